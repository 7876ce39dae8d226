//! Outbound progress and status events.

use cloakdrop_rendezvous::DropRequestId;
use tokio::sync::broadcast;

use crate::error::DropError;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Kind of a [`DropEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropEventKind {
    /// Lifecycle transition
    Status,
    /// Bytes moved
    Progress,
    /// Drop delivered
    Complete,
    /// Receiver declined
    Declined,
    /// Drop failed
    Error,
}

/// Event for UI consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropEvent {
    /// Drop the event belongs to; `None` before a document exists
    pub drop_request_id: Option<DropRequestId>,
    /// Kind
    pub kind: DropEventKind,
    /// Headline, e.g. "Waiting for receiver"
    pub major: String,
    /// Detail line
    pub minor: String,
    /// Progress numerator
    pub progress: u64,
    /// Progress denominator
    pub max_progress: u64,
    /// Payload bytes moved so far
    pub bytes_transferred: u64,
}

impl DropEvent {
    fn new(
        drop_request_id: Option<DropRequestId>,
        kind: DropEventKind,
        major: impl Into<String>,
        minor: impl Into<String>,
    ) -> Self {
        Self {
            drop_request_id,
            kind,
            major: major.into(),
            minor: minor.into(),
            progress: 0,
            max_progress: 0,
            bytes_transferred: 0,
        }
    }

    /// Lifecycle transition.
    #[must_use]
    pub fn status(
        id: Option<DropRequestId>,
        major: impl Into<String>,
        minor: impl Into<String>,
    ) -> Self {
        Self::new(id, DropEventKind::Status, major, minor)
    }

    /// Byte counter update.
    #[must_use]
    pub fn progress(id: DropRequestId, bytes: u64, total: u64) -> Self {
        let mut event = Self::new(
            Some(id),
            DropEventKind::Progress,
            "Transferring",
            format!("{bytes} of {total} bytes"),
        );
        event.progress = bytes.min(total);
        event.max_progress = total;
        event.bytes_transferred = bytes;
        event
    }

    /// Delivery finished.
    #[must_use]
    pub fn complete(id: DropRequestId, total: u64) -> Self {
        let mut event = Self::new(Some(id), DropEventKind::Complete, "Complete", "");
        event.progress = total;
        event.max_progress = total;
        event.bytes_transferred = total;
        event
    }

    /// Receiver declined.
    #[must_use]
    pub fn declined(id: DropRequestId) -> Self {
        Self::new(
            Some(id),
            DropEventKind::Declined,
            "Declined",
            "The receiver declined the drop",
        )
    }

    /// Drop failed or was cancelled.
    #[must_use]
    pub fn error(id: Option<DropRequestId>, error: &DropError) -> Self {
        Self::new(id, DropEventKind::Error, "Failed", error.to_string())
    }
}

/// Process-wide event channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DropEvent>,
}

impl EventBus {
    /// Bus buffering `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DropEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; returns how many subscribers saw it.
    pub fn publish(&self, event: DropEvent) -> usize {
        tracing::trace!("Drop event {:?}: {}", event.kind, event.major);
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

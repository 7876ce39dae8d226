//! The rendezvous store capability.

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

use crate::error::RendezvousError;
use crate::model::{DocumentChange, DropRequest, DropRequestId, DropStatus, NewDropRequest};

type Detach = Box<dyn FnOnce() + Send + Sync + 'static>;

/// A live feed of pushes from a store.
///
/// Dropping the feed detaches it from the store; [`Subscription::unsubscribe`]
/// does the same explicitly.
pub struct Subscription<T = DocumentChange> {
    rx: mpsc::UnboundedReceiver<T>,
    detach: Option<Detach>,
}

/// New pending drop requests addressed to one username.
pub type Inbox = Subscription<DropRequest>;

impl<T> Subscription<T> {
    /// Build a feed over `rx`; `detach` runs once when the feed goes away.
    pub fn new(
        rx: mpsc::UnboundedReceiver<T>,
        detach: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            detach: Some(Box::new(detach)),
        }
    }

    /// Next push, or `None` once the store closed the feed.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Detach from the store.
    pub fn unsubscribe(mut self) {
        self.run_detach();
    }

    fn run_detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.run_detach();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// Document store both peers of a drop coordinate through.
///
/// Writes are last-writer-wins; the store does not enforce the status
/// lifecycle, callers do.
#[async_trait]
pub trait RendezvousStore: Send + Sync {
    /// Publish a new drop request with status `pending`.
    async fn create(&self, request: NewDropRequest) -> Result<DropRequest, RendezvousError>;

    /// Current state of a document, if it exists.
    async fn get(&self, id: &DropRequestId) -> Result<Option<DropRequest>, RendezvousError>;

    /// Watch one document.
    ///
    /// The first push is the current snapshot, or [`DocumentChange::Deleted`]
    /// when the document does not exist. Later pushes follow store order.
    async fn subscribe(&self, id: &DropRequestId) -> Result<Subscription, RendezvousError>;

    /// Overwrite the status of a document.
    async fn update_status(
        &self,
        id: &DropRequestId,
        status: DropStatus,
    ) -> Result<DropRequest, RendezvousError>;

    /// Remove a document. Returns `false` if it was already gone.
    async fn delete(&self, id: &DropRequestId) -> Result<bool, RendezvousError>;

    /// Watch for pending requests addressed to `receiver_username`.
    ///
    /// Requests already pending are replayed first. The same request may be
    /// pushed twice if it is created while the watch is being set up.
    async fn watch_inbox(&self, receiver_username: &str) -> Result<Inbox, RendezvousError>;
}

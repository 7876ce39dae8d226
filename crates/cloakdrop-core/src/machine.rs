//! Sender state machine.
//!
//! Pure transition logic for one drop. The orchestrator task feeds it every
//! input (rendezvous pushes, listener events, swarm events, timers, cancel)
//! and carries out the [`Effect`]s it returns. Keeping I/O out of here keeps
//! the transitions testable without sockets or stores.
//!
//! ```text
//! Preparing ──Published──▶ AwaitingAcceptance ──accepted──▶ Transferring
//!     │                         │                               │
//!     └──────── cancel ─────────┴───── complete / declined ─────┴──▶ Terminal
//!                                      error / deleted / timeout
//! ```

use cloakdrop_rendezvous::{DocumentChange, DropStatus};
use cloakdrop_swarm::SwarmEventKind;

use crate::config::TransferPolicy;
use crate::direct::DirectEvent;
use crate::error::DropError;

/// How a drop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Receiver confirmed delivery
    Complete,
    /// Receiver declined
    Declined,
    /// Anything else
    Failed(DropError),
}

impl Outcome {
    /// `Ok` only for delivery.
    ///
    /// # Errors
    ///
    /// [`DropError::PeerDeclined`] for a decline, the failure otherwise.
    pub fn into_result(self) -> Result<(), DropError> {
        match self {
            Outcome::Complete => Ok(()),
            Outcome::Declined => Err(DropError::PeerDeclined),
            Outcome::Failed(e) => Err(e),
        }
    }
}

/// Sender lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderState {
    /// Cloaking and starting transports
    Preparing,
    /// Document published, waiting for the receiver
    AwaitingAcceptance,
    /// Receiver accepted; bytes may flow
    Transferring,
    /// Absorbing end state
    Terminal(Outcome),
}

/// Inputs the orchestrator feeds in.
#[derive(Debug, Clone)]
pub enum Input {
    /// The document was created at `version`
    Published {
        /// Version of the created document
        version: u64,
    },
    /// Push from the document subscription; `None` when the feed closed
    Rendezvous(Option<DocumentChange>),
    /// Direct listener event
    Direct(DirectEvent),
    /// Swarm event for this drop
    Swarm(SwarmEventKind),
    /// Receiver did not answer in time
    AcceptanceTimeout,
    /// Local user cancelled
    Cancel,
}

/// What the UI should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Document is live
    Waiting,
    /// Receiver accepted
    Transferring,
    /// Bytes moved
    Progress(u64),
    /// Delivered
    Complete,
    /// Declined
    Declined,
    /// Failed or cancelled
    Failed(DropError),
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Overwrite the document status
    WriteStatus(DropStatus),
    /// Publish a UI event
    Notify(Notice),
    /// Run teardown; always the last effect
    Teardown,
}

/// Transition logic for one outgoing drop
#[derive(Debug)]
pub struct SenderMachine {
    state: SenderState,
    policy: TransferPolicy,
    total_bytes: u64,
    last_version: u64,
    bytes_seen: u64,
}

impl SenderMachine {
    /// Machine for an artifact of `total_bytes`.
    #[must_use]
    pub fn new(total_bytes: u64, policy: TransferPolicy) -> Self {
        Self {
            state: SenderState::Preparing,
            policy,
            total_bytes,
            last_version: 0,
            bytes_seen: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &SenderState {
        &self.state
    }

    /// Whether the acceptance timer applies.
    #[must_use]
    pub fn is_awaiting(&self) -> bool {
        self.state == SenderState::AwaitingAcceptance
    }

    /// Whether the machine has stopped.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SenderState::Terminal(_))
    }

    /// Final outcome, once terminal.
    #[must_use]
    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.state {
            SenderState::Terminal(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Highest byte count reported so far, capped at the artifact size.
    #[must_use]
    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    /// Apply one input.
    pub fn step(&mut self, input: Input) -> Vec<Effect> {
        if self.is_terminal() {
            tracing::trace!("Ignoring input after terminal state: {:?}", input);
            return Vec::new();
        }

        match input {
            Input::Published { version } => self.on_published(version),
            Input::Rendezvous(Some(DocumentChange::Snapshot(doc))) => {
                if doc.version <= self.last_version {
                    tracing::trace!("Ignoring stale snapshot v{}", doc.version);
                    return Vec::new();
                }
                self.last_version = doc.version;
                self.on_status(doc.status)
            }
            Input::Rendezvous(Some(DocumentChange::Deleted)) => {
                self.fail(DropError::RendezvousVanished, false)
            }
            Input::Rendezvous(None) => self.fail(
                DropError::RendezvousFailure("document subscription closed".into()),
                true,
            ),
            Input::Direct(event) => self.on_direct(event),
            Input::Swarm(kind) => self.on_swarm(kind),
            Input::AcceptanceTimeout if self.is_awaiting() => self.fail(
                DropError::Timeout("receiver did not answer".into()),
                true,
            ),
            Input::AcceptanceTimeout => Vec::new(),
            Input::Cancel => {
                let published = self.state != SenderState::Preparing;
                self.fail(DropError::Cancelled, published)
            }
        }
    }

    fn on_published(&mut self, version: u64) -> Vec<Effect> {
        if self.state != SenderState::Preparing {
            return Vec::new();
        }
        self.last_version = version;
        self.state = SenderState::AwaitingAcceptance;
        vec![Effect::Notify(Notice::Waiting)]
    }

    fn on_status(&mut self, status: DropStatus) -> Vec<Effect> {
        match status {
            DropStatus::Pending => Vec::new(),
            DropStatus::Accepted => {
                if self.state != SenderState::AwaitingAcceptance {
                    return Vec::new();
                }
                self.state = SenderState::Transferring;
                vec![Effect::Notify(Notice::Transferring)]
            }
            DropStatus::Complete => {
                self.bytes_seen = self.total_bytes;
                self.finish(Outcome::Complete, Notice::Complete)
            }
            DropStatus::Declined => self.finish(Outcome::Declined, Notice::Declined),
            DropStatus::Error => self.fail(
                DropError::TransportError("receiver reported an error".into()),
                false,
            ),
        }
    }

    fn on_direct(&mut self, event: DirectEvent) -> Vec<Effect> {
        match event {
            DirectEvent::Progress { bytes_sent } => self.progress(bytes_sent),
            DirectEvent::Failed { peer, message } if self.state == SenderState::Transferring => {
                self.fail(
                    DropError::TransportError(format!("streaming to {peer} failed: {message}")),
                    true,
                )
            }
            DirectEvent::Failed { peer, message } => {
                tracing::debug!("Ignoring failed connection from {} before acceptance: {}", peer, message);
                Vec::new()
            }
            DirectEvent::Connected { .. } | DirectEvent::Served { .. } | DirectEvent::Rejected { .. } => {
                Vec::new()
            }
        }
    }

    fn on_swarm(&mut self, kind: SwarmEventKind) -> Vec<Effect> {
        match kind {
            SwarmEventKind::Progress(progress) => self.progress(progress.bytes_uploaded),
            SwarmEventKind::Error(message) if self.policy == TransferPolicy::Swarm => {
                self.fail(DropError::TransportError(format!("swarm: {message}")), true)
            }
            SwarmEventKind::Error(message) => {
                tracing::warn!("Swarm failed, direct transport still available: {}", message);
                Vec::new()
            }
            SwarmEventKind::Complete => Vec::new(),
        }
    }

    fn progress(&mut self, bytes: u64) -> Vec<Effect> {
        let bytes = bytes.min(self.total_bytes);
        if bytes <= self.bytes_seen {
            return Vec::new();
        }
        self.bytes_seen = bytes;
        vec![Effect::Notify(Notice::Progress(bytes))]
    }

    fn finish(&mut self, outcome: Outcome, notice: Notice) -> Vec<Effect> {
        self.state = SenderState::Terminal(outcome);
        vec![Effect::Notify(notice), Effect::Teardown]
    }

    fn fail(&mut self, error: DropError, write_error: bool) -> Vec<Effect> {
        let mut effects = Vec::with_capacity(3);
        if write_error {
            effects.push(Effect::WriteStatus(DropStatus::Error));
        }
        effects.push(Effect::Notify(Notice::Failed(error.clone())));
        effects.push(Effect::Teardown);
        self.state = SenderState::Terminal(Outcome::Failed(error));
        effects
    }
}

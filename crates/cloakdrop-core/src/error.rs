//! Error types for drops
//!
//! [`DropError`] is the single error surfaced to callers of the sender and
//! receiver APIs. The variants follow the lifecycle of a drop:
//!
//! - **Before publication**: [`CloakFailure`](DropError::CloakFailure),
//!   [`TransportStartFailure`](DropError::TransportStartFailure). Nothing was
//!   exposed to the network, the remote peer never learns about the attempt.
//! - **Signalling**: [`RendezvousFailure`](DropError::RendezvousFailure),
//!   [`RendezvousVanished`](DropError::RendezvousVanished).
//! - **Transfer**: [`TransportError`](DropError::TransportError),
//!   [`Timeout`](DropError::Timeout).
//! - **Outcomes that are not faults**: [`PeerDeclined`](DropError::PeerDeclined),
//!   [`Cancelled`](DropError::Cancelled).
//!
//! # Example
//!
//! ```
//! use cloakdrop_core::DropError;
//!
//! fn report(err: &DropError) {
//!     if err.is_error() {
//!         eprintln!("drop failed: {err}");
//!     } else {
//!         eprintln!("drop ended: {err}");
//!     }
//! }
//! # report(&DropError::PeerDeclined);
//! ```

use thiserror::Error;

use crate::direct::DirectError;
use cloakdrop_cloak::CloakError;
use cloakdrop_rendezvous::RendezvousError;
use cloakdrop_swarm::SwarmError;

/// Errors that end a drop
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DropError {
    // ============ Preparation ============
    /// Payload could not be disguised
    #[error("cloak failed: {0}")]
    CloakFailure(String),

    /// No listener could be bound
    #[error("transport start failed: {0}")]
    TransportStartFailure(String),

    // ============ Signalling ============
    /// Rendezvous write or subscription failed
    #[error("rendezvous failed: {0}")]
    RendezvousFailure(String),

    /// Document was deleted by someone else
    #[error("rendezvous document vanished")]
    RendezvousVanished,

    // ============ Outcomes ============
    /// Receiver turned the drop down
    #[error("receiver declined the drop")]
    PeerDeclined,

    /// Local user cancelled
    #[error("drop cancelled")]
    Cancelled,

    // ============ Transfer ============
    /// Socket or swarm failure mid-transfer
    #[error("transport error: {0}")]
    TransportError(String),

    /// Nothing happened in time
    #[error("timed out: {0}")]
    Timeout(String),

    // ============ Usage ============
    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local file I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl DropError {
    /// Whether the remote peer must be told through an `error` status write.
    ///
    /// False for failures before publication and for documents that are
    /// already gone.
    #[must_use]
    pub fn is_terminal_for_peer(&self) -> bool {
        matches!(
            self,
            DropError::TransportError(_)
                | DropError::Timeout(_)
                | DropError::Cancelled
                | DropError::RendezvousFailure(_)
                | DropError::Io(_)
        )
    }

    /// Whether this is a fault rather than a normal way for a drop to end.
    #[must_use]
    pub fn is_error(&self) -> bool {
        !matches!(self, DropError::PeerDeclined | DropError::Cancelled)
    }

    /// Short label for status lines.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            DropError::CloakFailure(_) => "cloak failure",
            DropError::TransportStartFailure(_) => "transport start failure",
            DropError::RendezvousFailure(_) => "rendezvous failure",
            DropError::RendezvousVanished => "rendezvous vanished",
            DropError::PeerDeclined => "declined",
            DropError::Cancelled => "cancelled",
            DropError::TransportError(_) => "transport error",
            DropError::Timeout(_) => "timeout",
            DropError::InvalidState(_) => "invalid state",
            DropError::InvalidConfig(_) => "invalid configuration",
            DropError::Io(_) => "I/O error",
        }
    }
}

impl From<std::io::Error> for DropError {
    fn from(e: std::io::Error) -> Self {
        DropError::Io(e.to_string())
    }
}

impl From<CloakError> for DropError {
    fn from(e: CloakError) -> Self {
        DropError::CloakFailure(e.to_string())
    }
}

impl From<RendezvousError> for DropError {
    fn from(e: RendezvousError) -> Self {
        DropError::RendezvousFailure(e.to_string())
    }
}

impl From<SwarmError> for DropError {
    fn from(e: SwarmError) -> Self {
        match e {
            SwarmError::MetadataTimeout(after) => {
                DropError::Timeout(format!("swarm metadata not received after {after:?}"))
            }
            other => DropError::TransportError(other.to_string()),
        }
    }
}

impl From<DirectError> for DropError {
    fn from(e: DirectError) -> Self {
        match e {
            DirectError::Timeout(what) => DropError::Timeout(what),
            other => DropError::TransportError(other.to_string()),
        }
    }
}

/// Result type for drop operations
pub type Result<T> = std::result::Result<T, DropError>;

//! Drop request documents.

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::RendezvousError;

/// Length of store-assigned document ids.
pub const DROP_REQUEST_ID_LEN: usize = 20;

/// Store-assigned identifier of a drop request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DropRequestId(String);

impl DropRequestId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        let id = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(DROP_REQUEST_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for DropRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a drop request.
///
/// ```text
/// pending ──▶ accepted ──▶ complete
///    │           ├───────▶ error
///    │           └───────▶ declined
///    ├──▶ declined
///    └──▶ error
/// ```
///
/// "Transferring" is not a stored status; it is implied by progress events
/// while the document reads `accepted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropStatus {
    /// Waiting for the receiver
    Pending,
    /// Receiver agreed; bytes may flow
    Accepted,
    /// Receiver has the file
    Complete,
    /// Receiver refused
    Declined,
    /// Either side failed
    Error,
}

impl DropStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Declined | Self::Error)
    }

    /// Whether `self → next` moves forward along the lifecycle.
    #[must_use]
    pub fn can_transition_to(self, next: DropStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Accepted | Self::Declined | Self::Error),
            Self::Accepted => matches!(next, Self::Complete | Self::Declined | Self::Error),
            Self::Complete | Self::Declined | Self::Error => false,
        }
    }

    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Complete => "complete",
            Self::Declined => "declined",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for DropStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the sender's direct listener can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SenderAddress {
    /// Public host or IP; `None` until a resolver fills it in
    pub host: Option<String>,
    /// Port of the bound listener, never 0 once published
    pub port: u16,
}

impl SenderAddress {
    /// `host:port` if the host is known.
    #[must_use]
    pub fn endpoint(&self) -> Option<String> {
        self.host.as_ref().map(|host| {
            if host.contains(':') {
                format!("[{host}]:{}", self.port)
            } else {
                format!("{host}:{}", self.port)
            }
        })
    }
}

/// A drop request before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDropRequest {
    /// Account id of the sender
    pub sender_id: String,
    /// Display username of the sender
    pub sender_username: String,
    /// Username the drop is addressed to
    pub receiver_username: String,
    /// Original file name, shown to the receiver
    pub original_filename: String,
    /// Generated name of the cloaked artifact
    pub cloaked_filename: String,
    /// Size of the cloaked artifact in bytes
    pub cloaked_file_size: u64,
    /// Shared 6-digit secret
    pub secret: u32,
    /// Direct transport endpoint
    pub sender_address: SenderAddress,
    /// Swarm link when the sender also seeds
    pub swarm_link: Option<String>,
}

impl NewDropRequest {
    /// Reject drafts that would publish placeholder connection data.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::InvalidRequest`] naming the bad field.
    pub fn validate(&self) -> Result<(), RendezvousError> {
        if self.receiver_username.is_empty() {
            return Err(RendezvousError::InvalidRequest("receiver_username is empty".into()));
        }
        if self.sender_address.port == 0 {
            return Err(RendezvousError::InvalidRequest(
                "sender port is unbound".into(),
            ));
        }
        if self.cloaked_filename.is_empty() || self.cloaked_file_size == 0 {
            return Err(RendezvousError::InvalidRequest(
                "cloaked artifact is not described".into(),
            ));
        }
        Ok(())
    }

    /// Materialize the document with its store-assigned fields.
    #[must_use]
    pub fn into_request(self, id: DropRequestId) -> DropRequest {
        DropRequest {
            id,
            sender_id: self.sender_id,
            sender_username: self.sender_username,
            receiver_username: self.receiver_username,
            original_filename: self.original_filename,
            cloaked_filename: self.cloaked_filename,
            cloaked_file_size: self.cloaked_file_size,
            secret: self.secret,
            sender_address: self.sender_address,
            swarm_link: self.swarm_link,
            status: DropStatus::Pending,
            created_at_ms: now_millis(),
            version: 1,
        }
    }
}

/// The rendezvous record of one drop attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropRequest {
    /// Store-assigned id
    pub id: DropRequestId,
    /// Account id of the sender
    pub sender_id: String,
    /// Display username of the sender
    pub sender_username: String,
    /// Username the drop is addressed to
    pub receiver_username: String,
    /// Original file name
    pub original_filename: String,
    /// Generated name of the cloaked artifact
    pub cloaked_filename: String,
    /// Size of the cloaked artifact in bytes
    pub cloaked_file_size: u64,
    /// Shared 6-digit secret
    pub secret: u32,
    /// Direct transport endpoint
    pub sender_address: SenderAddress,
    /// Swarm link when the sender also seeds
    pub swarm_link: Option<String>,
    /// Current lifecycle status
    pub status: DropStatus,
    /// Creation time, milliseconds since the Unix epoch
    pub created_at_ms: u64,
    /// Incremented by every write
    pub version: u64,
}

/// One push from a document subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentChange {
    /// Full current state of the document
    Snapshot(DropRequest),
    /// The document no longer exists
    Deleted,
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> NewDropRequest {
        NewDropRequest {
            sender_id: "uid-alice".into(),
            sender_username: "alice".into(),
            receiver_username: "bob".into(),
            original_filename: "photo.jpg".into(),
            cloaked_filename: "syncd-1-abcd.log".into(),
            cloaked_file_size: 4096,
            secret: 123_456,
            sender_address: SenderAddress {
                host: None,
                port: 40_000,
            },
            swarm_link: None,
        }
    }

    #[test]
    fn test_status_transitions() {
        use DropStatus::*;
        assert!(Pending.can_transition_to(Accepted));
        assert!(Pending.can_transition_to(Declined));
        assert!(Pending.can_transition_to(Error));
        assert!(!Pending.can_transition_to(Complete));
        assert!(Accepted.can_transition_to(Complete));
        assert!(!Accepted.can_transition_to(Pending));
        for terminal in [Complete, Declined, Error] {
            assert!(terminal.is_terminal());
            for next in [Pending, Accepted, Complete, Declined, Error] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_validate_rejects_unbound_port() {
        let mut d = draft();
        assert!(d.validate().is_ok());
        d.sender_address.port = 0;
        assert!(matches!(d.validate(), Err(RendezvousError::InvalidRequest(_))));
    }

    #[test]
    fn test_into_request_is_pending() {
        let req = draft().into_request(DropRequestId::new("abc"));
        assert_eq!(req.status, DropStatus::Pending);
        assert_eq!(req.version, 1);
        assert!(req.created_at_ms > 0);
    }

    #[test]
    fn test_generated_ids() {
        let a = DropRequestId::generate();
        let b = DropRequestId::generate();
        assert_eq!(a.as_str().len(), DROP_REQUEST_ID_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
        assert_eq!(a.short().len(), 8);
    }

    #[test]
    fn test_endpoint() {
        let mut addr = SenderAddress {
            host: None,
            port: 9000,
        };
        assert_eq!(addr.endpoint(), None);
        addr.host = Some("203.0.113.7".into());
        assert_eq!(addr.endpoint().as_deref(), Some("203.0.113.7:9000"));
        addr.host = Some("::1".into());
        assert_eq!(addr.endpoint().as_deref(), Some("[::1]:9000"));
    }
}

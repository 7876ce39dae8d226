//! Rendezvous error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::DropRequestId;

/// Errors returned by rendezvous stores.
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// No document with this id
    #[error("drop request not found: {0}")]
    NotFound(DropRequestId),

    /// Draft rejected before it became visible
    #[error("invalid drop request: {0}")]
    InvalidRequest(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Frame above the size limit
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply within the request timeout
    #[error("request timed out")]
    Timeout,

    /// Connection to the rendezvous server is gone
    #[error("disconnected from rendezvous server")]
    Disconnected,

    /// Server answered with an error
    #[error("server error ({code:?}): {message}")]
    Server {
        /// Error code
        code: ErrorCode,
        /// Human-readable error message
        message: String,
    },

    /// Backend refused the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl RendezvousError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Disconnected | Self::Io(_) | Self::Unavailable(_)
        )
    }

    /// Wire form of this error.
    #[must_use]
    pub fn to_wire(&self) -> WireError {
        let code = match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::Serialization(_) | Self::Deserialization(_) | Self::FrameTooLarge(_) => {
                ErrorCode::InvalidMessage
            }
            _ => ErrorCode::InternalError,
        };
        let id = match self {
            Self::NotFound(id) => Some(id.clone()),
            _ => None,
        };
        let message = match self {
            Self::InvalidRequest(msg) => msg.clone(),
            other => other.to_string(),
        };
        WireError { code, message, id }
    }
}

/// Rendezvous server error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Document does not exist
    NotFound = 1,
    /// Draft failed validation
    InvalidRequest = 2,
    /// Invalid message format
    InvalidMessage = 3,
    /// Internal server error
    InternalError = 4,
}

/// Error carried in a server reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Document the error refers to
    pub id: Option<DropRequestId>,
}

impl From<WireError> for RendezvousError {
    fn from(err: WireError) -> Self {
        match (err.code, err.id) {
            (ErrorCode::NotFound, Some(id)) => RendezvousError::NotFound(id),
            (ErrorCode::InvalidRequest, _) => RendezvousError::InvalidRequest(err.message),
            (code, _) => RendezvousError::Server {
                code,
                message: err.message,
            },
        }
    }
}

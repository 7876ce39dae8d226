//! Rendezvous wire protocol.
//!
//! Every frame is a big-endian `u32` length followed by a bincode body.
//! Clients tag requests with an id; the server echoes it in the reply and
//! reuses it as the watch id for subscriptions the request opened.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RendezvousError, WireError};
use crate::model::{DocumentChange, DropRequest, DropRequestId, DropStatus, NewDropRequest};

/// Largest accepted frame body.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Client requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Request {
    /// Publish a new drop request
    Create(NewDropRequest),
    /// Read one document
    Get(DropRequestId),
    /// Watch one document
    Subscribe(DropRequestId),
    /// Overwrite a document's status
    UpdateStatus {
        /// Document to update
        id: DropRequestId,
        /// New status
        status: DropStatus,
    },
    /// Remove a document
    Delete(DropRequestId),
    /// Watch pending requests for a username
    WatchInbox(String),
    /// Stop a watch opened by an earlier request
    Unwatch(u64),
    /// Keepalive message (no payload)
    Ping,
}

/// Successful replies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Reply {
    /// Document as created
    Created(DropRequest),
    /// Document lookup result
    Document(Option<DropRequest>),
    /// Watch is live; pushes carry the request id
    Watching,
    /// Document after the status write
    Updated(DropRequest),
    /// Whether a document was removed
    Deleted(bool),
    /// Watch stopped
    Unwatched,
    /// Keepalive answer
    Pong,
}

/// Frames sent by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientFrame {
    /// Request id, unique per connection
    pub req_id: u64,
    /// Request body
    pub request: Request,
}

/// Frames sent by the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerFrame {
    /// Answer to one request
    Reply {
        /// Id of the request being answered
        req_id: u64,
        /// Outcome
        result: Result<Reply, WireError>,
    },
    /// Push for a document watch
    Change {
        /// Id of the `Subscribe` request
        watch_id: u64,
        /// The change
        change: DocumentChange,
    },
    /// Push for an inbox watch
    Inbox {
        /// Id of the `WatchInbox` request
        watch_id: u64,
        /// Newly pending request
        request: DropRequest,
    },
}

impl Request {
    /// Get the message type name
    pub fn message_type(&self) -> &'static str {
        match self {
            Request::Create(_) => "Create",
            Request::Get(_) => "Get",
            Request::Subscribe(_) => "Subscribe",
            Request::UpdateStatus { .. } => "UpdateStatus",
            Request::Delete(_) => "Delete",
            Request::WatchInbox(_) => "WatchInbox",
            Request::Unwatch(_) => "Unwatch",
            Request::Ping => "Ping",
        }
    }
}

/// Serialize a message to bytes
pub fn to_bytes<T: Serialize>(msg: &T) -> Result<Vec<u8>, RendezvousError> {
    bincode::serialize(msg).map_err(|e| RendezvousError::Serialization(e.to_string()))
}

/// Deserialize a message from bytes
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RendezvousError> {
    bincode::deserialize(bytes).map_err(|e| RendezvousError::Deserialization(e.to_string()))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), RendezvousError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = to_bytes(msg)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(RendezvousError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RendezvousError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RendezvousError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    from_bytes(&body).map(Some)
}

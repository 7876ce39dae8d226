//! Peer wire protocol.
//!
//! BEP 3 handshake and length-prefixed messages, the BEP 10 extension
//! handshake, and BEP 9 `ut_metadata` messages carried inside it.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bencode::{self, DictBuilder, Value};
use crate::error::SwarmError;
use crate::metainfo::InfoHash;

/// Protocol identifier in the handshake.
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Encoded handshake length.
pub const HANDSHAKE_LEN: usize = 68;

/// Largest message body accepted.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024;

/// Extended message id of the extension handshake.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// Id this side assigns to `ut_metadata`.
pub const UT_METADATA_ID: u8 = 1;

/// Reserved-bytes flag announcing BEP 10 support.
const EXTENSION_BIT: u8 = 0x10;

/// Opening message on every peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Torrent the connection is for
    pub info_hash: InfoHash,
    /// Sender's peer id
    pub peer_id: [u8; 20],
    /// Whether the sender speaks BEP 10
    pub extensions: bool,
}

impl Handshake {
    /// Handshake announcing extension support.
    #[must_use]
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> Self {
        Self {
            info_hash,
            peer_id,
            extensions: true,
        }
    }

    /// Serialize to the fixed 68-byte form.
    #[must_use]
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[0] = PROTOCOL.len() as u8;
        out[1..20].copy_from_slice(PROTOCOL);
        if self.extensions {
            out[25] = EXTENSION_BIT;
        }
        out[28..48].copy_from_slice(self.info_hash.as_bytes());
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }

    /// Parse the fixed 68-byte form.
    ///
    /// # Errors
    ///
    /// Fails if the protocol identifier is wrong.
    pub fn decode(bytes: &[u8; HANDSHAKE_LEN]) -> Result<Self, SwarmError> {
        if bytes[0] as usize != PROTOCOL.len() || &bytes[1..20] != PROTOCOL {
            return Err(SwarmError::protocol("not a BitTorrent handshake"));
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);
        Ok(Self {
            info_hash: InfoHash(info_hash),
            peer_id,
            extensions: bytes[25] & EXTENSION_BIT != 0,
        })
    }

    /// Read a handshake from `reader`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a foreign protocol.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, SwarmError> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await?;
        Self::decode(&buf)
    }

    /// Write this handshake to `writer`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), SwarmError> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Peer wire messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Zero-length keepalive
    KeepAlive,
    /// id 0
    Choke,
    /// id 1
    Unchoke,
    /// id 2
    Interested,
    /// id 3
    NotInterested,
    /// id 4
    Have(u32),
    /// id 5
    Bitfield(Vec<u8>),
    /// id 6
    Request {
        /// Piece index
        index: u32,
        /// Offset within the piece
        begin: u32,
        /// Block length
        length: u32,
    },
    /// id 7
    Piece {
        /// Piece index
        index: u32,
        /// Offset within the piece
        begin: u32,
        /// Block bytes
        data: Vec<u8>,
    },
    /// id 8
    Cancel {
        /// Piece index
        index: u32,
        /// Offset within the piece
        begin: u32,
        /// Block length
        length: u32,
    },
    /// id 20
    Extended {
        /// Extended message id
        id: u8,
        /// Bencoded payload plus any trailing data
        payload: Vec<u8>,
    },
}

impl Message {
    /// Serialize including the length prefix.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Self::KeepAlive => {}
            Self::Choke => body.push(0),
            Self::Unchoke => body.push(1),
            Self::Interested => body.push(2),
            Self::NotInterested => body.push(3),
            Self::Have(index) => {
                body.push(4);
                body.extend_from_slice(&index.to_be_bytes());
            }
            Self::Bitfield(bits) => {
                body.push(5);
                body.extend_from_slice(bits);
            }
            Self::Request {
                index,
                begin,
                length,
            }
            | Self::Cancel {
                index,
                begin,
                length,
            } => {
                body.push(if matches!(self, Self::Request { .. }) { 6 } else { 8 });
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
            }
            Self::Piece { index, begin, data } => {
                body.push(7);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(data);
            }
            Self::Extended { id, payload } => {
                body.push(20);
                body.push(*id);
                body.extend_from_slice(payload);
            }
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Parse a message body (without the length prefix).
    ///
    /// # Errors
    ///
    /// Fails on unknown ids or short bodies.
    pub fn decode(body: &[u8]) -> Result<Self, SwarmError> {
        let Some((&id, rest)) = body.split_first() else {
            return Ok(Self::KeepAlive);
        };
        let word = |i: usize| -> Result<u32, SwarmError> {
            rest.get(i * 4..i * 4 + 4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(|| SwarmError::protocol(format!("message {id} too short")))
        };
        let exact = |n: usize| -> Result<(), SwarmError> {
            if rest.len() == n {
                Ok(())
            } else {
                Err(SwarmError::protocol(format!("message {id} has bad length")))
            }
        };

        Ok(match id {
            0 => exact(0).map(|()| Self::Choke)?,
            1 => exact(0).map(|()| Self::Unchoke)?,
            2 => exact(0).map(|()| Self::Interested)?,
            3 => exact(0).map(|()| Self::NotInterested)?,
            4 => {
                exact(4)?;
                Self::Have(word(0)?)
            }
            5 => Self::Bitfield(rest.to_vec()),
            6 | 8 => {
                exact(12)?;
                let (index, begin, length) = (word(0)?, word(1)?, word(2)?);
                if id == 6 {
                    Self::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Self::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            7 => Self::Piece {
                index: word(0)?,
                begin: word(1)?,
                data: rest[8..].to_vec(),
            },
            20 => {
                let (&ext, payload) = rest
                    .split_first()
                    .ok_or_else(|| SwarmError::protocol("empty extended message"))?;
                Self::Extended {
                    id: ext,
                    payload: payload.to_vec(),
                }
            }
            other => return Err(SwarmError::protocol(format!("unknown message id {other}"))),
        })
    }
}

/// Read one message.
///
/// # Errors
///
/// Fails on I/O errors, oversized or malformed messages.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, SwarmError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(SwarmError::protocol(format!("message of {len} bytes")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Message::decode(&body)
}

/// Write one message.
///
/// # Errors
///
/// Fails on I/O errors.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), SwarmError> {
    writer.write_all(&message.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// BEP 10 extension handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Peer's id for `ut_metadata`, if supported
    pub ut_metadata: Option<u8>,
    /// Size of the `info` dictionary, if the peer has it
    pub metadata_size: Option<usize>,
}

impl ExtensionHandshake {
    /// Handshake payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut m = DictBuilder::new();
        if let Some(id) = self.ut_metadata {
            m = m.with("ut_metadata", Value::Int(i64::from(id)));
        }
        let mut dict = DictBuilder::new()
            .with("m", m.build())
            .with("v", Value::bytes("cloakdrop"));
        if let Some(size) = self.metadata_size {
            dict = dict.with("metadata_size", Value::Int(size as i64));
        }
        bencode::encode(&dict.build())
    }

    /// Parse a handshake payload.
    ///
    /// # Errors
    ///
    /// Fails if the payload is not a dictionary.
    pub fn decode(payload: &[u8]) -> Result<Self, SwarmError> {
        let dict = bencode::decode(payload)?;
        if dict.as_dict().is_none() {
            return Err(SwarmError::protocol("extension handshake is not a dict"));
        }
        let ut_metadata = dict
            .get("m")
            .and_then(|m| m.get("ut_metadata"))
            .and_then(Value::as_int)
            .and_then(|id| u8::try_from(id).ok())
            .filter(|&id| id != 0);
        let metadata_size = dict
            .get("metadata_size")
            .and_then(Value::as_int)
            .and_then(|n| usize::try_from(n).ok());
        Ok(Self {
            ut_metadata,
            metadata_size,
        })
    }
}

/// BEP 9 metadata messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    /// msg_type 0
    Request(u32),
    /// msg_type 1
    Data {
        /// Piece index
        piece: u32,
        /// Size of the whole `info` dictionary
        total_size: usize,
        /// Piece bytes
        data: Vec<u8>,
    },
    /// msg_type 2
    Reject(u32),
}

impl MetadataMessage {
    /// Encode as an extended message payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (kind, piece) = match self {
            Self::Request(p) => (0, *p),
            Self::Data { piece, .. } => (1, *piece),
            Self::Reject(p) => (2, *p),
        };
        let mut dict = DictBuilder::new()
            .with("msg_type", Value::Int(kind))
            .with("piece", Value::Int(i64::from(piece)));
        if let Self::Data { total_size, .. } = self {
            dict = dict.with("total_size", Value::Int(*total_size as i64));
        }
        let mut out = bencode::encode(&dict.build());
        if let Self::Data { data, .. } = self {
            out.extend_from_slice(data);
        }
        out
    }

    /// Decode an extended message payload.
    ///
    /// # Errors
    ///
    /// Fails on missing fields or an unknown `msg_type`.
    pub fn decode(payload: &[u8]) -> Result<Self, SwarmError> {
        let (dict, used) = bencode::decode_prefix(payload)?;
        let int = |key: &str| {
            dict.get(key)
                .and_then(Value::as_int)
                .ok_or_else(|| SwarmError::protocol(format!("ut_metadata without {key}")))
        };
        let piece = u32::try_from(int("piece")?)
            .map_err(|_| SwarmError::protocol("ut_metadata piece out of range"))?;
        match int("msg_type")? {
            0 => Ok(Self::Request(piece)),
            1 => Ok(Self::Data {
                piece,
                total_size: usize::try_from(int("total_size")?)
                    .map_err(|_| SwarmError::protocol("ut_metadata total_size out of range"))?,
                data: payload[used..].to_vec(),
            }),
            2 => Ok(Self::Reject(piece)),
            other => Err(SwarmError::protocol(format!("ut_metadata msg_type {other}"))),
        }
    }
}

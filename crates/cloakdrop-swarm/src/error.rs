//! Swarm transport error types.

use thiserror::Error;

use crate::metainfo::InfoHash;

/// Errors from the swarm engine and manager.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Malformed bencode
    #[error("bencode error: {0}")]
    Bencode(String),

    /// Torrent descriptor is inconsistent
    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(String),

    /// Link could not be parsed
    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    /// Peer violated the wire protocol
    #[error("peer protocol error: {0}")]
    Protocol(String),

    /// Link names no reachable peer
    #[error("no peers to contact")]
    NoPeers,

    /// Metadata was not obtained in time
    #[error("metadata fetch timed out after {0:?}")]
    MetadataTimeout(std::time::Duration),

    /// Torrent already in the session
    #[error("torrent already added: {0}")]
    Duplicate(InfoHash),

    /// Torrent not in the session
    #[error("unknown torrent: {0}")]
    UnknownTorrent(InfoHash),

    /// Session was stopped
    #[error("swarm session is stopped")]
    Stopped,

    /// Background task panicked or was cancelled
    #[error("task failed: {0}")]
    Task(String),

    /// Network or disk I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

//! Session alerts.

use crate::metainfo::InfoHash;

/// Snapshot of one torrent, carried by [`Alert::StateUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentStatus {
    /// Torrent identity
    pub info_hash: InfoHash,
    /// Connected peers
    pub peers: usize,
    /// Bytes per second received since the previous update
    pub download_rate: u64,
    /// Bytes per second sent since the previous update
    pub upload_rate: u64,
    /// Verified payload bytes on disk
    pub bytes_done: u64,
    /// Payload size
    pub bytes_total: u64,
    /// Payload bytes served to peers
    pub bytes_uploaded: u64,
    /// Whether this side holds the whole payload
    pub is_seed: bool,
    /// Whether the download part has finished
    pub is_finished: bool,
}

/// Events published by a [`SwarmSession`](crate::SwarmSession).
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    /// Periodic status of every torrent
    StateUpdate(Vec<TorrentStatus>),
    /// A download verified its last piece
    TorrentFinished {
        /// Torrent identity
        info_hash: InfoHash,
    },
    /// A torrent failed, or the session hit an error not tied to a torrent
    TorrentError {
        /// Torrent identity, when known
        info_hash: Option<InfoHash>,
        /// Engine message
        message: String,
    },
    /// A torrent joined the session
    TorrentAdded {
        /// Torrent identity
        info_hash: InfoHash,
    },
    /// A torrent left the session
    TorrentRemoved {
        /// Torrent identity
        info_hash: InfoHash,
    },
}

impl Alert {
    /// The torrent this alert is about.
    ///
    /// `None` for state updates, which cover many torrents, and for
    /// session-level errors.
    #[must_use]
    pub fn info_hash(&self) -> Option<InfoHash> {
        match self {
            Self::StateUpdate(_) => None,
            Self::TorrentFinished { info_hash }
            | Self::TorrentAdded { info_hash }
            | Self::TorrentRemoved { info_hash } => Some(*info_hash),
            Self::TorrentError { info_hash, .. } => *info_hash,
        }
    }

    /// Short name for log lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateUpdate(_) => "state_update",
            Self::TorrentFinished { .. } => "torrent_finished",
            Self::TorrentError { .. } => "torrent_error",
            Self::TorrentAdded { .. } => "torrent_added",
            Self::TorrentRemoved { .. } => "torrent_removed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_accessor() {
        let h = InfoHash([1; 20]);
        assert_eq!(Alert::TorrentFinished { info_hash: h }.info_hash(), Some(h));
        assert_eq!(
            Alert::TorrentError {
                info_hash: None,
                message: "listen failed".into()
            }
            .info_hash(),
            None
        );
        assert_eq!(Alert::StateUpdate(Vec::new()).info_hash(), None);
        assert_eq!(Alert::TorrentRemoved { info_hash: h }.kind(), "torrent_removed");
    }
}

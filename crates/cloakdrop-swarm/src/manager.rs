//! Swarm Transport Manager.
//!
//! Wraps the one [`SwarmSession`] of the application and keys everything it
//! does by drop request id. A translator task turns session alerts into
//! [`SwarmEvent`]s; alerts for torrents no drop owns are skipped.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cloakdrop_rendezvous::DropRequestId;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::alert::{Alert, TorrentStatus};
use crate::error::SwarmError;
use crate::magnet::MagnetLink;
use crate::metainfo::{InfoHash, Metainfo};
use crate::session::{SessionConfig, SwarmSession};

/// Manager configuration
#[derive(Debug, Clone)]
pub struct SwarmManagerConfig {
    /// Deadline for resolving a link's metadata
    pub metadata_timeout: Duration,
    /// Keep seeding a finished download instead of removing it
    pub seed_after_complete: bool,
    /// Host put into peer hints when the listener is on a wildcard address
    pub advertise_host: Option<IpAddr>,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for SwarmManagerConfig {
    fn default() -> Self {
        Self {
            metadata_timeout: Duration::from_secs(30),
            seed_after_complete: false,
            advertise_host: None,
            event_capacity: 256,
        }
    }
}

/// Transfer counters for one drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwarmProgress {
    /// Connected peers
    pub peers: usize,
    /// Bytes per second received
    pub download_rate: u64,
    /// Bytes per second sent
    pub upload_rate: u64,
    /// Verified payload bytes
    pub bytes_done: u64,
    /// Payload size
    pub bytes_total: u64,
    /// Payload bytes served
    pub bytes_uploaded: u64,
}

impl From<&TorrentStatus> for SwarmProgress {
    fn from(status: &TorrentStatus) -> Self {
        Self {
            peers: status.peers,
            download_rate: status.download_rate,
            upload_rate: status.upload_rate,
            bytes_done: status.bytes_done,
            bytes_total: status.bytes_total,
            bytes_uploaded: status.bytes_uploaded,
        }
    }
}

/// What happened to a drop's swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEventKind {
    /// Periodic counters
    Progress(SwarmProgress),
    /// Download verified and written
    Complete,
    /// Engine reported a failure
    Error(String),
}

/// A swarm event keyed by drop request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmEvent {
    /// Drop the event belongs to
    pub drop_id: DropRequestId,
    /// What happened
    pub kind: SwarmEventKind,
}

/// A download started by [`SwarmTransportManager::start_download`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmDownload {
    /// Torrent identity
    pub info_hash: InfoHash,
    /// Where the payload is written
    pub path: PathBuf,
    /// Payload size
    pub total_bytes: u64,
}

struct ManagerInner {
    session: SwarmSession,
    config: SwarmManagerConfig,
    by_drop: DashMap<DropRequestId, InfoHash>,
    by_hash: DashMap<InfoHash, DropRequestId>,
    events: broadcast::Sender<SwarmEvent>,
}

impl ManagerInner {
    fn record(&self, drop_id: &DropRequestId, info_hash: InfoHash) {
        self.by_drop.insert(drop_id.clone(), info_hash);
        self.by_hash.insert(info_hash, drop_id.clone());
    }

    fn release_hash(&self, info_hash: &InfoHash) -> Option<DropRequestId> {
        let (_, drop_id) = self.by_hash.remove(info_hash)?;
        self.by_drop.remove(&drop_id);
        Some(drop_id)
    }

    fn emit(&self, drop_id: DropRequestId, kind: SwarmEventKind) {
        let _ = self.events.send(SwarmEvent { drop_id, kind });
    }

    async fn handle_alert(&self, alert: Alert) {
        match alert {
            Alert::StateUpdate(statuses) => {
                for status in &statuses {
                    let Some(drop_id) = self.by_hash.get(&status.info_hash).map(|d| d.value().clone())
                    else {
                        tracing::trace!("State update for unowned torrent {}", status.info_hash.short());
                        continue;
                    };
                    self.emit(drop_id, SwarmEventKind::Progress(status.into()));
                }
            }
            Alert::TorrentFinished { info_hash } => {
                // A seeding torrent keeps its drop entry so remove_drop can still reach it.
                let released = if self.config.seed_after_complete {
                    self.by_hash.remove(&info_hash).map(|(_, drop_id)| drop_id)
                } else {
                    self.release_hash(&info_hash)
                };
                let Some(drop_id) = released else {
                    tracing::debug!("Ignoring finished alert for unknown torrent {}", info_hash.short());
                    return;
                };
                tracing::info!("Swarm download for drop {} complete", drop_id.short());
                self.emit(drop_id, SwarmEventKind::Complete);
                if !self.config.seed_after_complete {
                    self.session.remove(&info_hash).await;
                }
            }
            Alert::TorrentError { info_hash, message } => {
                let Some(info_hash) = info_hash else {
                    tracing::warn!("Swarm session error: {}", message);
                    return;
                };
                let Some(drop_id) = self.release_hash(&info_hash) else {
                    tracing::debug!("Ignoring error alert for unknown torrent {}", info_hash.short());
                    return;
                };
                tracing::warn!("Swarm transfer for drop {} failed: {}", drop_id.short(), message);
                self.emit(drop_id, SwarmEventKind::Error(message));
                self.session.remove(&info_hash).await;
            }
            other => tracing::trace!("Swarm alert {}", other.kind()),
        }
    }
}

/// Drop-keyed facade over the swarm session.
pub struct SwarmTransportManager {
    inner: Arc<ManagerInner>,
    translator: JoinHandle<()>,
}

impl SwarmTransportManager {
    /// Start a session and a manager on top of it.
    ///
    /// # Errors
    ///
    /// Returns error if the session listener cannot be bound.
    pub async fn start(
        session_config: SessionConfig,
        config: SwarmManagerConfig,
    ) -> Result<Self, SwarmError> {
        let session = SwarmSession::start(session_config).await?;
        Ok(Self::with_session(session, config))
    }

    /// Manage an already running session.
    #[must_use]
    pub fn with_session(session: SwarmSession, config: SwarmManagerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let mut alerts = session.subscribe_alerts();
        let inner = Arc::new(ManagerInner {
            session,
            config,
            by_drop: DashMap::new(),
            by_hash: DashMap::new(),
            events,
        });

        let translating = inner.clone();
        let translator = tokio::spawn(async move {
            loop {
                match alerts.recv().await {
                    Ok(alert) => translating.handle_alert(alert).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Swarm alert translator skipped {} alerts", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { inner, translator }
    }

    /// The underlying session.
    #[must_use]
    pub fn session(&self) -> &SwarmSession {
        &self.inner.session
    }

    /// Receive every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.inner.events.subscribe()
    }

    /// Info-hash serving a drop.
    #[must_use]
    pub fn info_hash_for(&self, drop_id: &DropRequestId) -> Option<InfoHash> {
        self.inner.by_drop.get(drop_id).map(|h| *h.value())
    }

    /// Drop owning an info-hash.
    #[must_use]
    pub fn drop_for(&self, info_hash: &InfoHash) -> Option<DropRequestId> {
        self.inner.by_hash.get(info_hash).map(|d| d.value().clone())
    }

    /// Number of drops with a live swarm.
    #[must_use]
    pub fn active_drops(&self) -> usize {
        self.inner.by_drop.len()
    }

    fn advertised_addr(&self) -> SocketAddr {
        let listen = self.inner.session.listen_addr();
        let host = match self.inner.config.advertise_host {
            Some(host) => host,
            None if listen.ip().is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            None => listen.ip(),
        };
        SocketAddr::new(host, listen.port())
    }

    /// Hash `file` and seed it for `drop_id`.
    ///
    /// Returns a magnet link carrying this session as a peer hint.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be hashed or the session refuses it.
    pub async fn start_seeding(
        &self,
        file: &Path,
        drop_id: &DropRequestId,
    ) -> Result<MagnetLink, SwarmError> {
        let path = file.to_path_buf();
        let meta = tokio::task::spawn_blocking(move || Metainfo::from_file(&path))
            .await
            .map_err(|e| SwarmError::Task(e.to_string()))??;
        let info_hash = meta.info_hash();
        let link = MagnetLink::new(info_hash)
            .with_name(meta.name())
            .with_peer(self.advertised_addr());

        tracing::debug!(
            "Seeding drop {} as {} ({} pieces of {} bytes)",
            drop_id.short(),
            info_hash.short(),
            meta.piece_count(),
            meta.piece_length()
        );
        self.inner.session.add_seed(meta, file).await?;
        self.inner.record(drop_id, info_hash);
        tracing::info!("Drop {} seeding at {}", drop_id.short(), link);
        Ok(link)
    }

    /// Resolve `link` and download it into `target_dir` for `drop_id`.
    ///
    /// # Errors
    ///
    /// [`SwarmError::MetadataTimeout`] if the metadata does not arrive within
    /// the configured deadline, or any error starting the download.
    pub async fn start_download(
        &self,
        link: &MagnetLink,
        target_dir: &Path,
        drop_id: &DropRequestId,
    ) -> Result<SwarmDownload, SwarmError> {
        let meta = self
            .inner
            .session
            .fetch_metadata(link, self.inner.config.metadata_timeout)
            .await?;
        let info_hash = meta.info_hash();
        let total_bytes = meta.length();

        // Record before starting so an early finish resolves to the drop.
        self.inner.record(drop_id, info_hash);
        match self
            .inner
            .session
            .add_download(meta, target_dir, &link.peers)
            .await
        {
            Ok(path) => {
                tracing::info!("Drop {} downloading to {}", drop_id.short(), path.display());
                Ok(SwarmDownload {
                    info_hash,
                    path,
                    total_bytes,
                })
            }
            Err(e) => {
                self.inner.release_hash(&info_hash);
                Err(e)
            }
        }
    }

    /// Forget a drop and remove its torrent from the session.
    ///
    /// Returns whether the drop had a live swarm.
    pub async fn remove_drop(&self, drop_id: &DropRequestId) -> bool {
        let Some((_, info_hash)) = self.inner.by_drop.remove(drop_id) else {
            return false;
        };
        self.inner.by_hash.remove(&info_hash);
        self.inner.session.remove(&info_hash).await;
        tracing::debug!("Released swarm for drop {}", drop_id.short());
        true
    }

    /// Move a drop's swarm to a new id.
    ///
    /// Senders seed before the rendezvous service assigns the real id.
    /// Returns false if `old` has no swarm.
    pub fn rekey_drop(&self, old: &DropRequestId, new: &DropRequestId) -> bool {
        let Some((_, info_hash)) = self.inner.by_drop.remove(old) else {
            return false;
        };
        self.inner.record(new, info_hash);
        tracing::debug!("Swarm {} now serves drop {}", info_hash.short(), new.short());
        true
    }

    /// Stop the session and clear every lookup entry.
    pub async fn stop_session(&self) {
        self.inner.session.stop().await;
        self.inner.by_drop.clear();
        self.inner.by_hash.clear();
        self.translator.abort();
    }
}

impl Drop for SwarmTransportManager {
    fn drop(&mut self) {
        self.translator.abort();
    }
}

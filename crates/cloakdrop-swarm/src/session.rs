//! Swarm session engine.
//!
//! A session owns one TCP listener and a table of torrents keyed by
//! info-hash. Seeds serve metadata and blocks to whoever connects; downloads
//! run one worker per peer hint, claim pieces from a shared table, verify them
//! against the descriptor and write them in place. Everything observable is
//! published as [`Alert`]s on a broadcast channel.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha1::{Digest, Sha1};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};

use crate::alert::{Alert, TorrentStatus};
use crate::error::SwarmError;
use crate::magnet::MagnetLink;
use crate::metainfo::{InfoHash, Metainfo};
use crate::wire::{
    EXTENSION_HANDSHAKE_ID, ExtensionHandshake, Handshake, Message, MetadataMessage,
    UT_METADATA_ID, read_message, write_message,
};
use crate::{BLOCK_SIZE, METADATA_PIECE_SIZE};

/// Largest `info` dictionary accepted from a peer.
const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

/// Time an inbound peer has to send its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often an idle download worker re-checks the piece table.
const IDLE_TICK: Duration = Duration::from_millis(200);

/// Accept retry delay, doubled per consecutive failure up to the cap.
const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Corrupt pieces tolerated from one peer before dropping it.
const MAX_CORRUPT_PIECES: usize = 3;

const PIECE_MISSING: u8 = 0;
const PIECE_CLAIMED: u8 = 1;
const PIECE_DONE: u8 = 2;

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Listener address for inbound peers
    pub listen_addr: SocketAddr,
    /// Interval between [`Alert::StateUpdate`]s
    pub state_update_interval: Duration,
    /// Download workers started per torrent
    pub max_peers_per_torrent: usize,
    /// Outstanding block requests per peer
    pub pipeline_depth: usize,
    /// Outbound connect timeout
    pub connect_timeout: Duration,
    /// Silence tolerated from a peer while blocks are outstanding
    pub peer_timeout: Duration,
    /// Alert channel capacity
    pub alert_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            state_update_interval: Duration::from_secs(1),
            max_peers_per_torrent: 8,
            pipeline_depth: 16,
            connect_timeout: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(30),
            alert_capacity: 256,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Torrent State
// ═══════════════════════════════════════════════════════════════════════════

struct RateSample {
    at: Instant,
    received: u64,
    uploaded: u64,
    download_rate: u64,
    upload_rate: u64,
}

struct Torrent {
    meta: Arc<Metainfo>,
    path: PathBuf,
    seed: bool,
    pieces: Vec<AtomicU8>,
    done_pieces: AtomicUsize,
    bytes_done: AtomicU64,
    bytes_received: AtomicU64,
    bytes_uploaded: AtomicU64,
    peers: AtomicUsize,
    workers: AtomicUsize,
    finished: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
    rates: Mutex<RateSample>,
}

impl Torrent {
    fn new(meta: Metainfo, path: PathBuf, seed: bool) -> Self {
        let count = meta.piece_count();
        let initial = if seed { PIECE_DONE } else { PIECE_MISSING };
        Self {
            pieces: (0..count).map(|_| AtomicU8::new(initial)).collect(),
            done_pieces: AtomicUsize::new(if seed { count } else { 0 }),
            bytes_done: AtomicU64::new(if seed { meta.length() } else { 0 }),
            bytes_received: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            peers: AtomicUsize::new(0),
            workers: AtomicUsize::new(0),
            finished: AtomicBool::new(seed),
            tasks: Mutex::new(JoinSet::new()),
            rates: Mutex::new(RateSample {
                at: Instant::now(),
                received: 0,
                uploaded: 0,
                download_rate: 0,
                upload_rate: 0,
            }),
            meta: Arc::new(meta),
            path,
            seed,
        }
    }

    fn has_piece(&self, index: usize) -> bool {
        self.pieces
            .get(index)
            .is_some_and(|p| p.load(Ordering::Acquire) == PIECE_DONE)
    }

    fn is_complete(&self) -> bool {
        self.done_pieces.load(Ordering::Acquire) == self.pieces.len()
    }

    /// Claim the first missing piece the peer advertises.
    fn claim(&self, peer_has: &[bool]) -> Option<usize> {
        self.pieces.iter().enumerate().find_map(|(i, state)| {
            (peer_has.get(i).copied().unwrap_or(false)
                && state
                    .compare_exchange(PIECE_MISSING, PIECE_CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok())
            .then_some(i)
        })
    }

    fn release(&self, index: usize) {
        if let Some(state) = self.pieces.get(index) {
            let _ = state.compare_exchange(
                PIECE_CLAIMED,
                PIECE_MISSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Mark a claimed piece verified; true if it was the last one.
    fn complete_piece(&self, index: usize) -> bool {
        let Some(state) = self.pieces.get(index) else {
            return false;
        };
        if state
            .compare_exchange(PIECE_CLAIMED, PIECE_DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.bytes_done
            .fetch_add(u64::from(self.meta.piece_size(index)), Ordering::Relaxed);
        self.done_pieces.fetch_add(1, Ordering::AcqRel) + 1 == self.pieces.len()
    }

    fn bitfield(&self) -> Vec<u8> {
        let mut bits = vec![0u8; self.pieces.len().div_ceil(8)];
        for i in (0..self.pieces.len()).filter(|&i| self.has_piece(i)) {
            bits[i / 8] |= 0x80 >> (i % 8);
        }
        bits
    }

    async fn sample_rates(&self) {
        let received = self.bytes_received.load(Ordering::Relaxed);
        let uploaded = self.bytes_uploaded.load(Ordering::Relaxed);
        let mut sample = self.rates.lock().await;
        let secs = sample.at.elapsed().as_secs_f64().max(1e-3);
        sample.download_rate = (received.saturating_sub(sample.received) as f64 / secs) as u64;
        sample.upload_rate = (uploaded.saturating_sub(sample.uploaded) as f64 / secs) as u64;
        sample.at = Instant::now();
        sample.received = received;
        sample.uploaded = uploaded;
    }

    async fn status(&self) -> TorrentStatus {
        let sample = self.rates.lock().await;
        TorrentStatus {
            info_hash: self.meta.info_hash(),
            peers: self.peers.load(Ordering::Relaxed),
            download_rate: sample.download_rate,
            upload_rate: sample.upload_rate,
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            bytes_total: self.meta.length(),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            is_seed: self.seed || self.is_complete(),
            is_finished: self.finished.load(Ordering::Acquire),
        }
    }
}

/// Counts a live peer connection for the lifetime of the guard.
struct PeerGuard<'a>(&'a Torrent);

impl<'a> PeerGuard<'a> {
    fn new(torrent: &'a Torrent) -> Self {
        torrent.peers.fetch_add(1, Ordering::Relaxed);
        Self(torrent)
    }
}

impl Drop for PeerGuard<'_> {
    fn drop(&mut self) {
        self.0.peers.fetch_sub(1, Ordering::Relaxed);
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// What connection tasks need from the session.
#[derive(Clone)]
struct PeerContext {
    peer_id: [u8; 20],
    config: Arc<SessionConfig>,
    alerts: broadcast::Sender<Alert>,
}

impl PeerContext {
    fn alert(&self, alert: Alert) {
        // No subscribers is fine.
        let _ = self.alerts.send(alert);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Session
// ═══════════════════════════════════════════════════════════════════════════

struct SessionInner {
    ctx: PeerContext,
    listen_addr: SocketAddr,
    torrents: Arc<DashMap<InfoHash, Arc<Torrent>>>,
    running: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        for handle in self.background.get_mut().drain(..) {
            handle.abort();
        }
        for entry in self.torrents.iter() {
            if let Ok(mut tasks) = entry.value().tasks.try_lock() {
                tasks.abort_all();
            }
        }
    }
}

/// A running swarm session. Cheap to clone.
#[derive(Clone)]
pub struct SwarmSession {
    inner: Arc<SessionInner>,
}

impl SwarmSession {
    /// Bind the listener and start the background loops.
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be bound.
    pub async fn start(config: SessionConfig) -> Result<Self, SwarmError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let listen_addr = listener.local_addr()?;

        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(b"-CD0300-");
        for (slot, byte) in peer_id[8..]
            .iter_mut()
            .zip(rand::thread_rng().sample_iter(&Alphanumeric))
        {
            *slot = byte;
        }

        let (alerts, _) = broadcast::channel(config.alert_capacity.max(1));
        let interval = config.state_update_interval;
        let ctx = PeerContext {
            peer_id,
            config: Arc::new(config),
            alerts,
        };
        let torrents = Arc::new(DashMap::new());

        let accept = tokio::spawn(accept_loop(listener, torrents.clone(), ctx.clone()));
        let ticker = tokio::spawn(state_update_loop(
            torrents.clone(),
            ctx.alerts.clone(),
            interval,
        ));

        tracing::info!("Swarm session listening on {}", listen_addr);
        Ok(Self {
            inner: Arc::new(SessionInner {
                ctx,
                listen_addr,
                torrents,
                running: AtomicBool::new(true),
                background: Mutex::new(vec![accept, ticker]),
            }),
        })
    }

    /// Address inbound peers connect to.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    /// Peer id sent in handshakes.
    #[must_use]
    pub fn peer_id(&self) -> &[u8; 20] {
        &self.inner.ctx.peer_id
    }

    /// Whether [`stop`](Self::stop) has not been called yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Receive every alert published from now on.
    #[must_use]
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.inner.ctx.alerts.subscribe()
    }

    /// Whether a torrent is in the session.
    #[must_use]
    pub fn contains(&self, info_hash: &InfoHash) -> bool {
        self.inner.torrents.contains_key(info_hash)
    }

    /// Number of torrents in the session.
    #[must_use]
    pub fn torrent_count(&self) -> usize {
        self.inner.torrents.len()
    }

    /// Latest status of one torrent.
    pub async fn status(&self, info_hash: &InfoHash) -> Option<TorrentStatus> {
        let torrent = self.inner.torrents.get(info_hash).map(|t| t.value().clone())?;
        Some(torrent.status().await)
    }

    fn ensure_running(&self) -> Result<(), SwarmError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SwarmError::Stopped)
        }
    }

    fn insert(&self, torrent: Arc<Torrent>) -> Result<(), SwarmError> {
        let info_hash = torrent.meta.info_hash();
        match self.inner.torrents.entry(info_hash) {
            Entry::Occupied(_) => Err(SwarmError::Duplicate(info_hash)),
            Entry::Vacant(slot) => {
                slot.insert(torrent);
                self.inner.ctx.alert(Alert::TorrentAdded { info_hash });
                Ok(())
            }
        }
    }

    /// Serve the complete file at `path` as `meta`.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing, has the wrong length, or the torrent is
    /// already in the session.
    pub async fn add_seed(&self, meta: Metainfo, path: &Path) -> Result<(), SwarmError> {
        self.ensure_running()?;
        let on_disk = tokio::fs::metadata(path).await?.len();
        if on_disk != meta.length() {
            return Err(SwarmError::InvalidMetainfo(format!(
                "{} is {} bytes, descriptor says {}",
                path.display(),
                on_disk,
                meta.length()
            )));
        }
        let info_hash = meta.info_hash();
        self.insert(Arc::new(Torrent::new(meta, path.to_path_buf(), true)))?;
        tracing::info!("Seeding {} ({})", path.display(), info_hash.short());
        Ok(())
    }

    /// Obtain the `info` dictionary named by `link` from its peer hints.
    ///
    /// Gives up after `timeout` instead of waiting for a peer that never
    /// answers.
    ///
    /// # Errors
    ///
    /// [`SwarmError::NoPeers`] if the link has no hints,
    /// [`SwarmError::MetadataTimeout`] when the deadline passes, otherwise the
    /// error from the last peer tried.
    pub async fn fetch_metadata(
        &self,
        link: &MagnetLink,
        timeout: Duration,
    ) -> Result<Metainfo, SwarmError> {
        self.ensure_running()?;
        if link.peers.is_empty() {
            return Err(SwarmError::NoPeers);
        }

        let attempt = async {
            let mut last = SwarmError::NoPeers;
            for &peer in &link.peers {
                match fetch_metadata_from(peer, link.info_hash, &self.inner.ctx).await {
                    Ok(meta) => return Ok(meta),
                    Err(e) => {
                        tracing::debug!("Metadata from {} failed: {}", peer, e);
                        last = e;
                    }
                }
            }
            Err(last)
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(SwarmError::MetadataTimeout(timeout)),
        }
    }

    /// Download `meta` into `target_dir` from `peers`.
    ///
    /// Returns the path the payload is written to. Completion and failure are
    /// reported through alerts.
    ///
    /// # Errors
    ///
    /// Fails if there are no peers, the torrent is already in the session, or
    /// the target file cannot be created.
    pub async fn add_download(
        &self,
        meta: Metainfo,
        target_dir: &Path,
        peers: &[SocketAddr],
    ) -> Result<PathBuf, SwarmError> {
        self.ensure_running()?;
        if peers.is_empty() {
            return Err(SwarmError::NoPeers);
        }
        let info_hash = meta.info_hash();
        if self.contains(&info_hash) {
            return Err(SwarmError::Duplicate(info_hash));
        }

        tokio::fs::create_dir_all(target_dir).await?;
        let path = target_dir.join(meta.name());
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(meta.length()).await?;
        drop(file);

        let torrent = Arc::new(Torrent::new(meta, path.clone(), false));
        self.insert(torrent.clone())?;

        let mut tasks = torrent.tasks.lock().await;
        for &peer in peers.iter().take(self.inner.ctx.config.max_peers_per_torrent.max(1)) {
            torrent.workers.fetch_add(1, Ordering::AcqRel);
            tasks.spawn(download_worker(peer, torrent.clone(), self.inner.ctx.clone()));
        }
        drop(tasks);

        tracing::info!(
            "Downloading {} ({}) from {} peer(s)",
            path.display(),
            info_hash.short(),
            peers.len()
        );
        Ok(path)
    }

    /// Drop a torrent and every connection serving it.
    pub async fn remove(&self, info_hash: &InfoHash) -> bool {
        let Some((_, torrent)) = self.inner.torrents.remove(info_hash) else {
            return false;
        };
        torrent.tasks.lock().await.abort_all();
        self.inner.ctx.alert(Alert::TorrentRemoved {
            info_hash: *info_hash,
        });
        tracing::debug!("Removed torrent {}", info_hash.short());
        true
    }

    /// Stop the listener, the ticker and every torrent.
    pub async fn stop(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        for handle in self.inner.background.lock().await.drain(..) {
            handle.abort();
        }
        let hashes: Vec<InfoHash> = self.inner.torrents.iter().map(|e| *e.key()).collect();
        for info_hash in hashes {
            self.remove(&info_hash).await;
        }
        tracing::info!("Swarm session stopped");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Background Loops
// ═══════════════════════════════════════════════════════════════════════════

async fn accept_loop(
    listener: TcpListener,
    torrents: Arc<DashMap<InfoHash, Arc<Torrent>>>,
    ctx: PeerContext,
) {
    let mut handshakes = JoinSet::new();
    let mut failures = 0u32;
    loop {
        tokio::select! {
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    failures = 0;
                    handshakes.spawn(accept_peer(stream, peer, torrents.clone(), ctx.clone()));
                }
                Err(e) => {
                    let pause = accept_backoff(failures);
                    failures = failures.saturating_add(1);
                    tracing::warn!("Swarm accept error (retrying in {:?}): {}", pause, e);
                    tokio::time::sleep(pause).await;
                }
            },
        }
    }
}

fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1 << failures.min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

async fn accept_peer(
    mut stream: TcpStream,
    peer: SocketAddr,
    torrents: Arc<DashMap<InfoHash, Arc<Torrent>>>,
    ctx: PeerContext,
) {
    let _ = stream.set_nodelay(true);
    let theirs = match tokio::time::timeout(HANDSHAKE_TIMEOUT, Handshake::read(&mut stream)).await
    {
        Ok(Ok(hs)) => hs,
        Ok(Err(e)) => {
            tracing::debug!("Bad handshake from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            tracing::debug!("Handshake from {} timed out", peer);
            return;
        }
    };

    let Some(torrent) = torrents.get(&theirs.info_hash).map(|t| t.value().clone()) else {
        tracing::debug!(
            "Peer {} asked for unknown torrent {}",
            peer,
            theirs.info_hash.short()
        );
        return;
    };
    if let Err(e) = Handshake::new(theirs.info_hash, ctx.peer_id)
        .write(&mut stream)
        .await
    {
        tracing::debug!("Handshake to {} failed: {}", peer, e);
        return;
    }

    // Hand the connection to the torrent so removing it drops the peer.
    let serving = torrent.clone();
    torrent.tasks.lock().await.spawn(async move {
        if let Err(e) = serve_peer(stream, &serving, &ctx, theirs.extensions).await {
            tracing::debug!("Serving {} ended: {}", peer, e);
        }
    });
}

async fn state_update_loop(
    torrents: Arc<DashMap<InfoHash, Arc<Torrent>>>,
    alerts: broadcast::Sender<Alert>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let current: Vec<Arc<Torrent>> = torrents.iter().map(|e| e.value().clone()).collect();
        if current.is_empty() {
            continue;
        }
        let mut statuses = Vec::with_capacity(current.len());
        for torrent in current {
            torrent.sample_rates().await;
            statuses.push(torrent.status().await);
        }
        let _ = alerts.send(Alert::StateUpdate(statuses));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Serving
// ═══════════════════════════════════════════════════════════════════════════

async fn serve_peer(
    stream: TcpStream,
    torrent: &Torrent,
    ctx: &PeerContext,
    extensions: bool,
) -> Result<(), SwarmError> {
    let _guard = PeerGuard::new(torrent);
    let (mut reader, mut writer) = stream.into_split();

    if extensions {
        let hs = ExtensionHandshake {
            ut_metadata: Some(UT_METADATA_ID),
            metadata_size: Some(torrent.meta.info_bytes().len()),
        };
        write_message(
            &mut writer,
            &Message::Extended {
                id: EXTENSION_HANDSHAKE_ID,
                payload: hs.encode(),
            },
        )
        .await?;
    }
    write_message(&mut writer, &Message::Bitfield(torrent.bitfield())).await?;
    write_message(&mut writer, &Message::Unchoke).await?;

    let mut file: Option<File> = None;
    let mut remote_ut_metadata = None;

    loop {
        let message = match tokio::time::timeout(ctx.config.peer_timeout, read_message(&mut reader))
            .await
        {
            Ok(Ok(message)) => message,
            Ok(Err(SwarmError::Io(e))) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(SwarmError::protocol("peer idle")),
        };

        match message {
            Message::Request {
                index,
                begin,
                length,
            } => {
                let index = index as usize;
                let size = torrent.meta.piece_size(index);
                if !torrent.has_piece(index)
                    || length == 0
                    || length > 2 * BLOCK_SIZE
                    || u64::from(begin) + u64::from(length) > u64::from(size)
                {
                    tracing::trace!("Ignoring request {}:{}+{}", index, begin, length);
                    continue;
                }
                if file.is_none() {
                    file = Some(File::open(&torrent.path).await?);
                }
                let Some(handle) = file.as_mut() else {
                    continue;
                };
                handle
                    .seek(SeekFrom::Start(torrent.meta.piece_offset(index) + u64::from(begin)))
                    .await?;
                let mut data = vec![0u8; length as usize];
                handle.read_exact(&mut data).await?;
                write_message(
                    &mut writer,
                    &Message::Piece {
                        index: index as u32,
                        begin,
                        data,
                    },
                )
                .await?;
                torrent
                    .bytes_uploaded
                    .fetch_add(u64::from(length), Ordering::Relaxed);
            }
            Message::Extended {
                id: EXTENSION_HANDSHAKE_ID,
                payload,
            } => {
                remote_ut_metadata = ExtensionHandshake::decode(&payload)?.ut_metadata;
            }
            Message::Extended {
                id: UT_METADATA_ID,
                payload,
            } => {
                let MetadataMessage::Request(piece) = MetadataMessage::decode(&payload)? else {
                    continue;
                };
                let Some(remote_id) = remote_ut_metadata else {
                    continue;
                };
                let info = torrent.meta.info_bytes();
                let start = piece as usize * METADATA_PIECE_SIZE;
                let reply = if start < info.len() {
                    let end = (start + METADATA_PIECE_SIZE).min(info.len());
                    MetadataMessage::Data {
                        piece,
                        total_size: info.len(),
                        data: info[start..end].to_vec(),
                    }
                } else {
                    MetadataMessage::Reject(piece)
                };
                write_message(
                    &mut writer,
                    &Message::Extended {
                        id: remote_id,
                        payload: reply.encode(),
                    },
                )
                .await?;
            }
            _ => {}
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Fetching
// ═══════════════════════════════════════════════════════════════════════════

async fn connect(peer: SocketAddr, ctx: &PeerContext) -> Result<TcpStream, SwarmError> {
    match tokio::time::timeout(ctx.config.connect_timeout, TcpStream::connect(peer)).await {
        Ok(stream) => {
            let stream = stream?;
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Err(_) => Err(SwarmError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {peer} timed out"),
        ))),
    }
}

async fn open_peer(
    peer: SocketAddr,
    info_hash: InfoHash,
    ctx: &PeerContext,
) -> Result<(TcpStream, Handshake), SwarmError> {
    let mut stream = connect(peer, ctx).await?;
    Handshake::new(info_hash, ctx.peer_id)
        .write(&mut stream)
        .await?;
    let theirs = Handshake::read(&mut stream).await?;
    if theirs.info_hash != info_hash {
        return Err(SwarmError::protocol("peer answered for another torrent"));
    }
    Ok((stream, theirs))
}

async fn fetch_metadata_from(
    peer: SocketAddr,
    info_hash: InfoHash,
    ctx: &PeerContext,
) -> Result<Metainfo, SwarmError> {
    let (mut stream, theirs) = open_peer(peer, info_hash, ctx).await?;
    if !theirs.extensions {
        return Err(SwarmError::protocol("peer lacks the extension protocol"));
    }

    let ours = ExtensionHandshake {
        ut_metadata: Some(UT_METADATA_ID),
        metadata_size: None,
    };
    write_message(
        &mut stream,
        &Message::Extended {
            id: EXTENSION_HANDSHAKE_ID,
            payload: ours.encode(),
        },
    )
    .await?;

    let mut remote: Option<(u8, usize)> = None;
    let mut info = Vec::new();
    let mut next_piece = 0u32;

    loop {
        match read_message(&mut stream).await? {
            Message::Extended {
                id: EXTENSION_HANDSHAKE_ID,
                payload,
            } => {
                let hs = ExtensionHandshake::decode(&payload)?;
                let remote_id = hs
                    .ut_metadata
                    .ok_or_else(|| SwarmError::protocol("peer does not serve metadata"))?;
                let size = hs
                    .metadata_size
                    .filter(|&n| n > 0 && n <= MAX_METADATA_SIZE)
                    .ok_or_else(|| SwarmError::protocol("peer sent no usable metadata_size"))?;
                info = Vec::with_capacity(size);
                next_piece = 0;
                remote = Some((remote_id, size));
                request_metadata_piece(&mut stream, remote_id, 0).await?;
            }
            Message::Extended {
                id: UT_METADATA_ID,
                payload,
            } => {
                let Some((remote_id, size)) = remote else {
                    continue;
                };
                match MetadataMessage::decode(&payload)? {
                    MetadataMessage::Data {
                        piece,
                        total_size,
                        data,
                    } => {
                        if piece != next_piece || total_size != size {
                            return Err(SwarmError::protocol("unexpected metadata piece"));
                        }
                        info.extend_from_slice(&data);
                        if info.len() > size {
                            return Err(SwarmError::protocol("metadata longer than announced"));
                        }
                        if info.len() == size {
                            break;
                        }
                        next_piece += 1;
                        request_metadata_piece(&mut stream, remote_id, next_piece).await?;
                    }
                    MetadataMessage::Reject(piece) => {
                        return Err(SwarmError::protocol(format!(
                            "peer rejected metadata piece {piece}"
                        )));
                    }
                    MetadataMessage::Request(_) => {}
                }
            }
            _ => {}
        }
    }

    if InfoHash::of_info(&info) != info_hash {
        return Err(SwarmError::protocol("metadata does not match the info-hash"));
    }
    Metainfo::from_info_bytes(info)
}

async fn request_metadata_piece(
    stream: &mut TcpStream,
    remote_id: u8,
    piece: u32,
) -> Result<(), SwarmError> {
    write_message(
        stream,
        &Message::Extended {
            id: remote_id,
            payload: MetadataMessage::Request(piece).encode(),
        },
    )
    .await
}

// ═══════════════════════════════════════════════════════════════════════════
// Downloading
// ═══════════════════════════════════════════════════════════════════════════

struct PieceJob {
    index: usize,
    size: u32,
    buf: Vec<u8>,
    got: Vec<bool>,
    next_begin: u32,
    in_flight: usize,
    received: u32,
}

impl PieceJob {
    fn new(index: usize, size: u32) -> Self {
        Self {
            index,
            size,
            buf: vec![0u8; size as usize],
            got: vec![false; size.div_ceil(BLOCK_SIZE) as usize],
            next_begin: 0,
            in_flight: 0,
            received: 0,
        }
    }

    /// Copy a block in; false if it does not belong to this piece.
    fn accept(&mut self, begin: u32, data: &[u8]) -> bool {
        let end = u64::from(begin) + data.len() as u64;
        if begin % BLOCK_SIZE != 0 || data.is_empty() || end > u64::from(self.size) {
            return false;
        }
        let block = (begin / BLOCK_SIZE) as usize;
        if self.got[block] {
            return false;
        }
        self.got[block] = true;
        self.buf[begin as usize..end as usize].copy_from_slice(data);
        self.received += data.len() as u32;
        self.in_flight = self.in_flight.saturating_sub(1);
        true
    }

    fn is_complete(&self) -> bool {
        self.received == self.size
    }
}

async fn download_worker(peer: SocketAddr, torrent: Arc<Torrent>, ctx: PeerContext) {
    let result = download_from(peer, &torrent, &ctx).await;
    if let Err(e) = &result {
        tracing::debug!("Download from {} stopped: {}", peer, e);
    }

    let remaining = torrent.workers.fetch_sub(1, Ordering::AcqRel) - 1;
    if remaining == 0 && !torrent.finished.load(Ordering::Acquire) {
        let message = match result {
            Err(e) => format!("all peers failed, last error: {e}"),
            Ok(()) => "peers left before the download finished".to_string(),
        };
        tracing::warn!(
            "Download {} failed: {}",
            torrent.meta.info_hash().short(),
            message
        );
        ctx.alert(Alert::TorrentError {
            info_hash: Some(torrent.meta.info_hash()),
            message,
        });
    }
}

async fn pump_messages(mut reader: OwnedReadHalf, tx: mpsc::Sender<Result<Message, SwarmError>>) {
    loop {
        let result = read_message(&mut reader).await;
        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            break;
        }
    }
}

async fn download_from(
    peer: SocketAddr,
    torrent: &Torrent,
    ctx: &PeerContext,
) -> Result<(), SwarmError> {
    let (stream, _) = open_peer(peer, torrent.meta.info_hash(), ctx).await?;
    let _guard = PeerGuard::new(torrent);
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel(64);
    let _reader = AbortOnDrop(tokio::spawn(pump_messages(reader, tx)).abort_handle());

    let mut file = OpenOptions::new().write(true).open(&torrent.path).await?;
    write_message(&mut writer, &Message::Interested).await?;

    let count = torrent.meta.piece_count();
    let mut peer_has = vec![false; count];
    let mut choked = true;
    let mut job: Option<PieceJob> = None;
    let mut corrupt = 0usize;
    let mut last_activity = Instant::now();

    let outcome = loop {
        if torrent.is_complete() {
            break Ok(());
        }
        if !choked && job.is_none() {
            job = torrent
                .claim(&peer_has)
                .map(|i| PieceJob::new(i, torrent.meta.piece_size(i)));
        }
        match job.as_mut() {
            Some(current) if !choked => {
                let mut failed = None;
                while current.in_flight < ctx.config.pipeline_depth && current.next_begin < current.size
                {
                    let length = BLOCK_SIZE.min(current.size - current.next_begin);
                    let request = Message::Request {
                        index: current.index as u32,
                        begin: current.next_begin,
                        length,
                    };
                    if let Err(e) = write_message(&mut writer, &request).await {
                        failed = Some(e);
                        break;
                    }
                    current.in_flight += 1;
                    current.next_begin += length;
                }
                if let Some(e) = failed {
                    break Err(e);
                }
            }
            // Nothing outstanding, so silence is expected.
            _ => last_activity = Instant::now(),
        }

        let message = match tokio::time::timeout(IDLE_TICK, rx.recv()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => break Err(e),
            Ok(None) => break Err(SwarmError::protocol("peer closed the connection")),
            Err(_) => {
                if last_activity.elapsed() > ctx.config.peer_timeout {
                    break Err(SwarmError::protocol("peer stalled"));
                }
                continue;
            }
        };
        last_activity = Instant::now();

        match message {
            Message::Bitfield(bits) => {
                for (i, has) in peer_has.iter_mut().enumerate() {
                    *has = bits.get(i / 8).is_some_and(|b| b & (0x80 >> (i % 8)) != 0);
                }
            }
            Message::Have(index) => {
                if let Some(has) = peer_has.get_mut(index as usize) {
                    *has = true;
                }
            }
            Message::Choke => {
                choked = true;
                if let Some(current) = job.take() {
                    torrent.release(current.index);
                }
            }
            Message::Unchoke => choked = false,
            Message::Piece { index, begin, data } => {
                let Some(current) = job.as_mut() else {
                    continue;
                };
                if index as usize != current.index || !current.accept(begin, &data) {
                    continue;
                }
                torrent
                    .bytes_received
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                if !current.is_complete() {
                    continue;
                }

                let Some(done) = job.take() else {
                    continue;
                };
                let expected = torrent.meta.piece_hash(done.index).copied();
                let actual: [u8; 20] = Sha1::digest(&done.buf).into();
                if expected != Some(actual) {
                    torrent.release(done.index);
                    corrupt += 1;
                    tracing::warn!("Piece {} from {} failed verification", done.index, peer);
                    if corrupt >= MAX_CORRUPT_PIECES {
                        break Err(SwarmError::protocol("too many corrupt pieces"));
                    }
                    continue;
                }

                let written = async {
                    file.seek(SeekFrom::Start(torrent.meta.piece_offset(done.index)))
                        .await?;
                    file.write_all(&done.buf).await?;
                    file.flush().await
                }
                .await;
                if let Err(e) = written {
                    torrent.release(done.index);
                    break Err(e.into());
                }

                if torrent.complete_piece(done.index) {
                    if let Err(e) = file.sync_all().await {
                        break Err(e.into());
                    }
                    if torrent
                        .finished
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        tracing::info!(
                            "Download {} finished",
                            torrent.meta.info_hash().short()
                        );
                        ctx.alert(Alert::TorrentFinished {
                            info_hash: torrent.meta.info_hash(),
                        });
                    }
                }
            }
            _ => {}
        }
    };

    if let Some(current) = job.take() {
        torrent.release(current.index);
    }
    outcome
}

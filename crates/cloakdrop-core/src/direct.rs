//! Direct transport.
//!
//! An on-demand TCP listener that streams one cloaked artifact to every peer
//! that connects. The wire format is the raw artifact bytes; when a token is
//! required the peer first sends the six ASCII digits of the drop secret.
//!
//! ```text
//!  receiver                         sender
//!     │ ──── connect ──────────────▶ │ accept loop
//!     │ ──── "482913" (optional) ──▶ │ per-connection task
//!     │ ◀─── artifact bytes ──────── │
//!     │ ◀─── FIN ─────────────────── │
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use cloakdrop_cloak::Secret;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::DirectConfig;

/// Length of the token a receiver sends.
pub const TOKEN_LEN: usize = 6;

/// Progress is reported at least every this many bytes per connection.
const PROGRESS_STEP: u64 = 256 * 1024;

/// Pause after the first failed accept; doubles per consecutive failure.
const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Errors from the direct transport
#[derive(Debug, Error)]
pub enum DirectError {
    /// Listener could not be bound
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Underlying error
        source: std::io::Error,
    },

    /// `start()` called twice
    #[error("listener already started")]
    AlreadyStarted,

    /// Peer sent the wrong token
    #[error("peer sent a wrong token")]
    TokenMismatch,

    /// Stream ended at the wrong length
    #[error("expected {expected} bytes, got {actual}")]
    Length {
        /// Announced size
        expected: u64,
        /// Bytes seen
        actual: u64,
    },

    /// Operation exceeded its deadline
    #[error("{0} timed out")]
    Timeout(String),

    /// Socket or file I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Events a listener reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectEvent {
    /// A peer passed the token check and streaming began
    Connected {
        /// Remote address
        peer: SocketAddr,
    },
    /// Bytes sent across all connections so far
    Progress {
        /// Cumulative byte count
        bytes_sent: u64,
    },
    /// A peer received the whole artifact
    Served {
        /// Remote address
        peer: SocketAddr,
        /// Bytes streamed to it
        bytes: u64,
    },
    /// A peer was dropped for a wrong token
    Rejected {
        /// Remote address
        peer: SocketAddr,
    },
    /// Streaming to a peer failed
    Failed {
        /// Remote address
        peer: SocketAddr,
        /// What went wrong
        message: String,
    },
}

/// Why the accept loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptExit {
    /// `stop()` closed the listener
    Closed,
    /// Loop did not exit in time and was aborted
    Aborted,
}

/// Summary returned by [`DirectTransport::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerReport {
    /// How the loop ended
    pub exit: AcceptExit,
    /// Connections accepted
    pub accepted: usize,
    /// Accept errors logged and skipped
    pub transient_errors: usize,
}

#[derive(Default)]
struct ListenerStats {
    accepted: AtomicUsize,
    transient_errors: AtomicUsize,
}

struct Connection {
    artifact: Arc<PathBuf>,
    token: Option<[u8; TOKEN_LEN]>,
    timeout: Duration,
    buffer_size: usize,
    bytes_sent: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<DirectEvent>,
}

/// Listener streaming one artifact.
pub struct DirectTransport {
    config: DirectConfig,
    artifact: Arc<PathBuf>,
    token: Option<[u8; TOKEN_LEN]>,
    events: mpsc::UnboundedSender<DirectEvent>,
    running: Arc<AtomicBool>,
    bytes_sent: Arc<AtomicU64>,
    stats: Arc<ListenerStats>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

impl DirectTransport {
    /// Transport for `artifact`; pass `token` to require the secret.
    pub fn new(
        config: DirectConfig,
        artifact: impl Into<PathBuf>,
        token: Option<&Secret>,
        events: mpsc::UnboundedSender<DirectEvent>,
    ) -> Self {
        Self {
            config,
            artifact: Arc::new(artifact.into()),
            token: token.map(Secret::to_digits),
            events,
            running: Arc::new(AtomicBool::new(false)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            stats: Arc::new(ListenerStats::default()),
            local_addr: None,
            shutdown: None,
            accept_task: None,
        }
    }

    /// Bind the listener and start accepting; returns the bound port.
    ///
    /// # Errors
    ///
    /// [`DirectError::Bind`] if no port can be bound,
    /// [`DirectError::AlreadyStarted`] on a second call.
    pub async fn start(&mut self) -> Result<u16, DirectError> {
        if self.accept_task.is_some() {
            return Err(DirectError::AlreadyStarted);
        }
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DirectError::Bind { addr, source })?;
        let local = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.running.store(true, Ordering::SeqCst);
        let connection = Arc::new(Connection {
            artifact: self.artifact.clone(),
            token: self.token,
            timeout: self.config.connection_timeout,
            buffer_size: self.config.buffer_size.max(1),
            bytes_sent: self.bytes_sent.clone(),
            events: self.events.clone(),
        });
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            shutdown_rx,
            self.running.clone(),
            self.stats.clone(),
            connection,
        )));
        self.shutdown = Some(shutdown_tx);
        self.local_addr = Some(local);

        tracing::debug!("Direct transport listening on {}", local);
        Ok(local.port())
    }

    /// Bound address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether the accept loop is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bytes streamed across all connections.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Close the listener and every connection.
    ///
    /// Returns `None` if the listener was never started or is already
    /// stopped.
    pub async fn stop(&mut self) -> Option<ListenerReport> {
        let mut task = self.accept_task.take()?;
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        let exit = match tokio::time::timeout(self.config.stop_timeout, &mut task).await {
            Ok(_) => AcceptExit::Closed,
            Err(_) => {
                tracing::warn!("Direct accept loop did not exit in time, aborting");
                task.abort();
                AcceptExit::Aborted
            }
        };

        let report = ListenerReport {
            exit,
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            transient_errors: self.stats.transient_errors.load(Ordering::Relaxed),
        };
        tracing::debug!(
            "Direct transport on {:?} stopped ({} connections)",
            self.local_addr,
            report.accepted
        );
        Some(report)
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown: oneshot::Receiver<()>,
    running: Arc<AtomicBool>,
    stats: Arc<ListenerStats>,
    connection: Arc<Connection>,
) {
    // Dropping the set on exit aborts streams still in flight.
    let mut streams = JoinSet::new();
    let mut failures = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            Some(_) = streams.join_next(), if !streams.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    failures = 0;
                    stats.accepted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Direct connection from {}", peer);
                    let connection = connection.clone();
                    streams.spawn(async move { connection.serve(stream, peer).await });
                }
                Err(e) if !running.load(Ordering::SeqCst) => {
                    tracing::debug!("Direct listener closing: {}", e);
                    break;
                }
                Err(e) => {
                    stats.transient_errors.fetch_add(1, Ordering::Relaxed);
                    let pause = accept_backoff(failures);
                    failures = failures.saturating_add(1);
                    tracing::warn!("Direct accept error (retrying in {:?}): {}", pause, e);
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        () = tokio::time::sleep(pause) => {}
                    }
                }
            },
        }
    }

    drop(listener);
    streams.abort_all();
}

/// Delay before retrying after `failures` consecutive accept errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1 << failures.min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

impl Connection {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        match self.stream_artifact(stream, peer).await {
            Ok(bytes) => {
                tracing::debug!("Streamed {} bytes to {}", bytes, peer);
                let _ = self.events.send(DirectEvent::Served { peer, bytes });
            }
            Err(DirectError::TokenMismatch) => {
                tracing::warn!("Dropping {}: wrong token", peer);
                let _ = self.events.send(DirectEvent::Rejected { peer });
            }
            Err(e) => {
                tracing::warn!("Streaming to {} failed: {}", peer, e);
                let _ = self.events.send(DirectEvent::Failed {
                    peer,
                    message: e.to_string(),
                });
            }
        }
    }

    async fn stream_artifact(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<u64, DirectError> {
        let _ = stream.set_nodelay(true);
        if let Some(expected) = &self.token {
            let mut offered = [0u8; TOKEN_LEN];
            with_timeout(self.timeout, "token read", stream.read_exact(&mut offered)).await?;
            if !bool::from(offered.ct_eq(expected)) {
                return Err(DirectError::TokenMismatch);
            }
        }
        let _ = self.events.send(DirectEvent::Connected { peer });

        let mut file = File::open(self.artifact.as_path()).await?;
        let mut buf = vec![0u8; self.buffer_size];
        let mut sent = 0u64;
        let mut reported = 0u64;

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            with_timeout(self.timeout, "socket write", stream.write_all(&buf[..n])).await?;
            sent += n as u64;
            let total = self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
            if sent - reported >= PROGRESS_STEP {
                reported = sent;
                let _ = self.events.send(DirectEvent::Progress { bytes_sent: total });
            }
        }
        with_timeout(self.timeout, "socket shutdown", stream.shutdown()).await?;
        let _ = self.events.send(DirectEvent::Progress {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        });
        Ok(sent)
    }
}

async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T, DirectError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(DirectError::from),
        Err(_) => Err(DirectError::Timeout(what.to_string())),
    }
}

/// Pull an artifact from a direct listener into `dest`.
///
/// `on_progress` sees the running byte count. The stream must be exactly
/// `expected_size` bytes long.
///
/// # Errors
///
/// Fails on connect or I/O errors, stalls longer than `timeout`, or a length
/// mismatch. A partial `dest` is removed.
pub async fn pull<F>(
    addr: SocketAddr,
    token: Option<&Secret>,
    dest: &Path,
    expected_size: u64,
    timeout: Duration,
    mut on_progress: F,
) -> Result<u64, DirectError>
where
    F: FnMut(u64) + Send,
{
    let result = async {
        let mut stream = with_timeout(timeout, "connect", TcpStream::connect(addr)).await?;
        let _ = stream.set_nodelay(true);
        if let Some(secret) = token {
            with_timeout(timeout, "token write", stream.write_all(&secret.to_digits())).await?;
        }

        let mut file = File::create(dest).await?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut received = 0u64;
        let mut reported = 0u64;
        loop {
            let n = with_timeout(timeout, "socket read", stream.read(&mut buf)).await?;
            if n == 0 {
                break;
            }
            received += n as u64;
            if received > expected_size {
                break;
            }
            file.write_all(&buf[..n]).await?;
            if received - reported >= PROGRESS_STEP {
                reported = received;
                on_progress(received);
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        if received != expected_size {
            return Err(DirectError::Length {
                expected: expected_size,
                actual: received,
            });
        }
        on_progress(received);
        Ok(received)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(dest).await;
    }
    result
}

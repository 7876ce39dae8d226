//! Rendezvous server exposing a [`MemoryStore`] over TCP.
//!
//! The server also answers the question of who fills in the sender's public
//! address: when a draft arrives without a host, the server records the IP it
//! sees the creating connection come from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};

use crate::error::RendezvousError;
use crate::memory::MemoryStore;
use crate::protocol::{ClientFrame, Reply, Request, ServerFrame, read_frame, write_frame};
use crate::store::RendezvousStore;

/// Rendezvous server configuration
#[derive(Debug, Clone)]
pub struct RendezvousServerConfig {
    /// Maximum number of concurrent client connections
    pub max_connections: usize,
    /// Fill a missing `sender_address.host` with the creator's peer IP
    pub fill_sender_ip: bool,
}

impl Default for RendezvousServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            fill_sender_ip: true,
        }
    }
}

/// TCP rendezvous server
pub struct RendezvousServer {
    listener: TcpListener,
    store: MemoryStore,
    config: RendezvousServerConfig,
    connections: Arc<AtomicUsize>,
}

impl RendezvousServer {
    /// Bind a server with default configuration and an empty store.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, RendezvousError> {
        Self::bind_with_config(bind_addr, RendezvousServerConfig::default(), MemoryStore::new())
            .await
    }

    /// Bind a server over an existing store.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind_with_config(
        bind_addr: SocketAddr,
        config: RendezvousServerConfig,
        store: MemoryStore,
    ) -> Result<Self, RendezvousError> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            store,
            config,
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Address the server is listening on.
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, RendezvousError> {
        Ok(self.listener.local_addr()?)
    }

    /// The store behind this server.
    #[must_use]
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Run the accept loop on a background task.
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address.
    pub fn spawn(self) -> Result<RendezvousServerHandle, RendezvousError> {
        let addr = self.local_addr()?;
        let store = self.store.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        Ok(RendezvousServerHandle {
            addr,
            store,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    /// Accept clients until `shutdown` fires.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        tracing::info!("Rendezvous server listening on {:?}", self.listener.local_addr());
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if self.connections.load(Ordering::Relaxed) >= self.config.max_connections {
                            tracing::warn!("Rendezvous server at capacity, refusing {}", peer);
                            continue;
                        }
                        self.connections.fetch_add(1, Ordering::Relaxed);
                        let store = self.store.clone();
                        let config = self.config.clone();
                        let connections = self.connections.clone();
                        clients.spawn(async move {
                            handle_connection(stream, peer, store, config).await;
                            connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => tracing::warn!("Rendezvous accept error: {}", e),
                },
            }
        }

        clients.abort_all();
        tracing::info!("Rendezvous server stopped");
    }
}

/// Handle to a server running in the background.
pub struct RendezvousServerHandle {
    addr: SocketAddr,
    store: MemoryStore,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RendezvousServerHandle {
    /// Address clients connect to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The store behind the server.
    #[must_use]
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Stop accepting, drop every client, and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    store: MemoryStore,
    config: RendezvousServerConfig,
) {
    tracing::debug!("Rendezvous client connected: {}", peer);
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    // Tasks of this connection; dropping the set (also on abort) stops them.
    let mut tasks = JoinSet::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    tasks.spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::debug!("Rendezvous write to client failed: {}", e);
                break;
            }
        }
    });

    let mut watches: HashMap<u64, AbortHandle> = HashMap::new();

    loop {
        let ClientFrame { req_id, request } = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Rendezvous client {} sent a bad frame: {}", peer, e);
                break;
            }
        };
        tracing::trace!("{} from {} (req {})", request.message_type(), peer, req_id);

        let result = match request {
            Request::Create(mut draft) => {
                if config.fill_sender_ip && draft.sender_address.host.is_none() {
                    draft.sender_address.host = Some(peer.ip().to_string());
                }
                store.create(draft).await.map(Reply::Created)
            }
            Request::Get(id) => store.get(&id).await.map(Reply::Document),
            Request::Subscribe(id) => match store.subscribe(&id).await {
                Ok(mut sub) => {
                    let _ = tx.send(ServerFrame::Reply {
                        req_id,
                        result: Ok(Reply::Watching),
                    });
                    let tx = tx.clone();
                    watches.insert(
                        req_id,
                        tasks.spawn(async move {
                            while let Some(change) = sub.next().await {
                                let frame = ServerFrame::Change {
                                    watch_id: req_id,
                                    change,
                                };
                                if tx.send(frame).is_err() {
                                    break;
                                }
                            }
                        }),
                    );
                    continue;
                }
                Err(e) => Err(e),
            },
            Request::UpdateStatus { id, status } => {
                store.update_status(&id, status).await.map(Reply::Updated)
            }
            Request::Delete(id) => store.delete(&id).await.map(Reply::Deleted),
            Request::WatchInbox(username) => match store.watch_inbox(&username).await {
                Ok(mut inbox) => {
                    let _ = tx.send(ServerFrame::Reply {
                        req_id,
                        result: Ok(Reply::Watching),
                    });
                    let tx = tx.clone();
                    watches.insert(
                        req_id,
                        tasks.spawn(async move {
                            while let Some(request) = inbox.next().await {
                                let frame = ServerFrame::Inbox {
                                    watch_id: req_id,
                                    request,
                                };
                                if tx.send(frame).is_err() {
                                    break;
                                }
                            }
                        }),
                    );
                    continue;
                }
                Err(e) => Err(e),
            },
            Request::Unwatch(watch_id) => {
                if let Some(handle) = watches.remove(&watch_id) {
                    handle.abort();
                }
                Ok(Reply::Unwatched)
            }
            Request::Ping => Ok(Reply::Pong),
        };

        let frame = ServerFrame::Reply {
            req_id,
            result: result.map_err(|e| e.to_wire()),
        };
        if tx.send(frame).is_err() {
            break;
        }
    }

    for (_, handle) in watches.drain() {
        handle.abort();
    }
    drop(tx);
    while tasks.join_next().await.is_some() {}
    tracing::debug!("Rendezvous client disconnected: {}", peer);
}

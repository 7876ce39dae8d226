//! Rendezvous client speaking to a [`RendezvousServer`](crate::RendezvousServer).

use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;

use crate::error::{RendezvousError, WireError};
use crate::model::{DocumentChange, DropRequest, DropRequestId, DropStatus, NewDropRequest};
use crate::protocol::{ClientFrame, Reply, Request, ServerFrame, read_frame, write_frame};
use crate::store::{Inbox, RendezvousStore, Subscription};

/// Default time to wait for a reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type PendingReply = oneshot::Sender<Result<Reply, WireError>>;

struct RemoteInner {
    server_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    /// Request id -> waiting caller
    pending: DashMap<u64, PendingReply>,
    /// Watch id -> document subscription feed
    changes: DashMap<u64, mpsc::UnboundedSender<DocumentChange>>,
    /// Watch id -> inbox feed
    inboxes: DashMap<u64, mpsc::UnboundedSender<DropRequest>>,
    next_req: AtomicU64,
    connected: AtomicBool,
    request_timeout: Duration,
}

impl RemoteInner {
    fn next_req_id(&self) -> u64 {
        self.next_req.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatch(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Reply { req_id, result } => {
                if let Some((_, tx)) = self.pending.remove(&req_id) {
                    let _ = tx.send(result);
                }
            }
            ServerFrame::Change { watch_id, change } => {
                let deleted = change == DocumentChange::Deleted;
                if let Some(tx) = self.changes.get(&watch_id) {
                    let _ = tx.send(change);
                }
                if deleted {
                    self.changes.remove(&watch_id);
                }
            }
            ServerFrame::Inbox { watch_id, request } => {
                if let Some(tx) = self.inboxes.get(&watch_id) {
                    let _ = tx.send(request);
                }
            }
        }
    }

    /// Fail every waiting call and close every feed.
    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.clear();
        self.changes.clear();
        self.inboxes.clear();
    }
}

/// [`RendezvousStore`] backed by a remote rendezvous server.
///
/// One TCP connection carries every request and push. Cheap to clone.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteInner>,
    _tasks: Arc<ConnectionTasks>,
}

struct ConnectionTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for ConnectionTasks {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl RemoteStore {
    /// Connect to a rendezvous server.
    ///
    /// # Errors
    ///
    /// Returns error if connection fails or times out.
    pub async fn connect(addr: SocketAddr) -> Result<Self, RendezvousError> {
        Self::connect_with_timeout(addr, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Connect with a custom per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns error if connection fails or times out.
    pub async fn connect_with_timeout(
        addr: SocketAddr,
        request_timeout: Duration,
    ) -> Result<Self, RendezvousError> {
        let stream = time::timeout(request_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RendezvousError::Timeout)??;
        let _ = stream.set_nodelay(true);
        let (reader, mut writer) = stream.into_split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let inner = Arc::new(RemoteInner {
            server_addr: addr,
            outbound,
            pending: DashMap::new(),
            changes: DashMap::new(),
            inboxes: DashMap::new(),
            next_req: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            request_timeout,
        });

        let writer_inner = Arc::downgrade(&inner);
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::warn!("Rendezvous write failed: {}", e);
                    break;
                }
            }
            if let Some(inner) = writer_inner.upgrade() {
                inner.disconnect();
            }
        });

        let reader = tokio::spawn(read_loop(reader, Arc::downgrade(&inner)));

        tracing::debug!("Connected to rendezvous server {}", addr);
        Ok(Self {
            inner,
            _tasks: Arc::new(ConnectionTasks { reader, writer }),
        })
    }

    /// Server this store talks to.
    #[must_use]
    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr
    }

    /// Whether the connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Round-trip a keepalive.
    ///
    /// # Errors
    ///
    /// Returns error if the server does not answer in time.
    pub async fn ping(&self) -> Result<(), RendezvousError> {
        match self.call(Request::Ping).await? {
            Reply::Pong => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn call(&self, request: Request) -> Result<Reply, RendezvousError> {
        let req_id = self.inner.next_req_id();
        self.call_with_id(req_id, request).await
    }

    async fn call_with_id(&self, req_id: u64, request: Request) -> Result<Reply, RendezvousError> {
        if !self.is_connected() {
            return Err(RendezvousError::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(req_id, tx);

        if self
            .inner
            .outbound
            .send(ClientFrame { req_id, request })
            .is_err()
        {
            self.inner.pending.remove(&req_id);
            return Err(RendezvousError::Disconnected);
        }

        match time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(result)) => result.map_err(RendezvousError::from),
            Ok(Err(_)) => Err(RendezvousError::Disconnected),
            Err(_) => {
                self.inner.pending.remove(&req_id);
                Err(RendezvousError::Timeout)
            }
        }
    }

    fn unwatch_hook(&self, watch_id: u64) -> impl FnOnce() + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                inner.changes.remove(&watch_id);
                inner.inboxes.remove(&watch_id);
                let req_id = inner.next_req_id();
                let _ = inner.outbound.send(ClientFrame {
                    req_id,
                    request: Request::Unwatch(watch_id),
                });
            }
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, inner: std::sync::Weak<RemoteInner>) {
    loop {
        let frame = read_frame::<_, ServerFrame>(&mut reader).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match frame {
            Ok(Some(frame)) => inner.dispatch(frame),
            Ok(None) => {
                tracing::warn!("Rendezvous server {} closed the connection", inner.server_addr);
                inner.disconnect();
                return;
            }
            Err(e) => {
                tracing::warn!("Rendezvous read failed: {}", e);
                inner.disconnect();
                return;
            }
        }
    }
}

fn unexpected(reply: &Reply) -> RendezvousError {
    RendezvousError::Deserialization(format!("unexpected reply: {reply:?}"))
}

#[async_trait]
impl RendezvousStore for RemoteStore {
    async fn create(&self, request: NewDropRequest) -> Result<DropRequest, RendezvousError> {
        request.validate()?;
        match self.call(Request::Create(request)).await? {
            Reply::Created(doc) => Ok(doc),
            other => Err(unexpected(&other)),
        }
    }

    async fn get(&self, id: &DropRequestId) -> Result<Option<DropRequest>, RendezvousError> {
        match self.call(Request::Get(id.clone())).await? {
            Reply::Document(doc) => Ok(doc),
            other => Err(unexpected(&other)),
        }
    }

    async fn subscribe(&self, id: &DropRequestId) -> Result<Subscription, RendezvousError> {
        let watch_id = self.inner.next_req_id();
        let (tx, rx) = mpsc::unbounded_channel();
        // Route first: pushes may arrive right behind the reply.
        self.inner.changes.insert(watch_id, tx);

        match self.call_with_id(watch_id, Request::Subscribe(id.clone())).await {
            Ok(Reply::Watching) => Ok(Subscription::new(rx, self.unwatch_hook(watch_id))),
            Ok(other) => {
                self.inner.changes.remove(&watch_id);
                Err(unexpected(&other))
            }
            Err(e) => {
                self.inner.changes.remove(&watch_id);
                Err(e)
            }
        }
    }

    async fn update_status(
        &self,
        id: &DropRequestId,
        status: DropStatus,
    ) -> Result<DropRequest, RendezvousError> {
        let request = Request::UpdateStatus {
            id: id.clone(),
            status,
        };
        match self.call(request).await? {
            Reply::Updated(doc) => Ok(doc),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete(&self, id: &DropRequestId) -> Result<bool, RendezvousError> {
        match self.call(Request::Delete(id.clone())).await? {
            Reply::Deleted(existed) => Ok(existed),
            other => Err(unexpected(&other)),
        }
    }

    async fn watch_inbox(&self, receiver_username: &str) -> Result<Inbox, RendezvousError> {
        let watch_id = self.inner.next_req_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.inboxes.insert(watch_id, tx);

        let request = Request::WatchInbox(receiver_username.to_string());
        match self.call_with_id(watch_id, request).await {
            Ok(Reply::Watching) => Ok(Subscription::new(rx, self.unwatch_hook(watch_id))),
            Ok(other) => {
                self.inner.inboxes.remove(&watch_id);
                Err(unexpected(&other))
            }
            Err(e) => {
                self.inner.inboxes.remove(&watch_id);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SenderAddress;
    use crate::server::{RendezvousServer, RendezvousServerHandle};

    fn draft(host: Option<&str>) -> NewDropRequest {
        NewDropRequest {
            sender_id: "uid-alice".into(),
            sender_username: "alice".into(),
            receiver_username: "bob".into(),
            original_filename: "song.flac".into(),
            cloaked_filename: "syncd-1-beef.log".into(),
            cloaked_file_size: 1 << 20,
            secret: 777_777,
            sender_address: SenderAddress {
                host: host.map(str::to_string),
                port: 42_000,
            },
            swarm_link: None,
        }
    }

    async fn start_server() -> RendezvousServerHandle {
        RendezvousServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_fills_sender_ip() {
        let server = start_server().await;
        let store = RemoteStore::connect(server.local_addr()).await.unwrap();

        let doc = store.create(draft(None)).await.unwrap();
        assert_eq!(doc.sender_address.host.as_deref(), Some("127.0.0.1"));

        let explicit = store.create(draft(Some("198.51.100.4"))).await.unwrap();
        assert_eq!(explicit.sender_address.host.as_deref(), Some("198.51.100.4"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_subscription_roundtrip() {
        let server = start_server().await;
        let sender = RemoteStore::connect(server.local_addr()).await.unwrap();
        let receiver = RemoteStore::connect(server.local_addr()).await.unwrap();

        let doc = sender.create(draft(None)).await.unwrap();
        let mut sub = sender.subscribe(&doc.id).await.unwrap();
        assert!(matches!(sub.next().await, Some(DocumentChange::Snapshot(d)) if d.status == DropStatus::Pending));

        receiver
            .update_status(&doc.id, DropStatus::Accepted)
            .await
            .unwrap();
        assert!(matches!(sub.next().await, Some(DocumentChange::Snapshot(d)) if d.status == DropStatus::Accepted));

        assert!(receiver.delete(&doc.id).await.unwrap());
        assert_eq!(sub.next().await, Some(DocumentChange::Deleted));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_inbox() {
        let server = start_server().await;
        let sender = RemoteStore::connect(server.local_addr()).await.unwrap();
        let receiver = RemoteStore::connect(server.local_addr()).await.unwrap();

        let mut inbox = receiver.watch_inbox("bob").await.unwrap();
        let doc = sender.create(draft(None)).await.unwrap();
        assert_eq!(inbox.next().await.unwrap().id, doc.id);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_errors() {
        let server = start_server().await;
        let store = RemoteStore::connect(server.local_addr()).await.unwrap();
        store.ping().await.unwrap();

        let missing = DropRequestId::new("nope");
        assert!(matches!(
            store.update_status(&missing, DropStatus::Error).await,
            Err(RendezvousError::NotFound(id)) if id == missing
        ));
        assert!(!store.delete(&missing).await.unwrap());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_gone_closes_feeds() {
        let server = start_server().await;
        let store = RemoteStore::connect(server.local_addr()).await.unwrap();
        let doc = store.create(draft(None)).await.unwrap();
        let mut sub = store.subscribe(&doc.id).await.unwrap();
        let _ = sub.next().await;

        server.shutdown().await;
        assert_eq!(sub.next().await, None);
        assert!(matches!(
            store.get(&doc.id).await,
            Err(RendezvousError::Disconnected)
        ));
    }
}

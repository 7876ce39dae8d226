//! Receiver side of drops.
//!
//! Watches the inbox of one username, answers requests and pulls accepted
//! drops over the direct or swarm transport. Completion or failure is
//! written back to the document, which closes the loop for the sender.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cloakdrop_cloak::{Cloak, LogCloak, Secret};
use cloakdrop_rendezvous::{
    DocumentChange, DropRequest, DropStatus, Inbox, RendezvousStore, Subscription,
};
use cloakdrop_swarm::{MagnetLink, SwarmEventKind, SwarmTransportManager};
use tokio::sync::broadcast;

use crate::config::DropConfig;
use crate::direct;
use crate::error::{DropError, Result};
use crate::events::{DropEvent, EventBus};

/// Which transport a drop was pulled over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Sender's direct listener
    Direct,
    /// Swarm link from the document
    Swarm,
}

/// A failure and whether the sender still needs an `error` write.
struct Failure {
    error: DropError,
    tell_sender: bool,
}

impl From<DropError> for Failure {
    fn from(error: DropError) -> Self {
        let tell_sender = error != DropError::RendezvousVanished;
        Self { error, tell_sender }
    }
}

/// Receiver for one username
pub struct DropReceiver {
    config: DropConfig,
    store: Arc<dyn RendezvousStore>,
    events: EventBus,
    username: String,
    swarm: Option<Arc<SwarmTransportManager>>,
    cloak: Arc<dyn Cloak>,
}

impl DropReceiver {
    /// Receiver answering drops addressed to `username`.
    #[must_use]
    pub fn new(
        config: DropConfig,
        store: Arc<dyn RendezvousStore>,
        events: EventBus,
        username: impl Into<String>,
    ) -> Self {
        let cloak = Arc::new(LogCloak::new(
            config.cloak.work_dir.clone(),
            config.cloak.params,
        ));
        Self {
            config,
            store,
            events,
            username: username.into(),
            swarm: None,
            cloak,
        }
    }

    /// Download swarm links through `swarm`.
    #[must_use]
    pub fn with_swarm(mut self, swarm: Arc<SwarmTransportManager>) -> Self {
        self.swarm = Some(swarm);
        self
    }

    /// Replace the cloak codec.
    #[must_use]
    pub fn with_cloak(mut self, cloak: Arc<dyn Cloak>) -> Self {
        self.cloak = cloak;
        self
    }

    /// Username this receiver answers for.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Pending requests addressed to this user, then new ones as they arrive.
    ///
    /// # Errors
    ///
    /// [`DropError::RendezvousFailure`] if the watch cannot be set up.
    pub async fn inbox(&self) -> Result<Inbox> {
        Ok(self.store.watch_inbox(&self.username).await?)
    }

    /// Turn a pending drop down.
    ///
    /// # Errors
    ///
    /// [`DropError::InvalidState`] if the drop is not pending for this user.
    pub async fn decline(&self, request: &DropRequest) -> Result<()> {
        self.check_pending(request).await?;
        self.store
            .update_status(&request.id, DropStatus::Declined)
            .await?;
        tracing::info!(
            "Declined drop {} from {}",
            request.id.short(),
            request.sender_username
        );
        self.events.publish(DropEvent::declined(request.id.clone()));
        Ok(())
    }

    /// Accept a pending drop and restore it into `target_dir`.
    ///
    /// Returns the path of the restored file.
    ///
    /// # Errors
    ///
    /// Fails if the drop is not pending for this user, the transfer or
    /// decloak fails, the sender goes away, or the receive deadline passes.
    /// The document is set to `error` unless it already vanished.
    pub async fn accept(&self, request: &DropRequest, target_dir: &Path) -> Result<PathBuf> {
        self.check_pending(request).await?;
        let id = &request.id;

        let mut subscription = self.store.subscribe(id).await?;
        self.store.update_status(id, DropStatus::Accepted).await?;
        tracing::info!(
            "Accepted drop {} ({}) from {}",
            id.short(),
            request.original_filename,
            request.sender_username
        );

        let staging = self
            .config
            .cloak
            .work_dir
            .join("incoming")
            .join(id.as_str());
        let result = self
            .receive(request, &staging, target_dir, &mut subscription)
            .await;
        subscription.unsubscribe();

        if let Some(swarm) = &self.swarm {
            swarm.remove_drop(id).await;
        }
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", staging.display(), e),
        }

        match result {
            Ok(path) => {
                if let Err(e) = self.store.update_status(id, DropStatus::Complete).await {
                    tracing::warn!("Could not mark drop {} complete: {}", id.short(), e);
                }
                tracing::info!("Drop {} restored to {}", id.short(), path.display());
                self.events
                    .publish(DropEvent::complete(id.clone(), request.cloaked_file_size));
                Ok(path)
            }
            Err(Failure { error, tell_sender }) => {
                tracing::error!("Receiving drop {} failed: {}", id.short(), error);
                if tell_sender {
                    if let Err(e) = self.store.update_status(id, DropStatus::Error).await {
                        tracing::warn!("Could not mark drop {} failed: {}", id.short(), e);
                    }
                }
                self.events.publish(DropEvent::error(Some(id.clone()), &error));
                Err(error)
            }
        }
    }

    async fn check_pending(&self, request: &DropRequest) -> Result<()> {
        if request.receiver_username != self.username {
            return Err(DropError::InvalidState(format!(
                "drop {} is addressed to {}",
                request.id, request.receiver_username
            )));
        }
        let current = self
            .store
            .get(&request.id)
            .await?
            .ok_or(DropError::RendezvousVanished)?;
        if current.status != DropStatus::Pending {
            return Err(DropError::InvalidState(format!(
                "drop {} is {}",
                request.id, current.status
            )));
        }
        Ok(())
    }

    /// Route a drop takes under the configured policy.
    #[must_use]
    pub fn route_for(&self, request: &DropRequest) -> Route {
        let swarm_ready = self.config.policy.offers_swarm()
            && self.swarm.is_some()
            && request.swarm_link.is_some();
        if swarm_ready { Route::Swarm } else { Route::Direct }
    }

    async fn receive(
        &self,
        request: &DropRequest,
        staging: &Path,
        target_dir: &Path,
        subscription: &mut Subscription,
    ) -> std::result::Result<PathBuf, Failure> {
        let secret = Secret::new(request.secret).map_err(DropError::from)?;
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(DropError::from)?;
        self.events.publish(DropEvent::status(
            Some(request.id.clone()),
            "Receiving",
            format!("{} from {}", request.original_filename, request.sender_username),
        ));

        let transfer = self.transfer(request, staging, &secret);
        tokio::pin!(transfer);
        let raced = async {
            tokio::select! {
                result = &mut transfer => result.map_err(Failure::from),
                error = watch_sender(subscription) => Err(Failure { error, tell_sender: false }),
            }
        };
        let staged = match tokio::time::timeout(self.config.timeouts.receive, raced).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DropError::Timeout(format!(
                    "receive not finished after {:?}",
                    self.config.timeouts.receive
                ))
                .into());
            }
        };

        let size = tokio::fs::metadata(&staged)
            .await
            .map_err(DropError::from)?
            .len();
        if size != request.cloaked_file_size {
            return Err(DropError::TransportError(format!(
                "received {size} bytes, expected {}",
                request.cloaked_file_size
            ))
            .into());
        }

        let cloak = self.cloak.clone();
        let out_dir = target_dir.to_path_buf();
        let key = secret.clone();
        let restored = tokio::task::spawn_blocking(move || cloak.decloak(&staged, &key, &out_dir))
            .await
            .map_err(|e| DropError::CloakFailure(e.to_string()))?
            .map_err(DropError::from)?;
        Ok(restored)
    }

    async fn transfer(&self, request: &DropRequest, staging: &Path, secret: &Secret) -> Result<PathBuf> {
        match (self.route_for(request), &self.swarm, &request.swarm_link) {
            (Route::Swarm, Some(swarm), Some(link)) => match link.parse::<MagnetLink>() {
                Ok(link) => self.pull_swarm(swarm, &link, request, staging).await,
                Err(e) => {
                    tracing::warn!("Unusable swarm link, falling back to direct: {}", e);
                    self.pull_direct(request, staging, secret).await
                }
            },
            _ => self.pull_direct(request, staging, secret).await,
        }
    }

    async fn pull_direct(&self, request: &DropRequest, staging: &Path, secret: &Secret) -> Result<PathBuf> {
        let endpoint = request.sender_address.endpoint().ok_or_else(|| {
            DropError::TransportError("sender address has no host".into())
        })?;
        let addr = tokio::net::lookup_host(&endpoint)
            .await?
            .next()
            .ok_or_else(|| DropError::TransportError(format!("{endpoint} did not resolve")))?;

        let dest = staging.join(staged_name(&request.cloaked_filename));
        let token = self.config.direct.require_token.then_some(secret);
        let events = self.events.clone();
        let id = request.id.clone();
        let total = request.cloaked_file_size;

        tracing::debug!("Pulling drop {} from {}", id.short(), addr);
        direct::pull(
            addr,
            token,
            &dest,
            total,
            self.config.direct.connection_timeout,
            move |bytes| {
                events.publish(DropEvent::progress(id.clone(), bytes, total));
            },
        )
        .await?;
        Ok(dest)
    }

    async fn pull_swarm(
        &self,
        swarm: &SwarmTransportManager,
        link: &MagnetLink,
        request: &DropRequest,
        staging: &Path,
    ) -> Result<PathBuf> {
        let id = &request.id;
        let mut updates = swarm.subscribe();
        let download = swarm.start_download(link, staging, id).await?;
        tracing::debug!("Swarm download for drop {} started ({})", id.short(), download.info_hash);

        loop {
            match updates.recv().await {
                Ok(event) if &event.drop_id == id => match event.kind {
                    SwarmEventKind::Progress(progress) => {
                        self.events.publish(DropEvent::progress(
                            id.clone(),
                            progress.bytes_done,
                            download.total_bytes,
                        ));
                    }
                    SwarmEventKind::Complete => return Ok(download.path),
                    SwarmEventKind::Error(message) => {
                        return Err(DropError::TransportError(format!("swarm: {message}")));
                    }
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Drop {} missed {} swarm events", id.short(), missed);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(DropError::TransportError("swarm session stopped".into()));
                }
            }
        }
    }
}

/// Ends when the sender gives up on the drop; pends otherwise.
async fn watch_sender(subscription: &mut Subscription) -> DropError {
    loop {
        match subscription.next().await {
            Some(DocumentChange::Snapshot(doc)) if doc.status == DropStatus::Error => {
                return DropError::TransportError("sender reported an error".into());
            }
            Some(DocumentChange::Snapshot(_)) => {}
            Some(DocumentChange::Deleted) => return DropError::RendezvousVanished,
            None => return std::future::pending().await,
        }
    }
}

/// Local file name for a remote-supplied artifact name.
fn staged_name(cloaked_filename: &str) -> String {
    Path::new(cloaked_filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.starts_with('.'))
        .map_or_else(|| "artifact.log".to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direct::{DirectEvent, DirectTransport};
    use cloakdrop_cloak::CloakParams;
    use cloakdrop_rendezvous::{MemoryStore, NewDropRequest, SenderAddress};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn config(dir: &TempDir) -> DropConfig {
        let mut config = DropConfig::default();
        config.direct.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.cloak.work_dir = dir.path().join("work");
        config.cloak.params = CloakParams::low_security();
        config
    }

    async fn publish(store: &MemoryStore, receiver: &str, port: u16, size: u64) -> DropRequest {
        store
            .create(NewDropRequest {
                sender_id: "alice-id".into(),
                sender_username: "alice".into(),
                receiver_username: receiver.into(),
                original_filename: "report.pdf".into(),
                cloaked_filename: "syncd-1-aa.log".into(),
                cloaked_file_size: size,
                secret: 654_321,
                sender_address: SenderAddress {
                    host: Some("127.0.0.1".into()),
                    port,
                },
                swarm_link: None,
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_staged_name_strips_paths() {
        assert_eq!(staged_name("syncd-1-aa.log"), "syncd-1-aa.log");
        assert_eq!(staged_name("../../etc/passwd"), "passwd");
        assert_eq!(staged_name(".."), "artifact.log");
        assert_eq!(staged_name(".hidden"), "artifact.log");
    }

    #[tokio::test]
    async fn test_decline_writes_status() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let request = publish(&store, "bob", 4000, 10).await;
        let receiver = DropReceiver::new(config(&dir), store.clone(), EventBus::default(), "bob");

        receiver.decline(&request).await.unwrap();
        let doc = store.get(&request.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DropStatus::Declined);

        // no longer pending
        assert!(matches!(
            receiver.decline(&request).await,
            Err(DropError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_user_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let request = publish(&store, "bob", 4000, 10).await;
        let receiver = DropReceiver::new(config(&dir), store, EventBus::default(), "mallory");
        assert!(matches!(
            receiver.accept(&request, dir.path()).await,
            Err(DropError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_direct_restores_file() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let original = dir.path().join("report.pdf");
        let content: Vec<u8> = (0..50_000u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(&original, &content).unwrap();

        let secret = Secret::new(654_321).unwrap();
        let cloak = LogCloak::new(dir.path().join("sender"), CloakParams::low_security());
        let artifact = cloak.cloak(&original, &secret).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel::<DirectEvent>();
        let mut listener =
            DirectTransport::new(config.direct.clone(), &artifact.path, Some(&secret), tx);
        let port = listener.start().await.unwrap();

        let store = Arc::new(MemoryStore::new());
        let request = publish(&store, "bob", port, artifact.size).await;
        let receiver = DropReceiver::new(config, store.clone(), EventBus::default(), "bob");
        assert_eq!(receiver.route_for(&request), Route::Direct);

        let out = dir.path().join("downloads");
        let restored = receiver.accept(&request, &out).await.unwrap();
        assert_eq!(restored, out.join("report.pdf"));
        assert_eq!(std::fs::read(&restored).unwrap(), content);

        let doc = store.get(&request.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DropStatus::Complete);
        assert!(!dir.path().join("work/incoming").join(request.id.as_str()).exists());
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_accept_failure_marks_error() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.direct.connection_timeout = std::time::Duration::from_secs(2);
        let store = Arc::new(MemoryStore::new());

        // nothing listens on this port
        let free_port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let request = publish(&store, "bob", free_port, 100).await;
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let receiver = DropReceiver::new(config, store.clone(), events, "bob");

        let result = receiver.accept(&request, dir.path()).await;
        assert!(matches!(result, Err(DropError::TransportError(_))));
        let doc = store.get(&request.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DropStatus::Error);

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event.kind);
        }
        assert_eq!(last, Some(crate::events::DropEventKind::Error));
    }
}

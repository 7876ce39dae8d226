//! Drop Transfer Orchestrator (sender side).
//!
//! [`DropOrchestrator::initiate_send`] runs the preparation sequence
//! (secret, cloak, listener, optional swarm, document, subscription) and then
//! hands the drop to its own task. That task owns all mutable state of the
//! drop: it multiplexes document pushes, listener events, swarm events, the
//! acceptance deadline and cancel requests into a [`SenderMachine`] and runs
//! [`Teardown`] exactly once on every exit path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use cloakdrop_cloak::{Cloak, CloakedArtifact, LogCloak, Secret};
use cloakdrop_rendezvous::{
    DocumentChange, DropRequestId, DropStatus, NewDropRequest, RendezvousStore, SenderAddress,
    Subscription,
};
use cloakdrop_swarm::{
    InfoHash, MagnetLink, SwarmEvent, SwarmEventKind, SwarmTransportManager,
};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{DropConfig, TransferPolicy};
use crate::direct::{DirectEvent, DirectTransport, ListenerReport};
use crate::error::{DropError, Result};
use crate::events::{DropEvent, EventBus};
use crate::machine::{Effect, Input, Notice, Outcome, SenderMachine};

// ═══════════════════════════════════════════════════════════════════════════
// Sessions
// ═══════════════════════════════════════════════════════════════════════════

/// Control messages for a running drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Cancel,
}

/// Live transports of one outgoing drop.
#[derive(Debug, Clone)]
pub struct TransferSession {
    /// Port of the direct listener
    pub direct_port: u16,
    /// Swarm serving the drop, if any
    pub info_hash: Option<InfoHash>,
    /// When preparation started
    pub started_at: Instant,
    control: mpsc::UnboundedSender<Control>,
}

type Sessions = Arc<DashMap<DropRequestId, TransferSession>>;

// ═══════════════════════════════════════════════════════════════════════════
// Teardown
// ═══════════════════════════════════════════════════════════════════════════

/// What a teardown run released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Listener summary, if one was running
    pub listener: Option<ListenerReport>,
    /// A subscription was detached
    pub unsubscribed: bool,
    /// The document was deleted by this run
    pub document_deleted: bool,
    /// A swarm was removed
    pub swarm_removed: bool,
    /// The artifact was removed by this run
    pub artifact_removed: bool,
}

/// Every resource a drop may hold, released at most once.
///
/// Each field is taken when released, so a second [`Teardown::run`] is a
/// no-op.
pub struct Teardown {
    store: Arc<dyn RendezvousStore>,
    sessions: Sessions,
    listener: Option<DirectTransport>,
    subscription: Option<Subscription>,
    document: Option<DropRequestId>,
    swarm: Option<(Arc<SwarmTransportManager>, DropRequestId)>,
    artifact: Option<PathBuf>,
    session_key: Option<DropRequestId>,
}

impl Teardown {
    fn new(store: Arc<dyn RendezvousStore>, sessions: Sessions) -> Self {
        Self {
            store,
            sessions,
            listener: None,
            subscription: None,
            document: None,
            swarm: None,
            artifact: None,
            session_key: None,
        }
    }

    /// Release everything still held.
    ///
    /// Order: listener, subscription, document, swarm, artifact, session
    /// entry. Failures are logged and skipped.
    pub async fn run(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        if let Some(mut listener) = self.listener.take() {
            report.listener = listener.stop().await;
        }

        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
            report.unsubscribed = true;
        }

        if let Some(id) = self.document.take() {
            match self.store.delete(&id).await {
                Ok(deleted) => report.document_deleted = deleted,
                Err(e) => tracing::warn!("Teardown: failed to delete drop {}: {}", id.short(), e),
            }
        }

        if let Some((swarm, id)) = self.swarm.take() {
            report.swarm_removed = swarm.remove_drop(&id).await;
        }

        if let Some(path) = self.artifact.take() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.artifact_removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Teardown: failed to remove {}: {}", path.display(), e),
            }
        }

        if let Some(id) = self.session_key.take() {
            self.sessions.remove(&id);
        }

        tracing::debug!("Teardown released {:?}", report);
        report
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Handle
// ═══════════════════════════════════════════════════════════════════════════

/// Caller's handle on a published drop.
#[derive(Debug)]
pub struct SendHandle {
    id: DropRequestId,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<Result<()>>,
}

impl SendHandle {
    /// Id of the rendezvous document.
    #[must_use]
    pub fn id(&self) -> &DropRequestId {
        &self.id
    }

    /// Ask the drop to stop. Returns false if it already ended.
    pub fn cancel(&self) -> bool {
        self.control.send(Control::Cancel).is_ok()
    }

    /// Whether the drop task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal outcome.
    ///
    /// # Errors
    ///
    /// [`DropError::PeerDeclined`] for a decline, the failure otherwise.
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(DropError::InvalidState(format!("drop task failed: {e}"))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════════

/// Sender side of drops.
pub struct DropOrchestrator {
    config: DropConfig,
    store: Arc<dyn RendezvousStore>,
    events: EventBus,
    swarm: Option<Arc<SwarmTransportManager>>,
    cloak: Arc<dyn Cloak>,
    sessions: Sessions,
}

impl DropOrchestrator {
    /// Orchestrator publishing through `store` and reporting on `events`.
    ///
    /// Uses a [`LogCloak`] over the configured work directory until
    /// [`with_cloak`](Self::with_cloak) replaces it.
    #[must_use]
    pub fn new(config: DropConfig, store: Arc<dyn RendezvousStore>, events: EventBus) -> Self {
        let cloak = Arc::new(LogCloak::new(
            config.cloak.work_dir.clone(),
            config.cloak.params,
        ));
        Self {
            config,
            store,
            events,
            swarm: None,
            cloak,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Seed drops on `swarm` when the policy allows it.
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

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &DropConfig {
        &self.config
    }

    /// Drops currently holding transports.
    #[must_use]
    pub fn active_drops(&self) -> usize {
        self.sessions.len()
    }

    /// Transport details of a live drop.
    #[must_use]
    pub fn session(&self, id: &DropRequestId) -> Option<TransferSession> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Cancel a live drop. Returns false if it is unknown or already ending.
    pub fn cancel(&self, id: &DropRequestId) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|s| s.control.send(Control::Cancel).is_ok())
    }

    /// Cancel every live drop; returns how many were asked to stop.
    pub fn shutdown(&self) -> usize {
        let mut cancelled = 0;
        for session in self.sessions.iter() {
            if session.control.send(Control::Cancel).is_ok() {
                cancelled += 1;
            }
        }
        tracing::info!("Cancelled {} active drops", cancelled);
        cancelled
    }

    /// Send `file` to `receiver_username`.
    ///
    /// Returns once the document is published and subscribed; the transfer
    /// then continues in the background.
    ///
    /// # Errors
    ///
    /// - [`DropError::CloakFailure`] if no artifact is produced
    /// - [`DropError::TransportStartFailure`] if the listener cannot bind
    /// - [`DropError::RendezvousFailure`] if the document cannot be written
    ///   or watched
    ///
    /// Resources acquired before the failing step are released.
    pub async fn initiate_send(
        &self,
        file: &Path,
        receiver_username: &str,
        sender_username: &str,
        original_filename: &str,
    ) -> Result<SendHandle> {
        let policy = self.config.policy;
        if policy == TransferPolicy::Swarm && self.swarm.is_none() {
            return Err(DropError::InvalidConfig(
                "swarm policy requires a swarm manager".into(),
            ));
        }

        let started_at = Instant::now();
        self.events.publish(DropEvent::status(
            None,
            "Preparing",
            format!("Cloaking {original_filename}"),
        ));
        let mut teardown = Teardown::new(self.store.clone(), self.sessions.clone());

        // 1. secret
        let secret = Secret::generate();

        // 2. cloak
        let artifact = match self.cloak_file(file, &secret).await {
            Ok(artifact) => artifact,
            Err(e) => return Err(self.abort(None, e, &mut teardown).await),
        };
        teardown.artifact = Some(artifact.path.clone());

        // 3. direct listener
        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        let token = self.config.direct.require_token.then_some(&secret);
        let mut listener =
            DirectTransport::new(self.config.direct.clone(), &artifact.path, token, direct_tx);
        let port = match listener.start().await {
            Ok(port) => port,
            Err(e) => {
                let error = DropError::TransportStartFailure(e.to_string());
                return Err(self.abort(None, error, &mut teardown).await);
            }
        };
        teardown.listener = Some(listener);

        // swarm (seeded under a provisional id until the store assigns one)
        let mut link: Option<MagnetLink> = None;
        if let (true, Some(swarm)) = (policy.offers_swarm(), self.swarm.as_ref()) {
            let provisional = DropRequestId::generate();
            match swarm.start_seeding(&artifact.path, &provisional).await {
                Ok(magnet) => {
                    teardown.swarm = Some((swarm.clone(), provisional));
                    link = Some(magnet);
                }
                Err(e) if policy == TransferPolicy::Swarm => {
                    let error = DropError::TransportStartFailure(format!("swarm: {e}"));
                    return Err(self.abort(None, error, &mut teardown).await);
                }
                Err(e) => tracing::warn!("Swarm seeding failed, sending direct only: {}", e),
            }
        }

        // 4. document, only once a real port exists
        let draft = NewDropRequest {
            sender_id: sender_username.to_string(),
            sender_username: sender_username.to_string(),
            receiver_username: receiver_username.to_string(),
            original_filename: original_filename.to_string(),
            cloaked_filename: artifact.name.clone(),
            cloaked_file_size: artifact.size,
            secret: secret.value(),
            sender_address: SenderAddress {
                host: self.config.direct.published_host(),
                port,
            },
            swarm_link: link.as_ref().map(ToString::to_string),
        };
        let document = match self.store.create(draft).await {
            Ok(document) => document,
            Err(e) => {
                let error = DropError::RendezvousFailure(e.to_string());
                return Err(self.abort(None, error, &mut teardown).await);
            }
        };
        let id = document.id.clone();
        teardown.document = Some(id.clone());

        let mut swarm_rx = None;
        if let Some((swarm, key)) = teardown.swarm.as_mut() {
            if swarm.rekey_drop(key, &id) {
                *key = id.clone();
            }
            swarm_rx = Some(swarm.subscribe());
        }

        // 5. subscription
        let subscription = match self.store.subscribe(&id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let error = DropError::RendezvousFailure(e.to_string());
                return Err(self.abort(Some(&id), error, &mut teardown).await);
            }
        };

        let mut machine = SenderMachine::new(artifact.size, policy);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.sessions.insert(
            id.clone(),
            TransferSession {
                direct_port: port,
                info_hash: link.as_ref().map(|l| l.info_hash),
                started_at,
                control: control_tx.clone(),
            },
        );
        teardown.session_key = Some(id.clone());

        tracing::info!(
            "Drop {} published for {} ({} bytes, port {}{})",
            id.short(),
            receiver_username,
            artifact.size,
            port,
            if link.is_some() { ", swarm" } else { "" }
        );

        let mut task = DropTask {
            id: id.clone(),
            total_bytes: artifact.size,
            store: self.store.clone(),
            events: self.events.clone(),
            subscription: Some(subscription),
            direct_rx,
            swarm_rx,
            control_rx,
            teardown,
            deadline: tokio::time::Instant::now() + self.config.timeouts.acceptance,
        };
        let effects = machine.step(Input::Published {
            version: document.version,
        });
        task.apply(effects).await;
        let handle = tokio::spawn(task.run(machine));

        Ok(SendHandle {
            id,
            control: control_tx,
            task: handle,
        })
    }

    async fn cloak_file(&self, file: &Path, secret: &Secret) -> Result<CloakedArtifact> {
        let cloak = self.cloak.clone();
        let input = file.to_path_buf();
        let secret = secret.clone();
        let artifact = tokio::task::spawn_blocking(move || cloak.cloak(&input, &secret))
            .await
            .map_err(|e| DropError::CloakFailure(e.to_string()))??;

        match tokio::fs::metadata(&artifact.path).await {
            Ok(meta) if meta.is_file() => Ok(artifact),
            _ => Err(DropError::CloakFailure(format!(
                "artifact {} was not produced",
                artifact.path.display()
            ))),
        }
    }

    async fn abort(
        &self,
        id: Option<&DropRequestId>,
        error: DropError,
        teardown: &mut Teardown,
    ) -> DropError {
        tracing::error!("Drop preparation failed: {}", error);
        teardown.run().await;
        self.events
            .publish(DropEvent::error(id.cloned(), &error));
        error
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Per-drop task
// ═══════════════════════════════════════════════════════════════════════════

struct DropTask {
    id: DropRequestId,
    total_bytes: u64,
    store: Arc<dyn RendezvousStore>,
    events: EventBus,
    subscription: Option<Subscription>,
    direct_rx: mpsc::UnboundedReceiver<DirectEvent>,
    swarm_rx: Option<broadcast::Receiver<SwarmEvent>>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    teardown: Teardown,
    deadline: tokio::time::Instant,
}

impl DropTask {
    async fn run(mut self, mut machine: SenderMachine) -> Result<()> {
        let acceptance = tokio::time::sleep_until(self.deadline);
        tokio::pin!(acceptance);

        while !machine.is_terminal() {
            let input = tokio::select! {
                change = next_change(&mut self.subscription) => {
                    if change.is_none() {
                        self.subscription = None;
                    }
                    Input::Rendezvous(change)
                }
                Some(event) = self.direct_rx.recv() => Input::Direct(event),
                kind = next_swarm(&mut self.swarm_rx, &self.id) => Input::Swarm(kind),
                control = self.control_rx.recv() => match control {
                    Some(Control::Cancel) | None => Input::Cancel,
                },
                () = &mut acceptance, if machine.is_awaiting() => Input::AcceptanceTimeout,
            };
            let effects = machine.step(input);
            self.apply(effects).await;
        }

        let outcome = machine
            .outcome()
            .cloned()
            .unwrap_or(Outcome::Failed(DropError::InvalidState("drop ended early".into())));
        match &outcome {
            Outcome::Complete => tracing::info!("Drop {} delivered", self.id.short()),
            Outcome::Declined => tracing::info!("Drop {} declined by receiver", self.id.short()),
            Outcome::Failed(DropError::Cancelled) => {
                tracing::info!("Drop {} cancelled", self.id.short());
            }
            Outcome::Failed(e) => tracing::error!("Drop {} failed: {}", self.id.short(), e),
        }
        outcome.into_result()
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::WriteStatus(status) => {
                    write_status(self.store.clone(), &self.id, status).await;
                }
                Effect::Notify(notice) => {
                    self.events.publish(self.event_for(notice));
                }
                Effect::Teardown => {
                    self.teardown.subscription = self.subscription.take();
                    self.teardown.run().await;
                }
            }
        }
    }

    fn event_for(&self, notice: Notice) -> DropEvent {
        let id = self.id.clone();
        match notice {
            Notice::Waiting => DropEvent::status(Some(id), "Waiting for receiver", "Drop published"),
            Notice::Transferring => DropEvent::status(Some(id), "Transferring", "Receiver accepted"),
            Notice::Progress(bytes) => DropEvent::progress(id, bytes, self.total_bytes),
            Notice::Complete => DropEvent::complete(id, self.total_bytes),
            Notice::Declined => DropEvent::declined(id),
            Notice::Failed(e) => DropEvent::error(Some(id), &e),
        }
    }
}

async fn write_status(store: Arc<dyn RendezvousStore>, id: &DropRequestId, status: DropStatus) {
    if let Err(e) = store.update_status(id, status).await {
        tracing::warn!("Could not write {} to drop {}: {}", status, id.short(), e);
    }
}

async fn next_change(subscription: &mut Option<Subscription>) -> Option<DocumentChange> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn next_swarm(
    rx: &mut Option<broadcast::Receiver<SwarmEvent>>,
    id: &DropRequestId,
) -> SwarmEventKind {
    let Some(events) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match events.recv().await {
            Ok(event) if &event.drop_id == id => return event.kind,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Drop {} missed {} swarm events", id.short(), missed);
            }
            Err(broadcast::error::RecvError::Closed) => {
                *rx = None;
                return std::future::pending().await;
            }
        }
    }
}

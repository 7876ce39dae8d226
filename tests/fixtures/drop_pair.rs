//! Sender/receiver pair sharing one rendezvous store.
//!
//! ```no_run
//! use cloakdrop_integration_tests::fixtures::DropFixture;
//!
//! #[tokio::test]
//! async fn test_drop() {
//!     let fixture = DropFixture::new();
//!     let file = fixture.payload("photo.jpg", 4096);
//!     let orchestrator = fixture.orchestrator();
//!     // ... send, accept, assert ...
//! }
//! ```

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

use cloakdrop_cloak::CloakParams;
use cloakdrop_core::{DropConfig, DropEvent, DropOrchestrator, DropReceiver, EventBus};
use cloakdrop_rendezvous::{
    DocumentChange, DropRequestId, DropStatus, MemoryStore, RendezvousStore,
};

/// Temp directories, a shared [`MemoryStore`] and one event bus per side.
pub struct DropFixture {
    dir: TempDir,
    /// Store both sides talk to
    pub store: Arc<MemoryStore>,
    /// Sender events
    pub sender_events: EventBus,
    /// Receiver events
    pub receiver_events: EventBus,
}

impl DropFixture {
    /// Fresh fixture with its own temp directory.
    ///
    /// # Panics
    ///
    /// Panics if the temp directory cannot be created.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
            store: Arc::new(MemoryStore::new()),
            sender_events: EventBus::default(),
            receiver_events: EventBus::default(),
        }
    }

    /// Root of the fixture's temp directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Loopback sender config with cheap key derivation.
    pub fn sender_config(&self) -> DropConfig {
        self.config_in("sender")
    }

    /// Loopback receiver config with cheap key derivation.
    pub fn receiver_config(&self) -> DropConfig {
        self.config_in("receiver")
    }

    fn config_in(&self, side: &str) -> DropConfig {
        let mut config = DropConfig::default();
        config.direct.bind_addr = ([127, 0, 0, 1], 0).into();
        config.direct.connection_timeout = Duration::from_secs(5);
        config.direct.stop_timeout = Duration::from_secs(2);
        config.swarm.listen_addr = ([127, 0, 0, 1], 0).into();
        config.swarm.metadata_timeout = Duration::from_secs(10);
        config.swarm.state_update_interval = Duration::from_millis(50);
        config.cloak.work_dir = self.dir.path().join(side);
        config.cloak.params = CloakParams::low_security();
        config.timeouts.receive = Duration::from_secs(30);
        config
    }

    /// Sender using [`Self::sender_config`].
    pub fn orchestrator(&self) -> DropOrchestrator {
        self.orchestrator_with(self.sender_config())
    }

    /// Sender using `config` against the shared store.
    pub fn orchestrator_with(&self, config: DropConfig) -> DropOrchestrator {
        DropOrchestrator::new(config, self.store.clone(), self.sender_events.clone())
    }

    /// Receiver named `username` using [`Self::receiver_config`].
    pub fn receiver(&self, username: &str) -> DropReceiver {
        self.receiver_with(self.receiver_config(), username)
    }

    /// Receiver named `username` using `config` against the shared store.
    pub fn receiver_with(&self, config: DropConfig, username: &str) -> DropReceiver {
        DropReceiver::new(
            config,
            self.store.clone(),
            self.receiver_events.clone(),
            username,
        )
    }

    /// Write `len` deterministic pseudo-random bytes to `name`.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn payload(&self, name: &str, len: usize) -> PathBuf {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(len as u64).fill_bytes(&mut data);
        let path = self.dir.path().join(name);
        std::fs::write(&path, data).expect("write payload");
        path
    }

    /// Directory the receiver restores files into.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    pub fn downloads(&self) -> PathBuf {
        let path = self.dir.path().join("downloads");
        std::fs::create_dir_all(&path).expect("create downloads");
        path
    }

    /// Cloaked artifacts currently on the sender's disk.
    pub fn sender_artifacts(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.dir.path().join("sender")) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
            .collect()
    }
}

impl Default for DropFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain events already buffered on `rx`, then keep collecting for `settle`.
pub async fn collect_events(
    rx: &mut broadcast::Receiver<DropEvent>,
    settle: Duration,
) -> Vec<DropEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + settle;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => events.push(event),
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                tracing::warn!("Event collector lagged by {} events", n);
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }
    events
}

/// Wait until the document reaches `status`.
///
/// Returns `false` on timeout or when the document is deleted first.
pub async fn wait_for_status(
    store: &dyn RendezvousStore,
    id: &DropRequestId,
    status: DropStatus,
    timeout: Duration,
) -> bool {
    let Ok(mut subscription) = store.subscribe(id).await else {
        return false;
    };
    let wait = async {
        while let Some(change) = subscription.next().await {
            match change {
                DocumentChange::Snapshot(doc) if doc.status == status => return true,
                DocumentChange::Snapshot(_) => {}
                DocumentChange::Deleted => return false,
            }
        }
        false
    };
    tokio::time::timeout(timeout, wait).await.unwrap_or(false)
}

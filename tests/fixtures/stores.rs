//! Instrumented rendezvous stores.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use cloakdrop_rendezvous::{
    DropRequest, DropRequestId, DropStatus, Inbox, MemoryStore, NewDropRequest, RendezvousError,
    RendezvousStore, Subscription,
};

/// Memory store that counts writes.
#[derive(Default)]
pub struct CountingStore {
    /// Backing store
    pub inner: MemoryStore,
    creates: AtomicUsize,
    status_writes: AtomicUsize,
    deletes: AtomicUsize,
}

impl CountingStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls to `create`.
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Calls to `update_status`.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Calls to `delete`.
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RendezvousStore for CountingStore {
    async fn create(&self, request: NewDropRequest) -> Result<DropRequest, RendezvousError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(request).await
    }

    async fn get(&self, id: &DropRequestId) -> Result<Option<DropRequest>, RendezvousError> {
        self.inner.get(id).await
    }

    async fn subscribe(&self, id: &DropRequestId) -> Result<Subscription, RendezvousError> {
        self.inner.subscribe(id).await
    }

    async fn update_status(
        &self,
        id: &DropRequestId,
        status: DropStatus,
    ) -> Result<DropRequest, RendezvousError> {
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update_status(id, status).await
    }

    async fn delete(&self, id: &DropRequestId) -> Result<bool, RendezvousError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(id).await
    }

    async fn watch_inbox(&self, receiver_username: &str) -> Result<Inbox, RendezvousError> {
        self.inner.watch_inbox(receiver_username).await
    }
}

/// Memory store with switchable failures.
#[derive(Default)]
pub struct FailingStore {
    /// Backing store
    pub inner: MemoryStore,
    /// Fail every `create`
    pub fail_create: AtomicBool,
    /// Fail every `subscribe`
    pub fail_subscribe: AtomicBool,
}

impl FailingStore {
    /// Store whose creates fail.
    pub fn failing_create() -> Self {
        let store = Self::default();
        store.fail_create.store(true, Ordering::SeqCst);
        store
    }

    /// Store whose subscriptions fail.
    pub fn failing_subscribe() -> Self {
        let store = Self::default();
        store.fail_subscribe.store(true, Ordering::SeqCst);
        store
    }
}

#[async_trait]
impl RendezvousStore for FailingStore {
    async fn create(&self, request: NewDropRequest) -> Result<DropRequest, RendezvousError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RendezvousError::Disconnected);
        }
        self.inner.create(request).await
    }

    async fn get(&self, id: &DropRequestId) -> Result<Option<DropRequest>, RendezvousError> {
        self.inner.get(id).await
    }

    async fn subscribe(&self, id: &DropRequestId) -> Result<Subscription, RendezvousError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(RendezvousError::Disconnected);
        }
        self.inner.subscribe(id).await
    }

    async fn update_status(
        &self,
        id: &DropRequestId,
        status: DropStatus,
    ) -> Result<DropRequest, RendezvousError> {
        self.inner.update_status(id, status).await
    }

    async fn delete(&self, id: &DropRequestId) -> Result<bool, RendezvousError> {
        self.inner.delete(id).await
    }

    async fn watch_inbox(&self, receiver_username: &str) -> Result<Inbox, RendezvousError> {
        self.inner.watch_inbox(receiver_username).await
    }
}

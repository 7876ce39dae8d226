//! In-process rendezvous store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use crate::error::RendezvousError;
use crate::model::{DocumentChange, DropRequest, DropRequestId, DropStatus, NewDropRequest};
use crate::store::{Inbox, RendezvousStore, Subscription};

type ChangeTx = mpsc::UnboundedSender<DocumentChange>;
type InboxTx = mpsc::UnboundedSender<DropRequest>;

#[derive(Default)]
struct MemoryInner {
    /// Document id -> document
    docs: DashMap<DropRequestId, DropRequest>,
    /// Document id -> (watch id, sender)
    watchers: DashMap<DropRequestId, Vec<(u64, ChangeTx)>>,
    /// Watch id -> (receiver username, sender)
    inboxes: DashMap<u64, (String, InboxTx)>,
    next_watch: AtomicU64,
}

impl MemoryInner {
    /// Push a change to every watcher of `id`, dropping closed ones.
    ///
    /// Callers that need ordering hold the document's map entry while
    /// calling this.
    fn notify(&self, id: &DropRequestId, change: &DocumentChange) {
        if let Some(mut list) = self.watchers.get_mut(id) {
            list.retain(|(_, tx)| tx.send(change.clone()).is_ok());
        }
    }

    fn notify_inboxes(&self, request: &DropRequest) {
        self.inboxes.retain(|_, (user, tx)| {
            if *user != request.receiver_username {
                return !tx.is_closed();
            }
            tx.send(request.clone()).is_ok()
        });
    }
}

/// Rendezvous store held entirely in memory.
///
/// Cheap to clone; clones share the same documents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.docs.len()
    }

    /// Whether the store holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.docs.is_empty()
    }

    /// Number of live document watchers for `id`.
    #[must_use]
    pub fn watcher_count(&self, id: &DropRequestId) -> usize {
        self.inner
            .watchers
            .get(id)
            .map(|list| list.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn next_watch_id(&self) -> u64 {
        self.inner.next_watch.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, request: DropRequest) -> DropRequest {
        let id = request.id.clone();
        self.inner.docs.insert(id.clone(), request.clone());
        tracing::debug!(
            "Created drop request {} for {}",
            id.short(),
            request.receiver_username
        );
        self.inner.notify_inboxes(&request);
        request
    }
}

#[async_trait]
impl RendezvousStore for MemoryStore {
    async fn create(&self, request: NewDropRequest) -> Result<DropRequest, RendezvousError> {
        request.validate()?;
        let mut id = DropRequestId::generate();
        while self.inner.docs.contains_key(&id) {
            id = DropRequestId::generate();
        }
        Ok(self.insert(request.into_request(id)))
    }

    async fn get(&self, id: &DropRequestId) -> Result<Option<DropRequest>, RendezvousError> {
        Ok(self.inner.docs.get(id).map(|doc| doc.value().clone()))
    }

    async fn subscribe(&self, id: &DropRequestId) -> Result<Subscription, RendezvousError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watch_id = self.next_watch_id();

        // Holding the document entry keeps writers out until the initial
        // snapshot is queued, so no change is missed or reordered.
        match self.inner.docs.get(id) {
            Some(doc) => {
                let _ = tx.send(DocumentChange::Snapshot(doc.value().clone()));
                self.inner
                    .watchers
                    .entry(id.clone())
                    .or_default()
                    .push((watch_id, tx));
            }
            None => {
                let _ = tx.send(DocumentChange::Deleted);
            }
        }

        let weak: Weak<MemoryInner> = Arc::downgrade(&self.inner);
        let doc_id = id.clone();
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(mut list) = inner.watchers.get_mut(&doc_id) {
                    list.retain(|(w, _)| *w != watch_id);
                }
                inner.watchers.remove_if(&doc_id, |_, list| list.is_empty());
            }
        }))
    }

    async fn update_status(
        &self,
        id: &DropRequestId,
        status: DropStatus,
    ) -> Result<DropRequest, RendezvousError> {
        let mut doc = self
            .inner
            .docs
            .get_mut(id)
            .ok_or_else(|| RendezvousError::NotFound(id.clone()))?;
        let previous = doc.status;
        doc.status = status;
        doc.version += 1;
        let snapshot = doc.value().clone();
        self.inner
            .notify(id, &DocumentChange::Snapshot(snapshot.clone()));
        drop(doc);

        tracing::debug!(
            "Drop request {} status {} -> {} (v{})",
            id.short(),
            previous,
            status,
            snapshot.version
        );
        Ok(snapshot)
    }

    async fn delete(&self, id: &DropRequestId) -> Result<bool, RendezvousError> {
        if self.inner.docs.remove(id).is_none() {
            return Ok(false);
        }
        if let Some((_, list)) = self.inner.watchers.remove(id) {
            for (_, tx) in list {
                let _ = tx.send(DocumentChange::Deleted);
            }
        }
        tracing::debug!("Deleted drop request {}", id.short());
        Ok(true)
    }

    async fn watch_inbox(&self, receiver_username: &str) -> Result<Inbox, RendezvousError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watch_id = self.next_watch_id();
        self.inner
            .inboxes
            .insert(watch_id, (receiver_username.to_string(), tx.clone()));

        let mut pending: Vec<DropRequest> = self
            .inner
            .docs
            .iter()
            .filter(|doc| {
                doc.receiver_username == receiver_username && doc.status == DropStatus::Pending
            })
            .map(|doc| doc.value().clone())
            .collect();
        pending.sort_by_key(|doc| doc.created_at_ms);
        for doc in pending {
            let _ = tx.send(doc);
        }

        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.inboxes.remove(&watch_id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SenderAddress;

    fn draft(receiver: &str) -> NewDropRequest {
        NewDropRequest {
            sender_id: "uid-alice".into(),
            sender_username: "alice".into(),
            receiver_username: receiver.into(),
            original_filename: "photo.jpg".into(),
            cloaked_filename: "syncd-1-abcd.log".into(),
            cloaked_file_size: 4096,
            secret: 654_321,
            sender_address: SenderAddress {
                host: None,
                port: 41_000,
            },
            swarm_link: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryStore::new();
        let doc = store.create(draft("bob")).await.unwrap();
        assert_eq!(doc.status, DropStatus::Pending);
        assert_eq!(store.get(&doc.id).await.unwrap(), Some(doc));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_placeholder_port() {
        let store = MemoryStore::new();
        let mut d = draft("bob");
        d.sender_address.port = 0;
        assert!(store.create(d).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_sees_snapshot_then_changes_in_order() {
        let store = MemoryStore::new();
        let doc = store.create(draft("bob")).await.unwrap();
        let mut sub = store.subscribe(&doc.id).await.unwrap();

        store
            .update_status(&doc.id, DropStatus::Accepted)
            .await
            .unwrap();
        store
            .update_status(&doc.id, DropStatus::Complete)
            .await
            .unwrap();
        assert!(store.delete(&doc.id).await.unwrap());

        let mut seen = Vec::new();
        while let Some(change) = sub.next().await {
            match change {
                DocumentChange::Snapshot(d) => seen.push(Some((d.status, d.version))),
                DocumentChange::Deleted => seen.push(None),
            }
        }
        assert_eq!(
            seen,
            vec![
                Some((DropStatus::Pending, 1)),
                Some((DropStatus::Accepted, 2)),
                Some((DropStatus::Complete, 3)),
                None,
            ]
        );
    }

    #[tokio::test]
    async fn test_subscribe_missing_document() {
        let store = MemoryStore::new();
        let mut sub = store
            .subscribe(&DropRequestId::new("missing"))
            .await
            .unwrap();
        assert_eq!(sub.next().await, Some(DocumentChange::Deleted));
    }

    #[tokio::test]
    async fn test_delete_twice() {
        let store = MemoryStore::new();
        let doc = store.create(draft("bob")).await.unwrap();
        assert!(store.delete(&doc.id).await.unwrap());
        assert!(!store.delete(&doc.id).await.unwrap());
        assert!(matches!(
            store.update_status(&doc.id, DropStatus::Error).await,
            Err(RendezvousError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_detaches() {
        let store = MemoryStore::new();
        let doc = store.create(draft("bob")).await.unwrap();
        let sub = store.subscribe(&doc.id).await.unwrap();
        assert_eq!(store.watcher_count(&doc.id), 1);
        sub.unsubscribe();
        assert_eq!(store.watcher_count(&doc.id), 0);
    }

    #[tokio::test]
    async fn test_watch_inbox_replays_and_filters() {
        let store = MemoryStore::new();
        let early = store.create(draft("bob")).await.unwrap();
        store.create(draft("carol")).await.unwrap();

        let mut inbox = store.watch_inbox("bob").await.unwrap();
        assert_eq!(inbox.next().await.unwrap().id, early.id);

        store.create(draft("carol")).await.unwrap();
        let late = store.create(draft("bob")).await.unwrap();
        assert_eq!(inbox.next().await.unwrap().id, late.id);
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let store = MemoryStore::new();
        let doc = store.create(draft("bob")).await.unwrap();
        store
            .update_status(&doc.id, DropStatus::Declined)
            .await
            .unwrap();
        let after = store
            .update_status(&doc.id, DropStatus::Accepted)
            .await
            .unwrap();
        assert_eq!(after.status, DropStatus::Accepted);
        assert_eq!(after.version, 3);
    }
}

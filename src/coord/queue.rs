//! Fair waiting list
//!
//! Entries are pushed under generated keys, so ties on `joinedAt` fall
//! back to insertion order. The queue holds at most one entry per identity
//! and, among live identities, one per display name; both are enforced by
//! cleanup on join rather than by constraints in the store.

use crate::core::errors::Result;
use crate::coord::types::{decode, paths, QueueEntry};
use crate::store::{server_timestamp, watch, DisconnectOp, Query, SharedStore, SubscriptionHandle};
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn SharedStore>,
}

impl Queue {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Add an identity to the queue.
    ///
    /// Returns the new entry key, or `None` when the identity is already
    /// queued. Entries with the same display name held by other identities
    /// are removed first.
    pub async fn join(&self, identity_id: &str, display_name: &str) -> Result<Option<String>> {
        if !self.entries_for(identity_id).await?.is_empty() {
            debug!(identity = %identity_id, "Already queued");
            return Ok(None);
        }

        let pruned = self.prune_duplicate_names(identity_id, display_name).await?;
        if pruned > 0 {
            info!(name = %display_name, pruned, "Removed same-name queue entries");
        }

        let key = self
            .store
            .push(
                paths::QUEUE,
                json!({
                    "userId": identity_id,
                    "name": display_name,
                    "joinedAt": server_timestamp(),
                }),
            )
            .await?;

        // A racing join (same identity from another tab, or same name) may
        // have pushed before our checks; the later key wins.
        let mut settled = self.prune_names(identity_id, display_name, Some(&key)).await?;
        let older: Vec<QueueEntry> = self
            .entries_for(identity_id)
            .await?
            .into_iter()
            .filter(|e| e.entry_id < key)
            .collect();
        settled += self.remove_entries(&older).await?;
        if settled > 0 {
            debug!(name = %display_name, settled, "Removed racing same-name entries");
        }

        if let Err(e) = self
            .store
            .on_disconnect(&paths::queue_entry(&key), DisconnectOp::Remove)
            .await
        {
            warn!(identity = %identity_id, entry = %key, "Could not register queue disconnect cleanup: {}", e);
        }

        info!(identity = %identity_id, name = %display_name, entry = %key, "Joined queue");
        Ok(Some(key))
    }

    /// Remove every entry held by the identity. Returns how many went.
    pub async fn leave(&self, identity_id: &str) -> Result<usize> {
        let entries = self.entries_for(identity_id).await?;
        let removed = self.remove_entries(&entries).await?;
        if removed > 0 {
            info!(identity = %identity_id, removed, "Left queue");
        }
        Ok(removed)
    }

    /// Entries held by one identity
    pub async fn entries_for(&self, identity_id: &str) -> Result<Vec<QueueEntry>> {
        let rows = self
            .store
            .query(paths::QUEUE, &Query::order_by("userId").equal_to(identity_id))
            .await?;
        decode_entries(rows)
    }

    /// Remove entries with `display_name` held by identities other than
    /// `identity_id`. Returns how many went.
    pub async fn prune_duplicate_names(&self, identity_id: &str, display_name: &str) -> Result<usize> {
        self.prune_names(identity_id, display_name, None).await
    }

    /// Same-name cleanup, optionally limited to entries pushed before `before_key`
    async fn prune_names(
        &self,
        identity_id: &str,
        display_name: &str,
        before_key: Option<&str>,
    ) -> Result<usize> {
        let rows = self
            .store
            .query(paths::QUEUE, &Query::order_by("name").equal_to(display_name))
            .await?;
        let doomed: Vec<String> = decode_entries(rows)?
            .into_iter()
            .filter(|e| e.identity_id != identity_id)
            .filter(|e| before_key.map_or(true, |k| e.entry_id.as_str() < k))
            .map(|e| paths::queue_entry(&e.entry_id))
            .collect();
        let mut removed = 0;
        for result in join_all(doomed.iter().map(|p| self.store.remove(p))).await {
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(name = %display_name, "Failed to remove duplicate queue entry: {}", e),
            }
        }
        Ok(removed)
    }

    /// Point an identity's entries at a new id, keeping their positions
    pub async fn reassign(&self, old_id: &str, new_id: &str, display_name: Option<&str>) -> Result<usize> {
        let entries = self.entries_for(old_id).await?;
        for entry in &entries {
            let entry_path = paths::queue_entry(&entry.entry_id);
            self.store
                .set(&format!("{}/userId", entry_path), Value::from(new_id))
                .await?;
            if let Some(name) = display_name {
                self.store
                    .set(&format!("{}/name", entry_path), Value::from(name))
                    .await?;
            }
        }
        Ok(entries.len())
    }

    /// All entries in queue order
    pub async fn snapshot_ordered(&self) -> Result<Vec<QueueEntry>> {
        load_ordered(self.store.as_ref(), None).await
    }

    /// First `n` entries in queue order
    pub async fn top(&self, n: usize) -> Result<Vec<QueueEntry>> {
        load_ordered(self.store.as_ref(), Some(n)).await
    }

    /// Push the ordered queue to `on_change` now and on every change
    pub fn subscribe<C>(&self, on_change: C) -> SubscriptionHandle
    where
        C: FnMut(Vec<QueueEntry>) + Send + 'static,
    {
        watch(
            self.store.clone(),
            vec![paths::QUEUE.to_string()],
            |store: Arc<dyn SharedStore>| async move { load_ordered(store.as_ref(), None).await },
            on_change,
        )
    }

    async fn remove_entries(&self, entries: &[QueueEntry]) -> Result<usize> {
        let doomed: Vec<String> = entries.iter().map(|e| paths::queue_entry(&e.entry_id)).collect();
        let results = join_all(doomed.iter().map(|p| self.store.remove(p))).await;
        let mut removed = 0;
        for result in results {
            result?;
            removed += 1;
        }
        Ok(removed)
    }
}

async fn load_ordered(store: &dyn SharedStore, limit: Option<usize>) -> Result<Vec<QueueEntry>> {
    let mut query = Query::order_by("joinedAt");
    if let Some(n) = limit {
        query = query.limit_to_first(n);
    }
    let rows = store.query(paths::QUEUE, &query).await?;
    decode_entries(rows)
}

fn decode_entries(rows: Vec<(String, Value)>) -> Result<Vec<QueueEntry>> {
    rows.into_iter()
        .map(|(key, value)| {
            let mut entry: QueueEntry = decode(value)?;
            entry.entry_id = key;
            Ok(entry)
        })
        .collect()
}

/// Read-only helpers over one queue snapshot
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueView {
    entries: Vec<QueueEntry>,
}

impl QueueView {
    pub fn new(entries: Vec<QueueEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identity_id: &str) -> bool {
        self.position(identity_id).is_some()
    }

    /// Zero-based position of the identity's first entry
    pub fn position(&self, identity_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.identity_id == identity_id)
    }

    /// Whether the identity would get a slot if a match started now
    pub fn is_in_top(&self, identity_id: &str, n: usize) -> bool {
        matches!(self.position(identity_id), Some(p) if p < n)
    }
}

impl From<Vec<QueueEntry>> for QueueView {
    fn from(entries: Vec<QueueEntry>) -> Self {
        Self::new(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn queue_on(server: &MemoryStore) -> Queue {
        Queue::new(Arc::new(server.connect()))
    }

    fn names(entries: &[QueueEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.display_name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let server = MemoryStore::new();
        let queue = queue_on(&server);

        assert!(queue.join("A1", "Alice").await.unwrap().is_some());
        assert!(queue.join("A1", "Alice").await.unwrap().is_none());
        assert_eq!(queue.snapshot_ordered().await.unwrap().len(), 1);

        assert_eq!(queue.leave("A1").await.unwrap(), 1);
        assert_eq!(queue.leave("A1").await.unwrap(), 0);
        assert!(queue.snapshot_ordered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_replaces_same_name_entry() {
        let server = MemoryStore::new();
        let queue = queue_on(&server);
        queue.join("A1", "Alice").await.unwrap();
        queue.join("local:alice", "Alice").await.unwrap();

        let entries = queue.snapshot_ordered().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identity_id, "local:alice");
    }

    #[tokio::test]
    async fn test_order_and_view() {
        let server = MemoryStore::new();
        let queue = queue_on(&server);
        for (id, name) in [("A1", "Alice"), ("A2", "Bob"), ("A3", "Carol")] {
            queue.join(id, name).await.unwrap();
        }
        let entries = queue.snapshot_ordered().await.unwrap();
        assert_eq!(names(&entries), vec!["Alice", "Bob", "Carol"]);
        assert_eq!(names(&queue.top(2).await.unwrap()), vec!["Alice", "Bob"]);

        let view = QueueView::from(entries);
        assert_eq!(view.position("A3"), Some(2));
        assert!(view.is_in_top("A2", 2));
        assert!(!view.is_in_top("A3", 2));
        assert!(!view.contains("A9"));
    }

    #[tokio::test]
    async fn test_entry_removed_on_disconnect() {
        let server = MemoryStore::new();
        let tab = server.connect();
        let queue = Queue::new(Arc::new(tab.clone()));
        queue.join("A1", "Alice").await.unwrap();

        tab.disconnect().await;
        assert_eq!(server.read("queue").await.unwrap(), None);
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<usize>) -> usize {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_delivers_empty_after_clear() {
        let server = MemoryStore::new();
        let queue = queue_on(&server);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = queue.subscribe(move |entries: Vec<QueueEntry>| {
            let _ = tx.send(entries.len());
        });

        assert_eq!(recv(&mut rx).await, 0);
        queue.join("A1", "Alice").await.unwrap();
        assert_eq!(recv(&mut rx).await, 1);
        queue.leave("A1").await.unwrap();
        assert_eq!(recv(&mut rx).await, 0);
    }
}

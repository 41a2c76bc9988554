//! Index store strategy and the in-memory implementation
//!
//! The index store is the only owner of item records. Every write goes through
//! the operations below, which are idempotent and safe to call concurrently.

use crate::error::{Result, SyncError};
use crate::message::Item;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record existed for the id
    Inserted,
    /// An older or equal version was overwritten
    Replaced,
    /// The stored record is newer; nothing was written
    Stale,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Replaced => "replaced",
            Self::Stale => "stale",
        }
    }
}

/// Result of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed,
    /// Nothing to delete; still a success
    Absent,
}

impl DeleteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Removed => "removed",
            Self::Absent => "absent",
        }
    }
}

/// Index store strategy
///
/// Implementations:
/// - `MemoryIndexStore`: process-local map, used in tests and single-node setups
/// - `ElasticIndexStore`: Elasticsearch index behind an alias
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert or overwrite the record for `item.id` unless the stored one is newer
    async fn upsert(&self, item: Item) -> Result<UpsertOutcome>;

    /// Remove the record if present
    async fn delete(&self, id: &str) -> Result<DeleteOutcome>;

    /// Replace the whole collection; readers see either the old or the new set
    ///
    /// Returns the number of records now stored.
    async fn bulk_replace(&self, items: Vec<Item>) -> Result<usize>;

    /// Whether the index holds no records
    async fn is_empty(&self) -> Result<bool>;

    /// Read a single record
    async fn get(&self, id: &str) -> Result<Option<Item>>;

    /// Number of records
    async fn count(&self) -> Result<usize>;

    /// Highest version stored, `None` when empty
    async fn latest_version(&self) -> Result<Option<u64>>;

    /// Store name for logs and health reporting
    fn name(&self) -> &'static str;
}

/// Collapse duplicate ids, keeping the highest version (last one wins on ties)
pub fn dedupe_latest(items: Vec<Item>) -> HashMap<String, Item> {
    let mut latest: HashMap<String, Item> = HashMap::with_capacity(items.len());
    for item in items {
        match latest.get(&item.id) {
            Some(existing) if !item.supersedes(existing) => {}
            _ => {
                latest.insert(item.id.clone(), item);
            }
        }
    }
    latest
}

// ============================================================================
// Memory Index Store
// ============================================================================

/// In-memory index store
///
/// Every operation takes the single lock once, so writes to the same id are
/// serialized and a bulk replace is a single swap.
#[derive(Default)]
pub struct MemoryIndexStore {
    items: RwLock<HashMap<String, Item>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `items`
    pub fn with_items(items: Vec<Item>) -> Self {
        Self {
            items: RwLock::new(dedupe_latest(items)),
        }
    }

    /// Copy of every record, sorted by id
    pub async fn snapshot(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self.items.read().await.values().cloned().collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn upsert(&self, item: Item) -> Result<UpsertOutcome> {
        if item.id.is_empty() {
            return Err(SyncError::index("item id is empty"));
        }

        let mut items = self.items.write().await;
        let outcome = match items.get(&item.id) {
            None => UpsertOutcome::Inserted,
            Some(stored) if item.supersedes(stored) => UpsertOutcome::Replaced,
            Some(stored) => {
                debug!(
                    id = %item.id,
                    incoming = item.version,
                    stored = stored.version,
                    "Ignoring stale upsert"
                );
                return Ok(UpsertOutcome::Stale);
            }
        };
        items.insert(item.id.clone(), item);
        Ok(outcome)
    }

    async fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        Ok(match self.items.write().await.remove(id) {
            Some(_) => DeleteOutcome::Removed,
            None => DeleteOutcome::Absent,
        })
    }

    async fn bulk_replace(&self, items: Vec<Item>) -> Result<usize> {
        if items.iter().any(|i| i.id.is_empty()) {
            return Err(SyncError::index("bulk replace contains an item with an empty id"));
        }

        // Staged off-lock, swapped in under one write lock
        let staged = dedupe_latest(items);
        let count = staged.len();
        *self.items.write().await = staged;

        info!(count, "Replaced in-memory index");
        Ok(count)
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.items.read().await.is_empty())
    }

    async fn get(&self, id: &str) -> Result<Option<Item>> {
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.items.read().await.len())
    }

    async fn latest_version(&self) -> Result<Option<u64>> {
        Ok(self.items.read().await.values().map(|i| i.version).max())
    }

    fn name(&self) -> &'static str {
        "memory_index"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn item(id: &str, version: u64, title: &str) -> Item {
        Item::new(id, version, json!({ "title": title }))
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryIndexStore::new();

        assert_eq!(store.upsert(item("42", 1, "X")).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(item("42", 1, "X")).await.unwrap(), UpsertOutcome::Replaced);

        assert_eq!(store.snapshot().await, vec![item("42", 1, "X")]);
    }

    #[tokio::test]
    async fn test_stale_upsert_is_ignored() {
        let store = MemoryIndexStore::new();
        store.upsert(item("1", 5, "new")).await.unwrap();

        assert_eq!(store.upsert(item("1", 3, "old")).await.unwrap(), UpsertOutcome::Stale);
        assert_eq!(store.get("1").await.unwrap().unwrap().payload, json!({"title": "new"}));
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let store = MemoryIndexStore::new();
        assert_eq!(store.delete("missing").await.unwrap(), DeleteOutcome::Absent);

        store.upsert(item("1", 1, "a")).await.unwrap();
        assert_eq!(store.delete("1").await.unwrap(), DeleteOutcome::Removed);
        assert_eq!(store.delete("1").await.unwrap(), DeleteOutcome::Absent);
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_bulk_replace_dedupes_and_replaces() {
        let store = MemoryIndexStore::with_items(vec![item("old", 1, "gone")]);

        let count = store
            .bulk_replace(vec![item("a", 1, "first"), item("a", 2, "second"), item("b", 1, "b")])
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert!(store.get("old").await.unwrap().is_none());
        assert_eq!(store.get("a").await.unwrap().unwrap().version, 2);
        assert_eq!(store.latest_version().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_empty_id_rejected() {
        let store = MemoryIndexStore::new();
        assert!(store.upsert(item("", 1, "x")).await.is_err());
        assert!(store.bulk_replace(vec![item("", 1, "x")]).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_partial_bulk_replace() {
        let old: Vec<Item> = (0..500).map(|i| item(&format!("old-{i}"), 1, "old")).collect();
        let new: Vec<Item> = (0..800).map(|i| item(&format!("new-{i}"), 1, "new")).collect();
        let store = Arc::new(MemoryIndexStore::with_items(old));

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..2_000 {
                    let count = store.count().await.unwrap();
                    assert!(count == 500 || count == 800, "observed partial state: {count}");
                    tokio::task::yield_now().await;
                }
            })
        };

        store.bulk_replace(new).await.unwrap();
        reader.await.unwrap();
        assert_eq!(store.count().await.unwrap(), 800);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_same_id_keep_highest_version() {
        let store = Arc::new(MemoryIndexStore::new());
        let mut handles = Vec::new();
        for version in (1..=50u64).rev() {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.upsert(item("hot", version, &version.to_string())).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get("hot").await.unwrap().unwrap().version, 50);
    }
}

//! Notification handler
//!
//! Turns one change notification into one index store call. Ordering and
//! retries are the consumer's job; the handler only reports success or error.

use async_trait::async_trait;
use search_sync_core::prelude::*;
use search_sync_core::{ConsumerMetrics, LatencyTimer};
use std::sync::Arc;
use tracing::debug;

/// What applying a notification did to the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Upserted(UpsertOutcome),
    Deleted(DeleteOutcome),
}

impl HandleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upserted(outcome) => outcome.as_str(),
            Self::Deleted(outcome) => outcome.as_str(),
        }
    }
}

/// Applies a change notification to the index
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, notification: &ChangeNotification) -> Result<HandleOutcome>;
}

/// Default handler backed by an `IndexStore`
///
/// Created and updated both upsert, so an update for an item the index never
/// saw inserts it. Deletes of unknown ids succeed.
pub struct NotificationHandler {
    store: Arc<dyn IndexStore>,
    metrics: ConsumerMetrics,
}

impl NotificationHandler {
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self {
            store,
            metrics: ConsumerMetrics::new("notification_handler"),
        }
    }
}

#[async_trait]
impl ChangeHandler for NotificationHandler {
    async fn handle(&self, notification: &ChangeNotification) -> Result<HandleOutcome> {
        let _timer = LatencyTimer::start(|elapsed| self.metrics.record_latency(elapsed));

        let outcome = match notification {
            ChangeNotification::Created { item } | ChangeNotification::Updated { item } => {
                HandleOutcome::Upserted(self.store.upsert(item.clone()).await?)
            }
            ChangeNotification::Deleted { id } => {
                HandleOutcome::Deleted(self.store.delete(id).await?)
            }
        };

        let kind = notification.kind();
        self.metrics.record_applied(kind.as_subject_suffix(), outcome.as_str());
        debug!(
            kind = %kind,
            id = notification.item_id(),
            outcome = outcome.as_str(),
            "Applied notification"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_sync_core::MemoryIndexStore;
    use serde_json::json;

    fn handler() -> (Arc<MemoryIndexStore>, NotificationHandler) {
        let store = Arc::new(MemoryIndexStore::new());
        (store.clone(), NotificationHandler::new(store))
    }

    #[tokio::test]
    async fn test_duplicate_created_leaves_one_record() {
        let (store, handler) = handler();
        let created = ChangeNotification::created(Item::new("42", 1, json!({"title": "Lamp"})));

        handler.handle(&created).await.unwrap();
        let second = handler.handle(&created).await.unwrap();

        assert_eq!(second, HandleOutcome::Upserted(UpsertOutcome::Replaced));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_for_unknown_id_inserts() {
        let (store, handler) = handler();
        let updated = ChangeNotification::updated(Item::new("7", 3, json!("Chair")));

        let outcome = handler.handle(&updated).await.unwrap();

        assert_eq!(outcome, HandleOutcome::Upserted(UpsertOutcome::Inserted));
        assert_eq!(store.get("7").await.unwrap().unwrap().payload, json!("Chair"));
    }

    #[tokio::test]
    async fn test_delete_then_create_leaves_item_present() {
        let (store, handler) = handler();

        let deleted = handler.handle(&ChangeNotification::deleted("9")).await.unwrap();
        handler
            .handle(&ChangeNotification::created(Item::new("9", 1, json!("Desk"))))
            .await
            .unwrap();

        assert_eq!(deleted, HandleOutcome::Deleted(DeleteOutcome::Absent));
        assert!(store.get("9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_update_is_ignored() {
        let (store, handler) = handler();
        handler
            .handle(&ChangeNotification::updated(Item::new("5", 4, json!("new"))))
            .await
            .unwrap();

        let outcome = handler
            .handle(&ChangeNotification::updated(Item::new("5", 2, json!("old"))))
            .await
            .unwrap();

        assert_eq!(outcome, HandleOutcome::Upserted(UpsertOutcome::Stale));
        assert_eq!(store.get("5").await.unwrap().unwrap().payload, json!("new"));
    }
}

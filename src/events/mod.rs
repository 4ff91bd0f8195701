//! In-process fan-out for lifecycle events: every event is durably recorded
//! via [`crate::db::append_event`] first, then broadcast to any attached SSE
//! subscribers for live streaming.

use anyhow::Result;
use tokio::sync::broadcast;

use crate::db::{self, DbPool, EventType, LifecycleEvent};

const CHANNEL_CAPACITY: usize = 1024;

/// Shared handle: cheap to clone, holds only a broadcast sender.
#[derive(Clone)]
pub struct EventLog {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Persists the event, then publishes it to live subscribers. Returns the
    /// stored event (assigned id, timestamp) on success.
    pub async fn record(
        &self,
        pool: &DbPool,
        preview_ref: &str,
        pull_request_number: Option<i64>,
        event_type: EventType,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<LifecycleEvent> {
        let event = db::append_event(pool, preview_ref, pull_request_number, event_type, message, metadata).await?;
        // No receivers is a normal, non-error condition.
        let _ = self.sender.send(event.clone());
        Ok(event)
    }

    /// Subscribes to all future events across every preview; callers filter
    /// by `preview_ref` themselves since Tokio broadcast channels have no
    /// server-side topic filtering.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Preview, PreviewKind, PreviewStatus};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;

    async fn test_pool() -> DbPool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await.unwrap();
        db::init_schema_for_test(&pool).await.unwrap();
        pool
    }

    fn sample_preview(id: &str) -> Preview {
        let now = chrono::Utc::now();
        Preview {
            preview_id: id.to_string(),
            owner_id: "acme".to_string(),
            kind: PreviewKind::Branch,
            pull_request_number: None,
            repo_owner: "acme".to_string(),
            repo_name: "app".to_string(),
            branch: "main".to_string(),
            commit_sha: "abc".to_string(),
            status: PreviewStatus::Creating,
            services: vec![],
            database: None,
            urls: HashMap::new(),
            env: HashMap::new(),
            password: None,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
        }
    }

    #[tokio::test]
    async fn recorded_events_are_broadcast_to_subscribers() {
        let pool = test_pool().await;
        db::insert_preview(&pool, &sample_preview("branch-main")).await.unwrap();

        let log = EventLog::new();
        let mut rx = log.subscribe();

        log.record(&pool, "branch-main", None, EventType::System, "hello", None)
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, "hello");
    }

    #[tokio::test]
    async fn record_fails_without_existing_preview() {
        let pool = test_pool().await;
        let log = EventLog::new();
        let result = log.record(&pool, "missing", None, EventType::System, "hi", None).await;
        assert!(result.is_err());
    }
}

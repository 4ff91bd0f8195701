//! Background sweeper: idle eviction, tombstone GC, quota enforcement,
//! orphan container sweep, and event retention. Runs on a fixed interval and
//! once ~5s after process start; ticks never overlap.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::Config;
use crate::db::{self, DbPool};
use crate::orchestrator::Orchestrator;
use crate::runtime::ContainerRuntime;

const INITIAL_DELAY: Duration = Duration::from_secs(5);

pub struct Reconciler {
    db: DbPool,
    runtime: Arc<dyn ContainerRuntime>,
    orchestrator: Arc<Orchestrator>,
    config: Config,
}

impl Reconciler {
    pub fn new(db: DbPool, runtime: Arc<dyn ContainerRuntime>, orchestrator: Arc<Orchestrator>, config: Config) -> Self {
        Self {
            db,
            runtime,
            orchestrator,
            config,
        }
    }

    /// Spawns the recurring tick loop. The returned handle is owned by the
    /// caller (typically dropped only on process shutdown).
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(INITIAL_DELAY).await;

            let mut interval = tokio::time::interval(Duration::from_secs(self.config.reconciler.interval_minutes * 60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }

    async fn tick(&self) {
        tracing::info!("reconciler tick starting");
        let started = std::time::Instant::now();

        let (idle, tombstones, quota, orphans, retention) = tokio::join!(
            self.idle_eviction(),
            self.tombstone_gc(),
            self.quota_enforcement(),
            self.orphan_sweep(),
            self.event_retention(),
        );

        for (task, result) in [
            ("idle_eviction", idle),
            ("tombstone_gc", tombstones),
            ("quota_enforcement", quota),
            ("orphan_sweep", orphans),
            ("event_retention", retention),
        ] {
            if let Err(e) = result {
                tracing::warn!(task, error = %e, "reconciler task failed");
            }
        }

        let elapsed = started.elapsed();
        crate::api::metrics::record_reconciler_tick_duration(elapsed.as_secs_f64());
        tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "reconciler tick complete");
    }

    async fn idle_eviction(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.reconciler.idle_timeout_hours);
        let idle = db::list_idle_running(&self.db, cutoff).await?;
        for preview in idle {
            tracing::info!(preview_id = %preview.preview_id, "evicting idle preview");
            if let Err(e) = self.orchestrator.destroy(&preview.preview_id).await {
                tracing::warn!(preview_id = %preview.preview_id, error = %e, "idle eviction failed");
            }
        }
        Ok(())
    }

    async fn tombstone_gc(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.reconciler.tombstone_ttl_hours);
        let tombstones = db::list_destroyed_tombstones(&self.db, cutoff).await?;
        for preview in tombstones {
            db::delete_events_for(&self.db, &preview.preview_id).await?;
            db::delete_preview(&self.db, &preview.preview_id).await?;
            tracing::debug!(preview_id = %preview.preview_id, "tombstone collected");
        }
        Ok(())
    }

    async fn quota_enforcement(&self) -> anyhow::Result<()> {
        if self.config.quota.max_previews_global == -1 {
            return Ok(());
        }
        let active = db::count_reconcilable_global(&self.db).await?;
        let overflow = active - self.config.quota.max_previews_global;
        if overflow <= 0 {
            return Ok(());
        }
        let oldest = db::list_reconcilable_oldest_first(&self.db).await?;
        for preview in oldest.into_iter().take(overflow as usize) {
            tracing::info!(preview_id = %preview.preview_id, "evicting preview over global quota");
            if let Err(e) = self.orchestrator.destroy(&preview.preview_id).await {
                tracing::warn!(preview_id = %preview.preview_id, error = %e, "quota eviction failed");
            }
        }
        Ok(())
    }

    async fn orphan_sweep(&self) -> anyhow::Result<()> {
        let containers = self.runtime.list_by_label("managed", Some("true")).await?;
        for container in containers {
            let Some(preview_id) = container.labels.get("preview") else {
                continue;
            };
            let record = db::get_preview(&self.db, preview_id).await?;
            let orphaned = match record {
                Some(p) => p.status == crate::db::PreviewStatus::Destroyed,
                None => true,
            };
            if orphaned {
                tracing::info!(container_id = %container.id, preview_id, "removing orphaned container");
                if let Err(e) = self.runtime.remove_container(&container.id, true).await {
                    tracing::warn!(container_id = %container.id, error = %e, "orphan removal failed");
                }
            }
        }
        Ok(())
    }

    async fn event_retention(&self) -> anyhow::Result<()> {
        let deleted = db::retention_sweep(&self.db, self.config.reconciler.event_retention_days).await?;
        if deleted > 0 {
            tracing::debug!(deleted, "event retention sweep removed rows");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Preview, PreviewKind, PreviewStatus};
    use crate::events::EventLog;
    use crate::provisioner::ProvisionerFactory;
    use crate::runtime::NoopRuntime;
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

    fn sample_preview(id: &str, status: PreviewStatus) -> Preview {
        let now = chrono::Utc::now();
        Preview {
            preview_id: id.to_string(),
            owner_id: "acme".to_string(),
            kind: PreviewKind::Branch,
            pull_request_number: None,
            repo_owner: "acme".to_string(),
            repo_name: "app".to_string(),
            branch: id.to_string(),
            commit_sha: "abc".to_string(),
            status,
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

    fn test_reconciler(db: DbPool, config: Config) -> Reconciler {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(NoopRuntime);
        let provisioners = Arc::new(ProvisionerFactory::new(
            Default::default(),
            Default::default(),
            Default::default(),
            None,
        ));
        let events = EventLog::new();
        let orchestrator = Arc::new(Orchestrator::new(db.clone(), runtime.clone(), provisioners, events, config.clone()));
        Reconciler::new(db, runtime, orchestrator, config)
    }

    #[tokio::test]
    async fn idle_eviction_destroys_previews_past_the_idle_timeout() {
        let pool = test_pool().await;
        let mut stale = sample_preview("stale", PreviewStatus::Running);
        stale.last_accessed_at = Utc::now() - chrono::Duration::hours(100);
        db::insert_preview(&pool, &stale).await.unwrap();

        let fresh = sample_preview("fresh", PreviewStatus::Running);
        db::insert_preview(&pool, &fresh).await.unwrap();

        let mut config = Config::default();
        config.reconciler.idle_timeout_hours = 24;
        let reconciler = test_reconciler(pool.clone(), config);

        reconciler.idle_eviction().await.unwrap();

        let stale_after = db::get_preview(&pool, "stale").await.unwrap().unwrap();
        assert_eq!(stale_after.status, PreviewStatus::Destroyed);
        let fresh_after = db::get_preview(&pool, "fresh").await.unwrap().unwrap();
        assert_eq!(fresh_after.status, PreviewStatus::Running);
    }

    #[tokio::test]
    async fn tombstone_gc_deletes_old_destroyed_previews_and_their_events() {
        let pool = test_pool().await;
        let mut tombstone = sample_preview("gone", PreviewStatus::Destroyed);
        tombstone.updated_at = Utc::now() - chrono::Duration::hours(100);
        db::insert_preview(&pool, &tombstone).await.unwrap();
        db::append_event(&pool, "gone", None, crate::db::EventType::System, "destroyed", None)
            .await
            .unwrap();

        let mut config = Config::default();
        config.reconciler.tombstone_ttl_hours = 24;
        let reconciler = test_reconciler(pool.clone(), config);

        reconciler.tombstone_gc().await.unwrap();

        assert!(db::get_preview(&pool, "gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn quota_enforcement_is_a_noop_when_global_quota_is_unlimited() {
        let pool = test_pool().await;
        let mut config = Config::default();
        config.quota.max_previews_global = -1;
        let reconciler = test_reconciler(pool, config);

        reconciler.quota_enforcement().await.unwrap();
    }

    #[tokio::test]
    async fn quota_enforcement_evicts_oldest_previews_over_the_global_cap() {
        let pool = test_pool().await;
        for (id, age_hours) in [("a", 3), ("b", 2), ("c", 1)] {
            let mut preview = sample_preview(id, PreviewStatus::Running);
            preview.last_accessed_at = Utc::now() - chrono::Duration::hours(age_hours);
            db::insert_preview(&pool, &preview).await.unwrap();
        }

        let mut config = Config::default();
        config.quota.max_previews_global = 2;
        let reconciler = test_reconciler(pool.clone(), config);

        reconciler.quota_enforcement().await.unwrap();

        let oldest = db::get_preview(&pool, "a").await.unwrap().unwrap();
        assert_eq!(oldest.status, PreviewStatus::Destroyed);
        let active = db::count_active_global(&pool).await.unwrap();
        assert_eq!(active, 2);
    }

    #[tokio::test]
    async fn quota_enforcement_does_not_count_or_evict_updating_previews() {
        let pool = test_pool().await;
        let mut updating = sample_preview("mid-update", PreviewStatus::Updating);
        updating.last_accessed_at = Utc::now() - chrono::Duration::hours(10);
        db::insert_preview(&pool, &updating).await.unwrap();

        let mut config = Config::default();
        config.quota.max_previews_global = 0;
        let reconciler = test_reconciler(pool.clone(), config);

        reconciler.quota_enforcement().await.unwrap();

        let after = db::get_preview(&pool, "mid-update").await.unwrap().unwrap();
        assert_eq!(after.status, PreviewStatus::Updating);
    }
}

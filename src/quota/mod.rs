//! Per-owner preview quota gate, consulted at Create time.

use anyhow::Result;

use crate::config::QuotaConfig;
use crate::db::{self, DbPool};

#[derive(Debug, thiserror::Error)]
#[error("quota exceeded for owner {owner}: {active}/{max} active previews")]
pub struct QuotaExceeded {
    pub owner: String,
    pub active: i64,
    pub max: i64,
}

/// Succeeds when `owner` has fewer than `maxPreviewsPerOwner` active previews
/// (status in `{CREATING, RUNNING, UPDATING}`), or when the limit is -1
/// (unlimited).
pub async fn check(pool: &DbPool, owner: &str, config: &QuotaConfig) -> Result<()> {
    if config.max_previews_per_owner == -1 {
        return Ok(());
    }
    let active = db::count_active_for_owner(pool, owner).await?;
    if active < config.max_previews_per_owner {
        return Ok(());
    }
    Err(QuotaExceeded {
        owner: owner.to_string(),
        active,
        max: config.max_previews_per_owner,
    }
    .into())
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

    fn sample_preview(id: &str, owner: &str, status: PreviewStatus) -> Preview {
        let now = chrono::Utc::now();
        Preview {
            preview_id: id.to_string(),
            owner_id: owner.to_string(),
            kind: PreviewKind::Branch,
            pull_request_number: None,
            repo_owner: owner.to_string(),
            repo_name: "app".to_string(),
            branch: "main".to_string(),
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

    #[tokio::test]
    async fn unlimited_quota_always_passes() {
        let pool = test_pool().await;
        let config = QuotaConfig {
            max_previews_global: -1,
            max_previews_per_owner: -1,
        };
        assert!(check(&pool, "acme", &config).await.is_ok());
    }

    #[tokio::test]
    async fn denies_when_at_limit() {
        let pool = test_pool().await;
        db::insert_preview(&pool, &sample_preview("pr-1", "acme", PreviewStatus::Running))
            .await
            .unwrap();
        let config = QuotaConfig {
            max_previews_global: -1,
            max_previews_per_owner: 1,
        };
        assert!(check(&pool, "acme", &config).await.is_err());
    }

    #[tokio::test]
    async fn allows_under_limit() {
        let pool = test_pool().await;
        db::insert_preview(&pool, &sample_preview("pr-1", "acme", PreviewStatus::Running))
            .await
            .unwrap();
        let config = QuotaConfig {
            max_previews_global: -1,
            max_previews_per_owner: 2,
        };
        assert!(check(&pool, "acme", &config).await.is_ok());
    }
}

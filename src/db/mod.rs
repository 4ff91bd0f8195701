mod models;

pub use models::*;

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

pub type DbPool = SqlitePool;

/// Execute a SQL migration file, stripping `--` comment lines and splitting
/// on `;`, the same loader the teacher uses for its own flat `.sql` files.
async fn execute_sql(pool: &SqlitePool, sql: &str) -> Result<()> {
    for statement in sql.split(';') {
        let cleaned: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let trimmed = cleaned.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }
    Ok(())
}

pub async fn init(data_dir: &Path) -> Result<DbPool> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("previewd.db");
    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    info!("Initializing metadata store at {}", db_path.display());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    run_migrations(&pool).await?;

    info!("Metadata store initialized");
    Ok(pool)
}

/// Exposed for other modules' tests (e.g. `events`) that need a schema-ready
/// in-memory pool without going through [`init`]'s filesystem path.
#[cfg(test)]
pub(crate) async fn init_schema_for_test(pool: &SqlitePool) -> Result<()> {
    run_migrations(pool).await
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations...");

    let has_previews_table: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name='previews'")
            .fetch_optional(pool)
            .await?;
    if has_previews_table.is_none() {
        execute_sql(pool, include_str!("../../migrations/001_previews.sql")).await?;
    }

    let has_events_table: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='lifecycle_events'",
    )
    .fetch_optional(pool)
    .await?;
    if has_events_table.is_none() {
        execute_sql(pool, include_str!("../../migrations/002_lifecycle_events.sql")).await?;
    }

    Ok(())
}

/// Optional filters for listing previews via the API.
#[derive(Debug, Default, Clone)]
pub struct PreviewFilter {
    pub status: Option<PreviewStatus>,
    pub repo_owner: Option<String>,
    pub repo_name: Option<String>,
}

pub async fn insert_preview(pool: &DbPool, preview: &Preview) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO previews (
            preview_id, owner_id, kind, pull_request_number, repo_owner, repo_name,
            branch, commit_sha, status, services_json, database_json, urls_json,
            env_json, password, created_at, updated_at, last_accessed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&preview.preview_id)
    .bind(&preview.owner_id)
    .bind(preview.kind_str())
    .bind(preview.pull_request_number)
    .bind(&preview.repo_owner)
    .bind(&preview.repo_name)
    .bind(&preview.branch)
    .bind(&preview.commit_sha)
    .bind(preview.status.to_string())
    .bind(preview.services_json()?)
    .bind(preview.database_json()?)
    .bind(preview.urls_json()?)
    .bind(preview.env_json()?)
    .bind(&preview.password)
    .bind(preview.created_at)
    .bind(preview.updated_at)
    .bind(preview.last_accessed_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Overwrites a tombstoned (`DESTROYED`) row in place so a `previewId` can be
/// recreated without tripping the `preview_id` primary key. Callers must have
/// already confirmed the existing row is a tombstone; this does not check.
pub async fn replace_preview(pool: &DbPool, preview: &Preview) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO previews (
            preview_id, owner_id, kind, pull_request_number, repo_owner, repo_name,
            branch, commit_sha, status, services_json, database_json, urls_json,
            env_json, password, created_at, updated_at, last_accessed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&preview.preview_id)
    .bind(&preview.owner_id)
    .bind(preview.kind_str())
    .bind(preview.pull_request_number)
    .bind(&preview.repo_owner)
    .bind(&preview.repo_name)
    .bind(&preview.branch)
    .bind(&preview.commit_sha)
    .bind(preview.status.to_string())
    .bind(preview.services_json()?)
    .bind(preview.database_json()?)
    .bind(preview.urls_json()?)
    .bind(preview.env_json()?)
    .bind(&preview.password)
    .bind(preview.created_at)
    .bind(preview.updated_at)
    .bind(preview.last_accessed_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Full replace of a preview's mutable fields, keyed by `preview_id`. All
/// mutation of a Preview record goes through this atomic find-and-update.
pub async fn update_preview(pool: &DbPool, preview: &Preview) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE previews SET
            branch = ?, commit_sha = ?, status = ?, services_json = ?,
            database_json = ?, urls_json = ?, env_json = ?, password = ?,
            updated_at = ?, last_accessed_at = ?
        WHERE preview_id = ?
        "#,
    )
    .bind(&preview.branch)
    .bind(&preview.commit_sha)
    .bind(preview.status.to_string())
    .bind(preview.services_json()?)
    .bind(preview.database_json()?)
    .bind(preview.urls_json()?)
    .bind(preview.env_json()?)
    .bind(&preview.password)
    .bind(preview.updated_at)
    .bind(preview.last_accessed_at)
    .bind(&preview.preview_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_preview(pool: &DbPool, preview_id: &str) -> Result<Option<Preview>> {
    let row: Option<PreviewRow> = sqlx::query_as("SELECT * FROM previews WHERE preview_id = ?")
        .bind(preview_id)
        .fetch_optional(pool)
        .await?;
    row.map(PreviewRow::into_preview).transpose()
}

/// Look up by canonical `previewId`, falling back to a numeric pull-request
/// number for backward compatibility (§9 identifier overloading).
pub async fn get_preview_by_identifier(pool: &DbPool, identifier: &str) -> Result<Option<Preview>> {
    if let Some(preview) = get_preview(pool, identifier).await? {
        return Ok(Some(preview));
    }
    if let Ok(pr_number) = identifier.parse::<i64>() {
        let row: Option<PreviewRow> = sqlx::query_as(
            "SELECT * FROM previews WHERE pull_request_number = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(pr_number)
        .fetch_optional(pool)
        .await?;
        return row.map(PreviewRow::into_preview).transpose();
    }
    Ok(None)
}

pub async fn list_previews(pool: &DbPool, filter: &PreviewFilter) -> Result<Vec<Preview>> {
    let mut sql = String::from("SELECT * FROM previews WHERE 1=1");
    if filter.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if filter.repo_owner.is_some() {
        sql.push_str(" AND repo_owner = ?");
    }
    if filter.repo_name.is_some() {
        sql.push_str(" AND repo_name = ?");
    }
    sql.push_str(" ORDER BY created_at DESC");

    let mut query = sqlx::query_as::<_, PreviewRow>(&sql);
    if let Some(status) = filter.status {
        query = query.bind(status.to_string());
    }
    if let Some(ref owner) = filter.repo_owner {
        query = query.bind(owner.clone());
    }
    if let Some(ref name) = filter.repo_name {
        query = query.bind(name.clone());
    }

    let rows = query.fetch_all(pool).await?;
    rows.into_iter().map(PreviewRow::into_preview).collect()
}

pub async fn count_active_for_owner(pool: &DbPool, owner_id: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM previews WHERE owner_id = ? AND status IN ('CREATING','RUNNING','UPDATING')",
    )
    .bind(owner_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn count_active_global(pool: &DbPool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM previews WHERE status IN ('CREATING','RUNNING','UPDATING')",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// `RUNNING` previews whose `lastAccessedAt` predates `cutoff`, oldest-by-access first.
pub async fn list_idle_running(pool: &DbPool, cutoff: DateTime<Utc>) -> Result<Vec<Preview>> {
    let rows: Vec<PreviewRow> = sqlx::query_as(
        "SELECT * FROM previews WHERE status = 'RUNNING' AND last_accessed_at < ? ORDER BY last_accessed_at ASC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(PreviewRow::into_preview).collect()
}

/// `DESTROYED` tombstones whose `updatedAt` predates `cutoff`.
pub async fn list_destroyed_tombstones(pool: &DbPool, cutoff: DateTime<Utc>) -> Result<Vec<Preview>> {
    let rows: Vec<PreviewRow> =
        sqlx::query_as("SELECT * FROM previews WHERE status = 'DESTROYED' AND updated_at < ?")
            .bind(cutoff)
            .fetch_all(pool)
            .await?;
    rows.into_iter().map(PreviewRow::into_preview).collect()
}

/// Oldest-by-`lastAccessedAt` active previews globally, for quota enforcement
/// overflow eviction.
pub async fn list_active_oldest_first(pool: &DbPool) -> Result<Vec<Preview>> {
    let rows: Vec<PreviewRow> = sqlx::query_as(
        "SELECT * FROM previews WHERE status IN ('CREATING','RUNNING','UPDATING') ORDER BY last_accessed_at ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(PreviewRow::into_preview).collect()
}

/// Narrower than [`count_active_global`]: the Reconciler's global-quota sweep
/// doesn't count previews already mid-`UPDATING`, unlike the owner-level gate
/// in [`count_active_for_owner`].
pub async fn count_reconcilable_global(pool: &DbPool) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM previews WHERE status IN ('CREATING','RUNNING')")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Narrower than [`list_active_oldest_first`]; see [`count_reconcilable_global`].
pub async fn list_reconcilable_oldest_first(pool: &DbPool) -> Result<Vec<Preview>> {
    let rows: Vec<PreviewRow> = sqlx::query_as(
        "SELECT * FROM previews WHERE status IN ('CREATING','RUNNING') ORDER BY last_accessed_at ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(PreviewRow::into_preview).collect()
}

pub async fn delete_preview(pool: &DbPool, preview_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM previews WHERE preview_id = ?")
        .bind(preview_id)
        .execute(pool)
        .await?;
    Ok(())
}

// --- Lifecycle event log -----------------------------------------------

pub async fn append_event(
    pool: &DbPool,
    preview_ref: &str,
    pull_request_number: Option<i64>,
    event_type: EventType,
    message: &str,
    metadata: Option<serde_json::Value>,
) -> Result<LifecycleEvent> {
    // Record-before-event ordering: an event may only be appended once the
    // preview record exists.
    if get_preview(pool, preview_ref).await?.is_none() {
        anyhow::bail!("no preview record for {preview_ref}: cannot append event before insert");
    }

    let now = Utc::now();
    let metadata_json = metadata.map(|v| v.to_string());
    let id = sqlx::query(
        r#"
        INSERT INTO lifecycle_events (preview_ref, pull_request_number, event_type, message, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(preview_ref)
    .bind(pull_request_number)
    .bind(event_type.as_str())
    .bind(message)
    .bind(&metadata_json)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(LifecycleEvent {
        id,
        preview_ref: preview_ref.to_string(),
        pull_request_number,
        event_type_raw: event_type.as_str().to_string(),
        message: message.to_string(),
        metadata: metadata_json,
        created_at: now,
    })
}

pub async fn list_events(
    pool: &DbPool,
    preview_ref: &str,
    event_type: Option<EventType>,
    limit: i64,
    offset: i64,
) -> Result<Vec<LifecycleEvent>> {
    let events = if let Some(t) = event_type {
        sqlx::query_as::<_, LifecycleEvent>(
            "SELECT * FROM lifecycle_events WHERE preview_ref = ? AND event_type = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(preview_ref)
        .bind(t.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, LifecycleEvent>(
            "SELECT * FROM lifecycle_events WHERE preview_ref = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(preview_ref)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?
    };
    Ok(events)
}

pub async fn count_events(pool: &DbPool, preview_ref: &str) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM lifecycle_events WHERE preview_ref = ?")
            .bind(preview_ref)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

pub async fn event_stats(pool: &DbPool, preview_ref: &str) -> Result<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT event_type, COUNT(*) FROM lifecycle_events WHERE preview_ref = ? GROUP BY event_type",
    )
    .bind(preview_ref)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}

pub async fn recent_events_oldest_first(
    pool: &DbPool,
    preview_ref: &str,
    limit: i64,
) -> Result<Vec<LifecycleEvent>> {
    let mut events: Vec<LifecycleEvent> = sqlx::query_as(
        "SELECT * FROM lifecycle_events WHERE preview_ref = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(preview_ref)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    events.reverse();
    Ok(events)
}

pub async fn delete_events_for(pool: &DbPool, preview_ref: &str) -> Result<()> {
    sqlx::query("DELETE FROM lifecycle_events WHERE preview_ref = ?")
        .bind(preview_ref)
        .execute(pool)
        .await?;
    Ok(())
}

/// Backstop for the store-level TTL: delete events older than `days`.
pub async fn retention_sweep(pool: &DbPool, days: i64) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(days);
    let result = sqlx::query("DELETE FROM lifecycle_events WHERE created_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    async fn test_pool() -> DbPool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn sample_preview(id: &str) -> Preview {
        let now = Utc::now();
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
            urls: Map::new(),
            env: Map::new(),
            password: None,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let pool = test_pool().await;
        let preview = sample_preview("branch-main");
        insert_preview(&pool, &preview).await.unwrap();
        let fetched = get_preview(&pool, "branch-main").await.unwrap().unwrap();
        assert_eq!(fetched.preview_id, "branch-main");
        assert_eq!(fetched.status, PreviewStatus::Creating);
    }

    #[tokio::test]
    async fn event_append_requires_existing_record() {
        let pool = test_pool().await;
        let result = append_event(&pool, "missing", None, EventType::System, "hi", None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn event_append_and_list_newest_first() {
        let pool = test_pool().await;
        let preview = sample_preview("branch-main");
        insert_preview(&pool, &preview).await.unwrap();
        append_event(&pool, "branch-main", None, EventType::System, "first", None)
            .await
            .unwrap();
        append_event(&pool, "branch-main", None, EventType::Deploy, "second", None)
            .await
            .unwrap();
        let events = list_events(&pool, "branch-main", None, 100, 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "second");
    }

    #[tokio::test]
    async fn quota_counts_only_active_statuses() {
        let pool = test_pool().await;
        let mut p1 = sample_preview("pr-1");
        p1.status = PreviewStatus::Running;
        insert_preview(&pool, &p1).await.unwrap();
        let mut p2 = sample_preview("pr-2");
        p2.status = PreviewStatus::Destroyed;
        insert_preview(&pool, &p2).await.unwrap();
        let count = count_active_for_owner(&pool, "acme").await.unwrap();
        assert_eq!(count, 1);
    }
}

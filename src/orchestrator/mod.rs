//! Create/Update/Destroy state machine for preview environments.
//!
//! Create(ownerId, config):
//!   1. Derive previewId.
//!   2. If a non-DESTROYED record with that id exists, delegate to Update.
//!   3. Quota gate; deny -> QuotaExceeded.
//!   4. Insert record in CREATING with empty services/urls.
//!   5. Emit system: "Starting preview creation".
//!   6. If database requested: provision + migrate; persist database.
//!   7. Pull every service image, emitting build events.
//!   8. Precompute every service's external URL.
//!   9. For each service in order: compute env, resolve magic variables,
//!      compute labels, create + start container, record instance and url.
//!   10. status=RUNNING, lastAccessedAt=now, persist.
//!
//! Update(previewId, config): stop/remove old containers (best-effort), then
//! repeat steps 7-9 against the existing database connection string.
//!
//! Destroy(identifier): stop/remove containers, destroy database, remove
//! images, mark DESTROYED. Idempotent on a missing record.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::db::{
    self, Database, DatabaseEngine, DbPool, EventType, Preview, PreviewConfig, PreviewStatus, ServiceInstance,
    ServiceStatus,
};
use crate::edge_router;
use crate::events::EventLog;
use crate::provisioner::ProvisionerFactory;
use crate::quota;
use crate::runtime::{ContainerRuntime, ContainerSpec};

pub struct Orchestrator {
    db: DbPool,
    runtime: Arc<dyn ContainerRuntime>,
    provisioners: Arc<ProvisionerFactory>,
    events: EventLog,
    config: Config,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        db: DbPool,
        runtime: Arc<dyn ContainerRuntime>,
        provisioners: Arc<ProvisionerFactory>,
        events: EventLog,
        config: Config,
    ) -> Self {
        Self {
            db,
            runtime,
            provisioners,
            events,
            config,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, preview_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(preview_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the per-id lock entry once a preview reaches a terminal state.
    /// Safe to call even if another holder still owns the `Arc`.
    fn reap_lock(&self, preview_id: &str) {
        self.locks.remove(preview_id);
    }

    pub async fn create(&self, owner_id: &str, config: PreviewConfig) -> Result<Preview> {
        validate_config(&config)?;

        let preview_id = crate::naming::preview_id(config.kind.into(), config.pull_request_number, &config.branch);
        let lock = self.lock_for(&preview_id);
        let _guard = lock.lock().await;

        let tombstoned = match db::get_preview(&self.db, &preview_id).await? {
            Some(existing) if existing.status != PreviewStatus::Destroyed => {
                // Still holding `_guard`: delegate to Update under the same
                // per-id serialization.
                return self.update_locked(&preview_id, config).await;
            }
            Some(_) => true,
            None => false,
        };

        quota::check(&self.db, owner_id, &self.config.quota).await?;

        let now = chrono::Utc::now();
        let mut preview = Preview {
            preview_id: preview_id.clone(),
            owner_id: owner_id.to_string(),
            kind: config.kind,
            pull_request_number: config.pull_request_number,
            repo_owner: config.repo_owner.clone(),
            repo_name: config.repo_name.clone(),
            branch: config.branch.clone(),
            commit_sha: config.commit_sha.clone(),
            status: PreviewStatus::Creating,
            services: vec![],
            database: None,
            urls: HashMap::new(),
            env: config.env.clone(),
            password: config.password.clone(),
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
        };
        if tombstoned {
            db::replace_preview(&self.db, &preview).await?;
        } else {
            db::insert_preview(&self.db, &preview).await?;
        }
        self.emit_system(&preview, "Starting preview creation").await;

        match self.provision_and_deploy(&mut preview, &config, true).await {
            Ok(()) => {
                preview.status = PreviewStatus::Running;
                preview.last_accessed_at = chrono::Utc::now();
                preview.updated_at = preview.last_accessed_at;
                db::update_preview(&self.db, &preview).await?;
                crate::api::metrics::record_preview_created();
                Ok(preview)
            }
            Err(e) => {
                preview.status = PreviewStatus::Failed;
                preview.updated_at = chrono::Utc::now();
                db::update_preview(&self.db, &preview).await?;
                self.emit_system(&preview, &format!("Create failed: {e}")).await;
                crate::api::metrics::record_preview_failed();
                Err(e)
            }
        }
    }

    pub async fn update(&self, preview_id: &str, config: PreviewConfig) -> Result<Preview> {
        let lock = self.lock_for(preview_id);
        let _guard = lock.lock().await;
        self.update_locked(preview_id, config).await
    }

    async fn update_locked(&self, preview_id: &str, config: PreviewConfig) -> Result<Preview> {
        validate_config(&config)?;

        let mut preview = db::get_preview(&self.db, preview_id)
            .await?
            .filter(|p| p.status != PreviewStatus::Destroyed)
            .context("NotFound: no such preview")?;

        preview.status = PreviewStatus::Updating;
        preview.commit_sha = config.commit_sha.clone();
        preview.updated_at = chrono::Utc::now();
        db::update_preview(&self.db, &preview).await?;

        for service in &preview.services {
            if let Err(e) = self.runtime.stop_container(&service.container_id, 10).await {
                tracing::warn!(preview_id, container_id = %service.container_id, error = %e, "stop failed during update");
            }
            if let Err(e) = self.runtime.remove_container(&service.container_id, true).await {
                tracing::warn!(preview_id, container_id = %service.container_id, error = %e, "remove failed during update");
            }
        }
        preview.services.clear();
        preview.urls.clear();

        match self.provision_and_deploy(&mut preview, &config, false).await {
            Ok(()) => {
                preview.status = PreviewStatus::Running;
                preview.last_accessed_at = chrono::Utc::now();
                preview.updated_at = preview.last_accessed_at;
                db::update_preview(&self.db, &preview).await?;
                Ok(preview)
            }
            Err(e) => {
                // Left in UPDATING per design: the next Update call retries.
                db::update_preview(&self.db, &preview).await?;
                self.emit_system(&preview, &format!("Update failed: {e}")).await;
                crate::api::metrics::record_preview_failed();
                Err(e)
            }
        }
    }

    pub async fn destroy(&self, identifier: &str) -> Result<()> {
        let preview = match db::get_preview_by_identifier(&self.db, identifier).await? {
            Some(p) => p,
            None => return Ok(()),
        };

        let lock = self.lock_for(&preview.preview_id);
        let _guard = lock.lock().await;

        let mut preview = db::get_preview(&self.db, &preview.preview_id)
            .await?
            .context("preview disappeared during destroy")?;

        preview.status = PreviewStatus::Destroying;
        preview.updated_at = chrono::Utc::now();
        db::update_preview(&self.db, &preview).await?;

        for service in &preview.services {
            if let Err(e) = self.runtime.stop_container(&service.container_id, 10).await {
                tracing::warn!(preview_id = %preview.preview_id, error = %e, "stop failed during destroy");
            }
            if let Err(e) = self.runtime.remove_container(&service.container_id, true).await {
                tracing::warn!(preview_id = %preview.preview_id, error = %e, "remove failed during destroy");
            }
        }

        if let Some(database) = &preview.database {
            if let Ok(provisioner) = self.provisioners.get(database.engine).await {
                if let Err(e) = provisioner
                    .destroy_database(&preview.preview_id, &database.name)
                    .await
                {
                    tracing::warn!(preview_id = %preview.preview_id, error = %e, "database destroy failed");
                }
            }
        }

        for service in &preview.services {
            if let Err(e) = self.runtime.remove_image(&service.image_tag, true).await {
                tracing::warn!(preview_id = %preview.preview_id, image = %service.image_tag, error = %e, "image removal failed");
            }
        }

        preview.status = PreviewStatus::Destroyed;
        preview.updated_at = chrono::Utc::now();
        db::update_preview(&self.db, &preview).await?;
        self.emit_system(&preview, "Preview destroyed").await;
        crate::api::metrics::record_preview_destroyed();
        self.reap_lock(&preview.preview_id);
        Ok(())
    }

    /// Shared Create-step-6..9 / Update-step-4 body: provision the database
    /// (Create only), pull every image, precompute URLs, then deploy each
    /// service in deterministic (sorted-by-name) order.
    async fn provision_and_deploy(
        &self,
        preview: &mut Preview,
        config: &PreviewConfig,
        provision_database: bool,
    ) -> Result<()> {
        if provision_database {
            if let Some(db_config) = &config.database {
                let provisioner = self.provisioners.get(db_config.engine).await?;
                let db_name = crate::naming::database_name(&preview.preview_id);
                let connection_string = provisioner
                    .create_database(&preview.preview_id, &db_name)
                    .await
                    .context("ProvisionError: failed to create database")?;
                if let Some(migrations_dir) = &db_config.migrations {
                    provisioner
                        .run_migrations(&connection_string, migrations_dir)
                        .await
                        .context("MigrationError: migrations failed")?;
                }
                preview.database = Some(Database {
                    engine: db_config.engine,
                    name: db_name,
                    connection_string,
                });
                db::update_preview(&self.db, preview).await?;
                self.emit(preview, EventType::Database, "Database provisioned").await;
            }
        }

        let mut ordered: Vec<(&String, &crate::db::ServiceConfig)> = config.services.iter().collect();
        ordered.sort_by_key(|(name, _)| name.clone());

        // Pulls run concurrently; all must finish before any container is created.
        let preview_id = preview.preview_id.clone();
        let pull_request_number = preview.pull_request_number;
        let pulls = ordered.iter().map(|(name, service)| {
            let name = name.to_string();
            let image_tag = service.image_tag.clone();
            let runtime = self.runtime.clone();
            let events = self.events.clone();
            let db = self.db.clone();
            let preview_id = preview_id.clone();
            async move {
                runtime
                    .pull_image(&image_tag, &|line| {
                        tracing::debug!(preview_id = %preview_id, service = %name, "{line}");
                    })
                    .await
                    .with_context(|| format!("RuntimeError: failed to pull image for service {name}"))?;
                let _ = events
                    .record(
                        &db,
                        &preview_id,
                        pull_request_number,
                        EventType::Build,
                        &format!("Pulled image {image_tag} for service {name}"),
                        None,
                    )
                    .await;
                Ok::<(), anyhow::Error>(())
            }
        });
        futures::future::try_join_all(pulls).await?;

        let mut urls = HashMap::new();
        for (name, service) in &ordered {
            let url = edge_router::external_url(
                &preview.preview_id,
                &preview.repo_owner,
                name,
                &self.config.edge_router,
            );
            urls.insert((*name).clone(), (url, service.port));
        }

        preview.urls = urls.iter().map(|(k, (url, _))| (k.clone(), url.clone())).collect();

        for (name, service) in ordered {
            let container_name = crate::naming::container_name(&preview.preview_id, name);
            let mut env: HashMap<String, String> = preview.env.clone();
            if let Some(database) = &preview.database {
                env.insert("DATABASE_URL".to_string(), database.connection_string.clone());
            }
            for (k, v) in &service.env {
                env.insert(k.clone(), v.clone());
            }

            let preview_ref: &Preview = preview;
            let resolved: Vec<(String, String)> = env
                .into_iter()
                .map(|(k, v)| (k, resolve_magic_variables(&v, preview_ref, &urls)))
                .collect();

            let (url, port) = urls.get(name).cloned().unwrap_or_default();
            let password = preview.password.as_deref();
            let labels = edge_router::generate_labels(
                &preview.preview_id,
                &preview.repo_owner,
                name,
                port,
                password,
                &self.config.edge_router,
            );

            let spec = ContainerSpec {
                name: container_name,
                image: service.image_tag.clone(),
                env: resolved,
                labels,
                exposed_port: Some(port),
                network: self.config.edge_router.network.clone(),
            };

            let container_id = self
                .runtime
                .create_container(&spec)
                .await
                .with_context(|| format!("RuntimeError: failed to create container for service {name}"))?;
            self.runtime
                .start_container(&container_id)
                .await
                .with_context(|| format!("RuntimeError: failed to start container for service {name}"))?;

            preview.services.push(ServiceInstance {
                name: name.to_string(),
                container_id,
                image_tag: service.image_tag.clone(),
                port,
                url: url.clone(),
                status: ServiceStatus::Running,
            });
            preview.urls.insert(name.to_string(), url);
            db::update_preview(&self.db, preview).await?;
            self.emit(preview, EventType::Deploy, &format!("Deployed service {name}")).await;
        }

        Ok(())
    }

    async fn emit(&self, preview: &Preview, event_type: EventType, message: &str) {
        let _ = self
            .events
            .record(
                &self.db,
                &preview.preview_id,
                preview.pull_request_number,
                event_type,
                message,
                None,
            )
            .await;
    }

    async fn emit_system(&self, preview: &Preview, message: &str) {
        self.emit(preview, EventType::System, message).await;
    }
}

fn validate_config(config: &PreviewConfig) -> Result<()> {
    if matches!(config.kind, crate::db::PreviewKind::PullRequest) && config.pull_request_number.is_none() {
        anyhow::bail!("ValidationError: pullRequestNumber is required when kind=pull_request");
    }
    if config.repo_owner.trim().is_empty() || config.repo_name.trim().is_empty() {
        anyhow::bail!("ValidationError: repoOwner and repoName must be non-empty");
    }
    if config.services.is_empty() {
        anyhow::bail!("ValidationError: services must be a non-empty map");
    }
    for (name, service) in &config.services {
        if service.image_tag.trim().is_empty() {
            anyhow::bail!("ValidationError: service {name} is missing imageTag");
        }
    }
    Ok(())
}

/// Replaces `${DATABASE_URL}` and `${<SERVICE>_URL}` tokens textually, once,
/// with no recursive expansion. Unknown tokens are left literal.
fn resolve_magic_variables(value: &str, preview: &Preview, urls: &HashMap<String, (String, u16)>) -> String {
    if !value.contains("${") {
        return value.to_string();
    }

    let mut result = value.to_string();

    let db_url = preview
        .database
        .as_ref()
        .map(|d| d.connection_string.clone())
        .unwrap_or_default();
    result = result.replace("${DATABASE_URL}", &db_url);

    for (name, (url, _)) in urls {
        let token = format!("${{{}_URL}}", name.to_uppercase());
        result = result.replace(&token, url);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_database_url_token() {
        let mut preview = sample_preview();
        preview.database = Some(Database {
            engine: DatabaseEngine::RelationalA,
            name: "pr_1_db".to_string(),
            connection_string: "postgres://x/pr_1_db".to_string(),
        });
        let urls = HashMap::new();
        let resolved = resolve_magic_variables("${DATABASE_URL}", &preview, &urls);
        assert_eq!(resolved, "postgres://x/pr_1_db");
    }

    #[test]
    fn resolves_service_url_token_case_insensitively_in_name() {
        let preview = sample_preview();
        let mut urls = HashMap::new();
        urls.insert("api".to_string(), ("http://api.preview.test".to_string(), 8080u16));
        let resolved = resolve_magic_variables("${API_URL}", &preview, &urls);
        assert_eq!(resolved, "http://api.preview.test");
    }

    #[test]
    fn leaves_unknown_tokens_literal() {
        let preview = sample_preview();
        let urls = HashMap::new();
        let resolved = resolve_magic_variables("${UNKNOWN_TOKEN}", &preview, &urls);
        assert_eq!(resolved, "${UNKNOWN_TOKEN}");
    }

    #[test]
    fn leaves_empty_database_url_when_no_database() {
        let preview = sample_preview();
        let urls = HashMap::new();
        let resolved = resolve_magic_variables("prefix-${DATABASE_URL}-suffix", &preview, &urls);
        assert_eq!(resolved, "prefix--suffix");
    }

    async fn test_pool() -> DbPool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await.unwrap();
        db::init_schema_for_test(&pool).await.unwrap();
        pool
    }

    fn test_orchestrator(db: DbPool) -> Orchestrator {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(crate::runtime::NoopRuntime);
        let provisioners = Arc::new(crate::provisioner::ProvisionerFactory::new(
            Default::default(),
            Default::default(),
            Default::default(),
            None,
        ));
        Orchestrator::new(db, runtime, provisioners, EventLog::new(), Config::default())
    }

    #[tokio::test]
    async fn create_reuses_preview_id_after_a_prior_destroy() {
        let pool = test_pool().await;
        let orchestrator = test_orchestrator(pool.clone());

        let mut tombstone = sample_preview();
        tombstone.status = PreviewStatus::Destroyed;
        db::insert_preview(&pool, &tombstone).await.unwrap();

        let mut services = HashMap::new();
        services.insert(
            "web".to_string(),
            crate::db::ServiceConfig {
                image_tag: "registry.test/app:latest".to_string(),
                port: 8080,
                env: HashMap::new(),
            },
        );
        let config = PreviewConfig {
            kind: crate::db::PreviewKind::PullRequest,
            pull_request_number: Some(1),
            repo_name: "app".to_string(),
            repo_owner: "acme".to_string(),
            branch: "feature".to_string(),
            commit_sha: "def".to_string(),
            services,
            database: None,
            env: HashMap::new(),
            password: None,
        };

        // The NoopRuntime fails the image pull, but create() must not choke
        // on the UNIQUE constraint re-inserting over the tombstoned row.
        let result = orchestrator.create("acme", config).await;
        assert!(result.is_err());

        let record = db::get_preview(&pool, "pr-1").await.unwrap().unwrap();
        assert_eq!(record.status, PreviewStatus::Failed);
    }

    fn sample_preview() -> Preview {
        let now = chrono::Utc::now();
        Preview {
            preview_id: "pr-1".to_string(),
            owner_id: "acme".to_string(),
            kind: crate::db::PreviewKind::PullRequest,
            pull_request_number: Some(1),
            repo_owner: "acme".to_string(),
            repo_name: "app".to_string(),
            branch: "feature".to_string(),
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
}

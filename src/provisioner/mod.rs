mod document;
mod relational_a;
mod relational_b;

pub use document::DocumentProvisioner;
pub use relational_a::RelationalAProvisioner;
pub use relational_b::RelationalBProvisioner;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::config::DatabaseEngineConfig;
use crate::db::models::DatabaseEngine;

/// Uniform capability every database engine backend implements.
#[async_trait]
pub trait DatabaseProvisioner: Send + Sync {
    /// Idempotent: if the database already exists, returns its connection
    /// string without re-initializing.
    async fn create_database(&self, preview_id: &str, db_name: &str) -> Result<String>;
    /// Execute migration files from `migrations_dir` against the target
    /// database. A migration error is fatal to the create path.
    async fn run_migrations(&self, connection_string: &str, migrations_dir: &str) -> Result<()>;
    /// Never fails loudly on a missing database.
    async fn destroy_database(&self, preview_id: &str, db_name: &str) -> Result<()>;
    async fn database_exists(&self, db_name: &str) -> Result<bool>;
    async fn connection_string_for(&self, db_name: &str) -> String;
    /// Releases all pooled connections. Invoked from the graceful-shutdown path.
    async fn close(&self);
}

/// Allows arbitrary-code migration files for the document engine without the
/// crate embedding a scripting runtime: the host process supplies an adapter
/// that knows how to execute a file against a `mongodb::Database`.
#[async_trait]
pub trait DocumentMigrationAdapter: Send + Sync {
    async fn run(&self, db: &mongodb::Database, file_path: &std::path::Path) -> Result<()>;
}

/// Memoizes one provisioner per engine behind a lazily-constructed,
/// `Arc`-wrapped singleton, the same pattern `detect_runtime` uses for the
/// container runtime.
pub struct ProvisionerFactory {
    relational_a: OnceCell<Arc<dyn DatabaseProvisioner>>,
    relational_b: OnceCell<Arc<dyn DatabaseProvisioner>>,
    document: OnceCell<Arc<dyn DatabaseProvisioner>>,
    relational_a_config: DatabaseEngineConfig,
    relational_b_config: DatabaseEngineConfig,
    document_config: DatabaseEngineConfig,
    document_migration_adapter: Option<Arc<dyn DocumentMigrationAdapter>>,
}

impl ProvisionerFactory {
    pub fn new(
        relational_a_config: DatabaseEngineConfig,
        relational_b_config: DatabaseEngineConfig,
        document_config: DatabaseEngineConfig,
        document_migration_adapter: Option<Arc<dyn DocumentMigrationAdapter>>,
    ) -> Self {
        Self {
            relational_a: OnceCell::new(),
            relational_b: OnceCell::new(),
            document: OnceCell::new(),
            relational_a_config,
            relational_b_config,
            document_config,
            document_migration_adapter,
        }
    }

    pub async fn get(&self, engine: DatabaseEngine) -> Result<Arc<dyn DatabaseProvisioner>> {
        match engine {
            DatabaseEngine::RelationalA => {
                self.relational_a
                    .get_or_try_init(|| async {
                        RelationalAProvisioner::connect(&self.relational_a_config)
                            .await
                            .map(|p| Arc::new(p) as Arc<dyn DatabaseProvisioner>)
                    })
                    .await
                    .cloned()
            }
            DatabaseEngine::RelationalB => {
                self.relational_b
                    .get_or_try_init(|| async {
                        RelationalBProvisioner::connect(&self.relational_b_config)
                            .await
                            .map(|p| Arc::new(p) as Arc<dyn DatabaseProvisioner>)
                    })
                    .await
                    .cloned()
            }
            DatabaseEngine::Document => {
                self.document
                    .get_or_try_init(|| async {
                        DocumentProvisioner::connect(
                            &self.document_config,
                            self.document_migration_adapter.clone(),
                        )
                        .await
                        .map(|p| Arc::new(p) as Arc<dyn DatabaseProvisioner>)
                    })
                    .await
                    .cloned()
            }
        }
    }

    /// Releases all pooled connections across every constructed provisioner.
    pub async fn close_all(&self) {
        if let Some(p) = self.relational_a.get() {
            p.close().await;
        }
        if let Some(p) = self.relational_b.get() {
            p.close().await;
        }
        if let Some(p) = self.document.get() {
            p.close().await;
        }
    }
}

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::Client;

use crate::config::DatabaseEngineConfig;

use super::{DatabaseProvisioner, DocumentMigrationAdapter};

const SENTINEL_COLLECTION: &str = "_previewd_init";

/// Document-store engine. Mongo databases are implicit — they exist once a
/// collection is written to them — so `create_database` materializes a
/// sentinel collection rather than issuing a create statement.
pub struct DocumentProvisioner {
    client: Client,
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    migration_adapter: Option<Arc<dyn DocumentMigrationAdapter>>,
}

impl DocumentProvisioner {
    pub async fn connect(
        config: &DatabaseEngineConfig,
        migration_adapter: Option<Arc<dyn DocumentMigrationAdapter>>,
    ) -> Result<Self> {
        let host = config.host.clone().unwrap_or_else(|| "localhost".to_string());
        let port = config.port.unwrap_or(27017);
        let user = config.user.clone();
        let password = config.password.clone();

        let admin_uri = match (&user, &password) {
            (Some(u), Some(p)) => format!("mongodb://{u}:{p}@{host}:{port}/admin"),
            _ => format!("mongodb://{host}:{port}"),
        };
        let client = Client::with_uri_str(&admin_uri)
            .await
            .context("failed to connect to document admin endpoint")?;

        Ok(Self {
            client,
            host,
            port,
            user,
            password,
            migration_adapter,
        })
    }

    fn uri_for(&self, db_name: &str) -> String {
        match (&self.user, &self.password) {
            (Some(u), Some(p)) => format!("mongodb://{u}:{p}@{}:{}/{db_name}", self.host, self.port),
            _ => format!("mongodb://{}:{}/{db_name}", self.host, self.port),
        }
    }
}

#[async_trait]
impl DatabaseProvisioner for DocumentProvisioner {
    async fn create_database(&self, _preview_id: &str, db_name: &str) -> Result<String> {
        let db = self.client.database(db_name);
        db.collection::<mongodb::bson::Document>(SENTINEL_COLLECTION)
            .insert_one(doc! { "created_at": mongodb::bson::DateTime::now() })
            .await
            .context("failed to materialize document database")?;
        Ok(self.connection_string_for(db_name).await)
    }

    async fn run_migrations(&self, connection_string: &str, migrations_dir: &str) -> Result<()> {
        let client = Client::with_uri_str(connection_string)
            .await
            .context("failed to connect to target database for migrations")?;
        let db_name = client
            .default_database()
            .context("migration connection string must name a database")?
            .name()
            .to_string();
        let db = client.database(&db_name);

        let mut entries: Vec<_> = std::fs::read_dir(migrations_dir)
            .context("failed to read migrations directory")?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => {
                    let stem = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or("seed")
                        .to_string();
                    let contents = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read seed file {path:?}"))?;
                    let value: serde_json::Value = serde_json::from_str(&contents)
                        .with_context(|| format!("invalid JSON in seed file {path:?}"))?;
                    let docs: Vec<mongodb::bson::Document> = match value {
                        serde_json::Value::Array(items) => items
                            .into_iter()
                            .map(|v| mongodb::bson::to_document(&v))
                            .collect::<Result<_, _>>()
                            .with_context(|| format!("failed to convert seed JSON in {path:?}"))?,
                        other => vec![mongodb::bson::to_document(&other)
                            .with_context(|| format!("failed to convert seed JSON in {path:?}"))?],
                    };
                    if !docs.is_empty() {
                        db.collection::<mongodb::bson::Document>(&stem)
                            .insert_many(docs)
                            .await
                            .with_context(|| format!("seed insert failed for {path:?}"))?;
                    }
                }
                _ => {
                    if let Some(adapter) = &self.migration_adapter {
                        adapter
                            .run(&db, &path)
                            .await
                            .with_context(|| format!("migration adapter failed for {path:?}"))?;
                    }
                }
            }
        }

        Ok(())
    }

    async fn destroy_database(&self, _preview_id: &str, db_name: &str) -> Result<()> {
        if let Err(e) = self.client.database(db_name).drop().await {
            tracing::warn!(db_name, error = %e, "failed to drop document database");
        }
        Ok(())
    }

    async fn database_exists(&self, db_name: &str) -> Result<bool> {
        let names = self
            .client
            .list_database_names()
            .await
            .context("failed to list document databases")?;
        Ok(names.iter().any(|n| n == db_name))
    }

    async fn connection_string_for(&self, db_name: &str) -> String {
        self.uri_for(db_name)
    }

    async fn close(&self) {
        // The Mongo driver has no explicit close; connections are released on drop.
    }
}

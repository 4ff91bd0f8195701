use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseEngineConfig;

use super::DatabaseProvisioner;

/// Postgres-style engine. Create uses a pooled admin session; destroy first
/// terminates backends on the target database, then drops with `IF EXISTS`.
pub struct RelationalAProvisioner {
    admin_pool: PgPool,
    host: String,
    port: u16,
    user: String,
    password: String,
}

impl RelationalAProvisioner {
    pub async fn connect(config: &DatabaseEngineConfig) -> Result<Self> {
        let host = config.host.clone().unwrap_or_else(|| "localhost".to_string());
        let port = config.port.unwrap_or(5432);
        let user = config.user.clone().unwrap_or_else(|| "postgres".to_string());
        let password = config.password.clone().unwrap_or_default();

        let admin_url = format!("postgres://{user}:{password}@{host}:{port}/postgres");
        let admin_pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&admin_url)
            .await
            .context("failed to connect to relational-A admin endpoint")?;

        Ok(Self {
            admin_pool,
            host,
            port,
            user,
            password,
        })
    }

    fn url_for(&self, db_name: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, db_name
        )
    }
}

#[async_trait]
impl DatabaseProvisioner for RelationalAProvisioner {
    async fn create_database(&self, _preview_id: &str, db_name: &str) -> Result<String> {
        if self.database_exists(db_name).await? {
            return Ok(self.connection_string_for(db_name).await);
        }

        sqlx::query(&format!("CREATE DATABASE \"{db_name}\""))
            .execute(&self.admin_pool)
            .await
            .context("failed to create relational-A database")?;

        Ok(self.connection_string_for(db_name).await)
    }

    async fn run_migrations(&self, connection_string: &str, migrations_dir: &str) -> Result<()> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(connection_string)
            .await
            .context("failed to connect to target database for migrations")?;

        let mut entries: Vec<_> = std::fs::read_dir(migrations_dir)
            .context("failed to read migrations directory")?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "sql"))
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let sql = std::fs::read_to_string(entry.path())
                .with_context(|| format!("failed to read migration {:?}", entry.path()))?;
            sqlx::raw_sql(&sql)
                .execute(&pool)
                .await
                .with_context(|| format!("migration failed: {:?}", entry.path()))?;
        }

        pool.close().await;
        Ok(())
    }

    async fn destroy_database(&self, _preview_id: &str, db_name: &str) -> Result<()> {
        let terminate = sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(db_name)
        .execute(&self.admin_pool)
        .await;
        if let Err(e) = terminate {
            tracing::warn!(db_name, error = %e, "failed to terminate backends before drop");
        }

        if let Err(e) = sqlx::query(&format!("DROP DATABASE IF EXISTS \"{db_name}\""))
            .execute(&self.admin_pool)
            .await
        {
            tracing::warn!(db_name, error = %e, "failed to drop relational-A database");
        }
        Ok(())
    }

    async fn database_exists(&self, db_name: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT datname FROM pg_database WHERE datname = $1")
            .bind(db_name)
            .fetch_optional(&self.admin_pool)
            .await?;
        Ok(row.is_some())
    }

    async fn connection_string_for(&self, db_name: &str) -> String {
        self.url_for(db_name)
    }

    async fn close(&self) {
        self.admin_pool.close().await;
    }
}

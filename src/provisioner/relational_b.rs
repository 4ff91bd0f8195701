use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;

use crate::config::DatabaseEngineConfig;

use super::DatabaseProvisioner;

/// MySQL-style engine. Create/drop are idempotent SQL DDL against an admin
/// pool; migrations split file contents on `;` (mirrors the teacher's flat
/// `execute_sql` helper, generalized to an arbitrary target pool).
pub struct RelationalBProvisioner {
    admin_pool: MySqlPool,
    host: String,
    port: u16,
    user: String,
    password: String,
}

impl RelationalBProvisioner {
    pub async fn connect(config: &DatabaseEngineConfig) -> Result<Self> {
        let host = config.host.clone().unwrap_or_else(|| "localhost".to_string());
        let port = config.port.unwrap_or(3306);
        let user = config.user.clone().unwrap_or_else(|| "root".to_string());
        let password = config.password.clone().unwrap_or_default();

        let admin_url = format!("mysql://{user}:{password}@{host}:{port}/mysql");
        let admin_pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(&admin_url)
            .await
            .context("failed to connect to relational-B admin endpoint")?;

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
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, db_name
        )
    }
}

async fn execute_sql(pool: &MySqlPool, sql: &str) -> Result<()> {
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

#[async_trait]
impl DatabaseProvisioner for RelationalBProvisioner {
    async fn create_database(&self, _preview_id: &str, db_name: &str) -> Result<String> {
        sqlx::query(&format!("CREATE DATABASE IF NOT EXISTS `{db_name}`"))
            .execute(&self.admin_pool)
            .await
            .context("failed to create relational-B database")?;
        Ok(self.connection_string_for(db_name).await)
    }

    async fn run_migrations(&self, connection_string: &str, migrations_dir: &str) -> Result<()> {
        let pool = MySqlPoolOptions::new()
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
            execute_sql(&pool, &sql)
                .await
                .with_context(|| format!("migration failed: {:?}", entry.path()))?;
        }

        pool.close().await;
        Ok(())
    }

    async fn destroy_database(&self, _preview_id: &str, db_name: &str) -> Result<()> {
        if let Err(e) = sqlx::query(&format!("DROP DATABASE IF EXISTS `{db_name}`"))
            .execute(&self.admin_pool)
            .await
        {
            tracing::warn!(db_name, error = %e, "failed to drop relational-B database");
        }
        Ok(())
    }

    async fn database_exists(&self, db_name: &str) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT schema_name FROM information_schema.schemata WHERE schema_name = ?")
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

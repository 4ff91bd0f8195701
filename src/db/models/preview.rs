use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trigger that produced a preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewKind {
    PullRequest,
    Branch,
}

impl From<PreviewKind> for crate::naming::PreviewKind {
    fn from(k: PreviewKind) -> Self {
        match k {
            PreviewKind::PullRequest => crate::naming::PreviewKind::PullRequest,
            PreviewKind::Branch => crate::naming::PreviewKind::Branch,
        }
    }
}

/// Lifecycle status of a Preview record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PreviewStatus {
    Creating,
    Running,
    Updating,
    Destroying,
    Destroyed,
    Failed,
}

impl fmt::Display for PreviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PreviewStatus::Creating => "CREATING",
            PreviewStatus::Running => "RUNNING",
            PreviewStatus::Updating => "UPDATING",
            PreviewStatus::Destroying => "DESTROYING",
            PreviewStatus::Destroyed => "DESTROYED",
            PreviewStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PreviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATING" => Ok(PreviewStatus::Creating),
            "RUNNING" => Ok(PreviewStatus::Running),
            "UPDATING" => Ok(PreviewStatus::Updating),
            "DESTROYING" => Ok(PreviewStatus::Destroying),
            "DESTROYED" => Ok(PreviewStatus::Destroyed),
            "FAILED" => Ok(PreviewStatus::Failed),
            other => Err(format!("unknown preview status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Building,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Building => "BUILDING",
            ServiceStatus::Running => "RUNNING",
            ServiceStatus::Stopped => "STOPPED",
            ServiceStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseEngine {
    #[serde(rename = "relational-A")]
    RelationalA,
    #[serde(rename = "relational-B")]
    RelationalB,
    Document,
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DatabaseEngine::RelationalA => "relational-A",
            DatabaseEngine::RelationalB => "relational-B",
            DatabaseEngine::Document => "document",
        };
        write!(f, "{s}")
    }
}

/// One deployed workload within a preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub name: String,
    pub container_id: String,
    pub image_tag: String,
    pub port: u16,
    pub url: String,
    pub status: ServiceStatus,
}

/// The preview's dedicated database, if one was requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    pub engine: DatabaseEngine,
    pub name: String,
    pub connection_string: String,
}

/// Durable record for a single preview environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    pub preview_id: String,
    pub owner_id: String,
    pub kind: PreviewKind,
    pub pull_request_number: Option<i64>,
    pub repo_owner: String,
    pub repo_name: String,
    pub branch: String,
    pub commit_sha: String,
    pub status: PreviewStatus,
    pub services: Vec<ServiceInstance>,
    pub database: Option<Database>,
    pub urls: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// Raw row shape as persisted in the `previews` table: JSON-blob columns for
/// the nested collections, the same text-column-for-structured-data
/// convention the teacher uses for its own deployment metadata.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PreviewRow {
    pub preview_id: String,
    pub owner_id: String,
    pub kind: String,
    pub pull_request_number: Option<i64>,
    pub repo_owner: String,
    pub repo_name: String,
    pub branch: String,
    pub commit_sha: String,
    pub status: String,
    pub services_json: String,
    pub database_json: Option<String>,
    pub urls_json: String,
    pub env_json: String,
    pub password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl PreviewRow {
    pub fn into_preview(self) -> anyhow::Result<Preview> {
        let kind = match self.kind.as_str() {
            "pull_request" => PreviewKind::PullRequest,
            "branch" => PreviewKind::Branch,
            other => anyhow::bail!("unknown preview kind in row: {other}"),
        };
        Ok(Preview {
            preview_id: self.preview_id,
            owner_id: self.owner_id,
            kind,
            pull_request_number: self.pull_request_number,
            repo_owner: self.repo_owner,
            repo_name: self.repo_name,
            branch: self.branch,
            commit_sha: self.commit_sha,
            status: self.status.parse().map_err(anyhow::Error::msg)?,
            services: serde_json::from_str(&self.services_json)?,
            database: match self.database_json {
                Some(json) => Some(serde_json::from_str(&json)?),
                None => None,
            },
            urls: serde_json::from_str(&self.urls_json)?,
            env: serde_json::from_str(&self.env_json)?,
            password: self.password,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_accessed_at: self.last_accessed_at,
        })
    }
}

impl Preview {
    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            PreviewKind::PullRequest => "pull_request",
            PreviewKind::Branch => "branch",
        }
    }

    pub fn services_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.services)
    }

    pub fn database_json(&self) -> serde_json::Result<Option<String>> {
        self.database.as_ref().map(serde_json::to_string).transpose()
    }

    pub fn urls_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.urls)
    }

    pub fn env_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.env)
    }
}

/// One service entry in a `PreviewConfig` request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub image_tag: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_port() -> u16 {
    8080
}

/// Database section of a `PreviewConfig` request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub engine: DatabaseEngine,
    pub migrations: Option<String>,
}

/// Inbound request body for create/update.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewConfig {
    pub kind: PreviewKind,
    pub pull_request_number: Option<i64>,
    pub repo_name: String,
    pub repo_owner: String,
    pub branch: String,
    pub commit_sha: String,
    pub services: HashMap<String, ServiceConfig>,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub password: Option<String>,
}

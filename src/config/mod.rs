use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub edge_router: EdgeRouterConfig,
    #[serde(default)]
    pub relational_a: DatabaseEngineConfig,
    #[serde(default)]
    pub relational_b: DatabaseEngineConfig,
    #[serde(default)]
    pub document: DatabaseEngineConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// A single static bearer token, mapped to a synthetic `ownerId`. Full
    /// per-user OAuth tokens are out of scope.
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
    /// Synthetic owner id attributed to requests bearing `admin_token`.
    #[serde(default = "default_owner_id")]
    pub owner_id: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token: default_admin_token(),
            owner_id: default_owner_id(),
        }
    }
}

fn default_admin_token() -> String {
    "changeme".to_string()
}

fn default_owner_id() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Auto,
    Docker,
    Podman,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_type")]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
    #[serde(default = "default_podman_socket")]
    pub podman_socket: String,
    /// Deadline, in seconds, applied to every runtime call via
    /// `tokio::time::timeout`.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_type: default_runtime_type(),
            docker_socket: default_docker_socket(),
            podman_socket: default_podman_socket(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_runtime_type() -> RuntimeType {
    RuntimeType::Auto
}

fn default_docker_socket() -> String {
    if cfg!(windows) {
        "npipe:////./pipe/docker_engine".to_string()
    } else {
        "unix:///var/run/docker.sock".to_string()
    }
}

fn default_podman_socket() -> String {
    if cfg!(windows) {
        "npipe:////./pipe/docker_engine".to_string()
    } else {
        "unix:///run/podman/podman.sock".to_string()
    }
}

fn default_call_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdgeRouterConfig {
    /// Docker/Podman network the edge router (Traefik) listens on.
    #[serde(default = "default_edge_network")]
    pub network: String,
    /// Base domain appended to every generated external hostname.
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
    /// Enable TLS + certresolver labels.
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default = "default_cert_resolver")]
    pub cert_resolver: String,
    /// Protect every preview with basic-auth unless a service opts out.
    #[serde(default)]
    pub password_protect_default: bool,
    /// Password used when protection is on by default and the preview did
    /// not supply its own.
    pub fallback_password: Option<String>,
}

impl Default for EdgeRouterConfig {
    fn default() -> Self {
        Self {
            network: default_edge_network(),
            base_domain: default_base_domain(),
            tls_enabled: false,
            cert_resolver: default_cert_resolver(),
            password_protect_default: false,
            fallback_password: None,
        }
    }
}

fn default_edge_network() -> String {
    "previewd-edge".to_string()
}

fn default_base_domain() -> String {
    "preview.localhost".to_string()
}

fn default_cert_resolver() -> String {
    "letsencrypt".to_string()
}

/// Admin connection settings shared by the three database engines.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseEngineConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseEngineConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            user: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconciler_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_idle_timeout_hours")]
    pub idle_timeout_hours: i64,
    #[serde(default = "default_tombstone_ttl_hours")]
    pub tombstone_ttl_hours: i64,
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_reconciler_interval_minutes(),
            idle_timeout_hours: default_idle_timeout_hours(),
            tombstone_ttl_hours: default_tombstone_ttl_hours(),
            event_retention_days: default_event_retention_days(),
        }
    }
}

fn default_reconciler_interval_minutes() -> u64 {
    30
}

fn default_idle_timeout_hours() -> i64 {
    48
}

fn default_tombstone_ttl_hours() -> i64 {
    24
}

fn default_event_retention_days() -> i64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Global cap enforced by the Reconciler across all owners. -1 = unlimited.
    #[serde(default = "default_max_previews_global")]
    pub max_previews_global: i64,
    /// Default per-owner cap consulted at create time. -1 = unlimited.
    #[serde(default = "default_max_previews_per_owner")]
    pub max_previews_per_owner: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_previews_global: default_max_previews_global(),
            max_previews_per_owner: default_max_previews_per_owner(),
        }
    }
}

fn default_max_previews_global() -> i64 {
    -1
}

fn default_max_previews_per_owner() -> i64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Secret for verifying the source-hosting webhook signature (HMAC-SHA256,
    /// carried in `X-Hub-Signature-256`).
    pub secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { secret: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_requests_per_window")]
    pub api_requests_per_window: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            api_requests_per_window: default_api_requests_per_window(),
            window_seconds: default_window_seconds(),
        }
    }
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_api_requests_per_window() -> u32 {
    120
}

fn default_window_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            runtime: RuntimeConfig::default(),
            edge_router: EdgeRouterConfig::default(),
            relational_a: DatabaseEngineConfig::default(),
            relational_b: DatabaseEngineConfig::default(),
            document: DatabaseEngineConfig::default(),
            reconciler: ReconcilerConfig::default(),
            quota: QuotaConfig::default(),
            webhooks: WebhookConfig::default(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

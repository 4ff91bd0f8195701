pub mod api;
pub mod config;
pub mod db;
pub mod edge_router;
pub mod events;
pub mod naming;
pub mod orchestrator;
pub mod provisioner;
pub mod quota;
pub mod reconciler;
pub mod runtime;

pub use db::DbPool;

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::api::rate_limit::RateLimiter;
use crate::config::Config;
use crate::events::EventLog;
use crate::orchestrator::Orchestrator;
use crate::runtime::ContainerRuntime;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub orchestrator: Arc<Orchestrator>,
    pub events: EventLog,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: DbPool,
        runtime: Arc<dyn ContainerRuntime>,
        orchestrator: Arc<Orchestrator>,
        events: EventLog,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        Self {
            config,
            db,
            runtime,
            orchestrator,
            events,
            rate_limiter,
            metrics_handle: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

//! Prometheus metrics endpoint and HTTP request tracking middleware.
//!
//! Provides a `/metrics` endpoint (unauthenticated, per spec) plus counters
//! and gauges for preview lifecycle events and reconciler activity.

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::db;
use crate::AppState;

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

pub const PREVIEWS_CREATED_TOTAL: &str = "previewd_previews_created_total";
pub const PREVIEWS_DESTROYED_TOTAL: &str = "previewd_previews_destroyed_total";
pub const PREVIEWS_FAILED_TOTAL: &str = "previewd_previews_failed_total";
pub const ACTIVE_PREVIEWS: &str = "previewd_active_previews";
pub const RECONCILER_TICK_DURATION_SECONDS: &str = "previewd_reconciler_tick_duration_seconds";

/// Installs the Prometheus recorder. Call once at startup.
pub fn init_metrics() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder.install_recorder().expect("failed to install Prometheus recorder");

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request duration in seconds");

    describe_counter!(PREVIEWS_CREATED_TOTAL, "Total number of previews created");
    describe_counter!(PREVIEWS_DESTROYED_TOTAL, "Total number of previews destroyed");
    describe_counter!(PREVIEWS_FAILED_TOTAL, "Total number of previews that entered the FAILED state");
    describe_gauge!(ACTIVE_PREVIEWS, "Number of previews currently in CREATING/RUNNING/UPDATING");
    describe_histogram!(RECONCILER_TICK_DURATION_SECONDS, "Reconciler tick duration in seconds");

    handle
}

/// GET /metrics — unauthenticated, per spec.
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    update_gauge_metrics(&state).await;

    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "Metrics not initialized".to_string()),
    }
}

async fn update_gauge_metrics(state: &AppState) {
    if let Ok(count) = db::count_active_global(&state.db).await {
        gauge!(ACTIVE_PREVIEWS).set(count as f64);
    }
}

/// Tracks `http_requests_total` and `http_request_duration_seconds` for every request.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

pub fn record_preview_created() {
    counter!(PREVIEWS_CREATED_TOTAL).increment(1);
}

pub fn record_preview_destroyed() {
    counter!(PREVIEWS_DESTROYED_TOTAL).increment(1);
}

pub fn record_preview_failed() {
    counter!(PREVIEWS_FAILED_TOTAL).increment(1);
}

pub fn record_reconciler_tick_duration(duration_secs: f64) {
    histogram!(RECONCILER_TICK_DURATION_SECONDS).record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_follow_prometheus_conventions() {
        assert!(HTTP_REQUESTS_TOTAL.contains("_total"));
        assert!(PREVIEWS_CREATED_TOTAL.contains("_total"));
        assert!(HTTP_REQUEST_DURATION_SECONDS.contains("_seconds"));
        assert!(RECONCILER_TICK_DURATION_SECONDS.contains("_seconds"));
    }
}

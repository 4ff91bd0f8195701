pub mod auth;
pub mod error;
pub mod metrics;
mod previews;
pub mod rate_limit;
mod webhooks;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Authenticated by the admin bearer token.
    let preview_routes = Router::new()
        .route("/previews", post(previews::create_preview))
        .route("/previews", get(previews::list_previews))
        .route("/previews/:id", get(previews::get_preview))
        .route("/previews/:id", delete(previews::delete_preview))
        .route("/previews/:id/logs", get(previews::list_logs))
        .route("/previews/:id/logs/paginated", get(previews::list_logs_paginated))
        .route("/previews/:id/logs/stats", get(previews::logs_stats))
        .route("/previews/:id/logs/stream", get(previews::logs_stream))
        .route("/health", get(previews::health))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware));

    // Authenticated by HMAC signature over the raw body instead of the
    // bearer token, so it sits outside the auth middleware.
    let webhook_routes = Router::new().route("/webhooks/source", post(webhooks::source_webhook));

    let api_routes = preview_routes
        .merge(webhook_routes)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit::rate_limit));

    Router::new()
        .route("/metrics", get(metrics::metrics_endpoint))
        .nest("/api", api_routes)
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

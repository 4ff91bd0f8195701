//! Preview environment CRUD and lifecycle-log endpoints.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path, Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::auth::AuthenticatedOwner;
use crate::api::error::ApiError;
use crate::db::{self, EventType, LifecycleEvent, Preview, PreviewConfig, PreviewFilter, PreviewStatus};
use crate::AppState;

pub async fn create_preview(
    State(state): State<Arc<AppState>>,
    Extension(owner): Extension<AuthenticatedOwner>,
    Json(config): Json<PreviewConfig>,
) -> Result<Json<Preview>, ApiError> {
    let preview = state.orchestrator.create(&owner.0, config).await?;
    Ok(Json(preview))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPreviewsQuery {
    pub status: Option<PreviewStatus>,
    pub repo_owner: Option<String>,
    pub repo_name: Option<String>,
}

pub async fn list_previews(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListPreviewsQuery>,
) -> Result<Json<Vec<Preview>>, ApiError> {
    let filter = PreviewFilter {
        status: query.status,
        repo_owner: query.repo_owner,
        repo_name: query.repo_name,
    };
    let previews = db::list_previews(&state.db, &filter).await?;
    Ok(Json(previews))
}

pub async fn get_preview(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Preview>, ApiError> {
    let preview = db::get_preview_by_identifier(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no preview for identifier {id}")))?;
    Ok(Json(preview))
}

pub async fn delete_preview(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.destroy(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

fn resolve_preview_ref(preview: &Preview) -> &str {
    &preview.preview_id
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsQuery {
    #[serde(rename = "type")]
    pub event_type: Option<EventType>,
    #[serde(default = "default_logs_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_logs_limit() -> i64 {
    100
}

pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LifecycleEvent>>, ApiError> {
    let preview = db::get_preview_by_identifier(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no preview for identifier {id}")))?;
    let events = db::list_events(&state.db, resolve_preview_ref(&preview), query.event_type, query.limit, query.offset).await?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedLogsQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    50
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedLogsResponse {
    pub events: Vec<LifecycleEvent>,
    pub total: i64,
    pub pages: i64,
}

pub async fn list_logs_paginated(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<PaginatedLogsQuery>,
) -> Result<Json<PaginatedLogsResponse>, ApiError> {
    let preview = db::get_preview_by_identifier(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no preview for identifier {id}")))?;
    let preview_ref = resolve_preview_ref(&preview);

    let page = query.page.max(1);
    let page_size = query.page_size.max(1);
    let offset = (page - 1) * page_size;

    let total = db::count_events(&state.db, preview_ref).await?;
    let events = db::list_events(&state.db, preview_ref, None, page_size, offset).await?;
    let pages = (total + page_size - 1) / page_size.max(1);

    Ok(Json(PaginatedLogsResponse { events, total, pages }))
}

pub async fn logs_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<std::collections::HashMap<String, i64>>, ApiError> {
    let preview = db::get_preview_by_identifier(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no preview for identifier {id}")))?;
    let stats = db::event_stats(&state.db, resolve_preview_ref(&preview)).await?;
    Ok(Json(stats))
}

/// SSE live tail: backfills the most recent events, then forwards new ones
/// published on the broadcast channel as they're appended.
pub async fn logs_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let preview = db::get_preview_by_identifier(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no preview for identifier {id}")))?;
    let preview_ref = resolve_preview_ref(&preview).to_string();

    let backfill = db::recent_events_oldest_first(&state.db, &preview_ref, 50).await?;
    let backfill_stream = stream::iter(backfill.into_iter().map(to_sse_event));

    let preview_ref_filter = preview_ref.clone();
    let live_stream = tokio_stream::wrappers::BroadcastStream::new(state.events.subscribe())
        .filter_map(move |event| {
            let preview_ref_filter = preview_ref_filter.clone();
            async move {
                match event {
                    Ok(event) if event.preview_ref == preview_ref_filter => Some(to_sse_event(event)),
                    _ => None,
                }
            }
        });

    let combined = backfill_stream.chain(live_stream);
    Ok(Sse::new(combined).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn to_sse_event(event: LifecycleEvent) -> Result<SseEvent, Infallible> {
    Ok(SseEvent::default()
        .event(event.event_type_raw.clone())
        .json_data(event)
        .unwrap_or_else(|_| SseEvent::default().data("serialization error")))
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub runtime_available: bool,
    pub active_previews: i64,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthReport>, ApiError> {
    let runtime_available = state.runtime.is_available().await;
    let active_previews = db::count_active_global(&state.db).await?;
    Ok(Json(HealthReport {
        status: if runtime_available { "ok" } else { "degraded" },
        runtime_available,
        active_previews,
    }))
}

//! API route handlers.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use tracing::info;

use tokentap_storage::{RegisterDevice, UsageGroup};

use crate::error::{ApiError, Result};
use crate::models::{
    DeletedResponse, EventsQuery, EventsResponse, StatusResponse, UsageBreakdownResponse,
    UsageResponse,
};
use crate::state::AppState;

/// Header carrying the admin token on destructive endpoints.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Verifies the admin token on a destructive request.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::Forbidden(format!(
                "missing {ADMIN_TOKEN_HEADER} header (see admin.token in the tokentap state directory)"
            ))
        })?;

    if !state.security.verify_admin_token(presented)? {
        return Err(ApiError::Forbidden("invalid admin token".to_string()));
    }
    Ok(())
}

/// GET /api/events - list events with filters and pagination.
pub async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>> {
    let limit = query.limit.min(1000);
    let (events, total) = state
        .store
        .query_events(&query.filter(), query.offset, limit)?;
    Ok(Json(EventsResponse { events, total }))
}

/// GET /api/events/{id} - fetch one event.
pub async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<tokentap_storage::StoredEvent>> {
    state
        .store
        .get_event(id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("event {id}")))
}

/// DELETE /api/events/all - destructive; requires the admin token.
pub async fn delete_all_events(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DeletedResponse>> {
    require_admin(&state, &headers)?;
    let deleted = state.store.delete_all_events()?;
    info!(deleted, "all events deleted via admin endpoint");
    Ok(Json(DeletedResponse { deleted }))
}

/// GET /api/usage - aggregate totals.
pub async fn get_usage(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<UsageResponse>> {
    let totals = state.store.aggregate_usage(&query.filter())?;
    Ok(Json(UsageResponse { totals }))
}

/// GET /api/usage/models - usage grouped by model.
pub async fn usage_by_model(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<UsageBreakdownResponse>> {
    usage_by(state, query, UsageGroup::Model)
}

/// GET /api/usage/programs - usage grouped by program.
pub async fn usage_by_program(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<UsageBreakdownResponse>> {
    usage_by(state, query, UsageGroup::Program)
}

/// GET /api/usage/projects - usage grouped by project.
pub async fn usage_by_project(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<UsageBreakdownResponse>> {
    usage_by(state, query, UsageGroup::Project)
}

/// GET /api/usage/devices - usage grouped by device.
pub async fn usage_by_device(
    State(state): State<AppState>,
    Query(mut query): Query<EventsQuery>,
) -> Result<Json<UsageBreakdownResponse>> {
    // Device accounting defaults to token-consuming flows only.
    if query.is_token_consuming.is_none() {
        query.is_token_consuming = Some(true);
    }
    usage_by(state, query, UsageGroup::Device)
}

fn usage_by(
    state: AppState,
    query: EventsQuery,
    group: UsageGroup,
) -> Result<Json<UsageBreakdownResponse>> {
    let rows = state.store.usage_by(group, &query.filter())?;
    Ok(Json(UsageBreakdownResponse { rows }))
}

/// GET /api/devices - list observed devices with registered names.
pub async fn get_devices(
    State(state): State<AppState>,
) -> Result<Json<Vec<tokentap_storage::DeviceSummary>>> {
    Ok(Json(state.store.list_devices()?))
}

/// PUT /api/devices/{id} - register or rename a device.
pub async fn register_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RegisterDevice>,
) -> Result<Json<serde_json::Value>> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("device name cannot be empty".into()));
    }
    state.store.register_device(&id, req.name.trim(), req.metadata)?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// DELETE /api/devices/{id} - destructive; requires the admin token.
pub async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    state.store.delete_device(&id)?;
    info!(device_id = %id, "device registration deleted");
    Ok(Json(serde_json::json!({"ok": true})))
}

/// GET /api/status - pipeline counters and operator modes.
pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>> {
    Ok(Json(StatusResponse {
        status: "ok",
        network_mode: state.security.network_mode().as_str(),
        debug_mode: state.security.debug_mode().as_str(),
        events: state.store.count_events()?,
        sink_dropped: state.sink_counters.dropped(),
        sink_failed: state.sink_counters.failed(),
        sink_written: state.sink_counters.written(),
        extract_degraded: state.counters.extract_degraded(),
        stream_skipped: state.counters.stream_skipped(),
    }))
}

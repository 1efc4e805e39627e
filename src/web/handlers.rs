//! HTTP request handlers.

use super::AppState;
use crate::db::{AlarmStore, Device, DeviceDirectory, MetricKind, MetricsRepository, RepositoryError};
use crate::telemetry::MetricClass;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;

fn repository_failure(e: RepositoryError) -> axum::response::Response {
    match e {
        RepositoryError::NotFound => (StatusCode::NOT_FOUND, "Not found").into_response(),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
    }
}

// ============================================================================
// API: Devices
// ============================================================================

pub async fn handle_get_devices(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_all() {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => repository_failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub credential_ref: String,
}

pub async fn handle_create_device(
    State(state): State<AppState>,
    Json(req): Json<CreateDeviceRequest>,
) -> impl IntoResponse {
    if req.name.trim().is_empty() || req.address.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "name and address are required").into_response();
    }

    let mut device = Device {
        name: req.name,
        address: req.address,
        credential_ref: req.credential_ref,
        ..Default::default()
    };

    match state.store.add_device(&mut device) {
        Ok(_) => (StatusCode::CREATED, Json(device)).into_response(),
        Err(e) => repository_failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
}

pub async fn handle_set_maintenance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<MaintenanceRequest>,
) -> impl IntoResponse {
    if let Err(e) = state.store.set_maintenance(id, req.enabled) {
        return repository_failure(e);
    }
    tracing::info!("Device {} maintenance set to {}", id, req.enabled);

    match state.store.get_device(id) {
        Ok(Some(device)) => Json(device).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Device not found").into_response(),
        Err(e) => repository_failure(e),
    }
}

pub async fn handle_get_ports(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.get_ports(id) {
        Ok(ports) => Json(ports).into_response(),
        Err(e) => repository_failure(e),
    }
}

pub async fn handle_get_units(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.list_units(id) {
        Ok(units) => Json(units).into_response(),
        Err(e) => repository_failure(e),
    }
}

// ============================================================================
// API: Samples
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SamplesQuery {
    pub kind: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn handle_get_samples(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<SamplesQuery>,
) -> impl IntoResponse {
    let kind: MetricKind = match query.kind.parse() {
        Ok(k) => k,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let limit = query.limit.unwrap_or(100).min(10_000);

    match state.store.latest(id, kind, limit) {
        Ok(samples) => Json(samples).into_response(),
        Err(e) => repository_failure(e),
    }
}

// ============================================================================
// API: Alarms
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AlarmsQuery {
    #[serde(default)]
    pub device_id: Option<i64>,
    #[serde(default)]
    pub open: Option<bool>,
}

pub async fn handle_get_alarms(
    State(state): State<AppState>,
    Query(query): Query<AlarmsQuery>,
) -> impl IntoResponse {
    match state
        .store
        .list_alarms(query.device_id, query.open.unwrap_or(false))
    {
        Ok(alarms) => Json(alarms).into_response(),
        Err(e) => repository_failure(e),
    }
}

// ============================================================================
// API: Control
// ============================================================================

pub async fn handle_poll_now(
    State(state): State<AppState>,
    Path(class): Path<String>,
) -> impl IntoResponse {
    let class: MetricClass = match class.parse() {
        Ok(c) => c,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    tracing::info!("Manual {} sweep requested", class);
    let report = state.scheduler.poll_fleet(class).await;
    let status = if report.skipped {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    (status, Json(report)).into_response()
}

pub async fn handle_health_check(State(state): State<AppState>) -> impl IntoResponse {
    tracing::info!("Manual health check requested");
    Json(state.scheduler.run_health_check())
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "running": state.scheduler.is_running().await,
        "open_alarms": state.store.open_alarms().map(|a| a.len()).unwrap_or(0),
    }))
}

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde_json::{json, Value};
use std::env;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::alerts;
use crate::db::{now_unix, Db};
use crate::error::{AssociationError, IngestError};
use crate::freshness;
use crate::ingest::{self, IngestOutcome};
use crate::normalize::SourceType;
use crate::registry;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub shared: SharedState,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error body is `{"detail": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Forbidden(String),
    Unprocessable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotFound(d) => (StatusCode::NOT_FOUND, d),
            ApiError::Forbidden(d) => (StatusCode::FORBIDDEN, d),
            ApiError::Unprocessable(d) => (StatusCode::UNPROCESSABLE_ENTITY, d),
            ApiError::Internal(d) => (StatusCode::INTERNAL_SERVER_ERROR, d),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::DeviceNotFound => ApiError::NotFound(e.to_string()),
            IngestError::DeviceInactive(_) => ApiError::Forbidden(e.to_string()),
            IngestError::Normalization(_) => ApiError::Unprocessable(e.to_string()),
            IngestError::Persistence(_) => {
                error!("ingestion failed: {e}");
                ApiError::Internal("failed to store reading".into())
            }
        }
    }
}

impl From<AssociationError> for ApiError {
    fn from(e: AssociationError) -> Self {
        match e {
            AssociationError::DeviceNotFound(_) | AssociationError::BatchNotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            AssociationError::Persistence(_) => {
                error!("association failed: {e}");
                ApiError::Internal("failed to update device".into())
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!("request failed: {e:#}");
        ApiError::Internal("internal error".into())
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/devices/ispindel/data", post(ispindel_data))
        .route("/api/devices/tilt/data", post(tilt_data))
        .route(
            "/api/devices/{device_id}/batch/{batch_id}/associate",
            post(associate),
        )
        .route("/api/devices/{device_id}/batch", delete(dissociate))
        .route("/api/devices/{device_id}/alerts", get(device_alerts))
        .route("/api/scheduler/status", get(scheduler_status))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ispindel_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    push(&state, SourceType::Ispindel, &headers, &body).await
}

async fn tilt_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    push(&state, SourceType::Tilt, &headers, &body).await
}

/// Bodies that are not JSON still go through device resolution first; the
/// normalizer then rejects them.
async fn push(
    state: &AppState,
    source: SourceType,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Json<Value>, ApiError> {
    let payload: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    let outcome = ingest::ingest_push(&state.db, source, api_key, &payload)
        .await
        .map_err(|e| {
            if !matches!(e, IngestError::Persistence(_)) {
                warn!(?source, "push rejected: {e}");
            }
            ApiError::from(e)
        })?;

    let body = match outcome {
        IngestOutcome::Recorded {
            reading_id,
            batch_id,
            alerts,
        } => {
            if !alerts.is_empty() {
                let mut st = state.shared.write().await;
                for a in &alerts {
                    st.record_alert(a.message.clone());
                }
            }
            json!({
                "status": "success",
                "message": "Data recorded successfully",
                "reading_id": reading_id,
                "batch_id": batch_id,
                "alerts": alerts,
            })
        }
        IngestOutcome::Unattributed { device } => json!({
            "status": "received",
            "message": format!("Data received but device {device} has no batch assigned"),
        }),
        IngestOutcome::Duplicate { batch_id } => json!({
            "status": "duplicate",
            "message": "Reading already recorded",
            "batch_id": batch_id,
        }),
    };
    Ok(Json(body))
}

async fn associate(
    State(state): State<AppState>,
    Path((device_id, batch_id)): Path<(i64, i64)>,
) -> Result<Json<Value>, ApiError> {
    let device = registry::associate(&state.db, device_id, batch_id).await?;
    Ok(Json(json!({
        "message": format!("Device {} associated with batch {batch_id}", device.name),
        "device": device,
    })))
}

async fn dissociate(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let device = registry::dissociate(&state.db, device_id).await?;
    Ok(Json(json!({
        "message": format!("Device {} dissociated from batch", device.name),
        "device": device,
    })))
}

/// Thresholds re-evaluated against the newest reading for the current batch,
/// plus a stale-device event when the device is monitored and overdue.
async fn device_alerts(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let device = state
        .db
        .get_device(device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("device {device_id} not found")))?;

    let Some(batch_id) = device.batch_id else {
        return Ok(Json(json!({
            "device_id": device.id,
            "batch_id": null,
            "alerts": [],
        })));
    };

    let latest = state.db.latest_reading(device.id, batch_id).await?;
    let mut events = latest
        .as_ref()
        .map(|r| alerts::evaluate(device.alert_config.as_ref(), r.temperature))
        .unwrap_or_default();

    let monitored = device.is_active && device.auto_import_enabled && !device.manual_override;
    let now = now_unix();
    if monitored && freshness::is_stale(device.last_reading_at, device.import_interval_seconds, now) {
        let escalate = device
            .alert_config
            .as_ref()
            .is_some_and(|c| c.missing_data_alert);
        events.push(alerts::stale_device(
            &device.name,
            device.last_reading_at.map(|last| now - last),
            device.import_interval_seconds,
            escalate,
        ));
    }

    Ok(Json(json!({
        "device_id": device.id,
        "batch_id": batch_id,
        "reading_id": latest.map(|r| r.id),
        "alerts": events,
    })))
}

async fn scheduler_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Serve until `shutdown` resolves; in-flight requests are allowed to finish.
pub async fn serve<F>(state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

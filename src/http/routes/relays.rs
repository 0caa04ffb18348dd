use super::relay_id;
use crate::coordinator::Error;
use crate::http::error::AppError;
use crate::http::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

/// POST /relay/{n}: switch a relay on for its configured duration.
pub async fn trigger(
    State(app): State<AppState>,
    Path(n): Path<u32>,
) -> Result<Json<Value>, AppError> {
    let relay = relay_id(n)?;
    info!(relay, "Relay trigger requested");
    let triggered = app.coordinator.trigger(relay).inspect_err(|e| {
        if matches!(e, Error::Hardware { .. }) {
            app.stats.record_error();
        }
    })?;
    Ok(Json(json!({
        "status": "success",
        "relay": triggered.relay,
        "duration": triggered.duration,
        "already_active": triggered.already_active,
    })))
}

/// POST /relay/{n}/cancel
pub async fn cancel(
    State(app): State<AppState>,
    Path(n): Path<u32>,
) -> Result<Json<Value>, AppError> {
    let relay = relay_id(n)?;
    info!(relay, "Relay cancel requested");
    let cancelled = app.coordinator.cancel(relay)?;
    Ok(Json(json!({
        "status": "success",
        "relay": cancelled.relay,
        "released": cancelled.released,
    })))
}

/// POST /reset: what the reset button does.
pub async fn reset(State(app): State<AppState>) -> Result<Json<Value>, AppError> {
    let relay = app.config.lock().await.config()?.reset_button.target_relay;
    info!(relay, "Reset requested");
    let cancelled = app.coordinator.cancel(relay)?;
    Ok(Json(json!({
        "status": "success",
        "relay": cancelled.relay,
        "released": cancelled.released,
    })))
}

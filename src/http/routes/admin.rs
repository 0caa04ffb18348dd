use super::relays;
use crate::audio;
use crate::http::error::AppError;
use crate::http::state::AppState;
use crate::stats::StatsSnapshot;
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    stats: StatsSnapshot,
    active_triggers: usize,
    physical_buttons_active: usize,
}

/// GET /admin/stats
pub async fn stats(State(app): State<AppState>) -> Json<StatsResponse> {
    let active_triggers = app.coordinator.status().system.active_count;
    let physical_buttons_active = app
        .buttons
        .bindings()
        .await
        .iter()
        .filter(|b| b.active)
        .count();
    Json(StatsResponse {
        stats: app.stats.snapshot(),
        active_triggers,
        physical_buttons_active,
    })
}

/// GET /admin/config: the configuration document as stored.
pub async fn get_config(State(app): State<AppState>) -> Json<Value> {
    Json(app.config.lock().await.raw().clone())
}

#[derive(Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    section: Option<String>,
    #[serde(default)]
    settings: Option<Value>,
}

/// Audio files named in an `audio_buttons` update must be playable.
fn check_audio_files(settings: &Value) -> Result<(), AppError> {
    let Some(buttons) = settings.as_object() else {
        return Ok(());
    };
    for (key, button) in buttons {
        let Some(file) = button.get("audio_file").and_then(Value::as_str) else {
            continue;
        };
        if file.is_empty() {
            continue;
        }
        if let Err(e) = audio::validate(&PathBuf::from(file)) {
            return Err(AppError::bad_request(format!(
                "Invalid audio file for {}: {}",
                key, e
            )));
        }
    }
    Ok(())
}

/// POST /admin/config: `{section, settings}` merged into one section.
///
/// Relay names and durations, the concurrency limit, buttons and audio clips
/// are applied right away; pin and server changes need a restart.
pub async fn update_config(
    State(app): State<AppState>,
    Json(body): Json<ConfigUpdate>,
) -> Result<Json<Value>, AppError> {
    let (Some(section), Some(settings)) = (body.section, body.settings) else {
        return Err(AppError::bad_request("Invalid request"));
    };
    if section == "audio_buttons" {
        check_audio_files(&settings)?;
    }

    let mut store = app.config.lock().await;
    let before = store.config()?;
    let updated = store.update_section(&section, settings)?;
    let mut restart_required = app.apply(&updated).await;
    let after = store.config()?;
    restart_required |= before.relay_settings.active_low != after.relay_settings.active_low
        || before.server.host != after.server.host
        || before.server.port != after.server.port
        || before.logging.log_level != after.logging.log_level;
    info!(
        "Configuration section {} applied (restart required: {})",
        section, restart_required
    );

    Ok(Json(json!({
        "status": "success",
        "message": "Configuration updated",
        "restart_required": restart_required,
    })))
}

/// POST /admin/test/{n}
pub async fn test_relay(
    state: State<AppState>,
    n: Path<u32>,
) -> Result<Json<Value>, AppError> {
    relays::trigger(state, n).await
}

#[derive(Deserialize)]
pub struct ValidateAudio {
    #[serde(default)]
    filepath: String,
}

/// POST /admin/validate_audio
pub async fn validate_audio(Json(body): Json<ValidateAudio>) -> Json<Value> {
    match audio::validate(&PathBuf::from(&body.filepath)) {
        Ok(file_info) => Json(json!({
            "status": "success",
            "valid": true,
            "message": "Audio file is valid",
            "file_info": file_info,
        })),
        Err(e) => Json(json!({
            "status": "success",
            "valid": false,
            "message": e.to_string(),
        })),
    }
}

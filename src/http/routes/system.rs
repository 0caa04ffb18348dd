use crate::audio;
use crate::consts::{AudioIdx, RelayIdx, HEALTH_ERROR_THRESHOLD};
use crate::coordinator::{RelayStatus, SystemStatus};
use crate::http::state::AppState;
use crate::router::{BindingStatus, ButtonId};
use axum::extract::State;
use axum::Json;
use chrono::Local;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Serialize)]
pub struct SystemInfo {
    #[serde(flatten)]
    relays: SystemStatus,
    timestamp: String,
    audio_enabled: bool,
    /// Armed relay buttons.
    button_count: usize,
}

#[derive(Serialize)]
pub struct AudioButtonInfo {
    name: String,
    audio_file: String,
    volume: u8,
    channel: String,
    audio_file_valid: bool,
}

#[derive(Serialize)]
pub struct StatusResponse {
    relays: BTreeMap<RelayIdx, RelayStatus>,
    system: SystemInfo,
    physical_buttons: Vec<BindingStatus>,
    audio_buttons: BTreeMap<AudioIdx, AudioButtonInfo>,
}

/// GET /status
pub async fn status(State(app): State<AppState>) -> Json<StatusResponse> {
    let status = app.coordinator.status();
    let physical_buttons: Vec<BindingStatus> = app
        .buttons
        .bindings()
        .await
        .into_iter()
        .filter(|b| !matches!(b.id, ButtonId::Audio(_)))
        .collect();
    let button_count = physical_buttons
        .iter()
        .filter(|b| b.active && matches!(b.id, ButtonId::Relay(_) | ButtonId::Single))
        .count();

    let audio_buttons = app
        .audio
        .clips()
        .into_iter()
        .map(|clip| {
            let info = AudioButtonInfo {
                audio_file_valid: audio::validate(&clip.path).is_ok(),
                name: clip.name,
                audio_file: clip.path.to_string_lossy().into_owned(),
                volume: clip.volume,
                channel: clip.channel,
            };
            (clip.id, info)
        })
        .collect();

    Json(StatusResponse {
        relays: status.relays,
        system: SystemInfo {
            relays: status.system,
            timestamp: Local::now().to_rfc3339(),
            audio_enabled: app.audio.is_enabled(),
            button_count,
        },
        physical_buttons,
        audio_buttons,
    })
}

/// GET /health
pub async fn health(State(app): State<AppState>) -> Json<Value> {
    let stats = app.stats.snapshot();
    let healthy = stats.errors <= HEALTH_ERROR_THRESHOLD;
    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "timestamp": Local::now().to_rfc3339(),
        "uptime_secs": stats.uptime_secs,
        "errors": stats.errors,
    }))
}

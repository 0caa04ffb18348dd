use crate::consts::AudioIdx;
use crate::http::error::AppError;
use crate::http::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

/// POST /audio/play/{n}: queue the clip of audio button `n`.
pub async fn play(
    State(app): State<AppState>,
    Path(n): Path<u32>,
) -> Result<Json<Value>, AppError> {
    let id = AudioIdx::try_from(n)
        .map_err(|_| AppError::bad_request(format!("unknown audio button {}", n)))?;
    let accepted = app.audio.play(id)?;
    Ok(Json(json!({
        "status": "success",
        "button": accepted.id,
        "message": format!("Playing {}", accepted.name),
    })))
}

pub mod admin;
pub mod audio;
pub mod relays;
pub mod system;

use crate::consts::RelayIdx;
use crate::http::error::AppError;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

/// Relay number from the URL. Out-of-range numbers are unknown relays, not
/// malformed requests.
pub(crate) fn relay_id(n: u32) -> Result<RelayIdx, AppError> {
    RelayIdx::try_from(n).map_err(|_| AppError::bad_request(format!("unknown relay {}", n)))
}

pub async fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "status": "error", "message": "Endpoint not found" })),
    )
}

use crate::audio::AudioError;
use crate::config::ConfigError;
use crate::coordinator::Error;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

/// Carries an explicit 400 through the `anyhow::Error` chain.
#[derive(Debug)]
struct BadRequest(String);

impl std::fmt::Display for BadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequest {}

/// Error type of all handlers; rendered as `{"status": "error", "message"}`.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequest(msg.into()).into())
    }

    fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<BadRequest>().is_some() {
            return StatusCode::BAD_REQUEST;
        }
        if let Some(e) = self.0.downcast_ref::<Error>() {
            return match e {
                Error::UnknownRelay(_) | Error::InvalidDuration => StatusCode::BAD_REQUEST,
                Error::ResourceExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
                Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                Error::Hardware { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            };
        }
        if let Some(e) = self.0.downcast_ref::<AudioError>() {
            return match e {
                AudioError::Disabled
                | AudioError::UnknownClip(_)
                | AudioError::NoFile
                | AudioError::NotFound(_)
                | AudioError::UnsupportedExtension(_)
                | AudioError::Unreadable { .. } => StatusCode::BAD_REQUEST,
                AudioError::Busy => StatusCode::TOO_MANY_REQUESTS,
                AudioError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            };
        }
        if self.0.downcast_ref::<ConfigError>().is_some() {
            return StatusCode::BAD_REQUEST;
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {:?}", self.0);
        }
        let body = serde_json::json!({ "status": "error", "message": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

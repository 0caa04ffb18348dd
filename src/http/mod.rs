//! REST API.

pub mod error;
pub mod routes;
pub mod state;

pub use self::state::AppState;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the axum Router with all routes. Also used by the integration tests.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/relay/{n}", post(routes::relays::trigger))
        .route("/relay/{n}/cancel", post(routes::relays::cancel))
        .route("/reset", post(routes::relays::reset))
        .route("/audio/play/{n}", post(routes::audio::play))
        .route("/status", get(routes::system::status))
        .route("/health", get(routes::system::health))
        .route("/admin/stats", get(routes::admin::stats))
        .route(
            "/admin/config",
            get(routes::admin::get_config).post(routes::admin::update_config),
        )
        .route("/admin/test/{n}", post(routes::admin::test_relay))
        .route("/admin/validate_audio", post(routes::admin::validate_audio))
        .fallback(routes::not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until `shutdown` completes.
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Unable to listen on {}:{}", host, port))?;
    info!("Relay API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Relay API stopped");
    Ok(())
}

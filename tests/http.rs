use axum::http::StatusCode;
use http_body_util::BodyExt;
use relay_gate::audio::CommandPlayer;
use relay_gate::config::ConfigStore;
use relay_gate::http::{build_router, AppState};
use relay_gate::hw::sim::SimGpio;
use relay_gate::hw::Level;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Gate {
    app: axum::Router,
    state: AppState,
    gpio: SimGpio,
    dir: TempDir,
}

/// Default configuration with two concurrent triggers and 10 s pulses on
/// relays 1-3, running on simulated GPIO.
async fn gate() -> Gate {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"relay_settings": {"max_concurrent_triggers": 2,
             "trigger_durations": {"1": 10, "2": 10, "3": 10}}}"#,
    )
    .unwrap();
    let store = ConfigStore::open(&path).unwrap();
    let gpio = SimGpio::new();
    let player = Arc::new(CommandPlayer::parse("true").unwrap());
    let state = AppState::start(Arc::new(gpio.clone()), player, store)
        .await
        .unwrap();
    Gate {
        app: build_router(state.clone()),
        state,
        gpio,
        dir,
    }
}

async fn send(app: &axum::Router, req: axum::http::Request<axum::body::Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn get(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    send(app, req).await
}

async fn post(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    send(app, req).await
}

async fn post_json(app: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    send(app, req).await
}

// ---------------------------------------------------------------------------
// Relays
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trigger_switches_relay_on() {
    let gate = gate().await;
    let (status, body) = post(&gate.app, "/relay/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["relay"], 1);
    assert_eq!(body["duration"], 10.0);
    assert_eq!(body["already_active"], false);
    // Active low.
    assert_eq!(gate.gpio.level(17), Some(Level::Low));

    let (status, body) = post(&gate.app, "/relay/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["already_active"], true);
    assert_eq!(gate.state.coordinator.status().system.active_count, 1);
}

#[tokio::test]
async fn full_budget_returns_429_without_touching_the_relay() {
    let gate = gate().await;
    assert_eq!(post(&gate.app, "/relay/1").await.0, StatusCode::OK);
    assert_eq!(post(&gate.app, "/relay/2").await.0, StatusCode::OK);

    let writes = gate.gpio.write_count(27);
    let (status, body) = post(&gate.app, "/relay/3").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["status"], "error");
    assert_eq!(gate.gpio.write_count(27), writes);
}

#[tokio::test]
async fn unknown_relay_is_bad_request() {
    let gate = gate().await;
    let (status, body) = post(&gate.app, "/relay/9").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert_eq!(post(&gate.app, "/relay/999").await.0, StatusCode::BAD_REQUEST);
    assert_eq!(post(&gate.app, "/relay/abc").await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_releases_immediately() {
    let gate = gate().await;
    post(&gate.app, "/relay/1").await;

    let (status, body) = post(&gate.app, "/relay/1/cancel").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["released"], true);
    assert_eq!(gate.gpio.level(17), Some(Level::High));

    let (_, status) = get(&gate.app, "/status").await;
    assert_eq!(status["relays"]["1"]["active"], false);
    assert_eq!(status["system"]["active_count"], 0);

    // Idle relays can be cancelled again.
    let (status, body) = post(&gate.app, "/relay/1/cancel").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["released"], false);
}

#[tokio::test]
async fn reset_cancels_target_relay() {
    let gate = gate().await;
    post(&gate.app, "/relay/1").await;
    let (status, body) = post(&gate.app, "/reset").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["relay"], 1);
    assert_eq!(body["released"], true);
}

// ---------------------------------------------------------------------------
// Status and admin
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_shape() {
    let gate = gate().await;
    post(&gate.app, "/relay/2").await;
    let (status, body) = get(&gate.app, "/status").await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(body["relays"].as_object().unwrap().len(), 8);
    assert_eq!(body["relays"]["1"]["gpio_pin"], 17);
    assert_eq!(body["relays"]["1"]["state"], "OFF");
    assert_eq!(body["relays"]["1"]["name"], "Relay 1");
    assert_eq!(body["relays"]["2"]["state"], "ON");
    assert!(body["relays"]["2"]["remaining"].as_f64().unwrap() > 0.0);
    assert_eq!(body["system"]["active_count"], 1);
    assert_eq!(body["system"]["max_concurrent"], 2);
    assert_eq!(body["system"]["button_count"], 8);

    let buttons = body["physical_buttons"].as_array().unwrap();
    let reset = buttons.iter().find(|b| b["id"] == "reset").unwrap();
    assert_eq!(reset["pin"], 16);
    assert_eq!(reset["active"], true);
    assert_eq!(body["audio_buttons"]["1"]["audio_file_valid"], false);
}

#[tokio::test]
async fn health_and_not_found() {
    let gate = gate().await;
    let (status, body) = get(&gate.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = get(&gate.app, "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Endpoint not found");
}

#[tokio::test]
async fn admin_test_counts_in_stats() {
    let gate = gate().await;
    assert_eq!(post(&gate.app, "/admin/test/2").await.0, StatusCode::OK);

    // Activations are counted from the relay event stream.
    let mut body = Value::Null;
    for _ in 0..50 {
        body = get(&gate.app, "/admin/stats").await.1;
        if body["total_triggers"] == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(body["total_triggers"], 1);
    assert_eq!(body["relay_triggers"]["2"], 1);
    assert_eq!(body["active_triggers"], 1);
}

#[tokio::test]
async fn config_update_is_applied_and_persisted() {
    let gate = gate().await;
    let (status, body) = post_json(
        &gate.app,
        "/admin/config",
        json!({"section": "relay_settings", "settings": {"max_concurrent_triggers": 1}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["restart_required"], false);

    let (_, status) = get(&gate.app, "/status").await;
    assert_eq!(status["system"]["max_concurrent"], 1);
    let (_, config) = get(&gate.app, "/admin/config").await;
    assert_eq!(config["relay_settings"]["max_concurrent_triggers"], 1);
    assert_eq!(
        config["relay_settings"]["trigger_durations"]["1"].as_f64(),
        Some(10.0)
    );

    let saved: Value = serde_json::from_str(
        &std::fs::read_to_string(gate.dir.path().join("config.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(saved["relay_settings"]["max_concurrent_triggers"], 1);

    post(&gate.app, "/relay/1").await;
    assert_eq!(post(&gate.app, "/relay/2").await.0, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn config_update_renames_relay() {
    let gate = gate().await;
    let (status, _) = post_json(
        &gate.app,
        "/admin/config",
        json!({"section": "relay_names", "settings": {"4": "Garage"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, status) = get(&gate.app, "/status").await;
    assert_eq!(status["relays"]["4"]["name"], "Garage");
}

#[tokio::test]
async fn invalid_config_updates_are_rejected() {
    let gate = gate().await;
    let (status, body) = post_json(
        &gate.app,
        "/admin/config",
        json!({"section": "nope", "settings": {}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");

    let (status, _) = post_json(&gate.app, "/admin/config", json!({"settings": {}})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        &gate.app,
        "/admin/config",
        json!({"section": "relay_settings", "settings": {"trigger_durations": {"1": 0}}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        &gate.app,
        "/admin/config",
        json!({"section": "relay_settings", "settings": {"trigger_durations": {"1": 1e30}}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    // The gate keeps serving with the old duration.
    let (status, body) = post(&gate.app, "/relay/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duration"], 10.0);

    let (status, _) = post_json(
        &gate.app,
        "/admin/config",
        json!({"section": "audio_buttons", "settings": {"button1": {"audio_file": "/nonexistent/a.mp3"}}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

#[tokio::test]
async fn validate_audio_reports_file_info() {
    let gate = gate().await;
    let clip = gate.dir.path().join("bell.mp3");
    std::fs::write(&clip, vec![0u8; 2048]).unwrap();

    let (status, body) = post_json(
        &gate.app,
        "/admin/validate_audio",
        json!({"filepath": clip.to_string_lossy()}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["file_info"]["size"], 2048);
    assert_eq!(body["file_info"]["extension"], ".mp3");

    let (_, body) = post_json(
        &gate.app,
        "/admin/validate_audio",
        json!({"filepath": "/nonexistent/bell.mp3"}),
    )
    .await;
    assert_eq!(body["valid"], false);
}

#[tokio::test]
async fn playing_a_missing_clip_is_rejected() {
    let gate = gate().await;
    let (status, body) = post(&gate.app, "/audio/play/1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert_eq!(post(&gate.app, "/audio/play/42").await.0, StatusCode::BAD_REQUEST);
}

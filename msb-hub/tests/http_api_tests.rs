//! HTTP surface tests against the router
//!
//! Exercises webhook routing (including the slug rule), the status
//! endpoint, and the OAuth callback without binding a socket.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use std::sync::Arc;
use tower::util::ServiceExt;

use msb_common::config::AppConfig;
use msb_common::events::EventBus;
use msb_common::time::system_clock;

use msb_hub::creds::CredentialsStore;
use msb_hub::server::{router, AppState};
use msb_hub::supervisor::Supervisor;

fn config_with_sources() -> AppConfig {
    serde_json::from_str(
        r#"{
            "sources": [
                {"name": "ws-default", "type": "webscrobbler"},
                {"name": "ws-chrome", "type": "webscrobbler", "slug": "chrome"},
                {"name": "jf", "type": "jellyfin"}
            ],
            "clients": []
        }"#,
    )
    .unwrap()
}

fn app(config: &AppConfig, creds_dir: &std::path::Path) -> (axum::Router, Arc<Supervisor>) {
    let bus = EventBus::new(256);
    let clock = system_clock();
    let supervisor = Arc::new(Supervisor::from_config(config, bus, clock.clone()).unwrap());
    let state = Arc::new(AppState {
        supervisor: supervisor.clone(),
        creds: Arc::new(CredentialsStore::new(creds_dir)),
        clock,
    });
    (router(state), supervisor)
}

fn ws_body(track: &str) -> String {
    format!(
        r#"{{"eventName": "scrobble", "data": {{"song": {{"parsed": {{"track": "{}", "artist": "Artist"}}}}}}}}"#,
        track
    )
}

fn json_post(uri: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn health_endpoint_responds() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&config_with_sources(), dir.path());

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn webscrobbler_routes_by_slug() {
    let dir = tempfile::tempdir().unwrap();
    let (app, supervisor) = app(&config_with_sources(), dir.path());

    // Bare path goes to the slug-less source
    let response = app
        .clone()
        .oneshot(json_post("/api/webscrobbler", ws_body("Bare Song")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Slug path goes to the named source
    let response = app
        .clone()
        .oneshot(json_post("/api/webscrobbler/chrome", ws_body("Chrome Song")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Unknown slug matches nothing
    let response = app
        .oneshot(json_post("/api/webscrobbler/firefox", ws_body("Lost Song")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let bare = supervisor.find_webhook_source("webscrobbler", None).unwrap();
    assert_eq!(bare.core.lock().await.discovered(), 1);
    assert_eq!(
        bare.core.lock().await.recent()[0].data.track,
        "Bare Song"
    );

    let chrome = supervisor
        .find_webhook_source("webscrobbler", Some("chrome"))
        .unwrap();
    assert_eq!(chrome.core.lock().await.discovered(), 1);
}

#[tokio::test]
async fn malformed_webhook_payload_is_rejected_but_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (app, supervisor) = app(&config_with_sources(), dir.path());

    // Scrobble event with no artist: malformed, dropped individually
    let body = r#"{"eventName": "scrobble", "data": {"song": {"parsed": {"track": "T"}}}}"#;
    let response = app
        .clone()
        .oneshot(json_post("/api/webscrobbler", body.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The source keeps serving
    let response = app
        .oneshot(json_post("/api/webscrobbler", ws_body("Good Song")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bare = supervisor.find_webhook_source("webscrobbler", None).unwrap();
    assert_eq!(bare.core.lock().await.discovered(), 1);
}

#[tokio::test]
async fn jellyfin_requires_json_content_type() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&config_with_sources(), dir.path());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jellyfin")
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("NotificationType=PlaybackStart"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn status_lists_every_component() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&config_with_sources(), dir.path());

    let response = app
        .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(status["service"], "msb-hub");
    assert_eq!(status["sources"].as_array().unwrap().len(), 3);
    assert_eq!(status["clients"].as_array().unwrap().len(), 0);
    assert_eq!(status["sources"][0]["tracksDiscovered"], 0);
}

#[tokio::test]
async fn oauth_callback_persists_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&config_with_sources(), dir.path());

    let response = app
        .clone()
        .oneshot(
            Request::get("/spotify/callback?code=abc123&state=xyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let store = CredentialsStore::new(dir.path());
    let creds = store.read("spotify").await.unwrap().unwrap();
    assert_eq!(creds["code"], "abc123");

    // A callback with no parameters is rejected
    let response = app
        .oneshot(
            Request::get("/lastfm/callback")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dead_letter_list_is_empty_on_startup() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&config_with_sources(), dir.path());

    let response = app
        .oneshot(
            Request::get("/api/deadletter")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let listing: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing["count"], 0);
}

#[tokio::test]
async fn supervisor_start_and_shutdown_complete() {
    let dir = tempfile::tempdir().unwrap();
    let (_, supervisor) = app(&config_with_sources(), dir.path());

    supervisor.start().await;
    // Cooperative stop finishes well within the grace period
    tokio::time::timeout(std::time::Duration::from_secs(5), supervisor.shutdown())
        .await
        .expect("shutdown should not hang");
}

//! HTTP server for msb-hub
//!
//! Mounts the webhook ingress endpoints, the OAuth callback route, the
//! dashboard status/SSE endpoints, and dead-letter management.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use msb_common::error::Error;
use msb_common::time::SharedClock;

use crate::creds::CredentialsStore;
use crate::sources::ingress::{
    Ingress, JellyfinPayload, PlexPayload, TautulliPayload, WebScrobblerPayload,
};
use crate::supervisor::{SourceRuntime, Supervisor};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub creds: Arc<CredentialsStore>,
    pub clock: SharedClock,
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(status))
        .route("/api/events", get(sse_handler))
        .route("/api/recent/:source", get(recent_plays))
        .route("/api/webscrobbler", post(webscrobbler_bare))
        .route("/api/webscrobbler/:slug", post(webscrobbler_slug))
        .route("/plex", post(plex))
        .route("/tautulli", post(tautulli))
        .route("/jellyfin", post(jellyfin))
        .route("/api/deadletter", get(dead_letter_list))
        .route("/api/deadletter/:client/:id/retry", put(dead_letter_retry))
        .route("/api/deadletter/:client/:id", delete(dead_letter_remove))
        .route("/:service/callback", get(oauth_callback))
        .with_state(state)
}

/// Start the HTTP server; resolves when the shutdown future fires.
pub async fn start(
    bind_addr: &str,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("HTTP server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint
async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// Status endpoint: every component, its lifecycle state and counters
async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut sources = Vec::new();
    for source in &state.supervisor.sources {
        let core = source.core.lock().await;
        let players = source.players.lock().await;
        sources.push(json!({
            "name": source.name,
            "type": source.kind,
            "slug": source.slug,
            "status": core.status.get().to_string(),
            "tracksDiscovered": core.discovered(),
            "players": players.len(),
        }));
    }

    let mut clients = Vec::new();
    for client in &state.supervisor.clients {
        let core = client.core.lock().await;
        clients.push(json!({
            "name": client.name,
            "type": client.kind,
            "status": core.status.get().to_string(),
            "authed": core.authed,
            "queued": core.queue_len(),
            "scrobbled": core.scrobbled().count(),
            "deadLetters": core.dead_letters().len(),
        }));
    }

    Json(json!({
        "service": "msb-hub",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "sources": sources,
        "clients": clients,
    }))
}

/// A source's discovery ring, for the dashboard
async fn recent_plays(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let runtime = state
        .supervisor
        .sources
        .iter()
        .find(|s| s.name == source)
        .ok_or(StatusCode::NOT_FOUND)?;

    let core = runtime.core.lock().await;
    Ok(Json(json!({
        "name": source,
        "discovered": core.discovered(),
        "recent": core.recent(),
    })))
}

/// SSE endpoint streaming the event bus
async fn sse_handler(State(state): State<Arc<AppState>>) -> impl axum::response::IntoResponse {
    use axum::response::sse::{Event, KeepAlive, Sse};

    let mut rx = state.supervisor.bus.subscribe();
    info!("new SSE client connected");

    let stream = async_stream::stream! {
        yield Ok::<_, std::convert::Infallible>(
            Event::default().event("ConnectionStatus").data("connected"),
        );
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(data) = serde_json::to_string(&event) {
                        yield Ok(Event::default().event(event.event_type()).data(data));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "SSE client lagged behind the bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("heartbeat"),
    )
}

// ========================================
// Webhook ingress
// ========================================

/// Feed a lowered payload into the matched source.
async fn ingest(source: &SourceRuntime, ingress: Ingress) {
    match ingress {
        Ingress::Completed(play) => {
            source.core.lock().await.discover(play);
        }
        Ingress::Progress {
            key,
            play,
            progress_ms,
            status,
        } => {
            let crossed = source
                .players
                .lock()
                .await
                .update(key, play, progress_ms, status);
            if let Some(play) = crossed {
                source.core.lock().await.discover(play);
            }
        }
        Ingress::Ignored => {}
    }
}

async fn webscrobbler_bare(
    state: State<Arc<AppState>>,
    payload: Json<WebScrobblerPayload>,
) -> StatusCode {
    webscrobbler(state, None, payload).await
}

async fn webscrobbler_slug(
    state: State<Arc<AppState>>,
    Path(slug): Path<String>,
    payload: Json<WebScrobblerPayload>,
) -> StatusCode {
    webscrobbler(state, Some(slug), payload).await
}

async fn webscrobbler(
    State(state): State<Arc<AppState>>,
    slug: Option<String>,
    Json(payload): Json<WebScrobblerPayload>,
) -> StatusCode {
    let Some(source) = state
        .supervisor
        .find_webhook_source("webscrobbler", slug.as_deref())
    else {
        warn!(slug = ?slug, "no webscrobbler source configured for this slug");
        return StatusCode::NOT_FOUND;
    };

    match payload.lower(&source.name, &state.clock) {
        Ok(ingress) => {
            ingest(source, ingress).await;
            StatusCode::OK
        }
        Err(Error::InvalidInput(reason)) => {
            // Malformed events are dropped individually; the source keeps
            // serving.
            warn!(source = %source.name, reason = %reason, "dropping malformed webscrobbler event");
            StatusCode::BAD_REQUEST
        }
        Err(e) => {
            warn!(source = %source.name, error = %e, "webscrobbler ingest failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Jellyfin posts with `Content-Type: application/json` ("Send All
/// Properties" must be enabled upstream); the Json extractor rejects
/// anything else.
async fn jellyfin(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<JellyfinPayload>,
) -> StatusCode {
    let Some(source) = state.supervisor.find_webhook_source("jellyfin", None) else {
        return StatusCode::NOT_FOUND;
    };

    match payload.lower(&source.name, &state.clock) {
        Ok(ingress) => {
            ingest(source, ingress).await;
            StatusCode::OK
        }
        Err(e) => {
            warn!(source = %source.name, error = %e, "dropping malformed jellyfin event");
            StatusCode::BAD_REQUEST
        }
    }
}

async fn plex(State(state): State<Arc<AppState>>, Json(payload): Json<PlexPayload>) -> StatusCode {
    let Some(source) = state.supervisor.find_webhook_source("plex", None) else {
        return StatusCode::NOT_FOUND;
    };

    match payload.lower(&source.name, &state.clock) {
        Ok(ingress) => {
            ingest(source, ingress).await;
            StatusCode::OK
        }
        Err(e) => {
            warn!(source = %source.name, error = %e, "dropping malformed plex event");
            StatusCode::BAD_REQUEST
        }
    }
}

async fn tautulli(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TautulliPayload>,
) -> StatusCode {
    let Some(source) = state.supervisor.find_webhook_source("tautulli", None) else {
        return StatusCode::NOT_FOUND;
    };

    match payload.lower(&source.name, &state.clock) {
        Ok(ingress) => {
            ingest(source, ingress).await;
            StatusCode::OK
        }
        Err(e) => {
            warn!(source = %source.name, error = %e, "dropping malformed tautulli event");
            StatusCode::BAD_REQUEST
        }
    }
}

// ========================================
// OAuth callback
// ========================================

/// OAuth redirect target: persists whatever the provider handed back so the
/// owning adapter can finish authentication on its next init pass.
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<String, StatusCode> {
    if params.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let creds = serde_json::to_value(&params).map_err(|_| StatusCode::BAD_REQUEST)?;
    state
        .creds
        .write(&service, &creds)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!(service = %service, "oauth callback credentials stored");
    Ok(format!(
        "Authentication data for {} received. You can close this window.",
        service
    ))
}

// ========================================
// Dead-letter management
// ========================================

async fn dead_letter_list(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut entries = Vec::new();
    for client in &state.supervisor.clients {
        let core = client.core.lock().await;
        for dead in core.dead_letters() {
            entries.push(json!({
                "client": client.name,
                "id": dead.queued.id,
                "source": dead.queued.source,
                "play": dead.queued.play,
                "retries": dead.retries,
                "error": dead.error,
                "lastRetry": dead.last_retry,
            }));
        }
    }
    Json(json!({"deadLetters": entries, "count": entries.len()}))
}

async fn dead_letter_retry(
    State(state): State<Arc<AppState>>,
    Path((client, id)): Path<(String, Uuid)>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let runtime = state
        .supervisor
        .client_by_name(&client)
        .ok_or(StatusCode::NOT_FOUND)?;

    let mut core = runtime.core.lock().await;
    if !core.dead_letters().iter().any(|d| d.queued.id == id) {
        return Err(StatusCode::NOT_FOUND);
    }
    let cleared = core.retry_dead_letter(runtime.adapter.as_ref(), id).await;
    Ok(Json(json!({"id": id, "cleared": cleared})))
}

async fn dead_letter_remove(
    State(state): State<Arc<AppState>>,
    Path((client, id)): Path<(String, Uuid)>,
) -> Result<StatusCode, StatusCode> {
    let runtime = state
        .supervisor
        .client_by_name(&client)
        .ok_or(StatusCode::NOT_FOUND)?;

    let removed = runtime.core.lock().await.remove_dead_letter(id);
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

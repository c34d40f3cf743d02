//! HTTP server – control channels, API interception and recording
//! inspection.
//!
//! Routes:
//!   GET    /recorder               → recorder control channel (WebSocket)
//!   GET    /replayer               → replayer control channel (WebSocket)
//!   ANY    <API_PREFIX>/…          → API calls, through the interceptor
//!   GET    /health                 → health check
//!   GET    /recordings             → list stored recordings
//!   GET    /recordings/{name}      → download a recording
//!   DELETE /recordings/{name}      → remove a recording

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use rewind_common::config::Config;
use rewind_common::naming;
use rewind_common::protocol::{HealthResponse, RecordingInfo};
use serde_json::json;

use crate::fetch::HttpFetcher;
use crate::interceptor::{InterceptError, Interceptor};
use crate::recorder::{Handled, Recorder};
use crate::replayer::ReplaySession;
use crate::sessions::Sessions;
use crate::store::Store;

/// Shared state for route handlers.
#[derive(Clone)]
struct AppState {
    sessions: Arc<Sessions>,
    store: Store,
    recorder: Recorder,
    interceptor: Arc<Interceptor>,
    replay_interval: Duration,
    start_time: Instant,
}

/// Start the HTTP server. Blocks until shutdown.
pub async fn run(config: &Config, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let sessions = Arc::new(Sessions::new());
    let store = Store::new(&config.recordings_dir);
    let fetcher = HttpFetcher::new(&config.asset_base_url, config.fetch_timeout())?;
    let interceptor = Interceptor::new(
        &config.api_upstream_url,
        config.fetch_timeout(),
        sessions.clone(),
    )?;

    info!("Recordings stored in {}", store.root().display());
    info!(
        "Intercepting {}/* → {}",
        config.api_prefix, config.api_upstream_url
    );

    let state = AppState {
        recorder: Recorder::new(sessions.clone(), store.clone(), Arc::new(fetcher)),
        sessions,
        store,
        interceptor: Arc::new(interceptor),
        replay_interval: config.replay_interval(),
        start_time: Instant::now(),
    };

    let mut app = Router::new()
        .route("/recorder", get(recorder_upgrade))
        .route("/replayer", get(replayer_upgrade))
        .route(&config.api_prefix, any(intercept))
        .route(&format!("{}/{{*path}}", config.api_prefix), any(intercept))
        .route("/health", get(health))
        .route("/recordings", get(list_recordings))
        .route(
            "/recordings/{name}",
            get(download_recording).delete(delete_recording),
        );
    if let Some(dir) = &config.static_dir {
        info!("Serving static files from {}", dir.display());
        app = app.fallback_service(ServeDir::new(dir));
    }
    let app = app.layer(CorsLayer::permissive()).with_state(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Listening at http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

// ── control channels ─────────────────────────────────────────────────────

async fn recorder_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| recorder_channel(socket, state.recorder))
}

async fn recorder_channel(mut socket: WebSocket, recorder: Recorder) {
    debug!("Recorder connected");
    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Recorder socket error: {e}");
                break;
            }
        };
        match recorder.handle(text.as_str()).await {
            Ok(Handled::Stopped(saved)) => {
                let ack = json!({"stopped": true, "name": saved.name, "updated": saved.updated});
                if socket.send(Message::Text(ack.to_string().into())).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Recorder message rejected: {e:#}"),
        }
    }
    debug!("Recorder disconnected");
}

async fn replayer_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| replayer_channel(socket, state))
}

async fn replayer_channel(mut socket: WebSocket, state: AppState) {
    debug!("Replayer connected");
    let mut session = ReplaySession::new(state.sessions, state.store, state.replay_interval);

    loop {
        tokio::select! {
            message = socket.recv() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("Replayer socket error: {e}");
                        break;
                    }
                };
                let outbound = match session.handle(text.as_str()).await {
                    Ok(outbound) => outbound,
                    Err(e) => {
                        warn!("Replayer message rejected: {e:#}");
                        continue;
                    }
                };
                if !send_all(&mut socket, outbound).await {
                    break;
                }
            }
            Some(event) = session.next_event() => {
                if !send_all(&mut socket, vec![event]).await {
                    break;
                }
            }
        }
    }

    if session.is_replaying() {
        debug!("Replayer disconnected mid-replay");
    }
    session.stop();
}

async fn send_all(socket: &mut WebSocket, messages: Vec<serde_json::Value>) -> bool {
    for message in messages {
        if let Err(e) = socket.send(Message::Text(message.to_string().into())).await {
            debug!("Replayer send failed: {e}");
            return false;
        }
    }
    true
}

// ── API interception ─────────────────────────────────────────────────────

async fn intercept(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, InterceptError> {
    state.interceptor.handle(request).await
}

// ── inspection ───────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        recording: state.sessions.is_recording(),
        replaying: state.sessions.is_replaying(),
    })
}

async fn list_recordings(
    State(state): State<AppState>,
) -> Result<Json<Vec<RecordingInfo>>, StatusCode> {
    state.store.list().map(Json).map_err(|e| {
        warn!("Cannot list recordings: {e:#}");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn download_recording(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let name = naming::slugify(&name);
    if name.is_empty() || !state.store.exists(&name).await {
        return Err(StatusCode::NOT_FOUND);
    }

    let bytes = tokio::fs::read(state.store.recording_path(&name))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(([(axum::http::header::CONTENT_TYPE, "application/json")], bytes))
}

async fn delete_recording(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> StatusCode {
    let name = naming::slugify(&name);
    if name.is_empty() {
        return StatusCode::NOT_FOUND;
    }

    match state.store.delete(&name).await {
        Ok(true) => {
            info!("Deleted recording {name}");
            StatusCode::NO_CONTENT
        }
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            warn!("Cannot delete recording {name}: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

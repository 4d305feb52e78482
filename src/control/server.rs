// HTTP + WebSocket server
//
// - `WS  /ws`          control channel
// - `GET /api/status`  orchestrator status snapshot
// - `GET /api/config`  current settings
// - `GET /videos/*`    finished videos
// - `GET /captures/*`  captured stills
// - everything else    static UI, when UI_DIR is set

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use super::events::ServerEvent;
use super::ws::{handle_ws, system_info};
use super::ControlState;
use crate::constants::SYSTEM_INFO_INTERVAL_SECS;
use crate::logging::Logger;

/// Host name from a `Host` header, without port.
fn request_host(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::HOST)?.to_str().ok()?;
    let host = if raw.starts_with('[') {
        // [v6]:port
        raw.split_inclusive(']').next()?
    } else {
        raw.split(':').next()?
    };
    (!host.is_empty()).then(|| host.to_string())
}

pub fn router(state: Arc<ControlState>) -> Router {
    let settings = state.config();
    let log = Logger::new("control");

    let mut app = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/status", get(api_status))
        .route("/api/config", get(api_config))
        .nest_service("/videos", ServeDir::new(&settings.videos_dir))
        .nest_service("/captures", ServeDir::new(&settings.captures_dir))
        .layer(CorsLayer::permissive())
        .with_state(state);

    if let Some(path) = &settings.ui_dir {
        if path.exists() {
            log.info("serving UI", &[("path", &path.display())]);
            app = app.fallback_service(ServeDir::new(path).append_index_html_on_directories(true));
        } else {
            log.warn("UI directory does not exist, skipping", &[("path", &path.display())]);
        }
    }
    app
}

/// Rebroadcast host facts on a fixed period.
pub fn spawn_system_info_task(state: Arc<ControlState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(SYSTEM_INFO_INTERVAL_SECS));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if state.hub.client_count() == 0 {
                continue;
            }
            if let Some(info) = system_info(&state).await {
                state.hub.send(ServerEvent::SystemInfoUpdate(info));
            }
        }
    })
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve(
    state: Arc<ControlState>,
    listener: TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let log = Logger::new("control");
    let addr = listener.local_addr().context("listener has no address")?;
    let ticker = spawn_system_info_task(state.clone());
    log.info("control server listening", &[("addr", &format!("http://{}", addr))]);

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("control server error");
    ticker.abort();
    served
}

async fn ws_upgrade(ws: WebSocketUpgrade, headers: HeaderMap, State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let host = request_host(&headers);
    ws.on_upgrade(move |socket| handle_ws(socket, state, host))
}

async fn api_status(State(state): State<Arc<ControlState>>) -> Response {
    let handle = state.orchestrator.clone();
    match tokio::task::spawn_blocking(move || handle.status()).await {
        Ok(Ok(status)) => Json(status).into_response(),
        Ok(Err(e)) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn api_config(State(state): State<Arc<ControlState>>) -> Json<crate::config::Settings> {
    Json((*state.config()).clone())
}

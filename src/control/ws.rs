// WebSocket handler: subscribes to the hub, pushes JSON events, runs commands.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use super::dispatch::dispatch;
use super::events::{ClientCommand, LiveStream, ServerEvent, SystemInfo};
use super::{image_list, system, video_list, ControlState};
use crate::logging::Logger;

type WsSink = SplitSink<WebSocket, Message>;

/// Rewrite stream URLs for the host this client connected through.
fn localize(event: ServerEvent, host: Option<&str>) -> ServerEvent {
    match (event, host) {
        (ServerEvent::LiveStreamUrl(live), Some(host)) => ServerEvent::LiveStreamUrl(live.for_host(host)),
        (event, _) => event,
    }
}

async fn send(ws_tx: &mut WsSink, event: ServerEvent, host: Option<&str>, log: &Logger) -> bool {
    let event = localize(event, host);
    match event.to_json() {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            log.error("event encode failed", &[("method", &"send"), ("event", &event.name()), ("error", &e)]);
            true
        }
    }
}

pub async fn system_info(state: &Arc<ControlState>) -> Option<SystemInfo> {
    let dir = state.config().captures_dir.clone();
    let started = state.started;
    tokio::task::spawn_blocking(move || system::collect(&dir, started)).await.ok()
}

/// What a fresh client needs to render without waiting for the next change.
async fn initial_events(state: &Arc<ControlState>) -> Vec<ServerEvent> {
    let settings = state.config();
    let handle = state.orchestrator.clone();
    let status = tokio::task::spawn_blocking(move || handle.status()).await.ok().and_then(Result::ok);

    let mut events = Vec::new();
    if let Some(status) = &status {
        events.push(ServerEvent::StatusUpdate(Box::new(status.clone())));
    }
    events.push(ServerEvent::ConfigUpdate(Box::new((*settings).clone())));
    if let Some(info) = system_info(state).await {
        events.push(ServerEvent::SystemInfoUpdate(info));
    }

    let listing = settings.clone();
    let lists = tokio::task::spawn_blocking(move || (image_list(&listing), video_list(&listing))).await;
    if let Ok((images, videos)) = lists {
        if let Ok(images) = images {
            events.push(ServerEvent::ImageListUpdate(images));
        }
        if let Ok(videos) = videos {
            events.push(ServerEvent::VideoListUpdate(videos));
        }
    }

    if status.is_some_and(|s| s.stream_active) {
        events.push(ServerEvent::LiveStreamUrl(LiveStream::up(&state.stream_host, settings.stream_port)));
    }
    events
}

/// Handle a single WebSocket connection. `host` is the name the client
/// used to reach us, without port.
pub async fn handle_ws(socket: WebSocket, state: Arc<ControlState>, host: Option<String>) {
    let log = Logger::new("control");
    let host = host.as_deref();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut rx = state.hub.subscribe();
    log.info("client connected", &[("clients", &state.hub.client_count())]);

    for event in initial_events(&state).await {
        if !send(&mut ws_tx, event, host, &log).await {
            return;
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send(&mut ws_tx, event, host, &log).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log.warn("client lagged", &[("missed", &n)]);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let replies = match ClientCommand::parse(text.as_str()) {
                            Ok(command) => dispatch(&state, command).await,
                            Err(e) => vec![ServerEvent::from_error(&e)],
                        };
                        let mut open = true;
                        for reply in replies {
                            if !send(&mut ws_tx, reply, host, &log).await {
                                open = false;
                                break;
                            }
                        }
                        if !open {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    log.debug("client disconnected", &[]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localize_only_touches_stream_url() {
        let live = ServerEvent::LiveStreamUrl(LiveStream::up("lapsecam", 8080));
        let ServerEvent::LiveStreamUrl(local) = localize(live, Some("10.0.0.7")) else {
            panic!("event changed kind");
        };
        assert_eq!(local.url.as_deref(), Some("http://10.0.0.7:8080/?action=stream"));

        let note = localize(ServerEvent::info("x"), Some("10.0.0.7"));
        assert_eq!(note.name(), "notification");
    }
}

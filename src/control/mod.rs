// Lapse Cam - Control Plane
// One broadcast hub fans orchestrator and encoder events out to every
// connected UI client; commands come back in over the same socket.

pub mod dispatch;
pub mod events;
pub mod server;
pub mod system;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::camera::list_captures;
use crate::config::{ConfigStore, Settings};
use crate::constants::{EVENT_CHANNEL_CAPACITY, IMAGE_LIST_LIMIT};
use crate::encoder::{list_videos, EncoderPhase, EncoderService, ProgressSink};
use crate::logging::Logger;
use crate::orchestrator::{EventSink, OrchestratorEvent, OrchestratorHandle};
use events::{ImageList, LiveStream, Notification, NotificationLevel, ServerEvent, VideoList};

/// Broadcast fan-out. `send` is synchronous so selector and encoder
/// threads can publish without a runtime.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Dropped silently when nobody is listening.
    pub fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a connection handler needs.
pub struct ControlState {
    pub hub: EventHub,
    pub store: Arc<ConfigStore>,
    pub orchestrator: OrchestratorHandle,
    pub encoder: EncoderService,
    pub stream_host: String,
    pub started: Instant,
}

impl ControlState {
    pub fn config(&self) -> Arc<Settings> {
        self.store.snapshot()
    }

    /// Encoder sink bound to this state's hub.
    pub fn encoder_sink(&self) -> ProgressSink {
        encoder_sink(self.hub.clone(), self.store.clone())
    }
}

pub fn image_list(settings: &Settings) -> crate::error::Result<ImageList> {
    let records = list_captures(&settings.captures_dir)?;
    Ok(ImageList::from_records(&records, IMAGE_LIST_LIMIT))
}

pub fn video_list(settings: &Settings) -> crate::error::Result<VideoList> {
    Ok(VideoList::from_infos(&list_videos(&settings.videos_dir)?))
}

/// Map one orchestrator event onto the client events it implies.
pub fn translate(event: OrchestratorEvent, settings: &Settings, stream_host: &str) -> Vec<ServerEvent> {
    let port = settings.stream_port;
    match event {
        OrchestratorEvent::Status(status) => vec![ServerEvent::StatusUpdate(status)],
        OrchestratorEvent::StreamReady { .. } => vec![
            ServerEvent::LiveStreamUrl(LiveStream::up(stream_host, port)),
            ServerEvent::success("Live stream ready"),
        ],
        OrchestratorEvent::StreamPaused => vec![ServerEvent::LiveStreamUrl(LiveStream::down(
            port,
            "paused for capture",
        ))],
        OrchestratorEvent::StreamStopped { reason } => vec![ServerEvent::LiveStreamUrl(LiveStream::down(port, reason))],
        OrchestratorEvent::StreamError { message } => vec![
            ServerEvent::LiveStreamUrl(LiveStream::down(port, message.clone())),
            ServerEvent::Notification(Notification::new(
                NotificationLevel::Error,
                format!("Live stream error: {}", message),
            )),
        ],
        OrchestratorEvent::ImageCaptured { record } => {
            let mut out = vec![ServerEvent::success(format!("Image captured: {}", record.filename))];
            if let Ok(list) = image_list(settings) {
                out.push(ServerEvent::ImageListUpdate(list));
            }
            out
        }
        OrchestratorEvent::CaptureFailed { message, kind } => vec![ServerEvent::Notification(Notification {
            level: NotificationLevel::Error,
            message: format!("Capture failed: {}", message),
            kind: Some(kind),
        })],
        OrchestratorEvent::Error {
            message, error_kind, ..
        } => vec![ServerEvent::Notification(Notification {
            level: NotificationLevel::Error,
            message,
            kind: Some(error_kind),
        })],
        OrchestratorEvent::Info { message } => vec![ServerEvent::info(message)],
        OrchestratorEvent::Operation { .. } => Vec::new(),
    }
}

pub fn orchestrator_sink(hub: EventHub, store: Arc<ConfigStore>, stream_host: String) -> EventSink {
    let log = Logger::new("control");
    Arc::new(move |event| {
        if let OrchestratorEvent::Operation { id, kind, state, .. } = &event {
            log.debug("operation transition", &[("id", id), ("kind", kind), ("state", &format!("{:?}", state))]);
        }
        let settings = store.snapshot();
        for out in translate(event, &settings, &stream_host) {
            hub.send(out);
        }
    })
}

/// Progress goes out as-is; a finished video also refreshes the list.
pub fn encoder_sink(hub: EventHub, store: Arc<ConfigStore>) -> ProgressSink {
    Arc::new(move |progress| {
        let complete = progress.phase == EncoderPhase::Complete;
        hub.send(ServerEvent::VideoGenerationStatus(progress));
        if complete {
            if let Ok(list) = video_list(&store.snapshot()) {
                hub.send(ServerEvent::VideoListUpdate(list));
            }
        }
    })
}

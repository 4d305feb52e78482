// Client command dispatch
//
// Returns the events meant only for the requesting client; anything every
// client should see goes through the hub. Blocking calls into the
// orchestrator, the config store and the filesystem run on the blocking pool.

use std::sync::Arc;

use super::events::{ClientCommand, ImagesCleared, ServerEvent};
use super::{image_list, video_list, ControlState};
use crate::camera::clear_captures;
use crate::config::Settings;
use crate::encoder::delete_video;
use crate::error::{LapseError, Result};
use crate::logging::Logger;
use crate::orchestrator::Ack;

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LapseError::Other(format!("blocking task failed: {}", e)))?
}

async fn broadcast_status(state: &Arc<ControlState>) {
    let handle = state.orchestrator.clone();
    if let Ok(status) = blocking(move || handle.status()).await {
        state.hub.send(ServerEvent::StatusUpdate(Box::new(status)));
    }
}

fn broadcast_config(state: &ControlState, settings: &Settings) {
    state.hub.send(ServerEvent::ConfigUpdate(Box::new(settings.clone())));
}

pub async fn dispatch(state: &Arc<ControlState>, command: ClientCommand) -> Vec<ServerEvent> {
    let log = Logger::new("control");
    log.debug("command", &[("command", &format!("{:?}", command))]);
    match run(state, command).await {
        Ok(replies) => replies,
        Err(e) => {
            if !e.is_informational() {
                log.warn("command failed", &[("method", &"dispatch"), ("error", &e)]);
            }
            vec![ServerEvent::from_error(&e)]
        }
    }
}

async fn run(state: &Arc<ControlState>, command: ClientCommand) -> Result<Vec<ServerEvent>> {
    let orchestrator = state.orchestrator.clone();
    let replies = match command {
        ClientCommand::StartCapture => {
            let ack = match blocking(move || orchestrator.start_timelapse()).await {
                Ok(ack) => ack,
                // Already announced to everyone by the orchestrator.
                Err(e) if e.is_informational() => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            match ack {
                Ack::Queued => state.hub.send(ServerEvent::info("Time-lapse queued")),
                _ => state.hub.send(ServerEvent::success("Time-lapse started")),
            }
            broadcast_status(state).await;
            Vec::new()
        }
        ClientCommand::StopCapture => {
            if !blocking(move || orchestrator.stop_timelapse()).await? {
                return Ok(vec![ServerEvent::info("No time-lapse is running")]);
            }
            state.hub.send(ServerEvent::success("Time-lapse stopped"));
            broadcast_status(state).await;
            Vec::new()
        }
        ClientCommand::ToggleStream => {
            let ack = blocking(move || orchestrator.toggle_stream()).await?;
            broadcast_status(state).await;
            match ack {
                Ack::Queued => vec![ServerEvent::info("Live stream queued behind the current operation")],
                Ack::Dropped => vec![ServerEvent::info("Queued live stream withdrawn")],
                _ => Vec::new(),
            }
        }
        ClientCommand::CaptureNow => {
            let ack = blocking(move || orchestrator.capture_now()).await?;
            broadcast_status(state).await;
            match ack {
                Ack::Queued => vec![ServerEvent::info("Capture queued")],
                _ => Vec::new(),
            }
        }
        ClientCommand::GenerateVideo(request) => {
            state.encoder.start(request, state.config(), state.encoder_sink())?;
            Vec::new()
        }
        ClientCommand::CancelVideoGeneration => {
            let encoder = state.encoder.clone();
            if !blocking(move || Ok(encoder.cancel())).await? {
                return Ok(vec![ServerEvent::info("No video generation in progress")]);
            }
            Vec::new()
        }
        ClientCommand::RefreshImages => {
            let settings = state.config();
            vec![ServerEvent::ImageListUpdate(blocking(move || image_list(&settings)).await?)]
        }
        ClientCommand::ClearImages => {
            let status = blocking(move || orchestrator.status()).await?;
            if status.is_capturing {
                return Err(LapseError::State("Cannot clear images while a time-lapse is running".into()));
            }
            let settings = state.config();
            let (count, list) = blocking(move || {
                let count = clear_captures(&settings.captures_dir)?;
                Ok((count, image_list(&settings)?))
            })
            .await?;
            state.hub.send(ServerEvent::ImagesCleared(ImagesCleared { count }));
            state.hub.send(ServerEvent::ImageListUpdate(list));
            Vec::new()
        }
        ClientCommand::RefreshVideos => {
            let settings = state.config();
            vec![ServerEvent::VideoListUpdate(blocking(move || video_list(&settings)).await?)]
        }
        ClientCommand::DeleteVideo { filename } => {
            let settings = state.config();
            let name = filename.clone();
            let list = blocking(move || {
                delete_video(&settings.videos_dir, &name)?;
                video_list(&settings)
            })
            .await?;
            state.hub.send(ServerEvent::VideoListUpdate(list));
            vec![ServerEvent::success(format!("Deleted {}", filename))]
        }
        ClientCommand::SaveConfig(patch) => {
            let store = state.store.clone();
            let settings = blocking(move || store.update(&patch)).await?;
            let applied = settings.clone();
            blocking(move || orchestrator.update_config(applied)).await?;
            broadcast_config(state, &settings);
            vec![ServerEvent::success("Configuration saved")]
        }
        ClientCommand::ResetConfigToDefaults => {
            let store = state.store.clone();
            let settings = blocking(move || store.reset_to_defaults()).await?;
            let applied = settings.clone();
            blocking(move || orchestrator.update_config(applied)).await?;
            broadcast_config(state, &settings);
            vec![ServerEvent::success("Configuration reset to defaults")]
        }
        ClientCommand::RequestExtendedConfig => {
            vec![ServerEvent::ConfigUpdate(Box::new((*state.config()).clone()))]
        }
    };
    Ok(replies)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};

    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::broadcast::Receiver;

    use crate::camera::CameraCapture;
    use crate::config::ConfigStore;
    use crate::control::{orchestrator_sink, EventHub};
    use crate::encoder::EncoderService;
    use crate::error::ErrorKind;
    use crate::orchestrator;

    struct Fixture {
        _tmp: TempDir,
        state: Arc<ControlState>,
        events: Receiver<ServerEvent>,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.state.orchestrator.shutdown();
        }
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let settings = Settings {
            mock_camera: true,
            captures_dir: tmp.path().join("captures"),
            videos_dir: tmp.path().join("videos"),
            capture_settle_ms: 10,
            ..Settings::default()
        };
        fs::create_dir_all(&settings.videos_dir).unwrap();
        let store = Arc::new(ConfigStore::in_memory(tmp.path().join("settings.env"), settings.clone()));
        let hub = EventHub::new();
        let events = hub.subscribe();
        let camera = CameraCapture::new(&settings.captures_dir, "/nonexistent/camera").unwrap();
        let sink = orchestrator_sink(hub.clone(), store.clone(), "lapsecam".into());
        let handle = orchestrator::spawn(Arc::new(settings), camera, "/nonexistent/streamer", sink).unwrap();
        let state = Arc::new(ControlState {
            hub,
            store,
            orchestrator: handle,
            encoder: EncoderService::new("/nonexistent/ffmpeg"),
            stream_host: "lapsecam".into(),
            started: Instant::now(),
        });
        Fixture {
            _tmp: tmp,
            state,
            events,
        }
    }

    async fn next_matching(events: &mut Receiver<ServerEvent>, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => continue,
                    Err(e) => panic!("hub closed: {:?}", e),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("expected event did not arrive")
    }

    async fn next_named(events: &mut Receiver<ServerEvent>, name: &str) -> ServerEvent {
        next_matching(events, |e| e.name() == name).await
    }

    #[tokio::test]
    async fn test_capture_now_refreshes_image_list() {
        let mut fx = fixture();
        let replies = dispatch(&fx.state, ClientCommand::CaptureNow).await;
        assert!(replies.is_empty(), "{:?}", replies);

        let ServerEvent::ImageListUpdate(list) = next_named(&mut fx.events, "imageListUpdate").await else {
            unreachable!();
        };
        assert_eq!(list.total, 1);

        let replies = dispatch(&fx.state, ClientCommand::RefreshImages).await;
        assert!(matches!(&replies[..], [ServerEvent::ImageListUpdate(l)] if l.total == 1));

        let replies = dispatch(&fx.state, ClientCommand::ClearImages).await;
        assert!(replies.is_empty());
        let ServerEvent::ImagesCleared(cleared) = next_named(&mut fx.events, "imagesCleared").await else {
            unreachable!();
        };
        assert_eq!(cleared.count, 1);
    }

    #[tokio::test]
    async fn test_clear_refused_while_capturing() {
        let mut fx = fixture();
        assert!(dispatch(&fx.state, ClientCommand::StartCapture).await.is_empty());
        next_named(&mut fx.events, "imageListUpdate").await;

        let replies = dispatch(&fx.state, ClientCommand::ClearImages).await;
        let [ServerEvent::Notification(n)] = &replies[..] else {
            panic!("{:?}", replies);
        };
        assert_eq!(n.kind, Some(ErrorKind::State));

        // A second start is informational and already broadcast.
        assert!(dispatch(&fx.state, ClientCommand::StartCapture).await.is_empty());
        let notice = next_matching(&mut fx.events, |e| {
            matches!(e, ServerEvent::Notification(n) if n.message.contains("already"))
        })
        .await;
        let ServerEvent::Notification(n) = notice else {
            unreachable!();
        };
        assert_eq!(n.level, crate::control::events::NotificationLevel::Info);

        assert!(dispatch(&fx.state, ClientCommand::StopCapture).await.is_empty());
        let replies = dispatch(&fx.state, ClientCommand::StopCapture).await;
        assert_eq!(replies.len(), 1);
    }

    #[tokio::test]
    async fn test_save_config_validates_and_broadcasts() {
        let mut fx = fixture();
        let patch = json!({"captureIntervalSeconds": 0});
        let replies = dispatch(&fx.state, ClientCommand::SaveConfig(patch.as_object().unwrap().clone())).await;
        let [ServerEvent::Notification(n)] = &replies[..] else {
            panic!("{:?}", replies);
        };
        assert_eq!(n.kind, Some(ErrorKind::Validation));

        let patch = json!({"captureIntervalSeconds": 15});
        dispatch(&fx.state, ClientCommand::SaveConfig(patch.as_object().unwrap().clone())).await;
        let ServerEvent::ConfigUpdate(settings) = next_named(&mut fx.events, "configUpdate").await else {
            unreachable!();
        };
        assert_eq!(settings.capture_interval_seconds, 15);
        assert_eq!(fx.state.config().capture_interval_seconds, 15);

        let replies = dispatch(&fx.state, ClientCommand::RequestExtendedConfig).await;
        assert!(matches!(&replies[..], [ServerEvent::ConfigUpdate(s)] if s.capture_interval_seconds == 15));
    }

    #[tokio::test]
    async fn test_video_commands() {
        let mut fx = fixture();
        let videos = fx.state.config().videos_dir.clone();
        fs::write(videos.join("timelapse_a_to_b.mp4"), b"v").unwrap();

        let replies = dispatch(&fx.state, ClientCommand::RefreshVideos).await;
        assert!(matches!(&replies[..], [ServerEvent::VideoListUpdate(l)] if l.videos.len() == 1));

        let replies = dispatch(
            &fx.state,
            ClientCommand::DeleteVideo {
                filename: "../settings.env".into(),
            },
        )
        .await;
        assert!(matches!(&replies[..], [ServerEvent::Notification(n)] if n.kind == Some(ErrorKind::Security)));

        dispatch(
            &fx.state,
            ClientCommand::DeleteVideo {
                filename: "timelapse_a_to_b.mp4".into(),
            },
        )
        .await;
        let ServerEvent::VideoListUpdate(list) = next_named(&mut fx.events, "videoListUpdate").await else {
            unreachable!();
        };
        assert!(list.videos.is_empty());

        let replies = dispatch(&fx.state, ClientCommand::CancelVideoGeneration).await;
        assert_eq!(replies.len(), 1);
    }
}

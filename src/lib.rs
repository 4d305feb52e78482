// Lapse Cam - Library Entry Point

pub mod camera;
pub mod config;
pub mod constants;
pub mod control;
pub mod encoder;
pub mod error;
pub mod helper;
pub mod logging;
pub mod orchestrator;
pub mod stream;
pub mod timelapse;
pub mod tools;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use camera::CameraCapture;
use config::ConfigStore;
use control::{ControlState, EventHub};
use encoder::EncoderService;
use logging::Logger;

/// Everything the server binary runs, built from one settings file.
pub struct App {
    pub state: Arc<ControlState>,
}

impl App {
    /// Fails on an invalid settings file or an unwritable captures directory.
    pub fn init(store: ConfigStore) -> Result<Self> {
        let store = Arc::new(store);
        let settings = store.snapshot();
        settings.validate().context("invalid configuration")?;

        let log = Logger::new("app");
        let tools = tools::tool_status();
        if !settings.mock_camera && !tools.camera {
            log.warn("camera helper not found", &[("path", &tools::camera_path().display())]);
        }
        if !tools.streamer {
            log.warn("streaming helper not found", &[("path", &tools::streamer_path().display())]);
        }
        if !tools.encoder {
            log.warn("encoder not found", &[("path", &tools::encoder_path().display())]);
        }

        let camera = CameraCapture::new(&settings.captures_dir, tools::camera_path())
            .context("captures directory is not usable")?;
        std::fs::create_dir_all(&settings.videos_dir).context("videos directory is not usable")?;

        let hub = EventHub::new();
        let stream_host = control::system::hostname();
        let sink = control::orchestrator_sink(hub.clone(), store.clone(), stream_host.clone());
        let orchestrator = orchestrator::spawn(settings.clone(), camera, tools::streamer_path(), sink)
            .context("failed to start orchestrator")?;

        let state = Arc::new(ControlState {
            hub,
            store,
            orchestrator,
            encoder: EncoderService::new(tools::encoder_path()),
            stream_host,
            started: Instant::now(),
        });
        Ok(Self { state })
    }

    /// Stop any encode, the session and the stream.
    pub fn shutdown(&self) {
        self.state.encoder.cancel();
        self.state.orchestrator.shutdown();
    }
}

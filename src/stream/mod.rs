// Lapse Cam - Stream Adapter
// Owns the MJPEG streaming helper. Only the orchestrator thread mutates it;
// helper callbacks report back through the event sink and are folded into
// state by `handle_event`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::{Quality, Resolution, Settings};
use crate::error::{LapseError, Result};
use crate::helper::{self, ExitInfo, HelperCallbacks, HelperHandle, HelperOptions};
use crate::logging::Logger;

const READY_TIMEOUT_REASON: &str = "ready timeout";

/// Parameters the streaming helper was started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub quality: Quality,
    pub resolution: Resolution,
    pub fps: u32,
    pub rotation: u16,
}

impl StreamSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            quality: settings.stream_quality,
            resolution: settings.stream_quality.resolution(),
            fps: settings.stream_fps,
            rotation: settings.rotation,
        }
    }
}

/// Helper lifecycle events, tagged with the start generation that produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Ready { generation: u64 },
    Stopped { generation: u64, exit: ExitInfo },
    Error { generation: u64, message: String },
}

impl StreamEvent {
    pub fn generation(&self) -> u64 {
        match self {
            StreamEvent::Ready { generation }
            | StreamEvent::Stopped { generation, .. }
            | StreamEvent::Error { generation, .. } => *generation,
        }
    }
}

pub type StreamEventSink = Arc<dyn Fn(StreamEvent) + Send + Sync>;

pub fn stream_url(host: &str, port: u16) -> String {
    format!("http://{}:{}/?action=stream", host, port)
}

/// Argument list for the streaming helper. Plugin strings are single elements.
pub fn streamer_args(settings: &StreamSettings, port: u16) -> Vec<String> {
    let mut input = format!("input_uvc.so -r {} -f {}", settings.resolution, settings.fps);
    if settings.rotation != 0 {
        input.push_str(&format!(" -rot {}", settings.rotation));
    }
    vec![
        "-i".to_string(),
        input,
        "-o".to_string(),
        format!("output_http.so -p {}", port),
    ]
}

pub struct StreamAdapter {
    streamer_exe: PathBuf,
    sink: StreamEventSink,
    handle: Option<HelperHandle>,
    settings: Option<StreamSettings>,
    ready: bool,
    generation: u64,
    log: Logger,
}

impl StreamAdapter {
    pub fn new(streamer_exe: impl Into<PathBuf>, sink: StreamEventSink) -> Self {
        Self {
            streamer_exe: streamer_exe.into(),
            sink,
            handle: None,
            settings: None,
            ready: false,
            generation: 0,
            log: Logger::new("stream"),
        }
    }

    /// True once the helper has signalled ready, until it exits.
    pub fn active(&self) -> bool {
        self.handle.is_some() && self.ready
    }

    /// True while a helper process exists, ready or not.
    pub fn holds_camera(&self) -> bool {
        self.handle.is_some()
    }

    pub fn current_settings(&self) -> Option<StreamSettings> {
        self.settings
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Spawn the helper. Readiness arrives later as `StreamEvent::Ready`.
    pub fn start(&mut self, stream: StreamSettings, config: &Settings) -> Result<u64> {
        if self.handle.is_some() {
            return Err(LapseError::State("stream already active".into()));
        }

        self.generation += 1;
        let generation = self.generation;
        let args = streamer_args(&stream, config.stream_port);

        let ready_sink = Arc::clone(&self.sink);
        let exit_sink = Arc::clone(&self.sink);
        let line_log = self.log.clone();
        let callbacks = HelperCallbacks {
            on_stderr_line: Some(Box::new(move |line| {
                line_log.debug("streamer", &[("line", &line)]);
            })),
            on_ready: Some(Box::new(move || ready_sink(StreamEvent::Ready { generation }))),
            on_exit: Some(Box::new(move |exit| exit_sink(StreamEvent::Stopped { generation, exit }))),
            ..HelperCallbacks::default()
        };
        let options = HelperOptions {
            ready_signal: Some(config.stream_ready_signal.clone()),
            ready_timeout: Some(Duration::from_secs(config.stream_start_timeout_seconds)),
            kill_timeout: Duration::from_millis(config.kill_timeout_ms),
            ..HelperOptions::default()
        };

        let handle = helper::spawn(&self.streamer_exe, &args, options, callbacks).map_err(|e| {
            self.log.error(
                "stream start failed",
                &[("method", &"start"), ("error", &e)],
            );
            e
        })?;

        self.log.info(
            "stream starting",
            &[
                ("generation", &generation),
                ("resolution", &stream.resolution),
                ("fps", &stream.fps),
                ("port", &config.stream_port),
            ],
        );
        self.handle = Some(handle);
        self.settings = Some(stream);
        self.ready = false;
        Ok(generation)
    }

    /// Terminate the helper and wait for it. Returns false when nothing was running.
    pub fn stop(&mut self, reason: &str) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        let exit = handle.kill(reason);
        self.settings = None;
        self.ready = false;
        match exit {
            Some(exit) => self.log.info("stream stopped", &[("reason", &reason), ("status", &exit.describe())]),
            None => self.log.warn("stream helper did not exit after kill", &[("pid", &handle.pid())]),
        }
        true
    }

    /// Fold a helper event into adapter state.
    ///
    /// Returns the event to surface, or `None` when it belongs to a helper
    /// that has already been stopped or replaced.
    pub fn handle_event(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        if event.generation() != self.generation || self.handle.is_none() {
            self.log.debug("stale stream event dropped", &[("generation", &event.generation())]);
            return None;
        }

        match event {
            StreamEvent::Ready { .. } => {
                self.ready = true;
                self.log.info("stream ready", &[("generation", &self.generation)]);
                Some(event)
            }
            StreamEvent::Stopped { generation, exit } => {
                let was_ready = self.ready;
                let tail = self
                    .handle
                    .take()
                    .map(|h| h.stderr_tail())
                    .unwrap_or_default();
                self.settings = None;
                self.ready = false;

                if was_ready {
                    self.log.warn("stream helper exited", &[("status", &exit.describe())]);
                    return Some(StreamEvent::Stopped { generation, exit });
                }
                let message = if exit.kill_reason.as_deref() == Some(READY_TIMEOUT_REASON) {
                    READY_TIMEOUT_REASON.to_string()
                } else {
                    let detail = tail.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
                    format!("streamer {} before ready {}", exit.describe(), detail).trim_end().to_string()
                };
                self.log.error(
                    "stream failed to start",
                    &[("method", &"handle_event"), ("error", &message)],
                );
                Some(StreamEvent::Error { generation, message })
            }
            StreamEvent::Error { .. } => Some(event),
        }
    }
}

impl Drop for StreamAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.terminate("shutdown");
        }
    }
}

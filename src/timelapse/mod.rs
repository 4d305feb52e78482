// Lapse Cam - Time-lapse Engine
// Cadence bookkeeping for one session. The orchestrator thread owns the
// engine and calls `tick` when `next_deadline` passes; the camera and the
// stream adapter are lent in for the duration of each tick.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::camera::{CameraCapture, CaptureRecord};
use crate::config::Settings;
use crate::error::{LapseError, Result};
use crate::logging::Logger;
use crate::stream::{StreamAdapter, StreamSettings};

/// Counters carried across a pause.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub started_at: DateTime<Utc>,
    pub image_count: u64,
    /// Time left until the next tick when the session was paused.
    #[serde(skip)]
    pub until_next_tick: Option<Duration>,
    pub stream_was_active: bool,
    pub stream_settings: Option<StreamSettings>,
}

/// Outcome of one capture with the camera handed over from the stream.
#[derive(Debug)]
pub struct CaptureCycle {
    pub stream_paused: bool,
    pub result: Result<CaptureRecord>,
    /// Present when the stream was paused; carries the restart generation.
    pub stream_resumed: Option<Result<u64>>,
}

/// Stop the stream if it holds the camera, capture, then restart the
/// stream with its prior settings whether or not the capture succeeded.
pub fn capture_with_handoff(
    camera: &CameraCapture,
    stream: &mut StreamAdapter,
    settings: &Settings,
) -> CaptureCycle {
    let saved = if stream.holds_camera() {
        stream.current_settings()
    } else {
        None
    };
    let stream_paused = saved.is_some() && stream.stop("capture");
    if stream_paused && settings.capture_settle_ms > 0 {
        thread::sleep(Duration::from_millis(settings.capture_settle_ms));
    }

    let result = camera.capture(settings);

    let stream_resumed = match saved {
        Some(prior) if stream_paused => Some(stream.start(prior, settings)),
        _ => None,
    };
    CaptureCycle {
        stream_paused,
        result,
        stream_resumed,
    }
}

#[derive(Debug)]
pub struct TimelapseEngine {
    running: bool,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    image_count: u64,
    interval: Duration,
    next_tick: Option<Instant>,
    stream_was_active: bool,
    stream_settings: Option<StreamSettings>,
    log: Logger,
}

impl Default for TimelapseEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelapseEngine {
    pub fn new() -> Self {
        Self {
            running: false,
            started_at: None,
            ended_at: None,
            image_count: 0,
            interval: Duration::from_secs(1),
            next_tick: None,
            stream_was_active: false,
            stream_settings: None,
            log: Logger::new("timelapse"),
        }
    }

    /// Begin a fresh session; the first tick is due immediately.
    pub fn start(&mut self, interval: Duration, stream: &StreamAdapter) -> Result<()> {
        if self.running {
            return Err(LapseError::State("time-lapse already running".into()));
        }
        self.stream_was_active = stream.active();
        self.stream_settings = stream.current_settings();
        self.running = true;
        self.started_at = Some(Utc::now());
        self.ended_at = None;
        self.image_count = 0;
        self.interval = interval;
        self.next_tick = Some(Instant::now());
        self.log.info("session started", &[("interval_s", &interval.as_secs())]);
        Ok(())
    }

    /// Continue a paused session with its counters intact.
    pub fn resume(&mut self, snapshot: &SessionSnapshot, interval: Duration) -> Result<()> {
        if self.running {
            return Err(LapseError::State("time-lapse already running".into()));
        }
        self.running = true;
        self.started_at = Some(snapshot.started_at);
        self.ended_at = None;
        self.image_count = snapshot.image_count;
        self.interval = interval;
        self.stream_was_active = snapshot.stream_was_active;
        self.stream_settings = snapshot.stream_settings;
        self.next_tick = Some(Instant::now() + snapshot.until_next_tick.unwrap_or_default());
        self.log.info("session resumed", &[("images", &self.image_count)]);
        Ok(())
    }

    /// Stop the session and hand back its counters.
    pub fn pause(&mut self) -> Option<SessionSnapshot> {
        let snapshot = self.snapshot()?;
        self.stop();
        Some(snapshot)
    }

    /// Returns whether a session was running.
    pub fn stop(&mut self) -> bool {
        if !self.running {
            return false;
        }
        self.running = false;
        self.next_tick = None;
        self.ended_at = Some(Utc::now());
        self.log.info(
            "session stopped",
            &[("images", &self.image_count), ("session_time", &self.session_time())],
        );
        true
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        if !self.running {
            return None;
        }
        Some(SessionSnapshot {
            started_at: self.started_at?,
            image_count: self.image_count,
            until_next_tick: self
                .next_tick
                .map(|t| t.saturating_duration_since(Instant::now())),
            stream_was_active: self.stream_was_active,
            stream_settings: self.stream_settings,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn image_count(&self) -> u64 {
        self.image_count
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_tick.filter(|_| self.running)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_deadline().is_some_and(|t| now >= t)
    }

    /// Seconds until the next capture, rounded up.
    pub fn next_capture_eta(&self) -> Option<u64> {
        let left = self.next_deadline()?.saturating_duration_since(Instant::now());
        Some(left.as_millis().div_ceil(1000) as u64)
    }

    /// `HH:MM:SS` since the session started. A stopped session keeps its
    /// final length; zero before any session.
    pub fn session_time(&self) -> String {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        let elapsed = self
            .started_at
            .map(|t| (end - t).num_seconds().max(0) as u64)
            .unwrap_or(0);
        format_hms(elapsed)
    }

    /// One cadence iteration. The next tick is scheduled one interval after
    /// this one finishes, so a slow camera stretches the cadence.
    pub fn tick(
        &mut self,
        camera: &CameraCapture,
        stream: &mut StreamAdapter,
        settings: &Settings,
    ) -> CaptureCycle {
        let cycle = capture_with_handoff(camera, stream, settings);
        match &cycle.result {
            Ok(record) => {
                self.image_count += 1;
                self.log.debug(
                    "tick captured",
                    &[("file", &record.filename), ("images", &self.image_count)],
                );
            }
            Err(e) => {
                self.log.error(
                    "tick capture failed",
                    &[("method", &"tick"), ("error", e)],
                );
            }
        }
        if self.running {
            self.next_tick = Some(Instant::now() + self.interval);
        }
        cycle
    }
}

pub fn format_hms(total_seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        total_seconds / 3600,
        (total_seconds % 3600) / 60,
        total_seconds % 60
    )
}

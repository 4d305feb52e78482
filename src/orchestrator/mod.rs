// Lapse Cam - Operation Orchestrator
// Owns the camera. Runs on one "selector" thread that drains commands,
// stream helper events and timer deadlines in arrival order, so no two
// state transitions ever interleave.
//
// Only one operation is `current` at a time. A higher-priority arrival
// pauses the current one, which goes back into the queue with its progress
// saved. Whenever `current` empties, the head of the queue runs.

pub mod operation;

#[cfg(all(test, unix))]
mod tests;

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use crate::camera::{CameraCapture, CaptureRecord};
use crate::config::{Settings, TimeOfDay};
use crate::constants::STATUS_HEARTBEAT_MS;
use crate::error::{ErrorKind, LapseError, Result};
use crate::logging::Logger;
use crate::stream::{StreamAdapter, StreamEvent, StreamEventSink, StreamSettings};
use crate::timelapse::{self, CaptureCycle, TimelapseEngine};

pub use operation::{Operation, OperationKind, OperationQueue, OperationState, OperationSummary, Progress};

/// How long a caller waits for the selector to acknowledge a command.
/// A capture in flight delays the reply until it finishes.
const REPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything the orchestrator reports to the outside world.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Lifecycle transition of an operation.
    Operation {
        id: u64,
        kind: OperationKind,
        state: OperationState,
        message: String,
    },
    StreamPaused,
    StreamReady { settings: StreamSettings },
    StreamStopped { reason: String },
    StreamError { message: String },
    ImageCaptured { record: CaptureRecord },
    CaptureFailed { message: String, kind: ErrorKind },
    /// An operation failed; informational state errors use `Info`.
    Error {
        kind: Option<OperationKind>,
        message: String,
        error_kind: ErrorKind,
    },
    Info { message: String },
    Status(Box<StatusSnapshot>),
}

pub type EventSink = Arc<dyn Fn(OrchestratorEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub is_capturing: bool,
    /// Kind of the current operation, or `idle`.
    pub mode: String,
    pub current_operation: Option<OperationSummary>,
    pub queue: Vec<OperationSummary>,
    pub queue_length: usize,
    pub image_count: u64,
    pub session_time: String,
    pub session_started_at: Option<DateTime<Utc>>,
    pub next_capture_eta: Option<u64>,
    pub capture_interval_seconds: u64,
    pub stream_active: bool,
    pub stream_starting: bool,
    pub stream_settings: Option<StreamSettings>,
    pub schedule_enabled: bool,
    pub start_time: TimeOfDay,
    pub stop_time: TimeOfDay,
    pub within_schedule: bool,
}

/// Acknowledgement for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Ack {
    Started,
    Queued,
    Stopped,
    NotRunning,
    /// A queued stream request was withdrawn.
    Dropped,
    Applied,
}

#[derive(Debug, Clone)]
pub enum Command {
    StartTimelapse,
    StopTimelapse,
    ToggleStream,
    CaptureNow,
    UpdateConfig(Arc<Settings>),
}

pub enum Input {
    Command(Command, Option<Sender<Result<Ack>>>),
    Status(Sender<StatusSnapshot>),
    Stream(StreamEvent),
    Shutdown,
}

pub struct Orchestrator {
    config: Arc<Settings>,
    camera: CameraCapture,
    stream: StreamAdapter,
    engine: TimelapseEngine,
    current: Option<Operation>,
    queue: OperationQueue,
    next_id: u64,
    next_heartbeat: Option<Instant>,
    sink: EventSink,
    log: Logger,
}

impl Orchestrator {
    pub fn new(config: Arc<Settings>, camera: CameraCapture, stream: StreamAdapter, sink: EventSink) -> Self {
        Self {
            config,
            camera,
            stream,
            engine: TimelapseEngine::new(),
            current: None,
            queue: OperationQueue::new(),
            next_id: 0,
            next_heartbeat: None,
            sink,
            log: Logger::new("orchestrator"),
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        (self.sink)(event);
    }

    fn emit_transition(&self, op: &Operation, message: &str) {
        self.emit(OrchestratorEvent::Operation {
            id: op.id,
            kind: op.kind,
            state: op.state,
            message: message.to_string(),
        });
    }

    fn publish_status(&self) {
        self.emit(OrchestratorEvent::Status(Box::new(self.status())));
    }

    // ---- commands --------------------------------------------------------

    pub fn handle_command(&mut self, command: Command, reply: Option<Sender<Result<Ack>>>) {
        let respond = |result: Result<Ack>| {
            if let Some(reply) = &reply {
                let _ = reply.send(result);
            }
        };

        match command {
            Command::StartTimelapse => {
                if self.timelapse_pending() {
                    let err = LapseError::State("time-lapse already running".into());
                    self.emit(OrchestratorEvent::Info { message: err.to_string() });
                    respond(Err(err));
                } else {
                    self.enqueue(OperationKind::Timelapse, respond);
                }
            }
            Command::StopTimelapse => {
                let stopped = self.stop_timelapse();
                respond(Ok(if stopped { Ack::Stopped } else { Ack::NotRunning }));
            }
            Command::ToggleStream => {
                let ack = self.toggle_stream(respond);
                if let Some(ack) = ack {
                    if let Some(reply) = &reply {
                        let _ = reply.send(Ok(ack));
                    }
                }
            }
            Command::CaptureNow => self.enqueue(OperationKind::OneShotCapture, respond),
            Command::UpdateConfig(config) => {
                self.config = config;
                self.log.info("configuration applied", &[]);
                respond(Ok(Ack::Applied));
            }
        }
        self.publish_status();
    }

    fn timelapse_pending(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|op| op.kind == OperationKind::Timelapse)
            || self.queue.contains_kind(OperationKind::Timelapse)
    }

    /// Admit a new operation. `respond` is called before the operation runs
    /// so callers are not held for the length of a capture.
    pub fn enqueue(&mut self, kind: OperationKind, respond: impl FnOnce(Result<Ack>)) {
        self.next_id += 1;
        let op = Operation::new(self.next_id, kind, Arc::clone(&self.config));
        let log = self.log.with_correlation(op.correlation_id.clone());

        match &self.current {
            None => {
                respond(Ok(Ack::Started));
                self.activate(op);
            }
            Some(running) if op.priority > running.priority => {
                log.info(
                    "preempting",
                    &[("incoming", &op.kind), ("running", &running.kind)],
                );
                respond(Ok(Ack::Started));
                self.preempt(op);
            }
            Some(running) => {
                log.info(
                    "queued behind running operation",
                    &[("kind", &op.kind), ("running", &running.kind)],
                );
                self.emit_transition(&op, "queued");
                self.queue.push(op);
                respond(Ok(Ack::Queued));
            }
        }
        self.advance();
    }

    fn stop_timelapse(&mut self) -> bool {
        if self
            .current
            .as_ref()
            .is_some_and(|op| op.kind == OperationKind::Timelapse)
        {
            self.engine.stop();
            if let Some(op) = self.current.take() {
                self.finish(op, "stopped by user");
            }
            self.advance();
            return true;
        }

        let removed = self.queue.remove_kind(OperationKind::Timelapse);
        for mut op in removed.iter().cloned() {
            op.state = OperationState::Completed;
            self.emit_transition(&op, "stopped while paused");
        }
        !removed.is_empty()
    }

    /// Stop the stream if it holds the camera, else withdraw a queued
    /// request, else ask for one. Returns `None` when `respond` was used.
    fn toggle_stream(&mut self, respond: impl FnOnce(Result<Ack>)) -> Option<Ack> {
        if self.stream.holds_camera() {
            self.stream.stop("stopped by user");
            self.emit(OrchestratorEvent::StreamStopped {
                reason: "stopped by user".into(),
            });
            if self
                .current
                .as_ref()
                .is_some_and(|op| op.kind == OperationKind::Stream)
            {
                if let Some(op) = self.current.take() {
                    self.finish(op, "stopped before ready");
                }
                self.advance();
            }
            return Some(Ack::Stopped);
        }

        if self.queue.contains_kind(OperationKind::Stream) {
            for mut op in self.queue.remove_kind(OperationKind::Stream) {
                op.state = OperationState::Completed;
                self.emit_transition(&op, "withdrawn");
            }
            self.emit(OrchestratorEvent::Info {
                message: "queued stream request withdrawn".into(),
            });
            return Some(Ack::Dropped);
        }

        self.enqueue(OperationKind::Stream, respond);
        None
    }

    // ---- transitions -----------------------------------------------------

    /// Run queued work while nothing is current.
    fn advance(&mut self) {
        while self.current.is_none() {
            let Some(op) = self.queue.pop() else {
                break;
            };
            self.activate(op);
        }
    }

    fn preempt(&mut self, incoming: Operation) {
        if let Some(mut running) = self.current.take() {
            self.pause(&mut running);
            running.state = OperationState::Paused;
            self.emit_transition(&running, "paused");
            self.queue.push(running);
        }
        self.activate(incoming);
    }

    /// Start or resume `op`. Operations that finish immediately never
    /// become `current`.
    fn activate(&mut self, mut op: Operation) {
        let resumed = op.state == OperationState::Paused;
        op.state = OperationState::Running;
        self.emit_transition(&op, if resumed { "resumed" } else { "started" });

        let outcome = match op.kind {
            OperationKind::Stream => self.start_stream_op(&op, resumed),
            OperationKind::Timelapse => self.start_timelapse_op(&op, resumed),
            OperationKind::OneShotCapture => self.run_one_shot(&op),
        };

        match outcome {
            Ok(true) => self.finish(op, "completed"),
            Ok(false) => self.current = Some(op),
            Err(e) => self.fail(op, e),
        }
    }

    fn finish(&mut self, mut op: Operation, message: &str) {
        op.state = OperationState::Completed;
        self.emit_transition(&op, message);
    }

    fn fail(&mut self, mut op: Operation, error: LapseError) {
        let log = self.log.with_correlation(op.correlation_id.clone());
        op.state = OperationState::Failed;
        if error.is_informational() {
            log.info("operation not applicable", &[("kind", &op.kind), ("reason", &error)]);
            self.emit(OrchestratorEvent::Info {
                message: error.to_string(),
            });
        } else {
            log.error(
                "operation failed",
                &[("method", &"activate"), ("kind", &op.kind), ("error", &error)],
            );
            self.emit(OrchestratorEvent::Error {
                kind: Some(op.kind),
                message: error.to_string(),
                error_kind: error.kind(),
            });
        }
        self.emit_transition(&op, &error.to_string());
    }

    fn pause(&mut self, op: &mut Operation) {
        match op.kind {
            OperationKind::Timelapse => {
                if let Some(snapshot) = self.engine.pause() {
                    op.progress = Progress::Timelapse(snapshot);
                }
            }
            OperationKind::Stream => {
                op.progress = Progress::Stream {
                    was_active: self.stream.holds_camera(),
                    settings: self.stream.current_settings(),
                };
                if self.stream.stop("preempted") {
                    self.emit(OrchestratorEvent::StreamPaused);
                }
            }
            OperationKind::OneShotCapture => {}
        }
    }

    /// Completes on ready (see `on_stream_event`), so always returns false.
    fn start_stream_op(&mut self, op: &Operation, resumed: bool) -> Result<bool> {
        let settings = match (&op.progress, resumed) {
            (Progress::Stream { settings: Some(saved), .. }, true) => *saved,
            _ => StreamSettings::from_settings(&op.config),
        };
        match self.stream.start(settings, &op.config) {
            Ok(_) => Ok(false),
            Err(e) => {
                self.emit(OrchestratorEvent::StreamError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn start_timelapse_op(&mut self, op: &Operation, resumed: bool) -> Result<bool> {
        let interval = Duration::from_secs(op.config.capture_interval_seconds);
        match (&op.progress, resumed) {
            (Progress::Timelapse(snapshot), true) => self.engine.resume(snapshot, interval)?,
            _ => self.engine.start(interval, &self.stream)?,
        }
        self.next_heartbeat = Some(Instant::now() + Duration::from_millis(STATUS_HEARTBEAT_MS));
        Ok(false)
    }

    fn run_one_shot(&mut self, op: &Operation) -> Result<bool> {
        let cycle = timelapse::capture_with_handoff(&self.camera, &mut self.stream, &op.config);
        self.report_cycle(cycle)?;
        Ok(true)
    }

    /// Emit the events of one capture cycle in the order they happened.
    fn report_cycle(&self, cycle: CaptureCycle) -> Result<CaptureRecord> {
        if cycle.stream_paused {
            self.emit(OrchestratorEvent::StreamPaused);
        }
        match &cycle.result {
            Ok(record) => self.emit(OrchestratorEvent::ImageCaptured {
                record: record.clone(),
            }),
            Err(e) => self.emit(OrchestratorEvent::CaptureFailed {
                message: e.to_string(),
                kind: e.kind(),
            }),
        }
        if let Some(Err(e)) = &cycle.stream_resumed {
            self.emit(OrchestratorEvent::StreamError {
                message: format!("stream restart failed: {}", e),
            });
        }
        cycle.result
    }

    // ---- asynchronous inputs ---------------------------------------------

    pub fn on_stream_event(&mut self, event: StreamEvent) {
        let Some(event) = self.stream.handle_event(event) else {
            return;
        };
        let current_is_stream = self
            .current
            .as_ref()
            .is_some_and(|op| op.kind == OperationKind::Stream);

        match event {
            StreamEvent::Ready { .. } => {
                if let Some(settings) = self.stream.current_settings() {
                    self.emit(OrchestratorEvent::StreamReady { settings });
                }
                if current_is_stream {
                    if let Some(op) = self.current.take() {
                        self.finish(op, "stream ready");
                    }
                }
            }
            StreamEvent::Stopped { exit, .. } => {
                self.emit(OrchestratorEvent::StreamStopped {
                    reason: exit.describe(),
                });
            }
            StreamEvent::Error { message, .. } => {
                self.emit(OrchestratorEvent::StreamError {
                    message: message.clone(),
                });
                if current_is_stream {
                    if let Some(op) = self.current.take() {
                        self.fail(op, LapseError::Process(message));
                    }
                }
            }
        }
        self.advance();
        self.publish_status();
    }

    /// Nearest timer the selector must wake for.
    pub fn next_deadline(&self) -> Option<Instant> {
        let heartbeat = self.next_heartbeat.filter(|_| self.engine.is_running());
        match (self.engine.next_deadline(), heartbeat) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn run_due_timers(&mut self) {
        let now = Instant::now();
        if self.engine.is_due(now) {
            let config = self
                .current
                .as_ref()
                .filter(|op| op.kind == OperationKind::Timelapse)
                .map(|op| Arc::clone(&op.config))
                .unwrap_or_else(|| Arc::clone(&self.config));
            let cycle = self.engine.tick(&self.camera, &mut self.stream, &config);
            // A failed tick is reported and the cadence continues.
            let _ = self.report_cycle(cycle);
            self.publish_status();
        }

        if self.engine.is_running() {
            if self.next_heartbeat.is_some_and(|t| now >= t) {
                self.publish_status();
                self.next_heartbeat = Some(now + Duration::from_millis(STATUS_HEARTBEAT_MS));
            }
        } else {
            self.next_heartbeat = None;
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let current = self.current.as_ref().map(|op| op.summary());
        let config = &self.config;
        StatusSnapshot {
            is_capturing: self.engine.is_running(),
            mode: current
                .as_ref()
                .map(|op| op.kind.as_str().to_string())
                .unwrap_or_else(|| "idle".to_string()),
            current_operation: current,
            queue: self.queue.summaries(),
            queue_length: self.queue.len(),
            image_count: self.engine.image_count(),
            session_time: self.engine.session_time(),
            session_started_at: self.engine.started_at(),
            next_capture_eta: self.engine.next_capture_eta(),
            capture_interval_seconds: config.capture_interval_seconds,
            stream_active: self.stream.active(),
            stream_starting: self.stream.holds_camera() && !self.stream.active(),
            stream_settings: self.stream.current_settings(),
            schedule_enabled: config.schedule_enabled,
            start_time: config.start_time,
            stop_time: config.stop_time,
            within_schedule: config.within_schedule(Local::now().time()),
        }
    }

    pub fn shutdown(&mut self) {
        self.engine.stop();
        if let Some(op) = self.current.take() {
            self.finish(op, "shutdown");
        }
        self.stream.stop("shutdown");
        self.log.info("orchestrator stopped", &[]);
    }

    /// Selector loop. Returns on `Shutdown` or when every sender is gone.
    pub fn run(mut self, rx: Receiver<Input>) {
        self.log.info("orchestrator running", &[]);
        loop {
            let input = match self.next_deadline() {
                Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            let keep_going = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                match input {
                    Ok(Input::Command(command, reply)) => self.handle_command(command, reply),
                    Ok(Input::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Ok(Input::Stream(event)) => self.on_stream_event(event),
                    Ok(Input::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                self.run_due_timers();
                true
            }));

            match keep_going {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => self.log.error(
                    "selector handler panicked",
                    &[("method", &"run"), ("error", &"panic")],
                ),
            }
        }
        self.shutdown();
    }
}

/// Clonable front door to the selector thread.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: Sender<Input>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl OrchestratorHandle {
    fn request(&self, command: Command) -> Result<Ack> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Input::Command(command, Some(reply_tx)))
            .map_err(|_| LapseError::State("orchestrator is not running".into()))?;
        reply_rx
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| LapseError::Timeout("orchestrator did not acknowledge".into()))?
    }

    pub fn start_timelapse(&self) -> Result<Ack> {
        self.request(Command::StartTimelapse)
    }

    /// Returns whether a session was stopped.
    pub fn stop_timelapse(&self) -> Result<bool> {
        Ok(self.request(Command::StopTimelapse)? == Ack::Stopped)
    }

    pub fn toggle_stream(&self) -> Result<Ack> {
        self.request(Command::ToggleStream)
    }

    pub fn capture_now(&self) -> Result<Ack> {
        self.request(Command::CaptureNow)
    }

    pub fn update_config(&self, config: Arc<Settings>) -> Result<()> {
        self.request(Command::UpdateConfig(config)).map(|_| ())
    }

    pub fn status(&self) -> Result<StatusSnapshot> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Input::Status(reply_tx))
            .map_err(|_| LapseError::State("orchestrator is not running".into()))?;
        reply_rx
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| LapseError::Timeout("orchestrator did not report status".into()))
    }

    /// Stop the selector, the session and the stream; waits for the thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Input::Shutdown);
        let handle = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Build the orchestrator and start its selector thread.
pub fn spawn(
    config: Arc<Settings>,
    camera: CameraCapture,
    streamer_exe: impl Into<PathBuf>,
    sink: EventSink,
) -> Result<OrchestratorHandle> {
    let (tx, rx) = mpsc::channel::<Input>();
    let stream_tx = tx.clone();
    let stream_sink: StreamEventSink = Arc::new(move |event| {
        let _ = stream_tx.send(Input::Stream(event));
    });
    let stream = StreamAdapter::new(streamer_exe, stream_sink);
    let orchestrator = Orchestrator::new(config, camera, stream, sink);

    let thread = thread::Builder::new()
        .name("orchestrator".into())
        .spawn(move || orchestrator.run(rx))?;

    Ok(OrchestratorHandle {
        tx,
        thread: Arc::new(Mutex::new(Some(thread))),
    })
}

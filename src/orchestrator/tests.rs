// Orchestrator scenarios driven through the selector thread, with the
// mock camera and a shell script standing in for the streaming helper.

use super::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::mpsc::Receiver;
use tempfile::TempDir;

use crate::camera::list_captures;

struct Rig {
    _tmp: TempDir,
    captures: PathBuf,
    handle: OrchestratorHandle,
    events: Receiver<OrchestratorEvent>,
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

fn fake_streamer(dir: &Path) -> PathBuf {
    let path = dir.join("streamer");
    fs::write(
        &path,
        "#!/bin/sh\necho 'i: Using V4L2 device' >&2\necho 'o: HTTP TCP port........: 8080' >&2\nexec sleep 60\n",
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn rig_with(streamer: Option<PathBuf>, tweak: impl FnOnce(&mut Settings)) -> Rig {
    let tmp = TempDir::new().unwrap();
    let captures = tmp.path().join("captures");
    let streamer = streamer.unwrap_or_else(|| fake_streamer(tmp.path()));

    let mut settings = Settings {
        mock_camera: true,
        captures_dir: captures.clone(),
        capture_interval_seconds: 60,
        capture_settle_ms: 50,
        kill_timeout_ms: 500,
        stream_start_timeout_seconds: 5,
        ..Settings::default()
    };
    tweak(&mut settings);

    let (tx, events) = mpsc::channel();
    let tx = Mutex::new(tx);
    let sink: EventSink = Arc::new(move |event| {
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(event);
        }
    });
    let camera = CameraCapture::new(&captures, "/nonexistent/camera").unwrap();
    let handle = spawn(Arc::new(settings), camera, streamer, sink).unwrap();
    Rig {
        _tmp: tmp,
        captures,
        handle,
        events,
    }
}

fn rig() -> Rig {
    rig_with(None, |_| {})
}

/// Collect non-status events until `done` matches one, failing after `secs`.
fn collect_until(
    events: &Receiver<OrchestratorEvent>,
    secs: u64,
    done: impl Fn(&OrchestratorEvent) -> bool,
) -> Vec<OrchestratorEvent> {
    let deadline = Instant::now() + Duration::from_secs(secs);
    let mut seen = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let event = events
            .recv_timeout(left)
            .unwrap_or_else(|_| panic!("timed out; saw {:?}", seen));
        if matches!(event, OrchestratorEvent::Status(_)) {
            continue;
        }
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

fn is_stream_ready(e: &OrchestratorEvent) -> bool {
    matches!(e, OrchestratorEvent::StreamReady { .. })
}

fn transition(e: &OrchestratorEvent) -> Option<(OperationKind, OperationState)> {
    match e {
        OrchestratorEvent::Operation { kind, state, .. } => Some((*kind, *state)),
        _ => None,
    }
}

/// Running count never exceeds one across a transition log.
fn assert_single_runner(events: &[OrchestratorEvent]) {
    let mut running: i32 = 0;
    for e in events {
        match transition(e) {
            Some((_, OperationState::Running)) => running += 1,
            Some((_, OperationState::Paused | OperationState::Completed | OperationState::Failed)) => {
                running -= 1
            }
            _ => {}
        }
        assert!(running <= 1, "two operations running at once: {:?}", events);
    }
}

#[test]
fn test_capture_now_with_stream_pauses_and_resumes() {
    let rig = rig_with(None, |s| s.image_quality = crate::config::Quality::High);

    assert_eq!(rig.handle.toggle_stream().unwrap(), Ack::Started);
    collect_until(&rig.events, 10, is_stream_ready);

    assert_eq!(rig.handle.capture_now().unwrap(), Ack::Started);
    let seen = collect_until(&rig.events, 10, is_stream_ready);

    let order: Vec<&str> = seen
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::StreamPaused => Some("stream-paused"),
            OrchestratorEvent::ImageCaptured { .. } => Some("image-captured"),
            OrchestratorEvent::StreamReady { .. } => Some("stream-ready"),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec!["stream-paused", "image-captured", "stream-ready"]);

    let record = seen
        .iter()
        .find_map(|e| match e {
            OrchestratorEvent::ImageCaptured { record } => Some(record.clone()),
            _ => None,
        })
        .unwrap();
    assert!(record.filename.starts_with("timelapse_") && record.filename.ends_with(".jpg"));
    assert!(fs::metadata(&record.path).unwrap().len() > 0);
    assert!(rig.handle.status().unwrap().stream_active);
    assert_single_runner(&seen);
}

#[test]
fn test_timelapse_cadence_and_stop() {
    let rig = rig_with(None, |s| s.capture_interval_seconds = 2);

    assert_eq!(rig.handle.start_timelapse().unwrap(), Ack::Started);
    thread::sleep(Duration::from_millis(7000));
    let status = rig.handle.status().unwrap();
    assert!(rig.handle.stop_timelapse().unwrap());
    assert!(!rig.handle.stop_timelapse().unwrap());

    // One-second exposures starting at t=0, 3 and 6.
    assert_eq!(list_captures(&rig.captures).unwrap().len(), 3);
    assert!(status.is_capturing);
    assert_eq!(status.image_count, 3);

    let secs: Vec<u64> = status
        .session_time
        .split(':')
        .map(|p| p.parse().unwrap())
        .collect();
    assert_eq!(&secs[..2], &[0, 0]);
    assert!((6..=8).contains(&secs[2]), "session time {}", status.session_time);

    let after = rig.handle.status().unwrap();
    assert!(!after.is_capturing);
    assert_eq!(after.mode, "idle");
    assert_eq!(list_captures(&rig.captures).unwrap().len(), 3);
}

#[test]
fn test_stream_request_queues_behind_timelapse() {
    let rig = rig();

    rig.handle.start_timelapse().unwrap();
    collect_until(&rig.events, 5, |e| matches!(e, OrchestratorEvent::ImageCaptured { .. }));

    assert_eq!(rig.handle.toggle_stream().unwrap(), Ack::Queued);
    let seen = collect_until(&rig.events, 5, |e| {
        transition(e) == Some((OperationKind::Stream, OperationState::Queued))
    });
    assert!(!seen.iter().any(|e| transition(e) == Some((OperationKind::Timelapse, OperationState::Paused))));

    let status = rig.handle.status().unwrap();
    assert!(status.is_capturing);
    assert_eq!(status.mode, "time-lapse");
    assert_eq!(status.queue_length, 1);
    assert!(!status.stream_active && !status.stream_starting);

    // Ending the session lets the stream request run.
    assert!(rig.handle.stop_timelapse().unwrap());
    collect_until(&rig.events, 10, is_stream_ready);
    assert!(rig.handle.status().unwrap().stream_active);
}

#[test]
fn test_one_shot_preempts_and_resumes_timelapse() {
    let rig = rig();

    rig.handle.start_timelapse().unwrap();
    collect_until(&rig.events, 5, |e| matches!(e, OrchestratorEvent::ImageCaptured { .. }));
    let before = rig.handle.status().unwrap();
    assert_eq!(before.image_count, 1);

    rig.handle.capture_now().unwrap();
    let seen = collect_until(&rig.events, 10, |e| {
        transition(e) == Some((OperationKind::Timelapse, OperationState::Running))
    });

    let transitions: Vec<_> = seen.iter().filter_map(transition).collect();
    assert_eq!(
        transitions,
        vec![
            (OperationKind::Timelapse, OperationState::Paused),
            (OperationKind::OneShotCapture, OperationState::Running),
            (OperationKind::OneShotCapture, OperationState::Completed),
            (OperationKind::Timelapse, OperationState::Running),
        ]
    );

    let after = rig.handle.status().unwrap();
    assert!(after.is_capturing);
    assert_eq!(after.image_count, before.image_count);
    assert_eq!(after.session_started_at, before.session_started_at);
    assert_eq!(list_captures(&rig.captures).unwrap().len(), 2);
}

#[test]
fn test_toggle_stream_alternates() {
    let rig = rig();

    assert_eq!(rig.handle.toggle_stream().unwrap(), Ack::Started);
    collect_until(&rig.events, 10, is_stream_ready);
    assert_eq!(rig.handle.toggle_stream().unwrap(), Ack::Stopped);
    assert!(!rig.handle.status().unwrap().stream_active);
    assert_eq!(rig.handle.toggle_stream().unwrap(), Ack::Started);
    collect_until(&rig.events, 10, is_stream_ready);
    assert_eq!(rig.handle.toggle_stream().unwrap(), Ack::Stopped);
}

#[test]
fn test_toggle_withdraws_queued_stream() {
    let rig = rig();
    rig.handle.start_timelapse().unwrap();
    assert_eq!(rig.handle.toggle_stream().unwrap(), Ack::Queued);
    assert_eq!(rig.handle.toggle_stream().unwrap(), Ack::Dropped);
    assert_eq!(rig.handle.status().unwrap().queue_length, 0);
}

#[test]
fn test_second_start_is_informational() {
    let rig = rig();
    rig.handle.start_timelapse().unwrap();
    let err = rig.handle.start_timelapse().unwrap_err();
    assert!(err.is_informational());
    collect_until(&rig.events, 5, |e| matches!(e, OrchestratorEvent::Info { .. }));
}

#[test]
fn test_failed_stream_start_clears_current_and_advances() {
    let rig = rig_with(Some(PathBuf::from("/nonexistent/mjpg_streamer")), |_| {});

    assert_eq!(rig.handle.toggle_stream().unwrap(), Ack::Started);
    let seen = collect_until(&rig.events, 5, |e| {
        transition(e) == Some((OperationKind::Stream, OperationState::Failed))
    });
    assert!(seen.iter().any(|e| matches!(e, OrchestratorEvent::StreamError { .. })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::Error { error_kind: ErrorKind::Process, .. })));

    // Nothing is stuck in `current`.
    assert_eq!(rig.handle.capture_now().unwrap(), Ack::Started);
    collect_until(&rig.events, 5, |e| matches!(e, OrchestratorEvent::ImageCaptured { .. }));
    assert_eq!(rig.handle.status().unwrap().mode, "idle");
}

#[test]
fn test_timelapse_preempts_starting_stream_and_stream_resumes_after() {
    // A streamer that never becomes ready keeps the stream op current.
    let tmp = TempDir::new().unwrap();
    let slow = tmp.path().join("slow-streamer");
    fs::write(&slow, "#!/bin/sh\nsleep 1\necho 'HTTP TCP port 8080' >&2\nexec sleep 60\n").unwrap();
    fs::set_permissions(&slow, fs::Permissions::from_mode(0o755)).unwrap();
    let rig = rig_with(Some(slow), |_| {});

    assert_eq!(rig.handle.toggle_stream().unwrap(), Ack::Started);
    assert!(rig.handle.status().unwrap().stream_starting);

    assert_eq!(rig.handle.start_timelapse().unwrap(), Ack::Started);
    let seen = collect_until(&rig.events, 5, |e| {
        transition(e) == Some((OperationKind::Timelapse, OperationState::Running))
    });
    assert!(seen.contains_transition(OperationKind::Stream, OperationState::Paused));
    assert!(!rig.handle.status().unwrap().stream_starting);

    rig.handle.stop_timelapse().unwrap();
    collect_until(&rig.events, 10, is_stream_ready);
}

trait TransitionLog {
    fn contains_transition(&self, kind: OperationKind, state: OperationState) -> bool;
}

impl TransitionLog for Vec<OrchestratorEvent> {
    fn contains_transition(&self, kind: OperationKind, state: OperationState) -> bool {
        self.iter().any(|e| transition(e) == Some((kind, state)))
    }
}

// Lapse Cam - Helper-Process Adapter
// Supervises external executables (camera, streamer, encoder).
//
// Arguments are always passed as a list, never through a shell. Each helper
// gets its own process group so termination reaches anything it forks.
// One waiter thread owns the Child; two reader threads drain stdout/stderr.

pub mod tail;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::constants::{HELPER_BUFFER_BYTES, HELPER_POLL_INTERVAL_MS};
use crate::error::{LapseError, Result};
use crate::logging::Logger;
use tail::{LineSplitter, TailBuffer};

/// How long the waiter keeps draining pipes after the child is reaped.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub type LineCallback = Box<dyn FnMut(&str) + Send>;
pub type ReadyCallback = Box<dyn FnOnce() + Send>;
pub type ExitCallback = Box<dyn FnOnce(ExitInfo) + Send>;

#[derive(Debug, Clone)]
pub struct HelperOptions {
    /// Substring of a stderr line that marks the helper as serving.
    pub ready_signal: Option<String>,
    /// Kill the helper if the ready signal has not appeared by then.
    pub ready_timeout: Option<Duration>,
    /// Hard limit on total process lifetime.
    pub timeout: Option<Duration>,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_timeout: Duration,
    /// Retained bytes per pipe.
    pub buffer_bytes: usize,
    pub working_dir: Option<PathBuf>,
}

impl Default for HelperOptions {
    fn default() -> Self {
        Self {
            ready_signal: None,
            ready_timeout: None,
            timeout: None,
            kill_timeout: Duration::from_secs(5),
            buffer_bytes: HELPER_BUFFER_BYTES,
            working_dir: None,
        }
    }
}

#[derive(Default)]
pub struct HelperCallbacks {
    pub on_stdout_line: Option<LineCallback>,
    pub on_stderr_line: Option<LineCallback>,
    pub on_ready: Option<ReadyCallback>,
    pub on_exit: Option<ExitCallback>,
}

/// Terminal state of a helper; delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Synthetic indicator: the supervisor killed the helper on a deadline.
    pub timed_out: bool,
    /// Reason passed to `kill`, or the deadline that fired.
    pub kill_reason: Option<String>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.timed_out
    }

    pub fn describe(&self) -> String {
        if self.timed_out {
            return format!(
                "timed out ({})",
                self.kill_reason.as_deref().unwrap_or("process timeout")
            );
        }
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(sig)) => format!("terminated by signal {}", sig),
            (None, None) => "exited".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct SharedState {
    ready: bool,
    exit: Option<ExitInfo>,
    kill_reason: Option<String>,
    timed_out: bool,
}

struct Shared {
    pid: u32,
    state: Mutex<SharedState>,
    changed: Condvar,
    stdout_tail: Mutex<TailBuffer>,
    stderr_tail: Mutex<TailBuffer>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Handle to a running helper. Cloning shares the same process.
#[derive(Clone)]
pub struct HelperHandle {
    shared: Arc<Shared>,
    kill_timeout: Duration,
    name: String,
}

impl std::fmt::Debug for HelperHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperHandle")
            .field("name", &self.name)
            .field("pid", &self.shared.pid)
            .finish()
    }
}

impl HelperHandle {
    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().exit.is_none()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.lock().ready
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.shared.lock().exit.clone()
    }

    pub fn stderr_tail(&self) -> String {
        self.shared
            .stderr_tail
            .lock()
            .map(|t| t.contents())
            .unwrap_or_default()
    }

    pub fn stdout_tail(&self) -> String {
        self.shared
            .stdout_tail
            .lock()
            .map(|t| t.contents())
            .unwrap_or_default()
    }

    /// Block until the helper exits.
    pub fn wait(&self) -> ExitInfo {
        let mut state = self.shared.lock();
        loop {
            if let Some(exit) = &state.exit {
                return exit.clone();
            }
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitInfo> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if let Some(exit) = &state.exit {
                return Some(exit.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|p| p.into_inner())
                .0;
        }
    }

    /// Wait for the ready signal. Returns false if the helper exits first
    /// or the timeout elapses.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if state.ready {
                return true;
            }
            if state.exit.is_some() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|p| p.into_inner())
                .0;
        }
    }

    /// Graceful termination, then forceful after the kill timeout.
    /// Returns the exit info once the helper is gone.
    pub fn kill(&self, reason: &str) -> Option<ExitInfo> {
        {
            let mut state = self.shared.lock();
            if let Some(exit) = &state.exit {
                return Some(exit.clone());
            }
            state.kill_reason.get_or_insert_with(|| reason.to_string());
            signal_group(self.shared.pid, libc::SIGTERM);
        }

        if let Some(exit) = self.wait_timeout(self.kill_timeout) {
            return Some(exit);
        }

        if self.is_running() {
            signal_group(self.shared.pid, libc::SIGKILL);
        }
        self.wait_timeout(self.kill_timeout)
    }

    /// Send SIGTERM without waiting.
    pub fn terminate(&self, reason: &str) {
        let mut state = self.shared.lock();
        if state.exit.is_none() {
            state.kill_reason.get_or_insert_with(|| reason.to_string());
            signal_group(self.shared.pid, libc::SIGTERM);
        }
    }
}

/// Signal the helper's process group, falling back to the pid alone.
fn signal_group(pid: u32, signal: libc::c_int) {
    let pid = pid as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe {
        if libc::kill(-pid, signal) != 0 {
            libc::kill(pid, signal);
        }
    }
}

/// Spawn a helper. The executable is invoked directly with `args`.
pub fn spawn(
    exe: &Path,
    args: &[String],
    options: HelperOptions,
    callbacks: HelperCallbacks,
) -> Result<HelperHandle> {
    use std::os::unix::process::CommandExt;

    let name = exe
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| exe.display().to_string());
    let log = Logger::new("helper");

    let mut cmd = Command::new(exe);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(dir) = &options.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            LapseError::Process(format!("executable not found: {}", exe.display()))
        }
        std::io::ErrorKind::PermissionDenied => {
            LapseError::Process(format!("executable not permitted: {}", exe.display()))
        }
        _ => LapseError::Process(format!("failed to start {}: {}", exe.display(), e)),
    })?;

    let pid = child.id();
    log.debug("spawned", &[("name", &name), ("pid", &pid), ("args", &args.join(" "))]);

    let shared = Arc::new(Shared {
        pid,
        state: Mutex::new(SharedState::default()),
        changed: Condvar::new(),
        stdout_tail: Mutex::new(TailBuffer::new(options.buffer_bytes)),
        stderr_tail: Mutex::new(TailBuffer::new(options.buffer_bytes)),
    });

    let HelperCallbacks {
        on_stdout_line,
        on_stderr_line,
        on_ready,
        on_exit,
    } = callbacks;

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let mut readers = 0;

    if let Some(stdout) = child.stdout.take() {
        readers += 1;
        let shared = Arc::clone(&shared);
        let done = done_tx.clone();
        let max_line = options.buffer_bytes;
        thread::Builder::new()
            .name(format!("{}-stdout", name))
            .spawn(move || {
                let mut cb = on_stdout_line;
                read_pipe(stdout, max_line, &shared.stdout_tail, |line| {
                    if let Some(cb) = cb.as_mut() {
                        cb(line);
                    }
                });
                let _ = done.send(());
            })?;
    }

    if let Some(stderr) = child.stderr.take() {
        readers += 1;
        let shared_r = Arc::clone(&shared);
        let done = done_tx.clone();
        let max_line = options.buffer_bytes;
        let ready_signal = options.ready_signal.clone();
        thread::Builder::new()
            .name(format!("{}-stderr", name))
            .spawn(move || {
                let mut cb = on_stderr_line;
                let mut on_ready = on_ready;
                read_pipe(stderr, max_line, &shared_r.stderr_tail, |line| {
                    if let Some(signal) = ready_signal.as_deref() {
                        if line.contains(signal) && mark_ready(&shared_r) {
                            if let Some(ready) = on_ready.take() {
                                ready();
                            }
                        }
                    }
                    if let Some(cb) = cb.as_mut() {
                        cb(line);
                    }
                });
                let _ = done.send(());
            })?;
    }
    drop(done_tx);

    let waiter_shared = Arc::clone(&shared);
    let waiter_name = name.clone();
    let kill_timeout = options.kill_timeout;
    thread::Builder::new()
        .name(format!("{}-waiter", name))
        .spawn(move || {
            let exit = supervise(&mut child, &waiter_shared, &options);

            // Deliver remaining output before the exit notification.
            let drain_deadline = Instant::now() + READER_DRAIN_TIMEOUT;
            for _ in 0..readers {
                let left = drain_deadline.saturating_duration_since(Instant::now());
                if done_rx.recv_timeout(left).is_err() {
                    break;
                }
            }

            {
                let mut state = waiter_shared.lock();
                state.exit = Some(exit.clone());
            }
            waiter_shared.changed.notify_all();

            Logger::new("helper").debug(
                "exited",
                &[("name", &waiter_name), ("status", &exit.describe())],
            );
            if let Some(on_exit) = on_exit {
                on_exit(exit);
            }
        })?;

    Ok(HelperHandle {
        shared,
        kill_timeout,
        name,
    })
}

fn mark_ready(shared: &Shared) -> bool {
    let first = {
        let mut state = shared.lock();
        let first = !state.ready;
        state.ready = true;
        first
    };
    if first {
        shared.changed.notify_all();
    }
    first
}

fn read_pipe<R: Read>(
    mut pipe: R,
    max_line: usize,
    tail: &Mutex<TailBuffer>,
    mut on_line: impl FnMut(&str),
) {
    let mut splitter = LineSplitter::new(max_line);
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Ok(mut t) = tail.lock() {
                    t.push(&buf[..n]);
                }
                splitter.feed(&buf[..n], &mut on_line);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    splitter.finish(&mut on_line);
}

/// Poll the child until it exits, enforcing the process and ready deadlines.
fn supervise(child: &mut Child, shared: &Shared, options: &HelperOptions) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;

    let started = Instant::now();
    let poll = Duration::from_millis(HELPER_POLL_INTERVAL_MS);
    let mut term_sent_at: Option<Instant> = None;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let state = shared.lock();
                return ExitInfo {
                    code: status.code(),
                    signal: status.signal(),
                    timed_out: state.timed_out,
                    kill_reason: state.kill_reason.clone(),
                };
            }
            Ok(None) => {}
            Err(_) => {
                let state = shared.lock();
                return ExitInfo {
                    code: None,
                    signal: None,
                    timed_out: state.timed_out,
                    kill_reason: state.kill_reason.clone(),
                };
            }
        }

        let elapsed = started.elapsed();
        let deadline_hit = {
            let state = shared.lock();
            if state.timed_out {
                None
            } else if options.timeout.is_some_and(|t| elapsed >= t) {
                Some("process timeout")
            } else if !state.ready
                && options.ready_signal.is_some()
                && options.ready_timeout.is_some_and(|t| elapsed >= t)
            {
                Some("ready timeout")
            } else {
                None
            }
        };
        if let Some(reason) = deadline_hit {
            let mut state = shared.lock();
            state.timed_out = true;
            state.kill_reason = Some(reason.to_string());
            signal_group(shared.pid, libc::SIGTERM);
            term_sent_at = Some(Instant::now());
        }

        if let Some(sent) = term_sent_at {
            if sent.elapsed() >= options.kill_timeout {
                signal_group(shared.pid, libc::SIGKILL);
                let _ = child.kill();
                term_sent_at = None;
            }
        }

        thread::sleep(poll);
    }
}

/// Captured result of a helper run to completion.
#[derive(Debug, Clone)]
pub struct HelperOutput {
    pub exit: ExitInfo,
    pub stdout: String,
    pub stderr: String,
}

/// Run a one-shot helper and wait for it, bounded by `timeout`.
pub fn run_to_completion(
    exe: &Path,
    args: &[String],
    timeout: Duration,
    kill_timeout: Duration,
) -> Result<HelperOutput> {
    let options = HelperOptions {
        timeout: Some(timeout),
        kill_timeout,
        ..HelperOptions::default()
    };
    let handle = spawn(exe, args, options, HelperCallbacks::default())?;
    let exit = handle.wait();
    Ok(HelperOutput {
        exit,
        stdout: handle.stdout_tail(),
        stderr: handle.stderr_tail(),
    })
}

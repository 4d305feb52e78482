// Lapse Cam - Video Encoder Service
// Turns a folder of captures into one MP4 via the external encoder.
//
// At most one job runs at a time. A job walks validate -> resources ->
// scan -> link -> encode -> verify, emitting progress along the way, and
// always ends with exactly one terminal progress event.

pub mod args;
pub mod frames;
pub mod progress;
pub mod resources;
pub mod validate;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::{Codec, Quality, Settings};
use crate::constants::{VIDEO_EXTENSION, VIDEO_PREFIX};
use crate::error::{LapseError, Result};
use crate::helper::{self, HelperCallbacks, HelperHandle, HelperOptions};
use crate::logging::{new_correlation_id, Logger};

pub use progress::{EncoderPhase, EncoderProgress, ProgressSink, ProgressTracker};
pub use validate::{BitrateInput, EncodeRequest};

const MB: u64 = 1024 * 1024;

/// A finished video.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeResult {
    pub output_path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
    pub duration_seconds: u64,
    pub frame_count: usize,
    pub fps: f64,
    pub codec: Codec,
    pub quality: Quality,
    pub processing_time_ms: u64,
    pub created_at: DateTime<Utc>,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

struct CurrentJob {
    id: String,
    cancelled: Arc<AtomicBool>,
    helper: Option<HelperHandle>,
}

#[derive(Default)]
struct Inner {
    current: Mutex<Option<CurrentJob>>,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Option<CurrentJob>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Clone)]
pub struct EncoderService {
    encoder_exe: PathBuf,
    inner: Arc<Inner>,
}

impl EncoderService {
    pub fn new(encoder_exe: impl Into<PathBuf>) -> Self {
        Self {
            encoder_exe: encoder_exe.into(),
            inner: Arc::new(Inner::default()),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.inner.slot().is_some()
    }

    pub fn current_job_id(&self) -> Option<String> {
        self.inner.slot().as_ref().map(|job| job.id.clone())
    }

    /// Start a job on its own thread and return its id. Fails with a state
    /// error while another job is running.
    pub fn start(&self, request: EncodeRequest, settings: Arc<Settings>, sink: ProgressSink) -> Result<String> {
        let (job_id, cancelled) = self.claim()?;
        let service = self.clone();
        let id = job_id.clone();
        let spawned = thread::Builder::new()
            .name("lapsecam-encoder".to_string())
            .spawn(move || {
                let _ = service.run_claimed(&id, &cancelled, &request, &settings, &sink);
            });
        if let Err(e) = spawned {
            self.release();
            return Err(LapseError::Io(e));
        }
        Ok(job_id)
    }

    /// Run a job on the calling thread.
    pub fn run_blocking(&self, request: &EncodeRequest, settings: &Settings, sink: &ProgressSink) -> Result<EncodeResult> {
        let (job_id, cancelled) = self.claim()?;
        self.run_claimed(&job_id, &cancelled, request, settings, sink)
    }

    /// Request cancellation of the running job. Returns false when idle.
    pub fn cancel(&self) -> bool {
        let helper = {
            let slot = self.inner.slot();
            let Some(job) = slot.as_ref() else {
                return false;
            };
            job.cancelled.store(true, Ordering::SeqCst);
            job.helper.clone()
        };
        if let Some(helper) = helper {
            helper.kill("cancelled");
        }
        true
    }

    fn claim(&self) -> Result<(String, Arc<AtomicBool>)> {
        let mut slot = self.inner.slot();
        if slot.is_some() {
            return Err(LapseError::State("Video generation already in progress".into()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let cancelled = Arc::new(AtomicBool::new(false));
        *slot = Some(CurrentJob {
            id: id.clone(),
            cancelled: cancelled.clone(),
            helper: None,
        });
        Ok((id, cancelled))
    }

    fn release(&self) {
        *self.inner.slot() = None;
    }

    /// Returns false when the job was cancelled before the helper could be recorded.
    fn register_helper(&self, handle: &HelperHandle) -> bool {
        let mut slot = self.inner.slot();
        match slot.as_mut() {
            Some(job) if !job.cancelled.load(Ordering::SeqCst) => {
                job.helper = Some(handle.clone());
                true
            }
            _ => false,
        }
    }

    fn run_claimed(
        &self,
        job_id: &str,
        cancelled: &AtomicBool,
        request: &EncodeRequest,
        settings: &Settings,
        sink: &ProgressSink,
    ) -> Result<EncodeResult> {
        let correlation_id = new_correlation_id();
        let log = Logger::new("encoder").with_correlation(correlation_id.clone());
        log.info("video generation started", &[("job", &job_id)]);

        let tracker = Arc::new(Mutex::new(ProgressTracker::new(1)));
        let job = Job {
            service: self,
            job_id,
            correlation_id: &correlation_id,
            cancelled,
            settings,
            sink,
            log: &log,
            tracker: tracker.clone(),
        };
        let outcome = job.run(request);

        let terminal = match &outcome {
            Ok(result) => {
                log.info(
                    "video generation complete",
                    &[
                        ("file", &result.filename),
                        ("frames", &result.frame_count),
                        ("ms", &result.processing_time_ms),
                    ],
                );
                EncoderProgress::complete(job_id, result.clone())
            }
            Err(e) => {
                let pct = tracker.lock().map(|t| t.percent()).unwrap_or(0).min(99);
                match e {
                    LapseError::Cancelled(_) => log.info("video generation cancelled", &[]),
                    _ => log.error("video generation failed", &[("error", e)]),
                }
                EncoderProgress::failed(job_id, pct, e)
            }
        };
        // Free the slot first so a listener can start the next job on receipt.
        self.release();
        sink(terminal);
        outcome
    }
}

struct Job<'a> {
    service: &'a EncoderService,
    job_id: &'a str,
    correlation_id: &'a str,
    cancelled: &'a AtomicBool,
    settings: &'a Settings,
    sink: &'a ProgressSink,
    log: &'a Logger,
    tracker: Arc<Mutex<ProgressTracker>>,
}

impl Job<'_> {
    fn emit(&self, phase: EncoderPhase, percent: u8, message: impl Into<String>) {
        (self.sink)(EncoderProgress::new(self.job_id, phase, percent).with_message(message));
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(LapseError::Cancelled("video generation cancelled".into()));
        }
        Ok(())
    }

    fn run(&self, request: &EncodeRequest) -> Result<EncodeResult> {
        let started = Instant::now();
        let settings = self.settings;

        self.emit(EncoderPhase::Validating, 0, "Validating request");
        let options = validate::validate_options(request, settings)?;
        let input_dir = validate::resolve_within(&settings.captures_dir, request.input_folder.as_deref())?;

        fs::create_dir_all(&settings.videos_dir)?;
        let videos_root = settings.videos_dir.canonicalize()?;
        resources::check_resources(&videos_root, settings, self.log)?;
        self.check_cancelled()?;

        self.emit(EncoderPhase::Scanning, 0, "Scanning frames");
        let frames = frames::scan_frames(&input_dir)?;
        let (first, last) = match (frames.first(), frames.last()) {
            (Some(first), Some(last)) => (first.captured_at, last.captured_at),
            _ => {
                return Err(LapseError::resource(
                    format!("No images found in {}", input_dir.display()),
                    "at least 1 image",
                ))
            }
        };
        if frames.len() > settings.max_video_images {
            return Err(LapseError::resource(
                format!("Too many images: {}", frames.len()),
                settings.max_video_images,
            ));
        }
        let duration_seconds = frames::duration_seconds(&frames);
        let max_duration = settings.max_video_duration_hours * 3600.0;
        if duration_seconds as f64 > max_duration {
            return Err(LapseError::resource(
                format!("Time span too long: {} s", duration_seconds),
                format!("{} h", settings.max_video_duration_hours),
            ));
        }
        self.log.info("frames scanned", &[("count", &frames.len()), ("span_s", &duration_seconds)]);

        let links = frames::FrameLinks::create(&frames, settings.temp_dir.as_deref())?;
        self.check_cancelled()?;

        let filename = args::video_filename(first, last);
        let output = videos_root.join(&filename);
        validate::check_output_path(&videos_root, &output)?;
        let tmp_output = output.with_extension(format!("tmp.{}", VIDEO_EXTENSION));
        let encoder_args = args::build_encoder_args(&links.pattern(), &options, &tmp_output)?;

        self.emit(EncoderPhase::Encoding, 0, format!("Encoding {} frames", links.count()));
        if let Ok(mut t) = self.tracker.lock() {
            *t = ProgressTracker::new(links.count() as u64);
        }
        let (exit, stderr) = self.encode(&encoder_args)?;
        drop(links);

        if self.cancelled.load(Ordering::SeqCst) {
            remove_quietly(&tmp_output);
            return Err(LapseError::Cancelled("video generation cancelled".into()));
        }
        if exit.timed_out {
            remove_quietly(&tmp_output);
            return Err(LapseError::Timeout(format!(
                "encoder exceeded {} s",
                settings.encoder_timeout_seconds
            )));
        }
        if !exit.success() {
            remove_quietly(&tmp_output);
            return Err(LapseError::Process(format!(
                "encoder {}: {}",
                exit.describe(),
                last_lines(&stderr, 3)
            )));
        }

        self.emit(EncoderPhase::Verifying, 99, "Verifying output");
        let size = fs::metadata(&tmp_output).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            remove_quietly(&tmp_output);
            return Err(LapseError::Process("encoder produced no output".into()));
        }
        if size > settings.max_video_size_mb.saturating_mul(MB) {
            remove_quietly(&tmp_output);
            return Err(LapseError::resource(
                format!("Video too large: {} MB", size / MB),
                format!("{} MB", settings.max_video_size_mb),
            ));
        }
        fs::rename(&tmp_output, &output)?;
        if let Ok(mut t) = self.tracker.lock() {
            t.finish();
        }

        Ok(EncodeResult {
            output_path: output,
            filename,
            size_bytes: size,
            duration_seconds,
            frame_count: frames.len(),
            fps: options.fps,
            codec: options.codec,
            quality: options.quality,
            processing_time_ms: started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
            correlation_id: self.correlation_id.to_string(),
        })
    }

    /// Run the encoder helper; returns its exit info and stderr tail.
    fn encode(&self, encoder_args: &[String]) -> Result<(helper::ExitInfo, String)> {
        let tracker = self.tracker.clone();
        let sink = self.sink.clone();
        let job_id = self.job_id.to_string();
        let on_stderr = move |line: &str| {
            let advanced = tracker.lock().ok().and_then(|mut t| t.observe(line));
            if let Some(pct) = advanced {
                sink(
                    EncoderProgress::new(job_id.as_str(), EncoderPhase::Encoding, pct.min(99))
                        .with_message(format!("Encoding {}%", pct)),
                );
            }
        };

        let options = HelperOptions {
            timeout: Some(Duration::from_secs(self.settings.encoder_timeout_seconds)),
            kill_timeout: Duration::from_millis(self.settings.kill_timeout_ms),
            ..HelperOptions::default()
        };
        let callbacks = HelperCallbacks {
            on_stderr_line: Some(Box::new(on_stderr)),
            ..HelperCallbacks::default()
        };
        self.log.debug("spawning encoder", &[("args", &encoder_args.join(" "))]);
        let handle = helper::spawn(&self.service.encoder_exe, encoder_args, options, callbacks)?;
        if !self.service.register_helper(&handle) {
            handle.kill("cancelled");
        }
        let exit = handle.wait();
        Ok((exit, handle.stderr_tail()))
    }
}

fn remove_quietly(path: &Path) {
    let _ = fs::remove_file(path);
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text
        .split(['\n', '\r'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    lines[lines.len().saturating_sub(n)..].join(" | ")
}

fn is_video_name(name: &str) -> bool {
    name.starts_with(VIDEO_PREFIX)
        && name.ends_with(&format!(".{}", VIDEO_EXTENSION))
        && !name.ends_with(&format!(".tmp.{}", VIDEO_EXTENSION))
}

/// Finished videos, newest first. In-progress `.tmp.mp4` files are hidden.
pub fn list_videos(dir: &Path) -> Result<Vec<VideoInfo>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut videos = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| LapseError::Io(std::io::Error::other(e.to_string())))?;
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !entry.file_type().is_file() || !is_video_name(name) {
            continue;
        }
        let meta = entry.metadata().map_err(|e| LapseError::Io(std::io::Error::other(e.to_string())))?;
        let created_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        videos.push(VideoInfo {
            filename: name.to_string(),
            path: entry.path().to_path_buf(),
            size_bytes: meta.len(),
            created_at,
        });
    }
    videos.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.filename.cmp(&a.filename)));
    Ok(videos)
}

/// Delete one video by bare filename.
pub fn delete_video(dir: &Path, filename: &str) -> Result<()> {
    if filename.contains(['/', '\\', '\0']) || filename.contains("..") || !is_video_name(filename) {
        return Err(LapseError::Security(format!("invalid video filename: {}", filename)));
    }
    fs::remove_file(dir.join(filename))?;
    Ok(())
}

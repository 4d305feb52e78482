// Lapse Cam - Configuration
// Typed snapshot over the persisted KEY=VALUE settings file.

pub mod env_file;
pub mod store;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_STREAM_PORT, DEFAULT_STREAM_READY_SIGNAL, PRESET_HIGH, PRESET_LOW,
    PRESET_MEDIUM, STREAM_FPS_MAX, STREAM_FPS_MIN, VIDEO_BITRATE_MAX_KBPS, VIDEO_BITRATE_MIN_KBPS,
    VIDEO_FPS_MAX, VIDEO_FPS_MIN,
};
use crate::error::{LapseError, Result};

pub use env_file::EnvFile;

const CONFIG_ENV: &str = "LAPSECAM_CONFIG";
const SETTINGS_FILENAME: &str = "settings.env";
const SETTINGS_DIR: &str = ".lapsecam";
pub use store::ConfigStore;

/// Quality preset shared by capture, streaming and encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
        }
    }

    pub fn resolution(self) -> Resolution {
        let (width, height) = match self {
            Quality::Low => PRESET_LOW,
            Quality::Medium => PRESET_MEDIUM,
            Quality::High => PRESET_HIGH,
        };
        Resolution { width, height }
    }
}

impl FromStr for Quality {
    type Err = LapseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            other => Err(LapseError::Validation(format!(
                "quality must be one of low, medium, high (got '{}')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    pub fn as_str(self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
        }
    }
}

impl FromStr for Codec {
    type Err = LapseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "h264" => Ok(Codec::H264),
            "h265" => Ok(Codec::H265),
            other => Err(LapseError::Validation(format!(
                "codec must be one of h264, h265 (got '{}')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Wall-clock time of day, `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub const fn new(hour: u8, minute: u8) -> Self {
        Self { hour, minute }
    }

    pub fn minutes(self) -> u32 {
        self.hour as u32 * 60 + self.minute as u32
    }
}

impl FromStr for TimeOfDay {
    type Err = LapseError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || LapseError::Validation(format!("time must be HH:MM (got '{}')", s));
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        if h.len() != 2 || m.len() != 2 {
            return Err(invalid());
        }
        let hour: u8 = h.parse().map_err(|_| invalid())?;
        let minute: u8 = m.parse().map_err(|_| invalid())?;
        if hour > 23 || minute > 59 {
            return Err(invalid());
        }
        Ok(Self { hour, minute })
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = LapseError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Parse a bitrate given as `N`, `Nk` or `Nm` (case-insensitive) into kbps.
pub fn parse_bitrate_kbps(raw: &str) -> Result<u32> {
    let s = raw.trim().to_ascii_lowercase();
    let invalid = || LapseError::Validation(format!("invalid bitrate '{}'", raw));
    let (digits, multiplier) = if let Some(d) = s.strip_suffix('m') {
        (d, 1000u64)
    } else if let Some(d) = s.strip_suffix('k') {
        (d, 1u64)
    } else {
        (s.as_str(), 1u64)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let kbps = value.checked_mul(multiplier).ok_or_else(invalid)?;
    if kbps < VIDEO_BITRATE_MIN_KBPS as u64 || kbps > VIDEO_BITRATE_MAX_KBPS as u64 {
        return Err(LapseError::Validation(format!(
            "bitrate must be between {} and {} kbps (got {})",
            VIDEO_BITRATE_MIN_KBPS, VIDEO_BITRATE_MAX_KBPS, kbps
        )));
    }
    Ok(kbps as u32)
}

pub fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(LapseError::Validation(format!("expected true/false (got '{}')", raw))),
    }
}

fn parse_num<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| LapseError::Validation(format!("{}: not a valid number ('{}')", key, raw)))
}

fn opt_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    (!raw.is_empty()).then(|| PathBuf::from(raw))
}

/// Every option the appliance recognises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    // Capture
    pub capture_interval_seconds: u64,
    pub image_quality: Quality,
    pub rotation: u16,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,

    // Streaming
    pub stream_fps: u32,
    pub stream_quality: Quality,

    // Schedule (advisory)
    pub schedule_enabled: bool,
    pub start_time: TimeOfDay,
    pub stop_time: TimeOfDay,

    // Video
    pub video_fps: f64,
    pub video_quality: Quality,
    pub video_codec: Codec,
    pub video_bitrate_kbps: Option<u32>,

    // Storage policy (advisory)
    pub auto_cleanup: bool,
    pub max_images: u64,
    pub cleanup_older_than_days: u32,
    pub max_storage_gb: f64,

    // Observability
    pub debug_mode: bool,
    pub log_level: String,
    pub mock_camera: bool,

    // Deployment
    pub port: u16,
    pub stream_port: u16,
    pub captures_dir: PathBuf,
    pub videos_dir: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub ui_dir: Option<PathBuf>,
    pub stream_ready_signal: String,

    // Encoder limits
    pub max_video_images: usize,
    pub max_video_duration_hours: f64,
    pub max_video_size_mb: u64,
    pub min_free_disk_mb: u64,
    pub max_memory_mb: u64,
    pub encoder_timeout_seconds: u64,

    // Helper timing
    pub capture_timeout_seconds: u64,
    pub kill_timeout_ms: u64,
    pub stream_start_timeout_seconds: u64,
    pub capture_settle_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            capture_interval_seconds: 60,
            image_quality: Quality::High,
            rotation: 0,
            flip_horizontal: false,
            flip_vertical: false,
            stream_fps: 15,
            stream_quality: Quality::Medium,
            schedule_enabled: false,
            start_time: TimeOfDay::new(6, 0),
            stop_time: TimeOfDay::new(20, 0),
            video_fps: 30.0,
            video_quality: Quality::Medium,
            video_codec: Codec::H264,
            video_bitrate_kbps: None,
            auto_cleanup: false,
            max_images: 10_000,
            cleanup_older_than_days: 30,
            max_storage_gb: 10.0,
            debug_mode: false,
            log_level: "info".to_string(),
            mock_camera: false,
            port: DEFAULT_HTTP_PORT,
            stream_port: DEFAULT_STREAM_PORT,
            captures_dir: PathBuf::from("captures"),
            videos_dir: PathBuf::from("videos"),
            temp_dir: None,
            ui_dir: None,
            stream_ready_signal: DEFAULT_STREAM_READY_SIGNAL.to_string(),
            max_video_images: 10_000,
            max_video_duration_hours: 24.0,
            max_video_size_mb: 4096,
            min_free_disk_mb: 500,
            max_memory_mb: 1024,
            encoder_timeout_seconds: 3600,
            capture_timeout_seconds: 30,
            kill_timeout_ms: 5000,
            stream_start_timeout_seconds: 15,
            capture_settle_ms: 500,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl Settings {
    /// Apply one persisted record. Returns false when the key is not ours.
    pub fn set_key(&mut self, key: &str, raw: &str) -> Result<bool> {
        match key {
            "CAPTURE_INTERVAL" => self.capture_interval_seconds = parse_capture_interval(raw)?,
            "IMAGE_QUALITY" => self.image_quality = raw.parse()?,
            "ROTATION" => self.rotation = parse_num(key, raw)?,
            "FLIP_HORIZONTAL" => self.flip_horizontal = parse_bool(raw)?,
            "FLIP_VERTICAL" => self.flip_vertical = parse_bool(raw)?,
            "STREAM_FPS" => self.stream_fps = parse_num(key, raw)?,
            "STREAM_QUALITY" => self.stream_quality = raw.parse()?,
            "SCHEDULE_ENABLED" => self.schedule_enabled = parse_bool(raw)?,
            "START_TIME" => self.start_time = raw.parse()?,
            "STOP_TIME" => self.stop_time = raw.parse()?,
            "VIDEO_FPS" => self.video_fps = parse_num(key, raw)?,
            "VIDEO_QUALITY" => self.video_quality = raw.parse()?,
            "VIDEO_CODEC" => self.video_codec = raw.parse()?,
            "VIDEO_BITRATE" => {
                self.video_bitrate_kbps = match raw.trim() {
                    "" => None,
                    v => Some(parse_bitrate_kbps(v)?),
                }
            }
            "AUTO_CLEANUP" => self.auto_cleanup = parse_bool(raw)?,
            "MAX_IMAGES" => self.max_images = parse_num(key, raw)?,
            "CLEANUP_OLDER_THAN_DAYS" => self.cleanup_older_than_days = parse_num(key, raw)?,
            "MAX_STORAGE_GB" => self.max_storage_gb = parse_num(key, raw)?,
            "DEBUG_MODE" => self.debug_mode = parse_bool(raw)?,
            "LOG_LEVEL" => self.log_level = raw.trim().to_ascii_lowercase(),
            "MOCK_CAMERA" => self.mock_camera = parse_bool(raw)?,
            "PORT" => self.port = parse_num(key, raw)?,
            "STREAM_PORT" => self.stream_port = parse_num(key, raw)?,
            "CAPTURES_DIR" => self.captures_dir = PathBuf::from(raw.trim()),
            "VIDEOS_DIR" => self.videos_dir = PathBuf::from(raw.trim()),
            "TEMP_DIR" => self.temp_dir = opt_path(raw),
            "UI_DIR" => self.ui_dir = opt_path(raw),
            "STREAM_READY_SIGNAL" => self.stream_ready_signal = raw.to_string(),
            "MAX_VIDEO_IMAGES" => self.max_video_images = parse_num(key, raw)?,
            "MAX_VIDEO_DURATION_HOURS" => self.max_video_duration_hours = parse_num(key, raw)?,
            "MAX_VIDEO_SIZE_MB" => self.max_video_size_mb = parse_num(key, raw)?,
            "MIN_FREE_DISK_MB" => self.min_free_disk_mb = parse_num(key, raw)?,
            "MAX_MEMORY_MB" => self.max_memory_mb = parse_num(key, raw)?,
            "ENCODER_TIMEOUT_SECONDS" => self.encoder_timeout_seconds = parse_num(key, raw)?,
            "CAPTURE_TIMEOUT_SECONDS" => self.capture_timeout_seconds = parse_num(key, raw)?,
            "KILL_TIMEOUT_MS" => self.kill_timeout_ms = parse_num(key, raw)?,
            "STREAM_START_TIMEOUT_SECONDS" => {
                self.stream_start_timeout_seconds = parse_num(key, raw)?
            }
            "CAPTURE_SETTLE_MS" => self.capture_settle_ms = parse_num(key, raw)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Canonical persisted records for this snapshot.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let path = |p: &PathBuf| p.to_string_lossy().to_string();
        vec![
            ("CAPTURE_INTERVAL", self.capture_interval_seconds.to_string()),
            ("IMAGE_QUALITY", self.image_quality.as_str().to_string()),
            ("ROTATION", self.rotation.to_string()),
            ("FLIP_HORIZONTAL", self.flip_horizontal.to_string()),
            ("FLIP_VERTICAL", self.flip_vertical.to_string()),
            ("STREAM_FPS", self.stream_fps.to_string()),
            ("STREAM_QUALITY", self.stream_quality.as_str().to_string()),
            ("SCHEDULE_ENABLED", self.schedule_enabled.to_string()),
            ("START_TIME", self.start_time.to_string()),
            ("STOP_TIME", self.stop_time.to_string()),
            ("VIDEO_FPS", self.video_fps.to_string()),
            ("VIDEO_QUALITY", self.video_quality.as_str().to_string()),
            ("VIDEO_CODEC", self.video_codec.as_str().to_string()),
            (
                "VIDEO_BITRATE",
                self.video_bitrate_kbps.map(|b| b.to_string()).unwrap_or_default(),
            ),
            ("AUTO_CLEANUP", self.auto_cleanup.to_string()),
            ("MAX_IMAGES", self.max_images.to_string()),
            ("CLEANUP_OLDER_THAN_DAYS", self.cleanup_older_than_days.to_string()),
            ("MAX_STORAGE_GB", self.max_storage_gb.to_string()),
            ("DEBUG_MODE", self.debug_mode.to_string()),
            ("LOG_LEVEL", self.log_level.clone()),
            ("MOCK_CAMERA", self.mock_camera.to_string()),
            ("PORT", self.port.to_string()),
            ("STREAM_PORT", self.stream_port.to_string()),
            ("CAPTURES_DIR", path(&self.captures_dir)),
            ("VIDEOS_DIR", path(&self.videos_dir)),
            ("TEMP_DIR", self.temp_dir.as_ref().map(path).unwrap_or_default()),
            ("UI_DIR", self.ui_dir.as_ref().map(path).unwrap_or_default()),
            ("STREAM_READY_SIGNAL", self.stream_ready_signal.clone()),
            ("MAX_VIDEO_IMAGES", self.max_video_images.to_string()),
            ("MAX_VIDEO_DURATION_HOURS", self.max_video_duration_hours.to_string()),
            ("MAX_VIDEO_SIZE_MB", self.max_video_size_mb.to_string()),
            ("MIN_FREE_DISK_MB", self.min_free_disk_mb.to_string()),
            ("MAX_MEMORY_MB", self.max_memory_mb.to_string()),
            ("ENCODER_TIMEOUT_SECONDS", self.encoder_timeout_seconds.to_string()),
            ("CAPTURE_TIMEOUT_SECONDS", self.capture_timeout_seconds.to_string()),
            ("KILL_TIMEOUT_MS", self.kill_timeout_ms.to_string()),
            ("STREAM_START_TIMEOUT_SECONDS", self.stream_start_timeout_seconds.to_string()),
            ("CAPTURE_SETTLE_MS", self.capture_settle_ms.to_string()),
        ]
    }

    /// Build a snapshot from a persisted file; unknown keys are ignored here
    /// and left in the file by the store.
    pub fn from_env_file(file: &EnvFile) -> Result<Self> {
        let mut settings = Settings::default();
        for (key, value) in file.iter() {
            settings.set_key(key, value).map_err(|e| match e {
                LapseError::Validation(msg) => LapseError::Validation(format!("{}: {}", key, msg)),
                other => other,
            })?;
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Write every known record into `file`, keeping foreign records.
    pub fn apply_to_env_file(&self, file: &mut EnvFile) {
        for (key, value) in self.to_pairs() {
            file.set(key, value);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture_interval_seconds < 1 {
            return Err(LapseError::Validation("captureIntervalSeconds must be >= 1".into()));
        }
        if !matches!(self.rotation, 0 | 90 | 180 | 270) {
            return Err(LapseError::Validation(format!(
                "rotation must be one of 0, 90, 180, 270 (got {})",
                self.rotation
            )));
        }
        if !(STREAM_FPS_MIN..=STREAM_FPS_MAX).contains(&self.stream_fps) {
            return Err(LapseError::Validation(format!(
                "streamFps must be between {} and {} (got {})",
                STREAM_FPS_MIN, STREAM_FPS_MAX, self.stream_fps
            )));
        }
        validate_video_fps(self.video_fps)?;
        if let Some(kbps) = self.video_bitrate_kbps {
            if !(VIDEO_BITRATE_MIN_KBPS..=VIDEO_BITRATE_MAX_KBPS).contains(&kbps) {
                return Err(LapseError::Validation(format!(
                    "videoBitrateKbps must be between {} and {} (got {})",
                    VIDEO_BITRATE_MIN_KBPS, VIDEO_BITRATE_MAX_KBPS, kbps
                )));
            }
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(LapseError::Validation(format!(
                "logLevel must be one of {} (got '{}')",
                LOG_LEVELS.join(", "),
                self.log_level
            )));
        }
        if self.max_storage_gb < 0.0 || !self.max_storage_gb.is_finite() {
            return Err(LapseError::Validation("maxStorageGb must be >= 0".into()));
        }
        if self.captures_dir.as_os_str().is_empty() || self.videos_dir.as_os_str().is_empty() {
            return Err(LapseError::Validation("capturesDir and videosDir must be set".into()));
        }
        if self.stream_ready_signal.trim().is_empty() {
            return Err(LapseError::Validation("streamReadySignal must not be empty".into()));
        }
        if self.max_video_images == 0
            || self.max_video_size_mb == 0
            || self.encoder_timeout_seconds == 0
            || self.capture_timeout_seconds == 0
            || self.stream_start_timeout_seconds == 0
            || self.kill_timeout_ms == 0
        {
            return Err(LapseError::Validation("encoder and helper limits must be positive".into()));
        }
        if !(self.max_video_duration_hours > 0.0 && self.max_video_duration_hours.is_finite()) {
            return Err(LapseError::Validation("maxVideoDurationHours must be > 0".into()));
        }
        Ok(())
    }

    /// Whether `now` falls inside the daily schedule window. Reported only.
    pub fn within_schedule(&self, now: chrono::NaiveTime) -> bool {
        use chrono::Timelike;
        if !self.schedule_enabled {
            return true;
        }
        let minutes = now.hour() * 60 + now.minute();
        let (start, stop) = (self.start_time.minutes(), self.stop_time.minutes());
        if start <= stop {
            minutes >= start && minutes < stop
        } else {
            // Window wraps midnight.
            minutes >= start || minutes < stop
        }
    }
}

fn parse_capture_interval(raw: &str) -> Result<u64> {
    let value: i64 = parse_num("CAPTURE_INTERVAL", raw)?;
    if value <= 0 {
        return Err(LapseError::Validation(format!(
            "capture interval must be >= 1 second (got {})",
            value
        )));
    }
    Ok(value as u64)
}

pub fn validate_video_fps(fps: f64) -> Result<()> {
    if !fps.is_finite() || fps < VIDEO_FPS_MIN || fps > VIDEO_FPS_MAX {
        return Err(LapseError::Validation(format!(
            "video fps must be between {} and {} (got {})",
            VIDEO_FPS_MIN, VIDEO_FPS_MAX, fps
        )));
    }
    Ok(())
}

/// Settings file location: explicit path, then `LAPSECAM_CONFIG`, then
/// `./settings.env` when present, then `~/.lapsecam/settings.env`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    let local = PathBuf::from(SETTINGS_FILENAME);
    if local.is_file() {
        return local;
    }
    match directories::BaseDirs::new() {
        Some(base) => base.home_dir().join(SETTINGS_DIR).join(SETTINGS_FILENAME),
        None => local,
    }
}

// Lapse Cam - Camera Capture Adapter
// One still per call, written into the flat captures directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SubsecRound, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::{Resolution, Settings};
use crate::constants::{
    CAMERA_EXPOSURE_MS, CAMERA_JPEG_QUALITY, CAPTURE_EXTENSION, CAPTURE_PREFIX,
};
use crate::error::{LapseError, Result};
use crate::helper;
use crate::logging::Logger;

static CAPTURE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^timelapse_(\d{4})-(\d{2})-(\d{2})T(\d{2})-(\d{2})-(\d{2})-(\d{3})Z$")
        .expect("valid capture filename regex")
});

/// A still written by the camera.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
    pub filename: String,
    pub path: PathBuf,
    /// Known for fresh captures; listings do not probe image headers.
    pub resolution: Option<Resolution>,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// `timelapse_2024-01-02T03-04-05-678Z.jpg` for the given instant.
pub fn capture_filename(at: DateTime<Utc>) -> String {
    format!(
        "{}{}.{}",
        CAPTURE_PREFIX,
        at.format("%Y-%m-%dT%H-%M-%S-%3fZ"),
        CAPTURE_EXTENSION
    )
}

/// Inverse of [`capture_filename`]. Any other pattern yields `None`.
pub fn parse_capture_filename(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(CAPTURE_EXTENSION)?.strip_suffix('.')?;
    parse_capture_stem(stem)
}

/// The timestamp in a capture name without its extension.
pub fn parse_capture_stem(stem: &str) -> Option<DateTime<Utc>> {
    let caps = CAPTURE_NAME_RE.captures(stem)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    let date = NaiveDate::from_ymd_opt(num(1)? as i32, num(2)?, num(3)?)?;
    let time = date.and_hms_milli_opt(num(4)?, num(5)?, num(6)?, num(7)?)?;
    Some(Utc.from_utc_datetime(&time))
}

pub struct CameraCapture {
    captures_dir: PathBuf,
    camera_exe: PathBuf,
    log: Logger,
}

impl CameraCapture {
    /// Fails when the captures directory cannot be created or written.
    pub fn new(captures_dir: impl Into<PathBuf>, camera_exe: impl Into<PathBuf>) -> Result<Self> {
        let captures_dir = captures_dir.into();
        fs::create_dir_all(&captures_dir)?;
        tempfile::NamedTempFile::new_in(&captures_dir).map_err(|e| {
            LapseError::Io(std::io::Error::new(
                e.kind(),
                format!("captures directory not writable: {}: {}", captures_dir.display(), e),
            ))
        })?;

        Ok(Self {
            captures_dir,
            camera_exe: camera_exe.into(),
            log: Logger::new("camera"),
        })
    }

    pub fn captures_dir(&self) -> &Path {
        &self.captures_dir
    }

    /// Take one still using the orientation and quality in `settings`.
    ///
    /// A partial file left by a failed helper is not removed.
    pub fn capture(&self, settings: &Settings) -> Result<CaptureRecord> {
        let captured_at = Utc::now().trunc_subsecs(3);
        let filename = capture_filename(captured_at);
        let path = self.captures_dir.join(&filename);
        let resolution = settings.image_quality.resolution();

        if settings.mock_camera {
            // Same wall time as the real exposure so cadence behaves alike.
            thread::sleep(Duration::from_millis(u64::from(CAMERA_EXPOSURE_MS)));
            fs::write(&path, mock_jpeg())?;
        } else {
            let args = camera_args(&path, resolution, settings);
            let out = helper::run_to_completion(
                &self.camera_exe,
                &args,
                Duration::from_secs(settings.capture_timeout_seconds),
                Duration::from_millis(settings.kill_timeout_ms),
            )?;
            if out.exit.timed_out {
                self.log.error(
                    "capture timed out",
                    &[("method", &"capture"), ("error", &out.exit.describe())],
                );
                return Err(LapseError::Timeout(format!(
                    "camera did not finish within {}s",
                    settings.capture_timeout_seconds
                )));
            }
            if !out.exit.success() {
                let tail = out.stderr.trim();
                self.log.error(
                    "capture failed",
                    &[("method", &"capture"), ("error", &out.exit.describe())],
                );
                return Err(LapseError::Process(format!(
                    "camera {}: {}",
                    out.exit.describe(),
                    last_line(tail)
                )));
            }
        }

        let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if size_bytes == 0 {
            return Err(LapseError::Process(format!("camera produced no image at {}", path.display())));
        }

        self.log.info(
            "image captured",
            &[("file", &filename), ("resolution", &resolution), ("bytes", &size_bytes)],
        );
        Ok(CaptureRecord {
            filename,
            path,
            resolution: Some(resolution),
            captured_at,
            size_bytes,
        })
    }
}

/// Argument list for the still-capture binary.
pub fn camera_args(output: &Path, resolution: Resolution, settings: &Settings) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        output.to_string_lossy().to_string(),
        "--width".to_string(),
        resolution.width.to_string(),
        "--height".to_string(),
        resolution.height.to_string(),
        "--rotation".to_string(),
        settings.rotation.to_string(),
    ];
    if settings.flip_horizontal {
        args.push("--hflip".to_string());
    }
    if settings.flip_vertical {
        args.push("--vflip".to_string());
    }
    args.extend([
        "--nopreview".to_string(),
        "-t".to_string(),
        CAMERA_EXPOSURE_MS.to_string(),
        "-q".to_string(),
        CAMERA_JPEG_QUALITY.to_string(),
    ]);
    args
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("no output")
}

/// Captures in `dir`, newest first.
pub fn list_captures(dir: &Path) -> Result<Vec<CaptureRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| LapseError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().to_string();
        let Some(captured_at) = parse_capture_filename(&filename) else {
            continue;
        };
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        records.push(CaptureRecord {
            filename,
            path: entry.into_path(),
            resolution: None,
            captured_at,
            size_bytes,
        });
    }
    records.sort_by(|a, b| b.captured_at.cmp(&a.captured_at).then(b.filename.cmp(&a.filename)));
    Ok(records)
}

/// Delete every capture in `dir`. Other files are left alone.
pub fn clear_captures(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for record in list_captures(dir)? {
        fs::remove_file(&record.path)?;
        removed += 1;
    }
    Logger::new("camera").info("captures cleared", &[("count", &removed)]);
    Ok(removed)
}

/// An 8x8 mid-grey baseline JPEG.
///
/// Single-code Huffman tables: the scan is one DC category-0 code plus EOB.
pub fn mock_jpeg() -> Vec<u8> {
    let mut out = vec![0xFF, 0xD8];
    // APP0 JFIF
    out.extend_from_slice(&[
        0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00,
        0x01, 0x00, 0x00,
    ]);
    // DQT, all ones
    out.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x43, 0x00]);
    out.extend_from_slice(&[0x01; 64]);
    // SOF0 8x8, one component
    out.extend_from_slice(&[
        0xFF, 0xC0, 0x00, 0x0B, 0x08, 0x00, 0x08, 0x00, 0x08, 0x01, 0x01, 0x11, 0x00,
    ]);
    // DHT DC0 and AC0: a single 1-bit code for symbol 0
    for class in [0x00, 0x10] {
        out.extend_from_slice(&[0xFF, 0xC4, 0x00, 0x14, class, 0x01]);
        out.extend_from_slice(&[0x00; 15]);
        out.push(0x00);
    }
    // SOS
    out.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
    // Bits "00", padded with ones
    out.push(0x3F);
    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mock_settings() -> Settings {
        Settings {
            mock_camera: true,
            ..Settings::default()
        }
    }

    #[test]
    fn test_filename_round_trip() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap() + chrono::Duration::milliseconds(42);
        let name = capture_filename(at);
        assert_eq!(name, "timelapse_2024-03-09T14-05-07-042Z.jpg");
        assert_eq!(parse_capture_filename(&name), Some(at));
        assert_eq!(capture_filename(parse_capture_filename(&name).unwrap()), name);
    }

    #[test]
    fn test_parse_rejects_other_patterns() {
        assert!(parse_capture_filename("timelapse_2024-03-09T14:05:07.042Z.jpg").is_none());
        assert!(parse_capture_filename("IMG_0001.jpg").is_none());
        assert!(parse_capture_filename("timelapse_2024-13-09T14-05-07-042Z.jpg").is_none());
        assert!(parse_capture_filename("timelapse_2024-03-09T14-05-07-042Z.png").is_none());
        assert!(parse_capture_filename("timelapse_2024-03-09T14-05-07-042Z.JPEG").is_none());
        assert!(parse_capture_filename("TIMELAPSE_2024-03-09T14-05-07-042z.jpg").is_none());
        assert!(parse_capture_filename("timelapse_2024-03-09T14-05-07-042Z.jpeg").is_none());
    }

    #[test]
    fn test_camera_args_encode_orientation() {
        let settings = Settings {
            rotation: 180,
            flip_horizontal: true,
            ..Settings::default()
        };
        let args = camera_args(Path::new("/c/x.jpg"), Resolution { width: 1920, height: 1080 }, &settings);
        assert_eq!(&args[..4], ["-o", "/c/x.jpg", "--width", "1920"]);
        assert!(args.windows(2).any(|w| w == ["--rotation", "180"]));
        assert!(args.contains(&"--hflip".to_string()));
        assert!(!args.contains(&"--vflip".to_string()));
    }

    #[test]
    fn test_mock_capture_writes_jpeg() {
        let tmp = TempDir::new().unwrap();
        let camera = CameraCapture::new(tmp.path().join("captures"), "/nonexistent/camera").unwrap();
        let record = camera.capture(&mock_settings()).unwrap();
        assert!(record.filename.starts_with("timelapse_"));
        assert!(record.size_bytes > 0);
        let bytes = fs::read(&record.path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!(parse_capture_filename(&record.filename), Some(record.captured_at));
    }

    #[cfg(unix)]
    #[test]
    fn test_capture_with_fake_binary() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let exe = tmp.path().join("fake-still");
        // Writes a byte to the path following -o.
        fs::write(&exe, "#!/bin/sh\nwhile [ \"$1\" != \"-o\" ]; do shift; done\nprintf x > \"$2\"\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let camera = CameraCapture::new(tmp.path().join("captures"), &exe).unwrap();
        let record = camera.capture(&Settings::default()).unwrap();
        assert_eq!(record.size_bytes, 1);
        assert_eq!(record.resolution, Some(Settings::default().image_quality.resolution()));
    }

    #[cfg(unix)]
    #[test]
    fn test_capture_failure_reports_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let exe = tmp.path().join("broken-still");
        fs::write(&exe, "#!/bin/sh\necho 'ERROR: no cameras available' >&2\nexit 1\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let camera = CameraCapture::new(tmp.path(), &exe).unwrap();
        let err = camera.capture(&Settings::default()).unwrap_err();
        assert!(err.to_string().contains("no cameras available"));
    }

    #[test]
    fn test_list_and_clear_only_touch_captures() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("timelapse_2024-01-01T00-00-00-000Z.jpg"), b"a").unwrap();
        fs::write(tmp.path().join("timelapse_2024-01-01T00-00-05-000Z.jpg"), b"b").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"keep").unwrap();

        let listed = list_captures(tmp.path()).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].filename, "timelapse_2024-01-01T00-00-05-000Z.jpg");

        assert_eq!(clear_captures(tmp.path()).unwrap(), 2);
        assert!(tmp.path().join("notes.txt").exists());
        assert!(list_captures(tmp.path()).unwrap().is_empty());
    }
}

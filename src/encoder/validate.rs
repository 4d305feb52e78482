// Request validation and root confinement for encoder inputs and outputs

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::config::{parse_bitrate_kbps, validate_video_fps, Codec, Quality, Settings};
use crate::error::{LapseError, Result};

/// Bitrate as sent by clients: a number of kbps or a `5000k`/`5m` string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum BitrateInput {
    Kbps(u64),
    Text(String),
}

/// Raw encode request. Missing fields fall back to the config snapshot.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeRequest {
    pub input_folder: Option<String>,
    pub fps: Option<f64>,
    pub quality: Option<String>,
    pub codec: Option<String>,
    pub bitrate: Option<BitrateInput>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeOptions {
    pub fps: f64,
    pub quality: Quality,
    pub codec: Codec,
    pub bitrate_kbps: Option<u32>,
}

pub fn validate_options(request: &EncodeRequest, settings: &Settings) -> Result<EncodeOptions> {
    let fps = request.fps.unwrap_or(settings.video_fps);
    validate_video_fps(fps)?;

    let quality = match &request.quality {
        Some(q) => q.parse()?,
        None => settings.video_quality,
    };
    let codec = match &request.codec {
        Some(c) => c.parse()?,
        None => settings.video_codec,
    };
    let bitrate_kbps = match &request.bitrate {
        None => settings.video_bitrate_kbps,
        Some(BitrateInput::Kbps(n)) => Some(parse_bitrate_kbps(&n.to_string())?),
        Some(BitrateInput::Text(s)) if s.trim().is_empty() => None,
        Some(BitrateInput::Text(s)) => Some(parse_bitrate_kbps(s)?),
    };

    Ok(EncodeOptions {
        fps,
        quality,
        codec,
        bitrate_kbps,
    })
}

/// Resolve `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `requested` (absolute, or relative to `root`) and require it to
/// stay inside `root`, both lexically and after following symlinks.
pub fn resolve_within(root: &Path, requested: Option<&str>) -> Result<PathBuf> {
    let root = root.canonicalize().map_err(|e| {
        LapseError::Io(std::io::Error::new(
            e.kind(),
            format!("root not accessible: {}: {}", root.display(), e),
        ))
    })?;

    let requested = match requested.map(str::trim) {
        None | Some("") => return Ok(root),
        Some(r) => r,
    };
    if requested.contains('\0') {
        return Err(LapseError::Security("path contains a NUL byte".into()));
    }

    let candidate = Path::new(requested);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    if !normalize_lexically(&joined).starts_with(&root) {
        return Err(LapseError::Security(format!("path outside allowed root: {}", requested)));
    }

    let resolved = joined.canonicalize().map_err(|e| {
        LapseError::Io(std::io::Error::new(e.kind(), format!("{}: {}", requested, e)))
    })?;
    if !resolved.starts_with(&root) {
        return Err(LapseError::Security(format!("path outside allowed root: {}", requested)));
    }
    Ok(resolved)
}

/// Output must be a direct child of the canonical videos root.
pub fn check_output_path(videos_root: &Path, output: &Path) -> Result<()> {
    let normalized = normalize_lexically(output);
    if normalized.parent() != Some(videos_root) {
        return Err(LapseError::Security(format!(
            "output path escapes videos directory: {}",
            output.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_options_fall_back_to_settings() {
        let settings = Settings::default();
        let opts = validate_options(&EncodeRequest::default(), &settings).unwrap();
        assert_eq!(opts.fps, settings.video_fps);
        assert_eq!(opts.quality, settings.video_quality);
        assert_eq!(opts.codec, settings.video_codec);
    }

    #[test]
    fn test_options_bounds_and_allow_lists() {
        let settings = Settings::default();
        let with = |req: EncodeRequest| validate_options(&req, &settings);

        assert!(with(EncodeRequest { fps: Some(0.1), ..Default::default() }).is_ok());
        assert!(with(EncodeRequest { fps: Some(120.0), ..Default::default() }).is_ok());
        assert!(with(EncodeRequest { fps: Some(0.05), ..Default::default() }).is_err());
        assert!(with(EncodeRequest { fps: Some(121.0), ..Default::default() }).is_err());
        assert!(with(EncodeRequest { quality: Some("ultra".into()), ..Default::default() }).is_err());
        assert!(with(EncodeRequest { codec: Some("vp9".into()), ..Default::default() }).is_err());

        for raw in ["5000", "5000k", "5m", "5M"] {
            let opts = with(EncodeRequest {
                bitrate: Some(BitrateInput::Text(raw.into())),
                ..Default::default()
            })
            .unwrap();
            assert_eq!(opts.bitrate_kbps, Some(5000));
        }
        let numeric = with(EncodeRequest { bitrate: Some(BitrateInput::Kbps(5000)), ..Default::default() });
        assert_eq!(numeric.unwrap().bitrate_kbps, Some(5000));
        assert!(with(EncodeRequest { bitrate: Some(BitrateInput::Kbps(99)), ..Default::default() }).is_err());
    }

    #[test]
    fn test_request_deserializes_mixed_bitrate() {
        let req: EncodeRequest =
            serde_json::from_str(r#"{"fps":30,"quality":"medium","codec":"h264","bitrate":"5m"}"#).unwrap();
        assert_eq!(req.bitrate, Some(BitrateInput::Text("5m".into())));
        let req: EncodeRequest = serde_json::from_str(r#"{"bitrate":2500}"#).unwrap();
        assert_eq!(req.bitrate, Some(BitrateInput::Kbps(2500)));
    }

    #[test]
    fn test_resolve_within_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("captures");
        std::fs::create_dir_all(root.join("day1")).unwrap();

        let inside = resolve_within(&root, Some("day1")).unwrap();
        assert!(inside.ends_with("day1"));
        assert_eq!(resolve_within(&root, None).unwrap(), root.canonicalize().unwrap());

        for bad in ["../etc", "/etc", "day1/../../x"] {
            let err = resolve_within(&root, Some(bad)).unwrap_err();
            assert!(matches!(err, LapseError::Security(_)), "{} -> {:?}", bad, err);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_within_rejects_symlink_escape() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("captures");
        std::fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink(tmp.path(), root.join("up")).unwrap();
        let err = resolve_within(&root, Some("up")).unwrap_err();
        assert!(matches!(err, LapseError::Security(_)));
    }

    #[test]
    fn test_output_path_guard() {
        let root = Path::new("/srv/videos");
        assert!(check_output_path(root, &root.join("timelapse_a_to_b.mp4")).is_ok());
        assert!(check_output_path(root, &root.join("../timelapse.mp4")).is_err());
        assert!(check_output_path(root, &root.join("sub/timelapse.mp4")).is_err());
    }
}

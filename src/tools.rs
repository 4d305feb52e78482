// External tool resolver for the camera, streamer and encoder helpers
//
// Resolution order:
// 1) Environment variable override (LAPSECAM_CAMERA_PATH, etc.)
// 2) Binary next to the executable
// 3) bin/ subdirectory next to the executable
// 4) PATH fallback

use std::env;
use std::path::{Path, PathBuf};

use serde::Serialize;

pub const CAMERA_ENV: &str = "LAPSECAM_CAMERA_PATH";
pub const STREAMER_ENV: &str = "LAPSECAM_STREAMER_PATH";
pub const ENCODER_ENV: &str = "LAPSECAM_ENCODER_PATH";

/// Get the directory containing the current executable
fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

/// Resolve a helper binary path.
fn resolve_tool(env_key: &str, default_name: &str) -> PathBuf {
    if let Ok(v) = env::var(env_key) {
        let p = PathBuf::from(&v);
        if p.exists() {
            return p;
        }
    }

    if let Some(dir) = exe_dir() {
        let candidate = dir.join(default_name);
        if candidate.is_file() {
            return candidate;
        }

        let bin_candidate = dir.join("bin").join(default_name);
        if bin_candidate.is_file() {
            return bin_candidate;
        }
    }

    PathBuf::from(default_name)
}

/// Get path to the still-capture binary
pub fn camera_path() -> PathBuf {
    resolve_tool(CAMERA_ENV, "rpicam-still")
}

/// Get path to the MJPEG streaming helper
pub fn streamer_path() -> PathBuf {
    resolve_tool(STREAMER_ENV, "mjpg_streamer")
}

/// Get path to the video encoder
pub fn encoder_path() -> PathBuf {
    resolve_tool(ENCODER_ENV, "ffmpeg")
}

/// Check whether a resolved path can be executed.
/// Bare names are searched on PATH.
pub fn is_executable_available(path: &Path) -> bool {
    if path.components().count() > 1 {
        return path.is_file();
    }
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(path).is_file()))
        .unwrap_or(false)
}

/// Availability of each helper, reported in system info.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatus {
    pub camera: bool,
    pub streamer: bool,
    pub encoder: bool,
}

pub fn tool_status() -> ToolStatus {
    ToolStatus {
        camera: is_executable_available(&camera_path()),
        streamer: is_executable_available(&streamer_path()),
        encoder: is_executable_available(&encoder_path()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_tool_fallback() {
        let path = resolve_tool("LAPSECAM_TEST_NONEXISTENT", "testcmd");
        assert_eq!(path, PathBuf::from("testcmd"));
    }

    #[test]
    fn test_env_override() {
        let temp = tempfile::TempDir::new().unwrap();
        let temp_file = temp.path().join("lapsecam_test_tool");
        std::fs::write(&temp_file, "test").unwrap();

        env::set_var("LAPSECAM_TEST_TOOL", temp_file.to_str().unwrap());
        let path = resolve_tool("LAPSECAM_TEST_TOOL", "default");
        assert_eq!(path, temp_file);
        env::remove_var("LAPSECAM_TEST_TOOL");
    }

    #[test]
    fn test_missing_absolute_path_unavailable() {
        assert!(!is_executable_available(Path::new("/nonexistent/dir/tool")));
    }
}

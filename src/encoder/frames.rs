// Frame discovery and the dense symlink sequence handed to the encoder

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::camera::parse_capture_stem;
use crate::constants::{
    CAPTURE_EXTENSION, FRAME_EXTENSIONS, FRAME_INDEX_MIN_WIDTH, FRAME_LINK_PREFIX,
    TEMP_FRAMES_PREFIX,
};
use crate::error::{LapseError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub path: PathBuf,
    pub captured_at: DateTime<Utc>,
}

fn has_frame_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| FRAME_EXTENSIONS.iter().any(|allowed| e.eq_ignore_ascii_case(allowed)))
        .unwrap_or(false)
}

/// Frames directly inside `dir`, oldest first. Names that do not parse as
/// capture timestamps are skipped.
pub fn scan_frames(dir: &Path) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| LapseError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() || !has_frame_extension(entry.path()) {
            continue;
        }
        let Some(captured_at) = entry.path().file_stem().and_then(|s| s.to_str()).and_then(parse_capture_stem) else {
            continue;
        };
        frames.push(Frame {
            path: entry.into_path(),
            captured_at,
        });
    }
    frames.sort_by(|a, b| a.captured_at.cmp(&b.captured_at).then_with(|| a.path.cmp(&b.path)));
    Ok(frames)
}

/// Whole seconds from first to last frame, rounded up.
pub fn duration_seconds(frames: &[Frame]) -> u64 {
    match (frames.first(), frames.last()) {
        (Some(first), Some(last)) => {
            let ms = (last.captured_at - first.captured_at).num_milliseconds().max(0) as u64;
            ms.div_ceil(1000)
        }
        _ => 0,
    }
}

/// Zero-padded width for `count` frame indices.
pub fn index_width(count: usize) -> usize {
    count
        .saturating_sub(1)
        .to_string()
        .len()
        .max(FRAME_INDEX_MIN_WIDTH)
}

/// A temporary directory of `frame_000.jpg, frame_001.jpg, ...` links.
/// The directory is removed when this value drops.
#[derive(Debug)]
pub struct FrameLinks {
    dir: TempDir,
    width: usize,
    count: usize,
}

impl FrameLinks {
    pub fn create(frames: &[Frame], temp_root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_FRAMES_PREFIX);
        let dir = match temp_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        let width = index_width(frames.len());
        for (i, frame) in frames.iter().enumerate() {
            let link = dir.path().join(link_name(i, width));
            link_file(&frame.path, &link)?;
        }

        Ok(Self {
            dir,
            width,
            count: frames.len(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// printf-style input pattern, e.g. `/tmp/lapsecam_frames_x/frame_%03d.jpg`.
    pub fn pattern(&self) -> PathBuf {
        self.dir.path().join(format!(
            "{}%0{}d.{}",
            FRAME_LINK_PREFIX, self.width, CAPTURE_EXTENSION
        ))
    }
}

fn link_name(index: usize, width: usize) -> String {
    format!(
        "{}{:0width$}.{}",
        FRAME_LINK_PREFIX,
        index,
        CAPTURE_EXTENSION,
        width = width
    )
}

#[cfg(unix)]
fn link_file(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn link_file(target: &Path, link: &Path) -> Result<()> {
    fs::copy(target, link)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "timelapse_2024-05-01T10-00-10-000Z.jpg");
        touch(tmp.path(), "timelapse_2024-05-01T10-00-00-500Z.JPEG");
        touch(tmp.path(), "timelapse_2024-05-01T10-00-05-000Z.jpg");
        touch(tmp.path(), "holiday.jpg");
        touch(tmp.path(), "TIMELAPSE_2024-05-01T10-00-06-000z.jpg");
        touch(tmp.path(), "timelapse_2024-05-01T10-00-07-000Z.png");
        fs::create_dir(tmp.path().join("timelapse_2024-05-01T10-00-08-000Z.jpg")).unwrap();

        let frames = scan_frames(tmp.path()).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[0].captured_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::milliseconds(500)
        );
        assert!(frames.windows(2).all(|w| w[0].captured_at <= w[1].captured_at));
        // 9.5 s rounds up.
        assert_eq!(duration_seconds(&frames), 10);
    }

    #[test]
    fn test_index_width() {
        assert_eq!(index_width(1), 3);
        assert_eq!(index_width(1000), 3);
        assert_eq!(index_width(1001), 4);
        assert_eq!(link_name(7, 3), "frame_007.jpg");
    }

    #[cfg(unix)]
    #[test]
    fn test_links_are_dense_and_removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir(&src).unwrap();
        touch(&src, "timelapse_2024-05-01T10-00-02-000Z.jpg");
        touch(&src, "timelapse_2024-05-01T10-00-01-000Z.jpg");
        let frames = scan_frames(&src).unwrap();

        let work = tmp.path().join("work");
        let links = FrameLinks::create(&frames, Some(&work)).unwrap();
        let dir = links.path().to_path_buf();
        assert!(dir.file_name().unwrap().to_string_lossy().starts_with("lapsecam_frames_"));
        assert_eq!(fs::read_link(dir.join("frame_000.jpg")).unwrap(), frames[0].path);
        assert_eq!(fs::read_link(dir.join("frame_001.jpg")).unwrap(), frames[1].path);
        assert!(links.pattern().to_string_lossy().ends_with("frame_%03d.jpg"));

        drop(links);
        assert!(!dir.exists());
    }
}

// Host resource probes: free disk (statvfs) and resident memory (/proc).
// Either probe may be unavailable; callers skip the check in that case.

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::config::Settings;
use crate::error::{LapseError, Result};
use crate::logging::Logger;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpace {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

#[cfg(unix)]
pub fn disk_space(path: &Path) -> Option<DiskSpace> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: statvfs only writes into the zeroed struct we own.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let frsize = stat.f_frsize as u64;
    Some(DiskSpace {
        free_bytes: (stat.f_bavail as u64).saturating_mul(frsize),
        total_bytes: (stat.f_blocks as u64).saturating_mul(frsize),
    })
}

#[cfg(not(unix))]
pub fn disk_space(_path: &Path) -> Option<DiskSpace> {
    None
}

/// Resident set size of this process.
pub fn resident_memory_bytes() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb * 1024)
}

/// Free disk under `videos_dir` and process memory against the configured limits.
pub fn check_resources(videos_dir: &Path, settings: &Settings, log: &Logger) -> Result<()> {
    match disk_space(videos_dir) {
        Some(disk) => {
            let min_free = settings.min_free_disk_mb.saturating_mul(MB);
            if disk.free_bytes < min_free {
                return Err(LapseError::resource(
                    format!("Insufficient disk space: {} MB free", disk.free_bytes / MB),
                    format!("{} MB", settings.min_free_disk_mb),
                ));
            }
        }
        None => log.debug("disk probe unavailable, skipping", &[("path", &videos_dir.display())]),
    }

    match resident_memory_bytes() {
        Some(rss) => {
            let max = settings.max_memory_mb.saturating_mul(MB);
            if max > 0 && rss > max {
                return Err(LapseError::resource(
                    format!("Memory usage too high: {} MB", rss / MB),
                    format!("{} MB", settings.max_memory_mb),
                ));
            }
        }
        None => log.debug("memory probe unavailable, skipping", &[]),
    }
    Ok(())
}

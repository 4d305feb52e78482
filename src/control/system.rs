// Host facts for systemInfoUpdate

use std::fs;
use std::path::Path;
use std::time::Instant;

use super::events::SystemInfo;
use crate::encoder::resources::disk_space;
use crate::tools::tool_status;

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Degrees Celsius from a sysfs reading in millidegrees.
fn parse_millidegrees(raw: &str) -> Option<f64> {
    let milli: f64 = raw.trim().parse().ok()?;
    Some((milli / 100.0).round() / 10.0)
}

fn cpu_temperature() -> Option<f64> {
    parse_millidegrees(&fs::read_to_string(THERMAL_ZONE).ok()?)
}

fn parse_uptime(raw: &str) -> Option<u64> {
    let secs: f64 = raw.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}

/// Host uptime, or process uptime where /proc is absent.
fn uptime_seconds(started: Instant) -> u64 {
    fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|raw| parse_uptime(&raw))
        .unwrap_or_else(|| started.elapsed().as_secs())
}

pub fn collect(data_dir: &Path, started: Instant) -> SystemInfo {
    let disk = disk_space(data_dir);
    SystemInfo {
        hostname: hostname(),
        uptime_seconds: uptime_seconds(started),
        disk_free_bytes: disk.map(|d| d.free_bytes),
        disk_total_bytes: disk.map(|d| d.total_bytes),
        cpu_temperature_c: cpu_temperature(),
        tools: tool_status(),
    }
}

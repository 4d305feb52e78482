// Encoder job progress payload and stderr parsing

use std::sync::Arc;

use serde::Serialize;

use super::EncodeResult;
use crate::error::{ErrorKind, LapseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderPhase {
    Validating,
    Scanning,
    Encoding,
    Verifying,
    Complete,
    Error,
    Cancelled,
}

impl EncoderPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, EncoderPhase::Complete | EncoderPhase::Error | EncoderPhase::Cancelled)
    }
}

/// One payload shape for every encoder event, terminal or not.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderProgress {
    pub job_id: String,
    pub phase: EncoderPhase,
    pub percent: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EncodeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl EncoderProgress {
    pub fn new(job_id: impl Into<String>, phase: EncoderPhase, percent: u8) -> Self {
        Self {
            job_id: job_id.into(),
            phase,
            percent: percent.min(100),
            message: String::new(),
            result: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = msg.into();
        self
    }

    pub fn complete(job_id: impl Into<String>, result: EncodeResult) -> Self {
        let message = format!("Video created: {}", result.filename);
        Self {
            result: Some(result),
            ..Self::new(job_id, EncoderPhase::Complete, 100).with_message(message)
        }
    }

    /// Terminal failure; cancellation gets its own phase.
    pub fn failed(job_id: impl Into<String>, percent: u8, err: &LapseError) -> Self {
        let phase = match err {
            LapseError::Cancelled(_) => EncoderPhase::Cancelled,
            _ => EncoderPhase::Error,
        };
        Self {
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            ..Self::new(job_id, phase, percent).with_message(err.to_string())
        }
    }
}

pub type ProgressSink = Arc<dyn Fn(EncoderProgress) + Send + Sync>;

/// `frame=  123` from an encoder status line.
pub fn parse_frame(line: &str) -> Option<u64> {
    let idx = line.find("frame=")?;
    let digits: String = line[idx + 6..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// `time=HH:MM:SS.mmm` in seconds. `N/A` and negative times yield `None`.
pub fn parse_time(line: &str) -> Option<f64> {
    let idx = line.find("time=")?;
    let after = &line[idx + 5..];
    let end = after.find(char::is_whitespace).unwrap_or(after.len());
    let stamp = &after[..end];
    if stamp.starts_with('-') || stamp.starts_with('N') {
        return None;
    }
    let mut parts = stamp.split(':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(h * 3600.0 + m * 60.0 + s)
}

/// Turns encoder status lines into a non-decreasing percentage.
#[derive(Debug)]
pub struct ProgressTracker {
    total_frames: u64,
    percent: u8,
    last_time: Option<f64>,
}

impl ProgressTracker {
    pub fn new(total_frames: u64) -> Self {
        Self {
            total_frames: total_frames.max(1),
            percent: 0,
            last_time: None,
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn last_time(&self) -> Option<f64> {
        self.last_time
    }

    /// Returns the new percentage when this line advanced it.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        if let Some(t) = parse_time(line) {
            self.last_time = Some(t);
        }
        let frame = parse_frame(line)?;
        let pct = ((frame as f64 * 100.0) / self.total_frames as f64).round().min(100.0) as u8;
        if pct > self.percent {
            self.percent = pct;
            Some(pct)
        } else {
            None
        }
    }

    pub fn finish(&mut self) {
        self.percent = 100;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_and_time() {
        let line = "frame=   42 fps= 30 q=28.0 size=     256kB time=00:00:01.40 bitrate=1498.0kbits/s speed=1.2x";
        assert_eq!(parse_frame(line), Some(42));
        let t = parse_time(line).unwrap();
        assert!((t - 1.4).abs() < 1e-9);
        assert_eq!(parse_time("time=N/A bitrate=N/A"), None);
        assert_eq!(parse_time("time=-00:00:00.04"), None);
        assert_eq!(parse_frame("Stream mapping:"), None);
    }

    #[test]
    fn test_tracker_is_monotonic_and_capped() {
        let mut tracker = ProgressTracker::new(5);
        assert_eq!(tracker.observe("frame=    1 time=00:00:00.03"), Some(20));
        assert_eq!(tracker.observe("frame=    1 time=00:00:00.03"), None);
        assert_eq!(tracker.observe("frame=    3"), Some(60));
        assert_eq!(tracker.observe("frame=    2"), None);
        assert_eq!(tracker.observe("frame=    9"), Some(100));
        assert_eq!(tracker.percent(), 100);
        assert!(tracker.last_time().is_some());
    }

    #[test]
    fn test_failed_payload_phase() {
        let cancelled = EncoderProgress::failed("j", 40, &LapseError::Cancelled("user".into()));
        assert_eq!(cancelled.phase, EncoderPhase::Cancelled);
        assert_eq!(cancelled.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(cancelled.percent, 40);

        let security = EncoderProgress::failed("j", 0, &LapseError::Security("outside".into()));
        assert_eq!(security.phase, EncoderPhase::Error);
        let json = serde_json::to_value(&security).unwrap();
        assert_eq!(json["errorKind"], "security");
        assert!(json.get("result").is_none());
    }
}

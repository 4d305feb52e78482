// Wire types for the control channel.
// Every frame is `{"event": <name>, "data": <payload>}` in both directions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::camera::CaptureRecord;
use crate::config::Settings;
use crate::encoder::{EncodeRequest, EncoderProgress, VideoInfo};
use crate::error::{ErrorKind, LapseError, Result};
use crate::orchestrator::StatusSnapshot;
use crate::stream::stream_url;
use crate::tools::ToolStatus;

/// Server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    StatusUpdate(Box<StatusSnapshot>),
    ConfigUpdate(Box<Settings>),
    SystemInfoUpdate(SystemInfo),
    LiveStreamUrl(LiveStream),
    VideoGenerationStatus(EncoderProgress),
    ImageListUpdate(ImageList),
    ImagesCleared(ImagesCleared),
    VideoListUpdate(VideoList),
    Notification(Notification),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::StatusUpdate(_) => "statusUpdate",
            ServerEvent::ConfigUpdate(_) => "configUpdate",
            ServerEvent::SystemInfoUpdate(_) => "systemInfoUpdate",
            ServerEvent::LiveStreamUrl(_) => "liveStreamUrl",
            ServerEvent::VideoGenerationStatus(_) => "videoGenerationStatus",
            ServerEvent::ImageListUpdate(_) => "imageListUpdate",
            ServerEvent::ImagesCleared(_) => "imagesCleared",
            ServerEvent::VideoListUpdate(_) => "videoListUpdate",
            ServerEvent::Notification(_) => "notification",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn info(message: impl Into<String>) -> Self {
        ServerEvent::Notification(Notification::new(NotificationLevel::Info, message))
    }

    pub fn success(message: impl Into<String>) -> Self {
        ServerEvent::Notification(Notification::new(NotificationLevel::Success, message))
    }

    /// State errors become info notices; everything else is an error notice.
    pub fn from_error(err: &LapseError) -> Self {
        let level = if err.is_informational() {
            NotificationLevel::Info
        } else {
            NotificationLevel::Error
        };
        ServerEvent::Notification(Notification {
            level,
            message: err.to_string(),
            kind: Some(err.kind()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            kind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStream {
    pub active: bool,
    pub url: Option<String>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LiveStream {
    pub fn up(host: &str, port: u16) -> Self {
        Self {
            active: true,
            url: Some(stream_url(host, port)),
            port,
            message: None,
        }
    }

    pub fn down(port: u16, message: impl Into<String>) -> Self {
        Self {
            active: false,
            url: None,
            port,
            message: Some(message.into()),
        }
    }

    /// Point the URL at the host name the client used to reach us.
    pub fn for_host(&self, host: &str) -> Self {
        let mut local = self.clone();
        if local.active {
            local.url = Some(stream_url(host, local.port));
        }
        local
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEntry {
    pub filename: String,
    pub url: String,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl From<&CaptureRecord> for ImageEntry {
    fn from(record: &CaptureRecord) -> Self {
        Self {
            url: format!("/captures/{}", record.filename),
            filename: record.filename.clone(),
            captured_at: record.captured_at,
            size_bytes: record.size_bytes,
        }
    }
}

/// Newest captures first, truncated; `total` counts them all.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageList {
    pub images: Vec<ImageEntry>,
    pub total: usize,
}

impl ImageList {
    pub fn from_records(records: &[CaptureRecord], limit: usize) -> Self {
        Self {
            images: records.iter().take(limit).map(ImageEntry::from).collect(),
            total: records.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImagesCleared {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoEntry {
    pub filename: String,
    pub url: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoList {
    pub videos: Vec<VideoEntry>,
}

impl VideoList {
    pub fn from_infos(infos: &[VideoInfo]) -> Self {
        Self {
            videos: infos
                .iter()
                .map(|v| VideoEntry {
                    filename: v.filename.clone(),
                    url: format!("/videos/{}", v.filename),
                    size_bytes: v.size_bytes,
                    created_at: v.created_at,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub hostname: String,
    pub uptime_seconds: u64,
    pub disk_free_bytes: Option<u64>,
    pub disk_total_bytes: Option<u64>,
    pub cpu_temperature_c: Option<f64>,
    pub tools: ToolStatus,
}

/// Client to server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    StartCapture,
    StopCapture,
    ToggleStream,
    CaptureNow,
    GenerateVideo(EncodeRequest),
    CancelVideoGeneration,
    RefreshImages,
    ClearImages,
    RefreshVideos,
    DeleteVideo { filename: String },
    SaveConfig(Map<String, Value>),
    ResetConfigToDefaults,
    RequestExtendedConfig,
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl ClientCommand {
    pub fn parse(text: &str) -> Result<Self> {
        let Envelope { event, data } = serde_json::from_str(text)?;
        let command = match event.as_str() {
            "startCapture" => ClientCommand::StartCapture,
            "stopCapture" => ClientCommand::StopCapture,
            "toggleStream" => ClientCommand::ToggleStream,
            "captureNow" => ClientCommand::CaptureNow,
            "generateVideo" => ClientCommand::GenerateVideo(match data {
                Value::Null => EncodeRequest::default(),
                other => serde_json::from_value(other)?,
            }),
            "cancelVideoGeneration" => ClientCommand::CancelVideoGeneration,
            "refreshImages" => ClientCommand::RefreshImages,
            "clearImages" => ClientCommand::ClearImages,
            "refreshVideos" => ClientCommand::RefreshVideos,
            "deleteVideo" => {
                let filename = match &data {
                    Value::String(name) => Some(name.clone()),
                    Value::Object(map) => map.get("filename").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                };
                let filename =
                    filename.ok_or_else(|| LapseError::Validation("deleteVideo needs a filename".into()))?;
                ClientCommand::DeleteVideo { filename }
            }
            "saveConfig" => match data {
                Value::Object(map) => ClientCommand::SaveConfig(map),
                _ => return Err(LapseError::Validation("saveConfig needs an object".into())),
            },
            "resetConfigToDefaults" => ClientCommand::ResetConfigToDefaults,
            "requestExtendedConfig" => ClientCommand::RequestExtendedConfig,
            other => return Err(LapseError::Validation(format!("unknown event: {}", other))),
        };
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::BitrateInput;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ClientCommand::parse(r#"{"event":"startCapture"}"#).unwrap(), ClientCommand::StartCapture);
        assert_eq!(
            ClientCommand::parse(r#"{"event":"toggleStream","data":null}"#).unwrap(),
            ClientCommand::ToggleStream
        );

        let cmd = ClientCommand::parse(r#"{"event":"generateVideo","data":{"fps":24,"bitrate":"5m"}}"#).unwrap();
        let ClientCommand::GenerateVideo(req) = cmd else {
            panic!("wrong command");
        };
        assert_eq!(req.fps, Some(24.0));
        assert_eq!(req.bitrate, Some(BitrateInput::Text("5m".into())));

        assert_eq!(
            ClientCommand::parse(r#"{"event":"deleteVideo","data":"timelapse_a_to_b.mp4"}"#).unwrap(),
            ClientCommand::DeleteVideo {
                filename: "timelapse_a_to_b.mp4".into()
            }
        );
        assert_eq!(
            ClientCommand::parse(r#"{"event":"deleteVideo","data":{"filename":"x.mp4"}}"#).unwrap(),
            ClientCommand::DeleteVideo { filename: "x.mp4".into() }
        );
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        let unknown = ClientCommand::parse(r#"{"event":"reboot"}"#).unwrap_err();
        assert_eq!(unknown.kind(), ErrorKind::Validation);
        assert!(ClientCommand::parse("not json").is_err());
        assert!(ClientCommand::parse(r#"{"event":"saveConfig","data":[1]}"#).is_err());
        assert!(ClientCommand::parse(r#"{"event":"deleteVideo"}"#).is_err());
    }

    #[test]
    fn test_server_event_envelope() {
        let json: Value = serde_json::from_str(&ServerEvent::success("Saved").to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "notification");
        assert_eq!(json["data"]["level"], "success");
        assert_eq!(json["data"]["message"], "Saved");

        let cleared = ServerEvent::ImagesCleared(ImagesCleared { count: 3 });
        let json: Value = serde_json::from_str(&cleared.to_json().unwrap()).unwrap();
        assert_eq!(json["event"], cleared.name());
        assert_eq!(json["data"]["count"], 3);
    }

    #[test]
    fn test_state_errors_are_informational_notices() {
        let ServerEvent::Notification(n) = ServerEvent::from_error(&LapseError::State("busy".into())) else {
            panic!("not a notification");
        };
        assert_eq!(n.level, NotificationLevel::Info);
        assert_eq!(n.kind, Some(ErrorKind::State));

        let ServerEvent::Notification(n) = ServerEvent::from_error(&LapseError::Security("x".into())) else {
            panic!("not a notification");
        };
        assert_eq!(n.level, NotificationLevel::Error);
    }

    #[test]
    fn test_system_info_compares_tool_status() {
        let info = SystemInfo {
            hostname: "lapsecam".into(),
            uptime_seconds: 12,
            disk_free_bytes: Some(1024),
            disk_total_bytes: Some(4096),
            cpu_temperature_c: None,
            tools: ToolStatus {
                camera: true,
                streamer: true,
                encoder: false,
            },
        };
        let mut other = info.clone();
        assert_eq!(info, other);
        other.tools.encoder = true;
        assert_ne!(info, other);
        assert_eq!(serde_json::to_value(&info).unwrap()["tools"]["encoder"], false);
    }

    #[test]
    fn test_live_stream_host_rewrite() {
        let up = LiveStream::up("lapsecam", 8080);
        assert_eq!(up.for_host("192.168.1.20").url.as_deref(), Some("http://192.168.1.20:8080/?action=stream"));
        let down = LiveStream::down(8080, "stopped");
        assert_eq!(down.for_host("192.168.1.20").url, None);
    }
}

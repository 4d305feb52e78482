// Lapse Cam Constants
// Defaults for every tunable live in config::Settings; these are the fixed values.

// Operation priorities (higher wins)
pub const PRIORITY_ONE_SHOT: i32 = 80;
pub const PRIORITY_TIMELAPSE: i32 = 60;
pub const PRIORITY_STREAM: i32 = 20;

// Capture files
pub const CAPTURE_PREFIX: &str = "timelapse_";
pub const CAPTURE_EXTENSION: &str = "jpg";
pub const FRAME_EXTENSIONS: [&str; 2] = ["jpg", "jpeg"];

// Video files
pub const VIDEO_PREFIX: &str = "timelapse_";
pub const VIDEO_EXTENSION: &str = "mp4";
pub const TEMP_FRAMES_PREFIX: &str = "lapsecam_frames_";
pub const FRAME_LINK_PREFIX: &str = "frame_";
pub const FRAME_INDEX_MIN_WIDTH: usize = 3;

// Resolution presets (width, height)
pub const PRESET_LOW: (u32, u32) = (640, 480);
pub const PRESET_MEDIUM: (u32, u32) = (1280, 720);
pub const PRESET_HIGH: (u32, u32) = (1920, 1080);

// Encoder option bounds
pub const VIDEO_FPS_MIN: f64 = 0.1;
pub const VIDEO_FPS_MAX: f64 = 120.0;
pub const VIDEO_BITRATE_MIN_KBPS: u32 = 100;
pub const VIDEO_BITRATE_MAX_KBPS: u32 = 50_000;
pub const VIDEO_PIXEL_FORMAT: &str = "yuv420p";

// Streaming
pub const DEFAULT_STREAM_PORT: u16 = 8080;
pub const DEFAULT_STREAM_READY_SIGNAL: &str = "HTTP TCP port";
pub const STREAM_FPS_MIN: u32 = 1;
pub const STREAM_FPS_MAX: u32 = 60;

// Helper processes
pub const HELPER_BUFFER_BYTES: usize = 64 * 1024;
pub const HELPER_POLL_INTERVAL_MS: u64 = 25;
pub const CAMERA_EXPOSURE_MS: u32 = 1000;
pub const CAMERA_JPEG_QUALITY: u32 = 90;

// Control plane
pub const DEFAULT_HTTP_PORT: u16 = 3000;
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
pub const STATUS_HEARTBEAT_MS: u64 = 1000;
pub const SYSTEM_INFO_INTERVAL_SECS: u64 = 30;
pub const IMAGE_LIST_LIMIT: usize = 100;

// Correlation ids
pub const CORRELATION_ID_LEN: usize = 8;

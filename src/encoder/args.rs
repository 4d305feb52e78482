// Encoder argument list
// Every value is a separate element; nothing is ever joined into a shell line.

use std::path::Path;

use chrono::{DateTime, Utc};

use super::validate::EncodeOptions;
use crate::config::{Codec, Quality};
use crate::constants::{VIDEO_EXTENSION, VIDEO_PIXEL_FORMAT, VIDEO_PREFIX};
use crate::error::{LapseError, Result};

/// CRF, x264/x265 preset, maxrate and bufsize for a quality level.
pub fn quality_preset(quality: Quality) -> (u8, &'static str, &'static str, &'static str) {
    match quality {
        Quality::Low => (28, "veryfast", "2M", "4M"),
        Quality::Medium => (23, "medium", "5M", "10M"),
        Quality::High => (18, "slow", "10M", "20M"),
    }
}

/// `timelapse_2024-05-01T10-00-00_to_2024-05-01T18-30-00.mp4`
pub fn video_filename(first: DateTime<Utc>, last: DateTime<Utc>) -> String {
    const SAFE: &str = "%Y-%m-%dT%H-%M-%S";
    format!(
        "{}{}_to_{}.{}",
        VIDEO_PREFIX,
        first.format(SAFE),
        last.format(SAFE),
        VIDEO_EXTENSION
    )
}

pub fn build_encoder_args(input_pattern: &Path, options: &EncodeOptions, output: &Path) -> Result<Vec<String>> {
    let fps = options.fps.to_string();
    let mut args: Vec<String> = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-framerate".to_string(),
        fps.clone(),
        "-i".to_string(),
        path_str(input_pattern)?,
    ];

    match options.codec {
        Codec::H264 => args.extend(["-c:v".to_string(), "libx264".to_string()]),
        Codec::H265 => args.extend([
            "-c:v".to_string(),
            "libx265".to_string(),
            "-tag:v".to_string(),
            "hvc1".to_string(),
        ]),
    }
    args.extend(["-pix_fmt".to_string(), VIDEO_PIXEL_FORMAT.to_string()]);

    let (crf, preset, maxrate, bufsize) = quality_preset(options.quality);
    args.extend(["-preset".to_string(), preset.to_string()]);
    match options.bitrate_kbps {
        Some(kbps) => args.extend([
            "-b:v".to_string(),
            format!("{}k", kbps),
            "-maxrate".to_string(),
            format!("{}k", kbps),
            "-bufsize".to_string(),
            format!("{}k", kbps as u64 * 2),
        ]),
        None => args.extend([
            "-crf".to_string(),
            crf.to_string(),
            "-maxrate".to_string(),
            maxrate.to_string(),
            "-bufsize".to_string(),
            bufsize.to_string(),
        ]),
    }

    args.extend([
        "-r".to_string(),
        fps,
        "-movflags".to_string(),
        "+faststart".to_string(),
        path_str(output)?,
    ]);
    Ok(args)
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| LapseError::Security(format!("path is not valid UTF-8: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn opts(quality: Quality, codec: Codec, bitrate_kbps: Option<u32>) -> EncodeOptions {
        EncodeOptions {
            fps: 30.0,
            quality,
            codec,
            bitrate_kbps,
        }
    }

    fn pair(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
    }

    #[test]
    fn test_video_filename() {
        let first = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let last = Utc.with_ymd_and_hms(2024, 5, 1, 18, 30, 15).unwrap();
        assert_eq!(
            video_filename(first, last),
            "timelapse_2024-05-01T10-00-00_to_2024-05-01T18-30-15.mp4"
        );
    }

    #[test]
    fn test_preset_args() {
        let args = build_encoder_args(
            Path::new("/tmp/f/frame_%03d.jpg"),
            &opts(Quality::Medium, Codec::H264, None),
            Path::new("/v/out.tmp.mp4"),
        )
        .unwrap();
        assert_eq!(args[0], "-y");
        assert_eq!(pair(&args, "-framerate").as_deref(), Some("30"));
        assert_eq!(pair(&args, "-i").as_deref(), Some("/tmp/f/frame_%03d.jpg"));
        assert_eq!(pair(&args, "-c:v").as_deref(), Some("libx264"));
        assert_eq!(pair(&args, "-crf").as_deref(), Some("23"));
        assert_eq!(pair(&args, "-preset").as_deref(), Some("medium"));
        assert_eq!(pair(&args, "-maxrate").as_deref(), Some("5M"));
        assert_eq!(pair(&args, "-bufsize").as_deref(), Some("10M"));
        assert_eq!(pair(&args, "-pix_fmt").as_deref(), Some("yuv420p"));
        assert_eq!(args.last().map(String::as_str), Some("/v/out.tmp.mp4"));
    }

    #[test]
    fn test_custom_bitrate_and_h265() {
        let args = build_encoder_args(
            Path::new("/tmp/f/frame_%03d.jpg"),
            &opts(Quality::High, Codec::H265, Some(5000)),
            Path::new("/v/out.mp4"),
        )
        .unwrap();
        assert_eq!(pair(&args, "-c:v").as_deref(), Some("libx265"));
        assert_eq!(pair(&args, "-tag:v").as_deref(), Some("hvc1"));
        assert_eq!(pair(&args, "-b:v").as_deref(), Some("5000k"));
        assert_eq!(pair(&args, "-maxrate").as_deref(), Some("5000k"));
        assert_eq!(pair(&args, "-bufsize").as_deref(), Some("10000k"));
        assert!(pair(&args, "-crf").is_none());
    }

    #[test]
    fn test_fractional_fps() {
        let mut o = opts(Quality::Low, Codec::H264, None);
        o.fps = 0.5;
        let args = build_encoder_args(Path::new("/f/frame_%03d.jpg"), &o, Path::new("/v/o.mp4")).unwrap();
        assert_eq!(pair(&args, "-framerate").as_deref(), Some("0.5"));
        assert_eq!(pair(&args, "-r").as_deref(), Some("0.5"));
    }
}

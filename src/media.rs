//! Media probing, thumbnailing, and perceptual fingerprints.
//!
//! Probing and frame extraction shell out to the host ffmpeg toolchain. The
//! fingerprint is a 64-bit dHash over a 9x8 grayscale reduction of the
//! representative frame; it is a coarse duplicate signal, not an exact one.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

/// Extracted stream facts used by the auto-scorer.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration_secs: f64,
    pub size_bytes: i64,
    pub width: i32,
    pub height: i32,
    pub codec: String,
}

/// Probe failures are non-transient: retrying the same bytes cannot succeed,
/// so the pipeline parks the submission for human review instead.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unreadable or unsupported media: {0}")]
    Unsupported(String),
    #[error("media tooling failed: {0}")]
    Tooling(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait MediaProcessor: Send + Sync {
    async fn probe(&self, bytes: &[u8]) -> Result<MediaInfo, ProbeError>;

    /// JPEG still frame at the given offset.
    async fn still_frame(&self, bytes: &[u8], at_secs: f64) -> Result<Vec<u8>, ProbeError>;

    /// 64-bit dHash of the frame at the given offset.
    async fn frame_dhash(&self, bytes: &[u8], at_secs: f64) -> Result<u64, ProbeError>;
}

/// Representative-frame offset: 5 seconds in, or the midpoint of clips that
/// do not reach 5 seconds.
pub fn seek_point(duration_secs: f64) -> f64 {
    if duration_secs > 5.0 {
        5.0
    } else {
        duration_secs / 2.0
    }
}

/// dHash over a 9x8 grayscale raster: one bit per horizontally adjacent
/// pixel pair, set when the left pixel is brighter.
pub fn dhash_from_gray_9x8(pixels: &[u8]) -> Result<u64, ProbeError> {
    if pixels.len() < 72 {
        return Err(ProbeError::Unsupported(format!(
            "expected 72 grayscale pixels, got {}",
            pixels.len()
        )));
    }

    let mut bits = 0u64;
    for row in 0..8 {
        for col in 0..8 {
            let left = pixels[row * 9 + col];
            let right = pixels[row * 9 + col + 1];
            bits = (bits << 1) | u64::from(left > right);
        }
    }
    Ok(bits)
}

pub fn fingerprint_hex(bits: u64) -> String {
    hex::encode(bits.to_be_bytes())
}

/// ffmpeg/ffprobe-backed processor.
pub struct FfmpegProcessor {
    work_dir: PathBuf,
}

impl FfmpegProcessor {
    pub fn new() -> Self {
        Self {
            work_dir: std::env::temp_dir(),
        }
    }

    async fn write_temp(&self, bytes: &[u8], suffix: &str) -> Result<PathBuf, ProbeError> {
        let path = self
            .work_dir
            .join(format!("ecovault_{}{suffix}", Uuid::new_v4().simple()));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

impl Default for FfmpegProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaProcessor for FfmpegProcessor {
    async fn probe(&self, bytes: &[u8]) -> Result<MediaInfo, ProbeError> {
        let input = self.write_temp(bytes, ".bin").await?;

        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(&input)
            .stdin(Stdio::null())
            .output()
            .await;
        let _ = tokio::fs::remove_file(&input).await;

        let output = output.map_err(|err| ProbeError::Tooling(format!("ffprobe spawn failed: {err}")))?;
        if !output.status.success() {
            return Err(ProbeError::Unsupported(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|err| ProbeError::Tooling(format!("ffprobe output unparseable: {err}")))?;

        let duration_secs = parsed
            .pointer("/format/duration")
            .and_then(|value| value.as_str())
            .and_then(|value| value.parse::<f64>().ok())
            .ok_or_else(|| ProbeError::Unsupported("missing duration".to_string()))?;

        let video = parsed
            .pointer("/streams")
            .and_then(|value| value.as_array())
            .and_then(|streams| {
                streams.iter().find(|stream| {
                    stream.pointer("/codec_type").and_then(|v| v.as_str()) == Some("video")
                })
            })
            .ok_or_else(|| ProbeError::Unsupported("no video stream".to_string()))?;

        let width = video
            .pointer("/width")
            .and_then(|value| value.as_i64())
            .unwrap_or(0) as i32;
        let height = video
            .pointer("/height")
            .and_then(|value| value.as_i64())
            .unwrap_or(0) as i32;
        let codec = video
            .pointer("/codec_name")
            .and_then(|value| value.as_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(MediaInfo {
            duration_secs,
            size_bytes: bytes.len() as i64,
            width,
            height,
            codec,
        })
    }

    async fn still_frame(&self, bytes: &[u8], at_secs: f64) -> Result<Vec<u8>, ProbeError> {
        let input = self.write_temp(bytes, ".bin").await?;
        let frame = self
            .work_dir
            .join(format!("ecovault_{}.jpg", Uuid::new_v4().simple()));

        let status = Command::new("ffmpeg")
            .args(["-v", "error", "-ss", &format!("{at_secs:.3}"), "-i"])
            .arg(&input)
            .args(["-frames:v", "1", "-q:v", "3"])
            .arg(&frame)
            .stdin(Stdio::null())
            .status()
            .await;
        let _ = tokio::fs::remove_file(&input).await;

        let status = status.map_err(|err| ProbeError::Tooling(format!("ffmpeg spawn failed: {err}")))?;
        if !status.success() {
            let _ = tokio::fs::remove_file(&frame).await;
            return Err(ProbeError::Unsupported("frame extraction failed".to_string()));
        }

        let jpeg = tokio::fs::read(&frame).await;
        let _ = tokio::fs::remove_file(&frame).await;
        Ok(jpeg?)
    }

    async fn frame_dhash(&self, bytes: &[u8], at_secs: f64) -> Result<u64, ProbeError> {
        let input = self.write_temp(bytes, ".bin").await?;

        let output = Command::new("ffmpeg")
            .args(["-v", "error", "-ss", &format!("{at_secs:.3}"), "-i"])
            .arg(&input)
            .args([
                "-frames:v",
                "1",
                "-vf",
                "scale=9:8",
                "-pix_fmt",
                "gray",
                "-f",
                "rawvideo",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .output()
            .await;
        let _ = tokio::fs::remove_file(&input).await;

        let output = output.map_err(|err| ProbeError::Tooling(format!("ffmpeg spawn failed: {err}")))?;
        if !output.status.success() {
            return Err(ProbeError::Unsupported(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        dhash_from_gray_9x8(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_point_is_five_seconds_or_midpoint() {
        assert_eq!(seek_point(45.0), 5.0);
        assert_eq!(seek_point(5.1), 5.0);
        assert_eq!(seek_point(5.0), 2.5);
        assert_eq!(seek_point(4.0), 2.0);
        assert_eq!(seek_point(0.0), 0.0);
    }

    #[test]
    fn dhash_tracks_horizontal_gradients() {
        // Brightness increasing left to right: no left pixel is brighter.
        let rising: Vec<u8> = (0..72).map(|i| (i % 9) as u8 * 10).collect();
        assert_eq!(dhash_from_gray_9x8(&rising).unwrap(), 0);

        // Brightness decreasing left to right: every bit set.
        let falling: Vec<u8> = (0..72).map(|i| 100 - (i % 9) as u8 * 10).collect();
        assert_eq!(dhash_from_gray_9x8(&falling).unwrap(), u64::MAX);
    }

    #[test]
    fn dhash_is_deterministic() {
        let pixels: Vec<u8> = (0..72).map(|i| (i * 37 % 251) as u8).collect();
        assert_eq!(
            dhash_from_gray_9x8(&pixels).unwrap(),
            dhash_from_gray_9x8(&pixels).unwrap()
        );
    }

    #[test]
    fn dhash_rejects_short_rasters() {
        assert!(dhash_from_gray_9x8(&[0u8; 71]).is_err());
    }

    #[test]
    fn fingerprint_is_fixed_width_hex() {
        assert_eq!(fingerprint_hex(0), "0000000000000000");
        assert_eq!(fingerprint_hex(u64::MAX), "ffffffffffffffff");
    }
}

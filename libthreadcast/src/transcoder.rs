//! Re-encoding media to fit each platform's upload limits
//!
//! Images are shrunk with a JPEG quality search: start at quality 100 and step
//! down by one until the output fits the budget. Videos are normalized to an
//! H.264/AAC MP4, then re-encoded with a two-pass constant bitrate for every
//! platform whose limit the normalized copy still exceeds.

use image::codecs::jpeg::JpegEncoder;
use image::{ImageReader, RgbImage};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::MediaConfig;
use crate::error::{MediaError, Result};
use crate::types::SocialPlatform;

/// Bytes kept free under a video budget for container overhead and bitrate drift
pub const VIDEO_SIZE_MARGIN: u64 = 5_242_880;

pub const AUDIO_BITRATE_KBPS: u32 = 128;

/// Upload limits for one platform, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaBudget {
    pub image: u64,
    pub video: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformBudgets {
    pub twitter: MediaBudget,
    pub bluesky: MediaBudget,
    pub mastodon: MediaBudget,
    pub threads: MediaBudget,
}

impl Default for PlatformBudgets {
    fn default() -> Self {
        Self {
            twitter: MediaBudget {
                image: 5_242_880,
                video: 536_870_912,
            },
            bluesky: MediaBudget {
                image: 976_560,
                video: 52_428_800,
            },
            mastodon: MediaBudget {
                image: 16_777_216,
                video: 103_809_024,
            },
            threads: MediaBudget {
                image: 8_388_608,
                video: 536_870_912,
            },
        }
    }
}

impl PlatformBudgets {
    pub fn get(&self, platform: SocialPlatform) -> MediaBudget {
        match platform {
            SocialPlatform::Twitter => self.twitter,
            SocialPlatform::Bluesky => self.bluesky,
            SocialPlatform::Mastodon => self.mastodon,
            SocialPlatform::Threads => self.threads,
        }
    }

    /// The same image limit on every platform, used by tests
    pub fn uniform(image: u64, video: u64) -> Self {
        let budget = MediaBudget { image, video };
        Self {
            twitter: budget,
            bluesky: budget,
            mastodon: budget,
            threads: budget,
        }
    }
}

// ============================================================================
// Images
// ============================================================================

fn decode_rgb(data: &[u8]) -> Result<RgbImage> {
    let image = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| MediaError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| MediaError::Decode(e.to_string()))?;
    Ok(image.to_rgb8())
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    JpegEncoder::new_with_quality(&mut output, quality)
        .encode_image(image)
        .map_err(|e| MediaError::Encode(e.to_string()))?;
    Ok(output)
}

/// Pixel dimensions, read from the header without decoding
pub fn image_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    let dimensions = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| MediaError::Decode(e.to_string()))?
        .into_dimensions()
        .map_err(|e| MediaError::Decode(e.to_string()))?;
    Ok(dimensions)
}

/// Size of `data` re-encoded as JPEG at `quality`
pub fn jpeg_size_at_quality(data: &[u8], quality: u8) -> Result<usize> {
    Ok(encode_jpeg(&decode_rgb(data)?, quality)?.len())
}

/// Fit an image into `budget` bytes.
///
/// Returns `data` untouched when it already fits. Otherwise re-encodes as
/// JPEG from quality 100 down to 1 and returns the first encoding that fits.
/// Fails with [`MediaError::TooLarge`] if even quality 1 is over budget.
pub fn fit_image(data: &[u8], budget: u64) -> Result<Vec<u8>> {
    if data.len() as u64 <= budget {
        return Ok(data.to_vec());
    }

    let image = decode_rgb(data)?;
    let mut smallest = u64::MAX;
    for quality in (1..=100u8).rev() {
        let encoded = encode_jpeg(&image, quality)?;
        let size = encoded.len() as u64;
        if size <= budget {
            debug!(
                "Image fits {} byte budget at quality {} ({} -> {} bytes)",
                budget,
                quality,
                data.len(),
                size
            );
            return Ok(encoded);
        }
        smallest = smallest.min(size);
    }

    Err(MediaError::TooLarge { budget, smallest }.into())
}

#[derive(Debug, Clone)]
pub struct ImageOutput {
    pub width: u32,
    pub height: u32,
    /// JPEG variants for platforms whose limit the source exceeds
    pub variants: BTreeMap<SocialPlatform, Vec<u8>>,
}

// ============================================================================
// Video
// ============================================================================

/// Video bitrate in kbps that lands a `duration_secs` clip under `budget` bytes.
///
/// `((budget - margin) * 8 / 1000 / duration) - audio`, rounded to the
/// nearest 100 kbps. `None` when no positive bitrate fits.
pub fn target_video_bitrate_kbps(budget: u64, duration_secs: f64) -> Option<u32> {
    if duration_secs <= 0.0 || !duration_secs.is_finite() || budget <= VIDEO_SIZE_MARGIN {
        return None;
    }
    let total_kbps = (budget - VIDEO_SIZE_MARGIN) as f64 * 8.0 / 1000.0 / duration_secs;
    let video_kbps = total_kbps - AUDIO_BITRATE_KBPS as f64;
    let rounded = (video_kbps / 100.0).round() * 100.0;
    if rounded < 100.0 {
        None
    } else {
        Some(rounded as u32)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub duration_secs: f64,
}

/// Parse `ffprobe -of json -show_entries stream=width,height:format=duration`
fn parse_probe_output(stdout: &[u8]) -> Result<VideoInfo> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| MediaError::Decode(format!("unreadable ffprobe output: {}", e)))?;

    let stream = probe
        .streams
        .iter()
        .find(|s| s.width.is_some() && s.height.is_some())
        .ok_or_else(|| MediaError::Decode("no video stream".to_string()))?;

    let duration_secs = probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| MediaError::Decode("unknown video duration".to_string()))?;

    Ok(VideoInfo {
        width: stream.width.unwrap_or_default(),
        height: stream.height.unwrap_or_default(),
        duration_secs,
    })
}

#[derive(Debug)]
pub struct VideoOutput {
    /// Baseline H.264/AAC MP4, stored as the canonical copy
    pub canonical: Vec<u8>,
    pub info: VideoInfo,
    pub variants: BTreeMap<SocialPlatform, Vec<u8>>,
    /// Platforms whose two-pass encode failed, with the reason
    pub failures: Vec<(SocialPlatform, String)>,
}

// ============================================================================
// Transcoder
// ============================================================================

pub struct MediaTranscoder {
    ffmpeg: String,
    ffprobe: String,
    budgets: PlatformBudgets,
}

impl MediaTranscoder {
    pub fn new(config: &MediaConfig) -> Self {
        Self::with_budgets(config, PlatformBudgets::default())
    }

    pub fn with_budgets(config: &MediaConfig, budgets: PlatformBudgets) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
            budgets,
        }
    }

    pub fn budgets(&self) -> &PlatformBudgets {
        &self.budgets
    }

    /// Measure an image and fit it under every platform's image limit
    pub async fn optimize_image(&self, data: Vec<u8>) -> Result<ImageOutput> {
        let budgets = self.budgets.clone();
        tokio::task::spawn_blocking(move || {
            let (width, height) = image_dimensions(&data)?;
            let mut variants = BTreeMap::new();
            for platform in SocialPlatform::ALL {
                let budget = budgets.get(platform).image;
                if data.len() as u64 > budget {
                    variants.insert(platform, fit_image(&data, budget)?);
                }
            }
            Ok(ImageOutput {
                width,
                height,
                variants,
            })
        })
        .await
        .map_err(|e| MediaError::Encode(format!("image worker failed: {}", e)))?
    }

    /// Normalize a video and produce per-platform two-pass variants
    pub async fn process_video(&self, data: &[u8]) -> Result<VideoOutput> {
        let work_dir = tempfile::TempDir::new().map_err(|e| MediaError::Ffmpeg(e.to_string()))?;
        let input = work_dir.path().join("input");
        let canonical_path = work_dir.path().join("canonical.mp4");

        tokio::fs::write(&input, data)
            .await
            .map_err(|e| MediaError::Ffmpeg(format!("failed to stage input: {}", e)))?;

        self.ffmpeg(&[
            "-y",
            "-i",
            &path_str(&input),
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-c:a",
            "aac",
            "-movflags",
            "+faststart",
            &path_str(&canonical_path),
        ])
        .await?;

        let canonical = read_output(&canonical_path).await?;
        let info = self.probe(&canonical_path).await?;
        info!(
            "Normalized video to {} bytes ({}x{}, {:.1}s)",
            canonical.len(),
            info.width,
            info.height,
            info.duration_secs
        );

        let mut variants = BTreeMap::new();
        let mut failures = Vec::new();
        for platform in SocialPlatform::ALL {
            let budget = self.budgets.get(platform).video;
            if canonical.len() as u64 <= budget {
                continue;
            }
            match self
                .encode_two_pass(&canonical_path, work_dir.path(), platform, budget, info)
                .await
            {
                Ok(encoded) => {
                    variants.insert(platform, encoded);
                }
                Err(e) => {
                    warn!("Video variant for {} failed: {}", platform, e);
                    failures.push((platform, e.to_string()));
                }
            }
        }

        Ok(VideoOutput {
            canonical,
            info,
            variants,
            failures,
        })
    }

    async fn encode_two_pass(
        &self,
        source: &Path,
        work_dir: &Path,
        platform: SocialPlatform,
        budget: u64,
        info: VideoInfo,
    ) -> Result<Vec<u8>> {
        let bitrate = target_video_bitrate_kbps(budget, info.duration_secs).ok_or_else(|| {
            MediaError::TooLarge {
                budget,
                smallest: 0,
            }
        })?;
        let bitrate = format!("{}k", bitrate);
        let audio_bitrate = format!("{}k", AUDIO_BITRATE_KBPS);
        let pass_log = path_str(&work_dir.join(format!("pass_{}", platform)));
        let output = work_dir.join(format!("{}.mp4", platform));
        let source = path_str(source);

        debug!("Two-pass encode for {} at {}", platform, bitrate);

        self.ffmpeg(&[
            "-y",
            "-i",
            &source,
            "-c:v",
            "libx264",
            "-b:v",
            &bitrate,
            "-pass",
            "1",
            "-passlogfile",
            &pass_log,
            "-fps_mode",
            "cfr",
            "-an",
            "-f",
            "null",
            "-",
        ])
        .await?;

        self.ffmpeg(&[
            "-y",
            "-i",
            &source,
            "-c:v",
            "libx264",
            "-b:v",
            &bitrate,
            "-pass",
            "2",
            "-passlogfile",
            &pass_log,
            "-c:a",
            "aac",
            "-b:a",
            &audio_bitrate,
            "-movflags",
            "+faststart",
            &path_str(&output),
        ])
        .await?;

        read_output(&output).await
    }

    async fn probe(&self, path: &Path) -> Result<VideoInfo> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error"])
            .args(["-select_streams", "v:0"])
            .args(["-show_entries", "stream=width,height:format=duration"])
            .args(["-of", "json"])
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| MediaError::Ffmpeg(format!("failed to spawn ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(MediaError::Ffmpeg(format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        parse_probe_output(&output.stdout)
    }

    async fn ffmpeg(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| MediaError::Ffmpeg(format!("failed to spawn ffmpeg: {}", e)))?;

        if !output.status.success() {
            return Err(MediaError::Ffmpeg(String::from_utf8_lossy(&output.stderr).trim().to_string()).into());
        }
        Ok(())
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn read_output(path: &Path) -> Result<Vec<u8>> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| MediaError::Ffmpeg(format!("no output at {}: {}", path.display(), e)))?;
    if data.is_empty() {
        return Err(MediaError::Ffmpeg(format!("empty output at {}", path.display())).into());
    }
    Ok(data)
}

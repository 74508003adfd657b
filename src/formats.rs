//! Turns `yt-dlp --dump-single-json` output into the short list of quality
//! options offered to the user.
//!
//! Only muxable MP4 video streams at the common resolutions are offered. Each
//! option is later combined with the best audio stream, so the advertised
//! size includes the audio track.

use serde::{Deserialize, Serialize};

/// Resolutions offered to the user, highest first.
pub const COMMON_HEIGHTS: [u32; 4] = [1080, 720, 480, 360];

/// Assumed audio bitrate (kbit/s) when the best audio stream has no `tbr`.
const FALLBACK_AUDIO_KBPS: f64 = 128.0;
const DEFAULT_FPS: f64 = 30.0;

/// The subset of yt-dlp's info JSON we read. Everything is optional because
/// extractors differ wildly in what they report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub formats: Vec<FormatInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatInfo {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    /// Total bitrate in kbit/s.
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub resolution: Option<String>,
}

impl FormatInfo {
    fn has_video(&self) -> bool {
        self.vcodec.as_deref() != Some("none")
    }

    fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }

    fn is_h264(&self) -> bool {
        self.vcodec
            .as_deref()
            .is_some_and(|codec| codec.starts_with("avc1") || codec.eq_ignore_ascii_case("h264"))
    }
}

/// One entry of the `qualityOptions` array returned to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityOption {
    pub format_id: String,
    pub resolution: String,
    pub fps: f64,
    pub filesize: u64,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub ext: Option<String>,
    pub label: String,
}

/// Picks the audio-only stream with the highest bitrate. The first audio-only
/// stream wins ties and beats later streams that lack a bitrate.
pub fn best_audio(formats: &[FormatInfo]) -> Option<&FormatInfo> {
    formats
        .iter()
        .filter(|format| !format.has_video() && format.has_audio())
        .fold(None, |best: Option<&FormatInfo>, current| match (best, current.tbr) {
            (None, _) => Some(current),
            (Some(best), Some(tbr)) if best.tbr.is_none_or(|best_tbr| tbr > best_tbr) => {
                Some(current)
            }
            (best, _) => best,
        })
}

/// Size in bytes contributed by the audio track.
pub fn audio_size(info: &VideoInfo, audio: Option<&FormatInfo>) -> u64 {
    let Some(audio) = audio else {
        return 0;
    };
    if let Some(size) = audio.filesize.filter(|size| *size > 0) {
        return size;
    }
    match audio.tbr {
        Some(tbr) => bytes_for_bitrate(tbr, info.duration.unwrap_or(0.0)),
        None => 0,
    }
}

/// Builds the deduplicated, size-annotated options, highest resolution first.
pub fn quality_options(info: &VideoInfo) -> Vec<QualityOption> {
    let audio = best_audio(&info.formats);
    let audio_bytes = audio_size(info, audio);
    let audio_kbps = audio.and_then(|audio| audio.tbr).unwrap_or(FALLBACK_AUDIO_KBPS);

    let mut candidates: Vec<&FormatInfo> = info
        .formats
        .iter()
        .filter(|format| {
            format.has_video()
                && format.resolution.as_deref() != Some("audio only")
                && format.ext.as_deref() == Some("mp4")
                && format
                    .height
                    .is_some_and(|height| COMMON_HEIGHTS.contains(&height))
        })
        .collect();
    // Stable, so extractor order decides among equal heights.
    candidates.sort_by(|a, b| b.height.cmp(&a.height));

    let mut unique: Vec<&FormatInfo> = Vec::new();
    for format in candidates {
        match unique.iter_mut().find(|kept| kept.height == format.height) {
            None => unique.push(format),
            Some(kept) if format.is_h264() => *kept = format,
            Some(_) => {}
        }
    }

    unique
        .into_iter()
        .map(|format| build_option(format, info.duration, audio_bytes, audio_kbps))
        .collect()
}

fn build_option(
    format: &FormatInfo,
    duration: Option<f64>,
    audio_bytes: u64,
    audio_kbps: f64,
) -> QualityOption {
    // Callers only pass formats that survived the height filter.
    let height = format.height.unwrap_or_default();

    let (mut total, mut estimated) = match (format.filesize, format.tbr, duration) {
        (Some(size), _, _) if size > 0 => (size + audio_bytes, false),
        (_, Some(tbr), Some(duration)) if tbr > 0.0 && duration > 0.0 => {
            (bytes_for_bitrate(tbr + audio_kbps, duration), true)
        }
        _ => (0, false),
    };

    if total == 0 {
        estimated = true;
        let kbps = estimated_video_kbps(height) + FALLBACK_AUDIO_KBPS;
        total = bytes_for_bitrate(kbps, duration.unwrap_or(0.0));
    }

    let fps_suffix = match format.fps {
        Some(fps) if fps > DEFAULT_FPS => format!(" {fps}fps"),
        _ => String::new(),
    };

    QualityOption {
        format_id: format.format_id.clone(),
        resolution: format!("{height}p"),
        fps: format.fps.filter(|fps| *fps > 0.0).unwrap_or(DEFAULT_FPS),
        filesize: total,
        vcodec: format.vcodec.clone(),
        acodec: format.acodec.clone(),
        ext: format.ext.clone(),
        label: format!(
            "{height}p{fps_suffix} ({})",
            format_file_size(total, estimated)
        ),
    }
}

fn estimated_video_kbps(height: u32) -> f64 {
    match height {
        1080 => 8000.0,
        720 => 5000.0,
        480 => 2500.0,
        _ => 1000.0,
    }
}

/// `kbps` here follows yt-dlp's convention of 1024 bits per kbit.
fn bytes_for_bitrate(kbps: f64, duration_secs: f64) -> u64 {
    let bytes = (kbps * 1024.0 * duration_secs / 8.0).round();
    if bytes.is_finite() && bytes > 0.0 {
        bytes as u64
    } else {
        0
    }
}

/// Human readable size with one decimal, `~` marks estimates.
pub fn format_file_size(bytes: u64, estimated: bool) -> String {
    if bytes == 0 {
        return "Size unavailable".to_string();
    }
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    let prefix = if estimated { "~" } else { "" };
    format!("{prefix}{size:.1} {}", UNITS[unit])
}

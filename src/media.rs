//! Producer and muxer collaborators behind the download endpoint.
//!
//! `yt-dlp` fetches the video-only and audio-only streams, `ffmpeg` copies
//! them into one MP4. Both are opaque subprocesses: we build the command
//! line, check the exit status, and keep stderr for error messages. The
//! traits exist so the HTTP layer can be exercised without either tool.

use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, Output},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::formats::VideoInfo;

/// Format selector used when the client did not pick a quality.
pub const DEFAULT_VIDEO_SELECTOR: &str = "bestvideo[ext=mp4]";
const AUDIO_SELECTOR: &str = "bestaudio";
/// Keep error messages readable when a tool dumps a wall of stderr.
const STDERR_TAIL_CHARS: usize = 600;

/// Something that can describe a URL and download its streams to disk.
pub trait MediaProducer: Send + Sync {
    /// Returns the extractor's metadata, including the available formats.
    fn probe(&self, url: &str) -> Result<VideoInfo>;

    /// Downloads the video stream chosen by `selector` to `output`.
    fn fetch_video(&self, url: &str, selector: &str, output: &Path) -> Result<()>;

    /// Downloads the best audio stream as m4a to `output`.
    fn fetch_audio(&self, url: &str, output: &Path) -> Result<()>;
}

/// Something that can combine a video-only and an audio-only file.
pub trait Muxer: Send + Sync {
    fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Base command shared by every invocation; the extractor cache is off.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("--no-cache-dir").arg("--no-progress");
        command
    }

    fn run(&self, mut command: Command, url: &str, label: &str) -> Result<Output> {
        // `--` keeps a URL that starts with a dash from being read as a flag.
        command.arg("--").arg(url);
        let output = command
            .output()
            .with_context(|| format!("running {} for {label}", self.program.display()))?;
        if !output.status.success() {
            bail!(
                "{label} failed for {url} (status {}): {}",
                output.status,
                stderr_tail(&output)
            );
        }
        Ok(output)
    }
}

impl MediaProducer for YtDlp {
    fn probe(&self, url: &str) -> Result<VideoInfo> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--no-warnings")
            .arg("--no-check-certificates")
            .arg("--prefer-free-formats")
            .arg("--youtube-skip-dash-manifest");
        let output = self.run(command, url, "format probe")?;
        serde_json::from_slice(&output.stdout).context("deserializing yt-dlp metadata JSON")
    }

    fn fetch_video(&self, url: &str, selector: &str, output: &Path) -> Result<()> {
        let mut command = self.command();
        command
            .arg("--format")
            .arg(selector)
            .arg("--output")
            .arg(output);
        self.run(command, url, "video download")?;
        Ok(())
    }

    fn fetch_audio(&self, url: &str, output: &Path) -> Result<()> {
        let mut command = self.command();
        command
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg("m4a")
            .arg("--format")
            .arg(AUDIO_SELECTOR)
            .arg("--output")
            .arg(output);
        self.run(command, url, "audio download")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: PathBuf,
}

impl Ffmpeg {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Muxer for Ffmpeg {
    fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<()> {
        let result = Command::new(&self.program)
            .arg("-hide_banner")
            .arg("-nostdin")
            .arg("-i")
            .arg(video)
            .arg("-i")
            .arg(audio)
            .args(["-c:v", "copy", "-c:a", "aac", "-strict", "experimental"])
            .arg(output)
            .output()
            .with_context(|| format!("running {}", self.program.display()))?;

        if !result.status.success() {
            bail!(
                "ffmpeg exited with status {}: {}",
                result.status,
                stderr_tail(&result)
            );
        }
        debug!(stderr = %String::from_utf8_lossy(&result.stderr), "ffmpeg finished");
        Ok(())
    }
}

fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return trimmed.to_owned();
    }
    trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

/// Fetches both streams, muxes them into a fresh `<uuid>.mp4` inside the
/// downloads directory, and cleans up the intermediate files.
pub struct DownloadPipeline<P: ?Sized = dyn MediaProducer, M: ?Sized = dyn Muxer> {
    producer: Arc<P>,
    muxer: Arc<M>,
    downloads_dir: PathBuf,
}

impl<P: MediaProducer + ?Sized, M: Muxer + ?Sized> DownloadPipeline<P, M> {
    pub fn new(
        producer: Arc<P>,
        muxer: Arc<M>,
        downloads_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            producer,
            muxer,
            downloads_dir: downloads_dir.into(),
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn probe(&self, url: &str) -> Result<VideoInfo> {
        self.producer.probe(url)
    }

    /// Produces the artifact and returns its file name. Registration with the
    /// retention store is left to the caller.
    pub fn produce(&self, url: &str, format_id: Option<&str>) -> Result<String> {
        fs::create_dir_all(&self.downloads_dir)
            .with_context(|| format!("creating {}", self.downloads_dir.display()))?;

        let filename = format!("{}.mp4", Uuid::new_v4());
        let output = self.downloads_dir.join(&filename);
        let video_tmp = self.downloads_dir.join(format!("{filename}.video.mp4"));
        let audio_tmp = self.downloads_dir.join(format!("{filename}.audio.m4a"));
        let selector = format_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_VIDEO_SELECTOR);

        let result = self.fetch_and_mux(url, selector, &video_tmp, &audio_tmp, &output);
        remove_temp(&video_tmp);
        remove_temp(&audio_tmp);

        if let Err(err) = result {
            remove_temp(&output);
            return Err(err);
        }
        if !output.is_file() {
            bail!("downloaded file not found after processing");
        }

        info!(filename = %filename, "artifact ready");
        Ok(filename)
    }

    fn fetch_and_mux(
        &self,
        url: &str,
        selector: &str,
        video_tmp: &Path,
        audio_tmp: &Path,
        output: &Path,
    ) -> Result<()> {
        info!(url, selector, "downloading video stream");
        self.producer.fetch_video(url, selector, video_tmp)?;
        info!(url, "downloading audio stream");
        self.producer.fetch_audio(url, audio_tmp)?;
        info!("combining video and audio");
        self.muxer.mux(video_tmp, audio_tmp, output)
    }
}

fn remove_temp(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temporary file"),
    }
}

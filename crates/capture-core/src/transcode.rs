//! External transcoding steps run during finalize
//!
//! Both steps shell out to ffmpeg. Invocations are bounded by a semaphore so
//! a burst of sessions ending together cannot fork an unbounded number of
//! encoder processes.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::TranscodeConfig;
use crate::{Error, Result};

/// Bytes of ffmpeg stderr kept in error messages
const STDERR_TAIL: usize = 600;

/// Produces derivatives of a finished recording
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Write a mono 48 kHz PCM WAV of the recording's audio
    async fn extract_audio(&self, input: &Path, output: &Path) -> Result<()>;

    /// Write a browser-playable constant frame rate H.264/AAC MP4
    async fn transcode_video(&self, input: &Path, output: &Path) -> Result<()>;
}

/// Path of the video derivative for a recording
///
/// `x.mkv` becomes `x.mp4`; an input already ending in `.mp4` becomes
/// `x.transcoded.mp4` so the original is never overwritten.
pub fn transcoded_path(input: &Path) -> PathBuf {
    let is_mp4 = input
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false);
    if is_mp4 {
        input.with_extension("transcoded.mp4")
    } else {
        input.with_extension("mp4")
    }
}

/// Path of the extracted audio for a recording
pub fn audio_path(input: &Path) -> PathBuf {
    input.with_extension("wav")
}

/// ffmpeg-backed transcoder with a bounded worker pool
pub struct FfmpegTranscoder {
    config: TranscodeConfig,
    permits: Arc<Semaphore>,
}

impl FfmpegTranscoder {
    pub fn new(config: TranscodeConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self { config, permits }
    }

    fn audio_args(input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            input.display().to_string(),
            "-vn".into(),
            "-acodec".into(),
            "pcm_s16le".into(),
            "-ar".into(),
            "48000".into(),
            "-ac".into(),
            "1".into(),
            output.display().to_string(),
        ]
    }

    fn video_args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-fflags".into(),
            "+genpts".into(),
            "-i".into(),
            input.display().to_string(),
            "-map".into(),
            "0:v:0?".into(),
            "-map".into(),
            "0:a:0?".into(),
            "-r".into(),
            self.config.fps.to_string(),
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-preset".into(),
            self.config.preset.clone(),
            "-crf".into(),
            self.config.crf.to_string(),
            "-vsync".into(),
            "cfr".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "128k".into(),
            "-ar".into(),
            "48000".into(),
            "-ac".into(),
            "2".into(),
            "-shortest".into(),
            output.display().to_string(),
        ]
    }

    async fn run(&self, step: &str, args: Vec<String>) -> Result<()> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| Error::TranscodeError(format!("worker pool closed: {}", e)))?;

        debug!(step, ffmpeg = %self.config.ffmpeg_path, args = ?args, "Running ffmpeg");
        let output = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::TranscodeError(format!("{}: failed to spawn ffmpeg: {}", step, e)))?;

        if output.status.success() {
            info!(step, "ffmpeg step finished");
            Ok(())
        } else {
            Err(Error::TranscodeError(format!(
                "{}: ffmpeg exited with {}: {}",
                step,
                output.status,
                stderr_tail(&output.stderr)
            )))
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn extract_audio(&self, input: &Path, output: &Path) -> Result<()> {
        self.run("extract_audio", Self::audio_args(input, output)).await
    }

    async fn transcode_video(&self, input: &Path, output: &Path) -> Result<()> {
        self.run("transcode_video", self.video_args(input, output))
            .await
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| text.len() - i <= STDERR_TAIL)
        .unwrap_or(text.len());
    text[start..].to_string()
}

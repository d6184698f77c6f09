//! Finalization pipeline: stop, derive, upload, clean up
//!
//! ```text
//! gate ─▶ await start ─▶ stop recorder ─▶ extract audio ─▶ transcode video
//!                                                              │
//!        cleanup ◀─ cache keys + mark finalized ◀─ upload ◀─ flush probe
//! ```
//!
//! The gate is a per-session async mutex held for the whole run, so a second
//! caller waits for the first and then returns the cached keys without
//! repeating any I/O. Every step except upload is best-effort.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::CaptureConfig;
use crate::metrics::CaptureMetrics;
use crate::session::{ArtifactKeys, SessionState};
use crate::storage::{content_type_for, session_key, ObjectStore};
use crate::transcode::{audio_path, transcoded_path, Transcoder};
use crate::{Error, Result};

/// Runs the terminal sequence for sessions
pub struct Finalizer {
    store: Arc<dyn ObjectStore>,
    transcoder: Arc<dyn Transcoder>,
    metrics: Arc<CaptureMetrics>,
    start_wait: Duration,
    flush_checks: u32,
    flush_interval: Duration,
}

/// An artifact ready for upload
struct Artifact {
    name: &'static str,
    path: PathBuf,
    file_name: String,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        transcoder: Arc<dyn Transcoder>,
        metrics: Arc<CaptureMetrics>,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            store,
            transcoder,
            metrics,
            start_wait: config.recorder.start_wait(),
            flush_checks: config.session.flush_checks,
            flush_interval: config.session.flush_interval(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Finalize a session once; later calls return the cached keys.
    ///
    /// Upload failures are returned after cleanup has run and the session
    /// has been marked finalized, so they never cause a second attempt.
    #[instrument(skip(self, session), fields(session_id = %session.session_id))]
    pub async fn finalize(&self, session: &SessionState) -> Result<ArtifactKeys> {
        let mut gate = session.finalize_gate().lock().await;
        if let Some(keys) = gate.keys.clone() {
            debug!("Already finalized, returning cached keys");
            return Ok(keys);
        }
        info!("Finalize begin");

        self.await_pending_start(session).await;

        let (has_recording, recording) = {
            let mut recorder = session.recorder().lock().await;
            recorder.stop().await;
            (recorder.has_recording(), recorder.target().path)
        };

        let audio_out = audio_path(&recording);
        let video_out = transcoded_path(&recording);
        let mut artifacts = Vec::new();

        if has_recording && file_size(&recording).await.is_some() {
            if let Some(audio) = self.extract_audio(&recording, &audio_out).await {
                artifacts.push(audio);
            }
            let video = self.transcode_video(&recording, &video_out).await;
            self.probe_flush(&recording).await;
            // Video first so its key is reported before audio
            artifacts.insert(0, video);
        } else if has_recording {
            warn!(path = %recording.display(), "Recorder started but no recording file exists");
        } else {
            info!("No recording for this session");
        }

        let mut keys = ArtifactKeys::default();
        let mut first_error = None;
        for artifact in &artifacts {
            match self.upload(&session.session_id, artifact).await {
                Ok(key) => match artifact.name {
                    "recording" => keys.video_key = Some(key),
                    _ => keys.audio_key = Some(key),
                },
                Err(e) => {
                    error!(artifact = artifact.name, error = %e, "Upload failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        gate.keys = Some(keys.clone());
        session.mark_finalized(keys.clone());
        self.metrics.session_finalized();
        drop(gate);

        cleanup(&[recording, video_out, audio_out], &session.tmp_dir).await;

        info!(
            video_key = keys.video_key.as_deref().unwrap_or("-"),
            audio_key = keys.audio_key.as_deref().unwrap_or("-"),
            "Finalize done"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(keys),
        }
    }

    async fn await_pending_start(&self, session: &SessionState) {
        let Some(handle) = session.take_start_handle() else {
            return;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.start_wait, handle).await {
            Ok(Ok(())) => debug!("Pending recorder start completed"),
            Ok(Err(e)) => warn!(error = %e, "Recorder start task failed"),
            Err(_) => {
                warn!(wait_secs = self.start_wait.as_secs(), "Recorder start still pending, abandoning it");
                abort.abort();
            }
        }
    }

    async fn extract_audio(&self, recording: &Path, out: &Path) -> Option<Artifact> {
        match self.transcoder.extract_audio(recording, out).await {
            Ok(()) if file_size(out).await.unwrap_or(0) > 0 => Some(Artifact {
                name: "audio",
                path: out.to_path_buf(),
                file_name: "audio.wav".to_string(),
            }),
            Ok(()) => {
                self.metrics.audio_extraction_failed();
                warn!(path = %out.display(), "Audio extraction produced no output");
                None
            }
            Err(e) => {
                self.metrics.audio_extraction_failed();
                warn!(error = %e, "Audio extraction failed; audio artifact omitted");
                None
            }
        }
    }

    /// The mp4 derivative when it is usable, otherwise the original file
    async fn transcode_video(&self, recording: &Path, out: &Path) -> Artifact {
        let original = Artifact {
            name: "recording",
            path: recording.to_path_buf(),
            file_name: format!(
                "recording.{}",
                recording
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("mkv")
            ),
        };

        match self.transcoder.transcode_video(recording, out).await {
            Ok(()) => match file_size(out).await {
                Some(size) if size > 0 => {
                    info!(path = %out.display(), size, "Video transcoded");
                    Artifact {
                        name: "recording",
                        path: out.to_path_buf(),
                        file_name: "recording.mp4".to_string(),
                    }
                }
                _ => {
                    self.metrics.transcode_failed();
                    warn!(path = %out.display(), "Transcode produced no output; uploading original");
                    original
                }
            },
            Err(e) => {
                self.metrics.transcode_failed();
                warn!(error = %e, "Transcode failed; uploading original");
                original
            }
        }
    }

    /// Watch the recording size settle; observability only
    async fn probe_flush(&self, recording: &Path) {
        let mut last = None;
        for check in 0..self.flush_checks {
            let size = file_size(recording).await;
            debug!(check, size = ?size, "Recording flush probe");
            if size.is_some() && size == last {
                break;
            }
            last = size;
            tokio::time::sleep(self.flush_interval).await;
        }
        info!(
            exists = last.is_some(),
            size = last.map(|s| s as i64).unwrap_or(-1),
            path = %recording.display(),
            "Recording ready for upload"
        );
    }

    async fn upload(&self, session_id: &str, artifact: &Artifact) -> Result<String> {
        let key = session_key(session_id, &artifact.file_name);
        let fail = |reason: String| Error::Upload {
            artifact: artifact.name.to_string(),
            key: key.clone(),
            reason,
        };

        let body = match tokio::fs::read(&artifact.path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                self.metrics.upload_failed();
                return Err(fail(e.to_string()));
            }
        };

        if let Err(e) = self.store.remove(&key).await {
            debug!(key = %key, error = %e, "Removing previous object failed");
        }

        let content_type = content_type_for(&artifact.file_name);
        match self.store.put(&key, body, content_type).await {
            Ok(result) => {
                self.metrics.upload_succeeded();
                info!(
                    artifact = artifact.name,
                    key = %result.key,
                    size = result.size,
                    content_type,
                    "Artifact uploaded"
                );
                Ok(result.key)
            }
            Err(e) => {
                self.metrics.upload_failed();
                Err(fail(e.to_string()))
            }
        }
    }
}

async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

/// Remove temporary files and the session directory, ignoring absences
async fn cleanup(files: &[PathBuf], dir: &Path) {
    for file in files {
        match tokio::fs::remove_file(file).await {
            Ok(()) => debug!(path = %file.display(), "Removed temporary file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %file.display(), error = %e, "Removing temporary file failed"),
        }
    }
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(path = %dir.display(), "Removed session directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "Removing session directory failed"),
    }
}

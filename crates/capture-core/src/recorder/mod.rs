//! Recorder controller with container-format fallback
//!
//! The controller owns exactly one container writer bound to one temporary
//! file. Starting is attempted once with the configured format and, if that
//! fails, once more with the fallback format on a fresh path with the same
//! track handles re-attached. A second failure leaves the session without a
//! recording; nothing is raised past the controller.
//!
//! ```text
//! Idle ──start──▶ Starting ──ok──▶ Started ──stop──▶ Stopped
//!                    │                ▲
//!                    └─err─▶ FallbackStarting ──err──▶ Failed
//! ```

pub mod ffmpeg;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use webrtc::rtp::packet::Packet;

use crate::media::{ContainerFormat, TrackInfo};
use crate::metrics::CaptureMetrics;
use crate::tee::TeeReceiver;
use crate::Result;

pub use ffmpeg::{FfmpegWriter, FfmpegWriterFactory};

/// File a recorder writes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingTarget {
    pub path: PathBuf,
    pub format: ContainerFormat,
}

impl RecordingTarget {
    /// `{dir}/{session_id}{ext}`
    pub fn in_dir(dir: &Path, session_id: &str, format: ContainerFormat) -> Self {
        Self {
            path: dir.join(format!("{}{}", session_id, format.extension())),
            format,
        }
    }
}

/// Recording target readable without holding the recorder lock
pub type SharedTarget = Arc<RwLock<RecordingTarget>>;

/// One tee output attached to a writer
pub struct TrackInput {
    pub info: TrackInfo,
    pub frames: TeeReceiver<Packet>,
}

/// Recorder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Starting,
    FallbackStarting,
    Started,
    Failed,
    Stopped,
}

/// A process or library that multiplexes tracks into one container file
#[async_trait]
pub trait ContainerWriter: Send {
    /// Attach a track; may be called before `start`, frames queue in the
    /// tee output until the writer consumes them
    async fn add_track(&mut self, input: TrackInput) -> Result<()>;

    /// Begin writing the container
    async fn start(&mut self) -> Result<()>;

    /// Flush and close; a no-op when never started
    async fn stop(&mut self) -> Result<()>;

    /// Hand back every attached track so it can be re-attached elsewhere
    async fn detach_tracks(&mut self) -> Vec<TrackInput>;
}

/// Creates writers bound to a target file
pub trait WriterFactory: Send + Sync {
    fn create(&self, target: &RecordingTarget) -> Box<dyn ContainerWriter>;
}

/// Drives one container writer through start, fallback and stop
pub struct RecorderController {
    session_id: String,
    dir: PathBuf,
    fallback: ContainerFormat,
    factory: Arc<dyn WriterFactory>,
    writer: Box<dyn ContainerWriter>,
    target: SharedTarget,
    state: RecorderState,
    metrics: Arc<CaptureMetrics>,
}

impl RecorderController {
    pub fn new(
        session_id: impl Into<String>,
        dir: impl Into<PathBuf>,
        format: ContainerFormat,
        fallback: ContainerFormat,
        factory: Arc<dyn WriterFactory>,
        metrics: Arc<CaptureMetrics>,
    ) -> Self {
        let session_id = session_id.into();
        let dir = dir.into();
        let target = RecordingTarget::in_dir(&dir, &session_id, format);
        let writer = factory.create(&target);

        Self {
            session_id,
            dir,
            fallback,
            factory,
            writer,
            target: Arc::new(RwLock::new(target)),
            state: RecorderState::Idle,
            metrics,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn target(&self) -> RecordingTarget {
        self.target.read().clone()
    }

    pub fn shared_target(&self) -> SharedTarget {
        Arc::clone(&self.target)
    }

    /// Attach a tee output to the writer.
    ///
    /// Once the recorder has failed or stopped the input is dropped, which
    /// detaches it from its tee.
    pub async fn add_track(&mut self, input: TrackInput) -> Result<()> {
        if matches!(self.state, RecorderState::Failed | RecorderState::Stopped) {
            debug!(
                session_id = %self.session_id,
                kind = %input.info.kind,
                state = ?self.state,
                "Recorder not accepting tracks, releasing tee output"
            );
            return Ok(());
        }
        debug!(
            session_id = %self.session_id,
            kind = %input.info.kind,
            state = ?self.state,
            "Attaching track to recorder"
        );
        self.writer.add_track(input).await
    }

    /// Mark the recorder failed and drop every tee output the writer holds
    async fn fail(&mut self) {
        self.state = RecorderState::Failed;
        if let Err(e) = self.writer.stop().await {
            debug!(session_id = %self.session_id, error = %e, "Writer stop after failed start errored");
        }
        let released = self.writer.detach_tracks().await.len();
        debug!(session_id = %self.session_id, released, "Released recorder tee outputs");
    }

    /// Start the writer, falling back to the alternate format once.
    ///
    /// Returns the resulting state; failures are logged, never raised.
    pub async fn start(&mut self) -> RecorderState {
        if self.state != RecorderState::Idle {
            debug!(session_id = %self.session_id, state = ?self.state, "Recorder start ignored");
            return self.state;
        }

        let primary = self.target();
        self.state = RecorderState::Starting;
        info!(
            session_id = %self.session_id,
            format = %primary.format,
            path = %primary.path.display(),
            "Recorder start"
        );

        let first_error = match self.writer.start().await {
            Ok(()) => {
                self.state = RecorderState::Started;
                info!(session_id = %self.session_id, path = %primary.path.display(), "Recorder started");
                return self.state;
            }
            Err(e) => e,
        };

        self.metrics.recorder_start_failed();
        warn!(
            session_id = %self.session_id,
            format = %primary.format,
            error = %first_error,
            "Recorder start failed"
        );

        if self.fallback == primary.format {
            self.fail().await;
            error!(session_id = %self.session_id, "No distinct fallback format; session continues without recording");
            return self.state;
        }

        self.state = RecorderState::FallbackStarting;
        if let Err(e) = self.writer.stop().await {
            debug!(session_id = %self.session_id, error = %e, "Stopping half-started writer failed");
        }
        let tracks = self.writer.detach_tracks().await;

        let fallback = RecordingTarget::in_dir(&self.dir, &self.session_id, self.fallback);
        info!(
            session_id = %self.session_id,
            format = %fallback.format,
            path = %fallback.path.display(),
            tracks = tracks.len(),
            "Recorder fallback start"
        );
        *self.target.write() = fallback.clone();
        self.writer = self.factory.create(&fallback);
        for input in tracks {
            if let Err(e) = self.writer.add_track(input).await {
                warn!(session_id = %self.session_id, error = %e, "Re-attaching track failed");
            }
        }

        match self.writer.start().await {
            Ok(()) => {
                self.state = RecorderState::Started;
                self.metrics.recorder_fell_back();
                info!(session_id = %self.session_id, path = %fallback.path.display(), "Recorder fallback started");
            }
            Err(e) => {
                self.fail().await;
                self.metrics.recorder_start_failed();
                error!(
                    session_id = %self.session_id,
                    format = %fallback.format,
                    error = %e,
                    "Recorder fallback failed; session continues without recording"
                );
            }
        }
        self.state
    }

    /// Flush and close the writer; best-effort and a no-op unless started
    pub async fn stop(&mut self) {
        if self.state != RecorderState::Started {
            debug!(session_id = %self.session_id, state = ?self.state, "Recorder stop skipped");
            return;
        }
        let path = self.target().path;
        info!(session_id = %self.session_id, path = %path.display(), "Recorder stop");
        match self.writer.stop().await {
            Ok(()) => info!(session_id = %self.session_id, path = %path.display(), "Recorder stopped"),
            Err(e) => warn!(session_id = %self.session_id, error = %e, "Recorder stop failed"),
        }
        self.state = RecorderState::Stopped;
    }

    /// Whether a recording file is expected on disk
    pub fn has_recording(&self) -> bool {
        matches!(self.state, RecorderState::Started | RecorderState::Stopped)
    }
}

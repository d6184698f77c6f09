//! Aggregate state of one capture session

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::analysis::AnalysisSummary;
use crate::media::ContainerFormat;
use crate::recorder::{RecorderController, RecorderState, SharedTarget, TrackInput};
use crate::Result;

/// Storage keys of a finalized session; either may be absent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactKeys {
    pub video_key: Option<String>,
    pub audio_key: Option<String>,
}

/// Held for the whole finalize run; `keys` is set once finalize completed
#[derive(Debug, Default)]
pub(crate) struct FinalizeState {
    pub(crate) keys: Option<ArtifactKeys>,
}

/// State of one active capture
pub struct SessionState {
    pub session_id: String,
    pub transport_id: String,
    pub user_id: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Per-session temporary directory, removed by finalize
    pub tmp_dir: PathBuf,

    recorder: Mutex<RecorderController>,
    target: SharedTarget,
    recorder_started: AtomicBool,
    start_requested: AtomicBool,
    start_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,

    analysis: parking_lot::Mutex<Vec<JoinHandle<AnalysisSummary>>>,
    track_pumps: parking_lot::Mutex<Vec<JoinHandle<()>>>,

    finalize: Mutex<FinalizeState>,
    finalized: AtomicBool,
    cached_keys: parking_lot::Mutex<Option<ArtifactKeys>>,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        transport_id: impl Into<String>,
        user_id: Option<String>,
        tmp_dir: impl Into<PathBuf>,
        recorder: RecorderController,
    ) -> Self {
        let target = recorder.shared_target();
        Self {
            session_id: session_id.into(),
            transport_id: transport_id.into(),
            user_id,
            started_at: Utc::now(),
            tmp_dir: tmp_dir.into(),
            recorder: Mutex::new(recorder),
            target,
            recorder_started: AtomicBool::new(false),
            start_requested: AtomicBool::new(false),
            start_handle: parking_lot::Mutex::new(None),
            analysis: parking_lot::Mutex::new(Vec::new()),
            track_pumps: parking_lot::Mutex::new(Vec::new()),
            finalize: Mutex::new(FinalizeState::default()),
            finalized: AtomicBool::new(false),
            cached_keys: parking_lot::Mutex::new(None),
        }
    }

    /// Current recording file; changes at most once, on fallback
    pub fn recording_path(&self) -> PathBuf {
        self.target.read().path.clone()
    }

    pub fn container_format(&self) -> ContainerFormat {
        self.target.read().format
    }

    pub fn shared_target(&self) -> SharedTarget {
        Arc::clone(&self.target)
    }

    pub fn recorder_started(&self) -> bool {
        self.recorder_started.load(Ordering::SeqCst)
    }

    pub fn start_requested(&self) -> bool {
        self.start_requested.load(Ordering::SeqCst)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Keys cached by the first finalize
    pub fn artifact_keys(&self) -> Option<ArtifactKeys> {
        self.cached_keys.lock().clone()
    }

    pub(crate) fn recorder(&self) -> &Mutex<RecorderController> {
        &self.recorder
    }

    pub(crate) fn finalize_gate(&self) -> &Mutex<FinalizeState> {
        &self.finalize
    }

    pub(crate) fn mark_finalized(&self, keys: ArtifactKeys) {
        *self.cached_keys.lock() = Some(keys);
        self.finalized.store(true, Ordering::SeqCst);
    }

    /// Attach one tee output to the recorder
    pub async fn attach_track(&self, input: TrackInput) -> Result<()> {
        self.recorder.lock().await.add_track(input).await
    }

    /// Issue the recorder start at most once per session.
    ///
    /// The latch is taken before anything is awaited, so concurrent track
    /// arrivals cannot both start the recorder. The start itself runs in a
    /// task after `settle`, giving companion tracks time to attach.
    pub fn request_recorder_start(self: &Arc<Self>, settle: Duration) -> bool {
        // Held until the handle is stored so finalize never misses it
        let mut slot = self.start_handle.lock();
        if self
            .start_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let state = session.recorder.lock().await.start().await;
            if state == RecorderState::Started {
                session.recorder_started.store(true, Ordering::SeqCst);
            }
            debug!(session_id = %session.session_id, state = ?state, "Recorder start settled");
        });
        *slot = Some(handle);
        true
    }

    pub(crate) fn take_start_handle(&self) -> Option<JoinHandle<()>> {
        self.start_handle.lock().take()
    }

    pub fn push_analysis(&self, handle: JoinHandle<AnalysisSummary>) {
        self.analysis.lock().push(handle);
    }

    pub fn push_track_pump(&self, handle: JoinHandle<()>) {
        self.track_pumps.lock().push(handle);
    }

    pub fn analysis_count(&self) -> usize {
        self.analysis.lock().len()
    }

    /// Abort analysis workers and track pumps; returns how many were running
    pub fn cancel_tasks(&self) -> usize {
        let analysis: Vec<_> = self.analysis.lock().drain(..).collect();
        let pumps: Vec<_> = self.track_pumps.lock().drain(..).collect();
        let mut running = 0;
        for handle in analysis.iter() {
            if !handle.is_finished() {
                running += 1;
            }
            handle.abort();
        }
        for handle in pumps.iter() {
            handle.abort();
        }
        if running > 0 {
            info!(session_id = %self.session_id, workers = running, "Cancelled analysis workers");
        }
        running
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("session_id", &self.session_id)
            .field("transport_id", &self.transport_id)
            .field("started_at", &self.started_at)
            .field("recording_path", &self.recording_path())
            .field("recorder_started", &self.recorder_started())
            .field("finalized", &self.is_finalized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CaptureMetrics;
    use crate::recorder::WriterFactory;
    use crate::testing::ScriptedWriterFactory;

    fn session(dir: &std::path::Path, factory: Arc<ScriptedWriterFactory>) -> Arc<SessionState> {
        let recorder = RecorderController::new(
            "s1",
            dir,
            ContainerFormat::Matroska,
            ContainerFormat::Webm,
            factory as Arc<dyn WriterFactory>,
            Arc::new(CaptureMetrics::new()),
        );
        Arc::new(SessionState::new("s1", "t1", None, dir, recorder))
    }

    #[tokio::test]
    async fn test_start_latch_issues_one_start() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedWriterFactory::new(vec![]));
        let state = session(dir.path(), Arc::clone(&factory));

        let results: Vec<bool> = (0..8)
            .map(|_| state.request_recorder_start(Duration::from_millis(5)))
            .collect();
        assert_eq!(results.iter().filter(|r| **r).count(), 1);

        state.take_start_handle().unwrap().await.unwrap();
        assert!(state.recorder_started());
        assert_eq!(factory.log.starts.lock().len(), 1);
        assert!(state.take_start_handle().is_none());
    }

    #[tokio::test]
    async fn test_fallback_changes_recording_path() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedWriterFactory::new(vec![ContainerFormat::Matroska]));
        let state = session(dir.path(), factory);
        assert_eq!(state.recording_path(), dir.path().join("s1.mkv"));

        state.request_recorder_start(Duration::ZERO);
        state.take_start_handle().unwrap().await.unwrap();

        assert_eq!(state.container_format(), ContainerFormat::Webm);
        assert_eq!(state.recording_path(), dir.path().join("s1.webm"));
    }

    #[tokio::test]
    async fn test_cancel_tasks_aborts_workers() {
        let dir = tempfile::tempdir().unwrap();
        let state = session(dir.path(), Arc::new(ScriptedWriterFactory::new(vec![])));
        state.push_analysis(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            AnalysisSummary::default()
        }));

        assert_eq!(state.analysis_count(), 1);
        assert_eq!(state.cancel_tasks(), 1);
        assert_eq!(state.analysis_count(), 0);
        assert!(state.artifact_keys().is_none());
    }
}

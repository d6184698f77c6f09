//! Per-session state machine driver
//!
//! Transport callbacks and the orchestrator never mutate a session
//! directly; they enqueue [`SessionEvent`]s that one driver task consumes in
//! order. Every teardown path (transport failure, explicit close,
//! replacement, shutdown) goes through [`SessionContext::teardown`] and so
//! through the same finalize gate.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::registry::SessionRegistry;
use super::state::{ArtifactKeys, SessionState};
use crate::analysis::AnalysisWorker;
use crate::finalize::Finalizer;
use crate::media::{IncomingTrack, MediaKind, RtpTee};
use crate::metadata::{MetadataStore, SessionCompletion};
use crate::metrics::CaptureMetrics;
use crate::recorder::TrackInput;
use crate::transport::{Transport, TransportState};

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// The transport reached a terminal state
    Transport(TransportState),
    /// The caller asked to close
    Explicit,
    /// A new offer arrived for the same session id
    Replaced,
    /// The process is shutting down
    Shutdown,
}

/// Input to a session driver
pub enum SessionEvent {
    TrackArrived(IncomingTrack),
    StateChanged(TransportState),
    CloseRequested {
        cause: CloseCause,
        reply: oneshot::Sender<ArtifactKeys>,
    },
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::TrackArrived(track) => f.debug_tuple("TrackArrived").field(&track.info).finish(),
            SessionEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            SessionEvent::CloseRequested { cause, .. } => {
                f.debug_struct("CloseRequested").field("cause", cause).finish()
            }
        }
    }
}

/// Collaborators shared by every session
pub struct SessionContext {
    pub registry: Arc<SessionRegistry>,
    pub finalizer: Finalizer,
    pub metadata: Arc<dyn MetadataStore>,
    pub metrics: Arc<CaptureMetrics>,
    pub track_settle: Duration,
    pub analysis_window: Duration,
}

impl SessionContext {
    /// Tear a session down and return whatever keys finalize produced.
    ///
    /// A transport-driven teardown finalizes before closing so the recorder
    /// drains what already arrived; the other causes close first so no more
    /// media arrives while finalizing. Finalize errors are logged and
    /// counted, never raised.
    pub async fn teardown(
        &self,
        state: &Arc<SessionState>,
        transport: &Arc<dyn Transport>,
        cause: CloseCause,
    ) -> ArtifactKeys {
        info!(
            session_id = %state.session_id,
            transport_id = %state.transport_id,
            cause = ?cause,
            "Session teardown"
        );

        let keys = match cause {
            CloseCause::Transport(_) => {
                let keys = self.finalize_logged(state).await;
                self.close_transport(state, transport).await;
                state.cancel_tasks();
                keys
            }
            CloseCause::Explicit | CloseCause::Replaced | CloseCause::Shutdown => {
                self.close_transport(state, transport).await;
                state.cancel_tasks();
                self.finalize_logged(state).await
            }
        };

        if self
            .registry
            .remove_if_transport(&state.session_id, &state.transport_id)
            .await
        {
            self.metrics.session_ended();
        }

        // A replacement writes its own row right after this
        if cause != CloseCause::Replaced {
            self.complete_metadata(&state.session_id, &keys).await;
        }
        keys
    }

    /// Mark the metadata row completed; failures are logged only
    pub async fn complete_metadata(&self, session_id: &str, keys: &ArtifactKeys) {
        let completion = SessionCompletion::completed(keys.video_key.clone(), keys.audio_key.clone());
        match self.metadata.complete_session(session_id, &completion).await {
            Ok(()) => debug!(session_id = %session_id, "Metadata row completed"),
            Err(e) => warn!(session_id = %session_id, error = %e, "Metadata update failed"),
        }
    }

    async fn finalize_logged(&self, state: &Arc<SessionState>) -> ArtifactKeys {
        match self.finalizer.finalize(state).await {
            Ok(keys) => keys,
            Err(e) => {
                self.metrics.finalize_error_swallowed();
                warn!(session_id = %state.session_id, error = %e, "Finalize reported an error");
                state.artifact_keys().unwrap_or_default()
            }
        }
    }

    async fn close_transport(&self, state: &SessionState, transport: &Arc<dyn Transport>) {
        if let Err(e) = transport.close().await {
            warn!(session_id = %state.session_id, transport_id = %transport.id(), error = %e, "Transport close failed");
        }
    }
}

/// Consumes one session's events until it is torn down
pub struct SessionDriver {
    state: Arc<SessionState>,
    transport: Arc<dyn Transport>,
    ctx: Arc<SessionContext>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    transport_state: TransportState,
}

impl SessionDriver {
    pub fn new(
        state: Arc<SessionState>,
        transport: Arc<dyn Transport>,
        ctx: Arc<SessionContext>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        Self {
            state,
            transport,
            ctx,
            events,
            transport_state: TransportState::New,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                SessionEvent::TrackArrived(track) => self.on_track(track).await,
                SessionEvent::StateChanged(next) => {
                    info!(
                        session_id = %self.state.session_id,
                        from = %self.transport_state,
                        to = %next,
                        "Transport state changed"
                    );
                    self.transport_state = next;
                    if next.is_terminal() {
                        self.ctx
                            .teardown(&self.state, &self.transport, CloseCause::Transport(next))
                            .await;
                        break;
                    }
                }
                SessionEvent::CloseRequested { cause, reply } => {
                    let keys = self.ctx.teardown(&self.state, &self.transport, cause).await;
                    let _ = reply.send(keys);
                    break;
                }
            }
        }
        debug!(session_id = %self.state.session_id, "Session driver exited");
    }

    async fn on_track(&mut self, track: IncomingTrack) {
        let IncomingTrack { info, source } = track;
        let session_id = self.state.session_id.clone();
        info!(
            session_id = %session_id,
            kind = %info.kind,
            codec = %info.codec.mime_type,
            track_id = %info.track_id,
            "Track arrived"
        );

        // Outputs are wired before the pump starts so neither misses a packet
        let tee = Arc::new(RtpTee::new());
        let recorder_rx = tee.subscribe();
        let analysis_rx = tee.subscribe();
        self.state.push_track_pump(source.spawn_pump(Arc::clone(&tee)));

        if let Err(e) = self
            .state
            .attach_track(TrackInput {
                info: info.clone(),
                frames: recorder_rx,
            })
            .await
        {
            warn!(session_id = %session_id, kind = %info.kind, error = %e, "Attaching track to recorder failed");
        }

        let mut worker = AnalysisWorker::new(session_id.clone(), info.kind, self.ctx.analysis_window);
        if info.kind == MediaKind::Video {
            worker = worker.with_recording_probe(self.state.shared_target());
        }
        self.state.push_analysis(worker.spawn(analysis_rx));

        if self.state.request_recorder_start(self.ctx.track_settle) {
            debug!(session_id = %session_id, "Recorder start requested");
        }
    }
}

//! Top-level capture orchestrator
//!
//! Owns the session registry and the shared collaborators, and exposes the
//! operations behind the HTTP surface: accept an offer, close a session,
//! inspect a session and mint relay credentials.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::CaptureConfig;
use crate::credentials::{CredentialMinter, RelayCredentials};
use crate::finalize::Finalizer;
use crate::metadata::{MetadataStore, SessionRecord, SessionStatus};
use crate::metrics::{CaptureMetrics, MetricsSnapshot};
use crate::peer::WebRtcTransportFactory;
use crate::recorder::{FfmpegWriterFactory, RecorderController, WriterFactory};
use crate::session::{
    ArtifactKeys, CloseCause, SessionContext, SessionDriver, SessionEntry, SessionRegistry,
    SessionState,
};
use crate::storage::{session_prefix, ObjectStore, StoredObject};
use crate::supabase::{SupabaseMetadata, SupabaseStorage};
use crate::transcode::{FfmpegTranscoder, Transcoder};
use crate::transport::{ConnectRequest, TransportFactory};
use crate::{Error, Result};

/// Who sent an offer
#[derive(Debug, Clone, Default)]
pub struct CallerInfo {
    pub user_id: Option<String>,
    pub client_ip: String,
    pub user_agent: String,
}

/// A parsed negotiation request
#[derive(Debug, Clone)]
pub struct OfferRequest {
    pub session_id: Option<String>,
    pub sdp: String,
    pub sdp_type: String,
    pub caller: CallerInfo,
}

impl OfferRequest {
    /// Offer with the default `offer` type
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            session_id: None,
            sdp: sdp.into(),
            sdp_type: "offer".to_string(),
            caller: CallerInfo::default(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_caller(mut self, caller: CallerInfo) -> Self {
        self.caller = caller;
        self
    }
}

/// Answer for an accepted offer
#[derive(Debug, Clone)]
pub struct OfferAnswer {
    pub session_id: String,
    pub sdp: String,
}

/// Result of an explicit close
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseOutcome {
    /// Whether a live session existed for the id
    pub had_state: bool,
    pub keys: ArtifactKeys,
}

/// Introspection view of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionDebug {
    pub active: bool,
    pub transport_id: Option<String>,
    pub tmp_path: Option<String>,
    pub tmp_exists: bool,
    /// Zero when the file does not exist
    pub tmp_size: u64,
    pub bucket: String,
    pub objects: Vec<StoredObject>,
}

/// External collaborators of the orchestrator
pub struct Collaborators {
    pub store: Arc<dyn ObjectStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub transcoder: Arc<dyn Transcoder>,
    pub writers: Arc<dyn WriterFactory>,
    pub transports: Arc<dyn TransportFactory>,
}

impl Collaborators {
    /// Production wiring: REST storage and metadata, ffmpeg, WebRTC
    pub fn from_config(config: &CaptureConfig) -> Result<Self> {
        Ok(Self {
            store: Arc::new(SupabaseStorage::new(&config.storage)?),
            metadata: Arc::new(SupabaseMetadata::new(&config.storage)?),
            transcoder: Arc::new(FfmpegTranscoder::new(config.transcode.clone())),
            writers: Arc::new(FfmpegWriterFactory::from_config(config)),
            transports: Arc::new(WebRtcTransportFactory::new(
                config.session.ice_gather_timeout(),
            )?),
        })
    }
}

/// Accepts offers and owns every live session
pub struct CaptureOrchestrator {
    config: CaptureConfig,
    minter: CredentialMinter,
    ctx: Arc<SessionContext>,
    store: Arc<dyn ObjectStore>,
    writers: Arc<dyn WriterFactory>,
    transports: Arc<dyn TransportFactory>,
}

impl CaptureOrchestrator {
    pub fn new(config: CaptureConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            metadata,
            transcoder,
            writers,
            transports,
        } = collaborators;

        let metrics = Arc::new(CaptureMetrics::new());
        let finalizer = Finalizer::new(
            Arc::clone(&store),
            transcoder,
            Arc::clone(&metrics),
            &config,
        );
        let ctx = Arc::new(SessionContext {
            registry: Arc::new(SessionRegistry::new()),
            finalizer,
            metadata,
            metrics,
            track_settle: config.recorder.track_settle(),
            analysis_window: config.session.analysis_window(),
        });

        Self {
            minter: CredentialMinter::new(&config.turn),
            config,
            ctx,
            store,
            writers,
            transports,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    pub async fn active_sessions(&self) -> usize {
        self.ctx.registry.len().await
    }

    /// Negotiate a new session for an offer.
    ///
    /// A live session with the same id is torn down and finalized first.
    #[instrument(skip(self, request), fields(session_id = tracing::field::Empty))]
    pub async fn accept_offer(&self, request: OfferRequest) -> Result<OfferAnswer> {
        validate_offer(&request)?;

        let session_id = request
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::Span::current().record("session_id", session_id.as_str());

        if let Some(previous) = self.ctx.registry.get(&session_id).await {
            warn!(
                session_id = %session_id,
                transport_id = %previous.transport_id(),
                "Replacing live session for repeated offer"
            );
            self.ctx.metrics.zombie_replaced();
            self.close_entry(&previous, CloseCause::Replaced).await;
        }

        let transport_id = Uuid::new_v4().to_string();
        let tmp_dir = self.session_dir();
        tokio::fs::create_dir_all(&tmp_dir).await?;

        let recorder = RecorderController::new(
            session_id.clone(),
            &tmp_dir,
            self.config.recorder.format.live_format(),
            self.config.recorder.fallback_format,
            Arc::clone(&self.writers),
            Arc::clone(&self.ctx.metrics),
        );
        let state = Arc::new(SessionState::new(
            session_id.clone(),
            transport_id.clone(),
            request.caller.user_id.clone(),
            tmp_dir.clone(),
            recorder,
        ));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let negotiated = match self
            .transports
            .connect(ConnectRequest {
                session_id: &session_id,
                transport_id: &transport_id,
                offer_sdp: &request.sdp,
                rtc_config: self.minter.server_rtc_configuration(),
                events: events_tx.clone(),
            })
            .await
        {
            Ok(negotiated) => negotiated,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_dir_all(&tmp_dir).await {
                    debug!(path = %tmp_dir.display(), error = %rm, "Removing unused session directory failed");
                }
                return Err(e);
            }
        };

        let entry = SessionEntry::new(Arc::clone(&state), Arc::clone(&negotiated.transport), events_tx);
        if let Some(displaced) = self.ctx.registry.insert(entry).await {
            // A concurrent offer for the same id won the race to the registry
            warn!(transport_id = %displaced.transport_id(), "Displaced a concurrently installed session");
            self.ctx.metrics.zombie_replaced();
            self.ctx.metrics.session_ended();
            self.close_entry(&displaced, CloseCause::Replaced).await;
        }
        self.ctx.metrics.session_started();
        SessionDriver::new(
            Arc::clone(&state),
            negotiated.transport,
            Arc::clone(&self.ctx),
            events_rx,
        )
        .spawn();

        let record = SessionRecord {
            id: session_id.clone(),
            user_id: request.caller.user_id,
            started_at: state.started_at,
            client_ip: request.caller.client_ip,
            user_agent: request.caller.user_agent,
            status: SessionStatus::InProgress,
        };
        if let Err(e) = self.ctx.metadata.upsert_session(&record).await {
            warn!(session_id = %session_id, error = %e, "Metadata upsert failed");
        }

        info!(
            session_id = %session_id,
            transport_id = %transport_id,
            path = %state.recording_path().display(),
            "Session accepted"
        );
        Ok(OfferAnswer {
            session_id,
            sdp: negotiated.answer_sdp,
        })
    }

    /// Close a session and finalize it synchronously.
    ///
    /// An unknown id is not an error: the metadata row is still marked
    /// completed and the outcome reports `had_state = false`.
    pub async fn close_session(&self, session_id: &str) -> CloseOutcome {
        match self.ctx.registry.get(session_id).await {
            Some(entry) => {
                let keys = self.close_entry(&entry, CloseCause::Explicit).await;
                CloseOutcome {
                    had_state: true,
                    keys,
                }
            }
            None => {
                info!(session_id = %session_id, "Close for unknown session");
                let keys = ArtifactKeys::default();
                self.ctx.complete_metadata(session_id, &keys).await;
                CloseOutcome {
                    had_state: false,
                    keys,
                }
            }
        }
    }

    /// Inspect a session's temporary file and uploaded objects
    pub async fn debug_session(&self, session_id: &str) -> SessionDebug {
        let entry = self.ctx.registry.get(session_id).await;

        let (transport_id, tmp_path, tmp_size) = match &entry {
            Some(entry) => {
                let path = entry.state.recording_path();
                let size = tokio::fs::metadata(&path).await.ok().map(|m| m.len());
                (
                    Some(entry.transport_id().to_string()),
                    Some(path.display().to_string()),
                    size,
                )
            }
            None => (None, None, None),
        };

        let objects = match self.store.list(&session_prefix(session_id)).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Listing session objects failed");
                Vec::new()
            }
        };

        SessionDebug {
            active: entry.is_some(),
            transport_id,
            tmp_path,
            tmp_exists: tmp_size.is_some(),
            tmp_size: tmp_size.unwrap_or(0),
            bucket: self.store.bucket().to_string(),
            objects,
        }
    }

    pub fn mint_credentials(&self) -> Result<RelayCredentials> {
        self.minter.mint()
    }

    /// Close every live session through the finalize gate
    pub async fn shutdown_all(&self) {
        let entries = self.ctx.registry.entries().await;
        if entries.is_empty() {
            return;
        }
        info!(sessions = entries.len(), "Closing live sessions");
        futures::future::join_all(
            entries
                .iter()
                .map(|entry| self.close_entry(entry, CloseCause::Shutdown)),
        )
        .await;
    }

    /// Route a close through the session driver, or tear down directly when
    /// the driver is already gone.
    async fn close_entry(&self, entry: &SessionEntry, cause: CloseCause) -> ArtifactKeys {
        if let Some(reply) = entry.request_close(cause) {
            if let Ok(keys) = reply.await {
                return keys;
            }
        }
        debug!(session_id = %entry.session_id(), "Driver gone; tearing down directly");
        self.ctx
            .teardown(&entry.state, &entry.transport, cause)
            .await
    }

    fn session_dir(&self) -> PathBuf {
        self.config
            .recorder
            .tmp_dir
            .join(format!("capture_{}", Uuid::new_v4().simple()))
    }
}

fn validate_offer(request: &OfferRequest) -> Result<()> {
    if request.sdp_type != "offer" {
        return Err(Error::SdpError(format!(
            "Expected an offer, got type '{}'",
            request.sdp_type
        )));
    }
    let sdp = request.sdp.trim_start();
    if sdp.is_empty() {
        return Err(Error::SdpError("Offer SDP is empty".to_string()));
    }
    if !sdp.starts_with("v=") {
        return Err(Error::SdpError("Offer is not a session description".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_offer() {
        assert!(validate_offer(&OfferRequest::new("v=0\r\n")).is_ok());

        let empty = validate_offer(&OfferRequest::new("  ")).unwrap_err();
        assert!(empty.is_negotiation_error());

        let garbage = validate_offer(&OfferRequest::new("hello")).unwrap_err();
        assert!(garbage.is_negotiation_error());

        let mut answer = OfferRequest::new("v=0\r\n");
        answer.sdp_type = "answer".to_string();
        assert!(validate_offer(&answer).unwrap_err().is_negotiation_error());
    }
}

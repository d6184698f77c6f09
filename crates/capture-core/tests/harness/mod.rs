//! Session test harness
//!
//! Builds a [`CaptureOrchestrator`] over in-process doubles:
//! - loopback transport that records every negotiated connection
//! - scripted container writers (optionally failing per format)
//! - scripted transcoder
//! - in-memory object and metadata stores
//!
//! Tests drive a session by emitting tracks and state changes on the
//! loopback connection, then assert on what reached the stores.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use capture_core::media::ContainerFormat;
use capture_core::metadata::MemoryMetadataStore;
use capture_core::storage::MemoryObjectStore;
use capture_core::testing::{
    LoopbackConnection, LoopbackTransportFactory, ScriptedTranscoder, ScriptedWriterFactory,
};
use capture_core::{CaptureConfig, CaptureOrchestrator, Collaborators, OfferRequest};

/// Minimal offer accepted by the loopback transport
pub const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,capture_core=debug")
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub orchestrator: CaptureOrchestrator,
    pub transports: Arc<LoopbackTransportFactory>,
    pub writers: Arc<ScriptedWriterFactory>,
    pub transcoder: Arc<ScriptedTranscoder>,
    pub store: Arc<MemoryObjectStore>,
    pub metadata: Arc<MemoryMetadataStore>,
    pub tmp: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_formats(ContainerFormat::Mp4, ContainerFormat::Matroska, vec![])
    }

    /// Harness whose writers fail to start for the `failing` formats
    pub fn with_formats(
        format: ContainerFormat,
        fallback: ContainerFormat,
        failing: Vec<ContainerFormat>,
    ) -> Self {
        init_logging();
        let tmp = tempfile::tempdir().expect("tempdir");

        let mut config = CaptureConfig::default();
        config.recorder.format = format;
        config.recorder.fallback_format = fallback;
        config.recorder.tmp_dir = tmp.path().to_path_buf();
        config.recorder.track_settle_ms = 10;
        config.recorder.start_wait_secs = 2;
        config.session.flush_checks = 2;
        config.session.flush_interval_ms = 1;
        config.session.analysis_window_secs = 1;

        let transports = Arc::new(LoopbackTransportFactory::new());
        let writers = Arc::new(ScriptedWriterFactory::new(failing));
        let transcoder = Arc::new(ScriptedTranscoder::new());
        let store = Arc::new(MemoryObjectStore::new("recordings"));
        let metadata = Arc::new(MemoryMetadataStore::new());

        let orchestrator = CaptureOrchestrator::new(
            config,
            Collaborators {
                store: store.clone(),
                metadata: metadata.clone(),
                transcoder: transcoder.clone(),
                writers: writers.clone(),
                transports: transports.clone(),
            },
        );

        Self {
            orchestrator,
            transports,
            writers,
            transcoder,
            store,
            metadata,
            tmp,
        }
    }

    /// Accept an offer for `session_id` and return its loopback connection
    pub async fn offer(&self, session_id: &str) -> LoopbackConnection {
        let answer = self
            .orchestrator
            .accept_offer(OfferRequest::new(OFFER).with_session_id(session_id))
            .await
            .expect("offer accepted");
        assert_eq!(answer.session_id, session_id);
        assert!(answer.sdp.starts_with("v=0"));
        self.transports
            .latest(session_id)
            .expect("loopback connection recorded")
    }

    /// Number of entries left under the temporary root
    pub fn tmp_entries(&self) -> usize {
        std::fs::read_dir(self.tmp.path())
            .map(|dir| dir.count())
            .unwrap_or(0)
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

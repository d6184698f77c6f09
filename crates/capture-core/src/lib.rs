//! Capture Core
//!
//! Receives browser media over WebRTC, records it to a temporary container
//! file, and on session end derives browser-friendly artifacts and uploads
//! them to object storage.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                          CaptureOrchestrator                          │
//! │  accept_offer ─┬─▶ TransportFactory (webrtc) ──events──┐              │
//! │                │                                        ▼              │
//! │                └─▶ SessionRegistry ◀──────────── SessionDriver         │
//! │                                                        │ TrackArrived  │
//! │                                                        ▼               │
//! │                   ┌──────────── TrackTee ─────────────┐                │
//! │                   ▼                                    ▼               │
//! │          RecorderController                     AnalysisWorker         │
//! │          (ffmpeg, fallback)                     (throughput)           │
//! │                   │                                                    │
//! │                   ▼ terminal state / close / replace / shutdown        │
//! │               Finalizer ─▶ Transcoder ─▶ ObjectStore ─▶ MetadataStore  │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every teardown path converges on one per-session finalize gate, so
//! artifacts are uploaded at most once per session.

pub mod analysis;
pub mod config;
pub mod credentials;
pub mod error;
pub mod finalize;
pub mod media;
pub mod metadata;
pub mod metrics;
pub mod orchestrator;
pub mod peer;
pub mod recorder;
pub mod session;
pub mod storage;
pub mod supabase;
pub mod tee;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transcode;
pub mod transport;

pub use config::CaptureConfig;
pub use error::{Error, Result};
pub use orchestrator::{
    CallerInfo, CaptureOrchestrator, CloseOutcome, Collaborators, OfferAnswer, OfferRequest,
    SessionDebug,
};

//! Capture Gateway HTTP Service
//!
//! Authenticated HTTP front for [`capture_core`]: browsers post an SDP offer,
//! receive the answer, stream media over WebRTC, and close the session to get
//! the storage keys of the finalized recording and audio track.
//!
//! ```text
//!   client ──POST /webrtc/offer──▶ axum router ──▶ CallerIdentity (HS256)
//!                                      │
//!                                      ▼
//!                             CaptureOrchestrator ──▶ object store / metadata
//! ```

pub mod api;
pub mod auth;
pub mod config;

//! Counters for capture sessions
//!
//! Owned by the orchestrator and shared by reference; there is no global
//! instance.

use std::sync::atomic::{AtomicU64, Ordering};

/// Capture metrics collector
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    sessions_started: AtomicU64,
    sessions_finalized: AtomicU64,
    active_sessions: AtomicU64,
    zombie_replacements: AtomicU64,
    recorder_start_failures: AtomicU64,
    recorder_fallbacks: AtomicU64,
    transcode_failures: AtomicU64,
    audio_extraction_failures: AtomicU64,
    uploads_succeeded: AtomicU64,
    uploads_failed: AtomicU64,
    finalize_errors_swallowed: AtomicU64,
    startup_time: AtomicU64,
}

impl CaptureMetrics {
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        Self {
            startup_time: AtomicU64::new(now),
            ..Default::default()
        }
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session leaving the registry
    pub fn session_ended(&self) {
        // Saturating: a session torn down twice must not wrap the gauge
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn session_finalized(&self) {
        self.sessions_finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn zombie_replaced(&self) {
        self.zombie_replacements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recorder_start_failed(&self) {
        self.recorder_start_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recorder_fell_back(&self) {
        self.recorder_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transcode_failed(&self) {
        self.transcode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audio_extraction_failed(&self) {
        self.audio_extraction_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_succeeded(&self) {
        self.uploads_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_failed(&self) {
        self.uploads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finalize_error_swallowed(&self) {
        self.finalize_errors_swallowed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let uptime_secs = now.saturating_sub(self.startup_time.load(Ordering::Relaxed));

        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_finalized: self.sessions_finalized.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            zombie_replacements: self.zombie_replacements.load(Ordering::Relaxed),
            recorder_start_failures: self.recorder_start_failures.load(Ordering::Relaxed),
            recorder_fallbacks: self.recorder_fallbacks.load(Ordering::Relaxed),
            transcode_failures: self.transcode_failures.load(Ordering::Relaxed),
            audio_extraction_failures: self.audio_extraction_failures.load(Ordering::Relaxed),
            uploads_succeeded: self.uploads_succeeded.load(Ordering::Relaxed),
            uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
            finalize_errors_swallowed: self.finalize_errors_swallowed.load(Ordering::Relaxed),
            uptime_secs,
        }
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_finalized: u64,
    pub active_sessions: u64,
    pub zombie_replacements: u64,
    pub recorder_start_failures: u64,
    pub recorder_fallbacks: u64,
    pub transcode_failures: u64,
    pub audio_extraction_failures: u64,
    pub uploads_succeeded: u64,
    pub uploads_failed: u64,
    pub finalize_errors_swallowed: u64,
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Fraction of upload attempts that succeeded
    pub fn upload_success_rate(&self) -> f64 {
        let attempts = self.uploads_succeeded + self.uploads_failed;
        if attempts == 0 {
            1.0
        } else {
            self.uploads_succeeded as f64 / attempts as f64
        }
    }
}

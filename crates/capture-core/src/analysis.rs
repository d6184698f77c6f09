//! Lightweight streaming analysis
//!
//! One worker per (session, track) drains its own tee output and reports
//! throughput once per window. Workers only observe; they never touch
//! session state and end quietly on end-of-stream or cancellation.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};
use webrtc::rtp::packet::Packet;

use crate::media::MediaKind;
use crate::recorder::SharedTarget;
use crate::tee::TeeReceiver;

/// Audio timestamp jumps above this many samples are treated as gaps
const MAX_AUDIO_STEP: u32 = 48_000;

/// Totals reported by a worker when it ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisSummary {
    /// Packets drained from the tee
    pub packets: u64,
    /// Frames (video) or samples (audio) counted
    pub units: u64,
    /// Reporting windows emitted
    pub windows: u64,
}

/// Per-track throughput reporter
pub struct AnalysisWorker {
    session_id: String,
    kind: MediaKind,
    window: Duration,
    recording: Option<SharedTarget>,
}

impl AnalysisWorker {
    pub fn new(session_id: impl Into<String>, kind: MediaKind, window: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            window,
            recording: None,
        }
    }

    /// Also log the recording file's size every window
    pub fn with_recording_probe(mut self, target: SharedTarget) -> Self {
        self.recording = Some(target);
        self
    }

    pub fn spawn(self, rx: TeeReceiver<Packet>) -> JoinHandle<AnalysisSummary> {
        tokio::spawn(self.run(rx))
    }

    pub async fn run(self, mut rx: TeeReceiver<Packet>) -> AnalysisSummary {
        let mut meter = ThroughputMeter::new(self.kind);
        let mut summary = AnalysisSummary::default();
        let mut window_units = 0u64;

        let mut ticker = interval_at(Instant::now() + self.window, self.window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(packet) => {
                        let units = meter.observe(&packet);
                        summary.packets += 1;
                        summary.units += units;
                        window_units += units;
                    }
                    None => {
                        debug!(
                            session_id = %self.session_id,
                            kind = %self.kind,
                            packets = summary.packets,
                            "Analysis stream ended"
                        );
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.report(window_units).await;
                    summary.windows += 1;
                    window_units = 0;
                }
            }
        }

        summary
    }

    async fn report(&self, units: u64) {
        let secs = self.window.as_secs_f64().max(f64::EPSILON);
        match self.kind {
            MediaKind::Video => {
                info!(
                    session_id = %self.session_id,
                    frames = units,
                    fps = units as f64 / secs,
                    "Video throughput"
                );
                if let Some(target) = &self.recording {
                    let path = target.read().path.clone();
                    let (exists, size) = match tokio::fs::metadata(&path).await {
                        Ok(meta) => (true, meta.len() as i64),
                        Err(_) => (false, -1),
                    };
                    info!(
                        session_id = %self.session_id,
                        exists,
                        size,
                        path = %path.display(),
                        "Midstream recording probe"
                    );
                }
            }
            MediaKind::Audio => {
                info!(
                    session_id = %self.session_id,
                    samples = units,
                    window_secs = secs,
                    "Audio throughput"
                );
            }
        }
    }
}

/// Counts frames for video and samples for audio from RTP headers.
///
/// A video frame ends on a packet carrying the marker bit; audio samples are
/// the RTP timestamp advance between consecutive packets.
struct ThroughputMeter {
    kind: MediaKind,
    last_timestamp: Option<u32>,
}

impl ThroughputMeter {
    fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            last_timestamp: None,
        }
    }

    fn observe(&mut self, packet: &Packet) -> u64 {
        match self.kind {
            MediaKind::Video => u64::from(packet.header.marker),
            MediaKind::Audio => {
                let ts = packet.header.timestamp;
                let step = match self.last_timestamp {
                    Some(prev) => ts.wrapping_sub(prev),
                    None => 0,
                };
                self.last_timestamp = Some(ts);
                if step > MAX_AUDIO_STEP {
                    0
                } else {
                    u64::from(step)
                }
            }
        }
    }
}

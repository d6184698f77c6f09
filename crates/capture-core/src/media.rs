//! Media descriptors shared by the tee, recorder and analysis workers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use webrtc::rtp::packet::Packet;

use crate::tee::TrackTee;

/// Tee over inbound RTP packets
pub type RtpTee = TrackTee<Packet>;

/// Kind of an inbound media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Negotiated codec of an inbound track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    /// MIME type as negotiated, e.g. `video/VP8` or `audio/opus`
    pub mime_type: String,
    /// RTP clock rate in Hz
    pub clock_rate: u32,
    /// Channel count (audio only, 0 when unspecified)
    pub channels: u16,
    /// RTP payload type used on the wire
    pub payload_type: u8,
}

impl CodecInfo {
    /// Encoding name as used in an SDP `a=rtpmap` line
    pub fn encoding_name(&self) -> &str {
        self.mime_type
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.mime_type)
    }

    /// Opus at 48 kHz stereo, the default WebRTC audio codec
    pub fn opus(payload_type: u8) -> Self {
        Self {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            payload_type,
        }
    }

    /// VP8 at the 90 kHz video clock
    pub fn vp8(payload_type: u8) -> Self {
        Self {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            payload_type,
        }
    }
}

/// Identity and codec of one inbound track
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub track_id: String,
    pub kind: MediaKind,
    pub codec: CodecInfo,
}

/// Upstream source of packets for one inbound track
///
/// The transport hands one of these to the session driver, which wires the
/// tee outputs before any packet is read so no consumer misses the start of
/// the stream.
pub trait TrackSource: Send {
    /// Start reading packets into `tee`; the tee must be closed when the
    /// upstream ends.
    fn spawn_pump(self: Box<Self>, tee: Arc<RtpTee>) -> JoinHandle<()>;
}

/// A track announced by the transport
pub struct IncomingTrack {
    pub info: TrackInfo,
    pub source: Box<dyn TrackSource>,
}

impl fmt::Debug for IncomingTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingTrack")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Container format of a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ContainerFormat {
    Mp4,
    Webm,
    Matroska,
}

impl ContainerFormat {
    /// Normalize a user supplied format name; unknown names map to mp4
    pub fn normalize(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "mkv" | "matroska" => ContainerFormat::Matroska,
            "webm" => ContainerFormat::Webm,
            _ => ContainerFormat::Mp4,
        }
    }

    /// File extension including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => ".mp4",
            ContainerFormat::Webm => ".webm",
            ContainerFormat::Matroska => ".mkv",
        }
    }

    /// Muxer name understood by ffmpeg's `-f`
    pub fn muxer(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Webm => "webm",
            ContainerFormat::Matroska => "matroska",
        }
    }

    /// Format actually written while the session is live.
    ///
    /// Live mp4 muxing produces non-monotonic timestamps, so an mp4 preference
    /// is recorded as matroska and converted during finalize.
    pub fn live_format(&self) -> Self {
        match self {
            ContainerFormat::Mp4 => ContainerFormat::Matroska,
            other => *other,
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.muxer())
    }
}

impl From<String> for ContainerFormat {
    fn from(s: String) -> Self {
        ContainerFormat::normalize(&s)
    }
}

impl From<ContainerFormat> for String {
    fn from(f: ContainerFormat) -> Self {
        f.muxer().to_string()
    }
}

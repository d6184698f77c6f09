//! In-process doubles for the external collaborators
//!
//! Scripted container writers, a scripted transcoder and a loopback
//! transport let the session machinery run without ffmpeg, a browser or a
//! network. Together with [`MemoryObjectStore`](crate::storage::MemoryObjectStore)
//! and [`MemoryMetadataStore`](crate::metadata::MemoryMetadataStore) they back
//! the test suites of this crate and of the server.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use crate::media::{CodecInfo, ContainerFormat, IncomingTrack, MediaKind, RtpTee, TrackInfo, TrackSource};
use crate::recorder::{ContainerWriter, RecordingTarget, TrackInput, WriterFactory};
use crate::session::SessionEvent;
use crate::transcode::Transcoder;
use crate::transport::{
    ConnectRequest, EventSender, Negotiated, Transport, TransportFactory, TransportState,
};
use crate::{Error, Result};

/// What scripted writers were asked to do
#[derive(Debug, Default)]
pub struct WriterLog {
    pub created: Mutex<Vec<RecordingTarget>>,
    pub starts: Mutex<Vec<ContainerFormat>>,
    pub stops: Mutex<usize>,
    pub attached: Mutex<Vec<(ContainerFormat, String)>>,
}

/// Writer factory whose writers refuse to start for the listed formats.
///
/// A started writer puts a few bytes at its target path, standing in for
/// the container file.
pub struct ScriptedWriterFactory {
    pub failing: Vec<ContainerFormat>,
    pub log: Arc<WriterLog>,
}

impl ScriptedWriterFactory {
    pub fn new(failing: Vec<ContainerFormat>) -> Self {
        Self {
            failing,
            log: Arc::new(WriterLog::default()),
        }
    }
}

impl WriterFactory for ScriptedWriterFactory {
    fn create(&self, target: &RecordingTarget) -> Box<dyn ContainerWriter> {
        self.log.created.lock().push(target.clone());
        Box::new(ScriptedWriter {
            target: target.clone(),
            fail: self.failing.contains(&target.format),
            tracks: Vec::new(),
            log: Arc::clone(&self.log),
        })
    }
}

struct ScriptedWriter {
    target: RecordingTarget,
    fail: bool,
    tracks: Vec<TrackInput>,
    log: Arc<WriterLog>,
}

#[async_trait]
impl ContainerWriter for ScriptedWriter {
    async fn add_track(&mut self, input: TrackInput) -> Result<()> {
        self.log
            .attached
            .lock()
            .push((self.target.format, input.info.track_id.clone()));
        self.tracks.push(input);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.log.starts.lock().push(self.target.format);
        if self.fail {
            return Err(Error::RecorderError(format!(
                "{} muxer refused the stream",
                self.target.format
            )));
        }
        tokio::fs::write(&self.target.path, b"recorded").await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        *self.log.stops.lock() += 1;
        Ok(())
    }

    async fn detach_tracks(&mut self) -> Vec<TrackInput> {
        std::mem::take(&mut self.tracks)
    }
}

/// Transcoder that writes placeholder outputs, or fails on request
#[derive(Debug, Default)]
pub struct ScriptedTranscoder {
    fail_audio: AtomicBool,
    fail_video: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_audio(&self) {
        self.fail_audio.store(true, Ordering::SeqCst);
    }

    pub fn fail_video(&self) {
        self.fail_video.store(true, Ordering::SeqCst);
    }

    /// Number of transcoding steps invoked
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn extract_audio(&self, _input: &Path, output: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_audio.load(Ordering::SeqCst) {
            return Err(Error::TranscodeError("extract_audio: scripted failure".to_string()));
        }
        tokio::fs::write(output, b"RIFF....WAVE").await?;
        Ok(())
    }

    async fn transcode_video(&self, _input: &Path, output: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_video.load(Ordering::SeqCst) {
            return Err(Error::TranscodeError("transcode_video: scripted failure".to_string()));
        }
        tokio::fs::write(output, b"....ftypisom").await?;
        Ok(())
    }
}

/// Transport that only counts close calls
#[derive(Debug)]
pub struct StubTransport {
    id: String,
    closes: AtomicUsize,
}

impl StubTransport {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for StubTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One negotiated loopback connection
#[derive(Clone)]
pub struct LoopbackConnection {
    pub session_id: String,
    pub transport: Arc<StubTransport>,
    pub offer_sdp: String,
    events: EventSender,
}

impl LoopbackConnection {
    /// Deliver an event as the transport would
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn emit_state(&self, state: TransportState) -> bool {
        self.emit(SessionEvent::StateChanged(state))
    }

    /// Announce a track that delivers `packets` and then ends
    pub fn emit_track(&self, kind: MediaKind, packets: Vec<Packet>) -> bool {
        let codec = match kind {
            MediaKind::Audio => CodecInfo::opus(111),
            MediaKind::Video => CodecInfo::vp8(96),
        };
        self.emit(SessionEvent::TrackArrived(IncomingTrack {
            info: TrackInfo {
                track_id: format!("{}-{}", self.session_id, kind),
                kind,
                codec,
            },
            source: Box::new(ScriptedTrack { packets }),
        }))
    }
}

/// Answer returned by [`LoopbackTransportFactory`]
pub const LOOPBACK_ANSWER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=loopback\r\nt=0 0\r\n";

/// Transport factory that negotiates nothing and records every connection
#[derive(Default)]
pub struct LoopbackTransportFactory {
    connections: Mutex<Vec<LoopbackConnection>>,
    reject: AtomicBool,
}

impl LoopbackTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent offers fail negotiation
    pub fn reject_offers(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<LoopbackConnection> {
        self.connections.lock().clone()
    }

    /// Most recent connection for a session id
    pub fn latest(&self, session_id: &str) -> Option<LoopbackConnection> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| c.session_id == session_id)
            .cloned()
    }
}

#[async_trait]
impl TransportFactory for LoopbackTransportFactory {
    async fn connect(&self, request: ConnectRequest<'_>) -> Result<Negotiated> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(Error::SdpError("offer rejected by loopback transport".to_string()));
        }
        let transport = Arc::new(StubTransport::new(request.transport_id));
        self.connections.lock().push(LoopbackConnection {
            session_id: request.session_id.to_string(),
            transport: Arc::clone(&transport),
            offer_sdp: request.offer_sdp.to_string(),
            events: request.events,
        });
        Ok(Negotiated {
            transport,
            answer_sdp: LOOPBACK_ANSWER.to_string(),
        })
    }
}

/// Track source replaying a fixed list of packets
pub struct ScriptedTrack {
    pub packets: Vec<Packet>,
}

impl TrackSource for ScriptedTrack {
    fn spawn_pump(self: Box<Self>, tee: Arc<RtpTee>) -> JoinHandle<()> {
        tokio::spawn(async move {
            for packet in self.packets {
                tee.publish(packet);
            }
            tee.close();
        })
    }
}

/// `count` small RTP packets, every `frame_len`-th one ending a frame
pub fn rtp_packets(count: usize, frame_len: usize) -> Vec<Packet> {
    let frame_len = frame_len.max(1);
    (0..count)
        .map(|i| Packet {
            header: Header {
                version: 2,
                sequence_number: i as u16,
                timestamp: (i / frame_len) as u32 * 3000,
                marker: (i + 1) % frame_len == 0,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0u8; 16]),
        })
        .collect()
}

//! WebRTC peer connection controller
//!
//! Negotiates one receive-only peer connection per offer and reports its
//! tracks and connectivity changes to the session driver. The answer is
//! produced after ICE gathering completes or a short timeout elapses, since
//! the signaling exchange does not trickle candidates.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{CodecInfo, IncomingTrack, MediaKind, RtpTee, TrackInfo, TrackSource};
use crate::session::SessionEvent;
use crate::transport::{ConnectRequest, EventSender, Negotiated, Transport, TransportFactory};
use crate::{Error, Result};

/// Builds peer connections from remote offers
pub struct WebRtcTransportFactory {
    api: API,
    ice_gather_timeout: Duration,
}

impl WebRtcTransportFactory {
    pub fn new(ice_gather_timeout: Duration) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_gather_timeout,
        })
    }

    fn register_handlers(pc: &RTCPeerConnection, session_id: &str, events: EventSender) {
        let state_events = events.clone();
        let sid = session_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let events = state_events.clone();
            let sid = sid.clone();
            Box::pin(async move {
                debug!(session_id = %sid, state = %s, "Peer connection state");
                // The driver may already be gone after teardown
                let _ = events.send(SessionEvent::StateChanged(s.into()));
            })
        }));

        let sid = session_id.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            let sid = sid.clone();
            Box::pin(async move {
                let info = track_info(&track);
                info!(session_id = %sid, kind = %info.kind, codec = %info.codec.mime_type, "Remote track added");
                let _ = events.send(SessionEvent::TrackArrived(IncomingTrack {
                    info,
                    source: Box::new(RemoteTrackSource { track }),
                }));
            })
        }));
    }

    async fn negotiate(&self, pc: &RTCPeerConnection, offer_sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| Error::SdpError(format!("Invalid offer SDP: {}", e)))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create answer: {}", e)))?;

        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(self.ice_gather_timeout, gathered.recv())
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.ice_gather_timeout.as_millis() as u64,
                "ICE gathering incomplete; answering with the candidates found so far"
            );
        }

        pc.local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| Error::WebRtcError("No local description after negotiation".to_string()))
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    #[instrument(skip(self, request), fields(session_id = %request.session_id, transport_id = %request.transport_id))]
    async fn connect(&self, request: ConnectRequest<'_>) -> Result<Negotiated> {
        let relay_only = !request.rtc_config.ice_servers.is_empty();
        let pc = Arc::new(self.api.new_peer_connection(request.rtc_config).await?);
        Self::register_handlers(&pc, request.session_id, request.events);

        let answer_sdp = match self.negotiate(&pc, request.offer_sdp).await {
            Ok(sdp) => sdp,
            Err(e) => {
                if let Err(close_err) = pc.close().await {
                    debug!(error = %close_err, "Closing failed peer connection");
                }
                return Err(e);
            }
        };
        info!(relay_only, answer_len = answer_sdp.len(), "Answer ready");

        Ok(Negotiated {
            transport: Arc::new(PeerTransport {
                id: request.transport_id.to_string(),
                pc,
                closed: AtomicBool::new(false),
            }),
            answer_sdp,
        })
    }
}

/// A negotiated peer connection
pub struct PeerTransport {
    id: String,
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for PeerTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(transport_id = %self.id, "Closing peer connection");
        self.pc.close().await?;
        Ok(())
    }
}

/// Reads RTP from a remote track into a tee
struct RemoteTrackSource {
    track: Arc<TrackRemote>,
}

impl TrackSource for RemoteTrackSource {
    fn spawn_pump(self: Box<Self>, tee: Arc<RtpTee>) -> JoinHandle<()> {
        let track = self.track;
        tokio::spawn(async move {
            let mut packets = 0u64;
            loop {
                match track.read_rtp().await {
                    Ok((packet, _)) => {
                        packets += 1;
                        tee.publish(packet);
                    }
                    Err(e) => {
                        debug!(track_id = %track.id(), packets, error = %e, "Remote track ended");
                        break;
                    }
                }
            }
            tee.close();
        })
    }
}

fn track_info(track: &TrackRemote) -> TrackInfo {
    let codec = track.codec();
    let kind = match track.kind() {
        RTPCodecType::Audio => MediaKind::Audio,
        _ => MediaKind::Video,
    };
    TrackInfo {
        track_id: track.id(),
        kind,
        codec: CodecInfo {
            mime_type: codec.capability.mime_type,
            clock_rate: codec.capability.clock_rate,
            channels: codec.capability.channels,
            payload_type: track.payload_type(),
        },
    }
}

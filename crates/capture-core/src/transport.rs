//! Transport seam between the session machinery and the peer connection
//!
//! A transport reports tracks and connectivity changes as [`SessionEvent`]s
//! on the channel it is given at connect time; it never touches session
//! state directly.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::session::SessionEvent;
use crate::Result;

/// Channel a transport reports on
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Connectivity state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Failed and closed transports never recover
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

/// A live peer transport
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;

    /// Close the transport; closing twice is a no-op
    async fn close(&self) -> Result<()>;
}

/// Parameters for negotiating one transport
pub struct ConnectRequest<'a> {
    pub session_id: &'a str,
    pub transport_id: &'a str,
    pub offer_sdp: &'a str,
    pub rtc_config: RTCConfiguration,
    pub events: EventSender,
}

/// A negotiated transport and its answer
pub struct Negotiated {
    pub transport: Arc<dyn Transport>,
    pub answer_sdp: String,
}

/// Negotiates transports from remote offers
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, request: ConnectRequest<'_>) -> Result<Negotiated>;
}

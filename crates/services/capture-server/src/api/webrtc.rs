//! Capture session endpoints
//!
//! Negotiation, explicit close, introspection and relay credentials. Every
//! handler takes a [`CallerIdentity`], so unauthenticated requests are
//! rejected before any session work starts.

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use capture_core::credentials::RelayCredentials;
use capture_core::{CallerInfo, OfferRequest, SessionDebug};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::info;

use super::{ApiError, AppState};
use crate::auth::CallerIdentity;

/// `?session_id=` query parameter
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Structured offer body
#[derive(Debug, Deserialize)]
pub struct OfferBody {
    pub sdp: String,

    #[serde(rename = "type", default = "default_offer_type")]
    pub sdp_type: String,

    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_offer_type() -> String {
    "offer".to_string()
}

/// Response body for an explicit close
#[derive(Debug, Serialize, Deserialize)]
pub struct CloseResponse {
    pub status: String,
    pub storage_recording_key: Option<String>,
    pub storage_audio_key: Option<String>,
    pub had_state: bool,
}

/// Negotiate a capture session
///
/// POST /webrtc/offer
pub async fn offer(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Query(query): Query<SessionQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut request = parse_offer(&headers, &body)?;
    if let Some(id) = query.session_id.filter(|id| !id.trim().is_empty()) {
        request.session_id = Some(id);
    }
    request.caller = CallerInfo {
        user_id: Some(caller.user_id),
        client_ip: client_ip(&headers, connect_info.map(|ConnectInfo(addr)| addr)),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    };

    let answer = state.orchestrator.accept_offer(request).await?;
    info!(session_id = %answer.session_id, "Offer answered");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::HeaderName::from_static("x-session-id"), answer.session_id),
        ],
        answer.sdp,
    )
        .into_response())
}

/// Close and finalize a session
///
/// POST /webrtc/close?session_id=
pub async fn close(
    State(state): State<AppState>,
    _caller: CallerIdentity,
    Query(query): Query<SessionQuery>,
) -> Result<Json<CloseResponse>, ApiError> {
    let session_id = required_session_id(query)?;
    let outcome = state.orchestrator.close_session(&session_id).await;

    Ok(Json(CloseResponse {
        status: "closed".to_string(),
        storage_recording_key: outcome.keys.video_key,
        storage_audio_key: outcome.keys.audio_key,
        had_state: outcome.had_state,
    }))
}

/// Inspect a session
///
/// GET /webrtc/debug?session_id=
pub async fn debug(
    State(state): State<AppState>,
    _caller: CallerIdentity,
    Query(query): Query<SessionQuery>,
) -> Result<Json<SessionDebug>, ApiError> {
    let session_id = required_session_id(query)?;
    Ok(Json(state.orchestrator.debug_session(&session_id).await))
}

/// Mint relay credentials
///
/// GET /webrtc/turn-credentials
pub async fn turn_credentials(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<RelayCredentials>, ApiError> {
    let credentials = state.orchestrator.mint_credentials()?;
    info!(user_id = %caller.user_id, ttl = credentials.ttl, "Relay credentials issued");
    Ok(Json(credentials))
}

/// Raw SDP for `application/sdp`, otherwise a JSON [`OfferBody`]
fn parse_offer(headers: &HeaderMap, body: &[u8]) -> Result<OfferRequest, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.contains("application/sdp") {
        let sdp = std::str::from_utf8(body)
            .map_err(|_| ApiError::BadRequest("Offer SDP is not valid UTF-8".to_string()))?;
        return Ok(OfferRequest::new(sdp));
    }

    let parsed: OfferBody = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid offer body: {}", e)))?;
    let mut request = OfferRequest::new(parsed.sdp);
    request.sdp_type = parsed.sdp_type;
    request.session_id = parsed.session_id;
    Ok(request)
}

/// First `x-forwarded-for` entry, else the peer address
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}

fn required_session_id(query: SessionQuery) -> Result<String, ApiError> {
    query
        .session_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("session_id is required".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_parse_raw_sdp() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/sdp"));

        let request = parse_offer(&headers, b"v=0\r\n").unwrap();
        assert_eq!(request.sdp, "v=0\r\n");
        assert_eq!(request.sdp_type, "offer");
        assert!(request.session_id.is_none());
    }

    #[test]
    fn test_parse_json_offer() {
        let headers = HeaderMap::new();
        let body = br#"{"sdp":"v=0","type":"offer","session_id":"abc"}"#;

        let request = parse_offer(&headers, body).unwrap();
        assert_eq!(request.sdp, "v=0");
        assert_eq!(request.session_id.as_deref(), Some("abc"));

        let err = parse_offer(&headers, b"{not json").unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let peer: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(peer)), "10.0.0.9");
        assert_eq!(client_ip(&headers, None), "");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.7");
    }
}

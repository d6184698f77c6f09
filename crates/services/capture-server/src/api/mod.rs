//! HTTP API for the capture server
//!
//! - `POST /webrtc/offer` - Negotiate a capture session
//! - `POST /webrtc/close?session_id=` - Close and finalize a session
//! - `GET /webrtc/debug?session_id=` - Inspect a session
//! - `GET /webrtc/turn-credentials` - Mint relay credentials
//! - `GET /health` - Liveness
//! - `GET /metrics` - Capture metrics

pub mod webrtc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use capture_core::metrics::MetricsSnapshot;
use capture_core::CaptureOrchestrator;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::auth::{JwtError, JwtValidator};
use crate::config::Config;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Session orchestrator
    pub orchestrator: Arc<CaptureOrchestrator>,
    /// Caller token validator; `None` rejects every caller
    pub validator: Option<Arc<JwtValidator>>,
    /// Service configuration
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(orchestrator: Arc<CaptureOrchestrator>, config: Arc<Config>) -> Self {
        Self {
            validator: JwtValidator::from_config(&config.auth).map(Arc::new),
            orchestrator,
            config,
        }
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/webrtc/offer", post(webrtc::offer))
        .route("/webrtc/close", post(webrtc::close))
        .route("/webrtc/debug", get(webrtc::debug))
        .route("/webrtc/turn-credentials", get(webrtc::turn_credentials))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.orchestrator.metrics())
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Handler failure, rendered as an [`ErrorResponse`]
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Unauthorized(#[from] JwtError),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Capture(#[from] capture_core::Error),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Capture(e) if e.is_negotiation_error() => {
                (StatusCode::BAD_REQUEST, "negotiation_failed")
            }
            ApiError::Capture(capture_core::Error::RelayNotConfigured) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "relay_not_configured")
            }
            ApiError::Capture(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let mut response = (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message: self.to_string(),
            }),
        )
            .into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

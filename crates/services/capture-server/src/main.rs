//! Capture Gateway Binary
//!
//! Entry point for the WebRTC capture service.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capture_core::{CaptureOrchestrator, Collaborators};
use capture_server::{
    api::{build_router, AppState},
    config::Config,
};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!("Starting Capture Gateway...");

    let config = Config::load(std::env::var("CAPTURE_CONFIG").ok())?;
    config.capture.validate()?;
    let config = Arc::new(config);

    if config.auth.jwt_secret.is_none() {
        tracing::warn!("SUPABASE_JWT_SECRET is not set; every request will be rejected");
    }
    tracing::info!(
        http_port = config.server.http_port,
        format = ?config.capture.recorder.format,
        fallback = ?config.capture.recorder.fallback_format,
        relay = config.capture.turn.secret.is_some(),
        "Configuration loaded"
    );

    let collaborators = Collaborators::from_config(&config.capture)?;
    let orchestrator = Arc::new(CaptureOrchestrator::new(
        config.capture.clone(),
        collaborators,
    ));

    let state = AppState::new(orchestrator.clone(), config.clone());
    let router = build_router(state);

    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("HTTP server listening on {}", bind_addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, finalizing live sessions...");
    })
    .await?;

    orchestrator.shutdown_all().await;

    tracing::info!("Capture Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

//! Consultation Controller
//!
//! Stateful WebSocket signaling server for remote care consultations.
//!
//! # Servers
//!
//! The Consultation Controller runs two servers:
//! - WebSocket server for client signaling (default: 0.0.0.0:8440)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8441)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Build the admission gate (directory authorizer)
//! 4. Spawn the room registry actor
//! 5. Start the health HTTP server (liveness, readiness, metrics)
//! 6. Start the WebSocket signaling server
//! 7. Wait for shutdown signal, then drain via the cancellation tree

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use consult_controller::actors::{RegistrySettings, RoomRegistryHandle};
use consult_controller::admission::{AdmissionGate, DirectoryAuthorizer};
use consult_controller::config::Config;
use consult_controller::observability::{health_router, CoreMetrics, HealthState};
use consult_controller::transport::{signaling_router, AppState};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consult_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Consultation Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        controller_id = %config.controller_id,
        ws_bind_address = %config.ws_bind_address,
        health_bind_address = %config.health_bind_address,
        directory_url = %config.directory_url,
        authorization_timeout_ms = config.authorization_timeout_ms,
        idle_grace_seconds = config.idle_grace_seconds,
        sweep_interval_seconds = config.sweep_interval_seconds,
        max_rooms = config.max_rooms,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder before any metrics are
    // recorded
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus metrics recorder")?;
    info!("Prometheus metrics recorder initialized");

    // Initialize health state and shared metrics
    let health_state = Arc::new(HealthState::new());
    let metrics = CoreMetrics::new();

    // Build the admission gate around the directory authorizer
    let authorization_timeout = Duration::from_millis(config.authorization_timeout_ms);
    let authorizer = DirectoryAuthorizer::new(
        config.directory_url.clone(),
        config.directory_token.clone(),
        authorization_timeout,
    )
    .map_err(|e| {
        error!(error = %e, "Failed to build directory authorizer");
        e
    })?;
    let gate = Arc::new(AdmissionGate::new(
        Arc::new(authorizer),
        authorization_timeout,
        &config.fallback_stun_servers,
    ));
    info!("Admission gate initialized");

    // Spawn the room registry actor
    let registry = RoomRegistryHandle::new(
        config.controller_id.clone(),
        RegistrySettings {
            idle_grace: Duration::from_secs(config.idle_grace_seconds),
            sweep_interval: Duration::from_secs(config.sweep_interval_seconds),
            max_rooms: config.max_rooms as usize,
        },
        Arc::clone(&metrics),
    );
    info!("Room registry initialized");

    // Shutdown token: child of the registry's root token so one cancel
    // drains rooms and servers together
    let shutdown_token = registry.child_token();

    // Health server: bind before spawning to fail fast on bind errors
    let health_addr: SocketAddr = config
        .health_bind_address
        .parse()
        .with_context(|| format!("Invalid health bind address: {}", config.health_bind_address))?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("Failed to bind health server to {health_addr}"))?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        let server =
            axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
                health_shutdown_token.cancelled().await;
                info!("Health server shutting down");
            });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });
    info!(addr = %health_addr, "Health server started");

    // WebSocket signaling server
    let ws_addr: SocketAddr = config
        .ws_bind_address
        .parse()
        .with_context(|| format!("Invalid signaling bind address: {}", config.ws_bind_address))?;

    let app_state = Arc::new(AppState {
        registry: registry.clone(),
        gate,
        metrics: Arc::clone(&metrics),
    });
    let signaling_app = signaling_router(app_state).layer(TraceLayer::new_for_http());

    let ws_listener = tokio::net::TcpListener::bind(ws_addr)
        .await
        .with_context(|| format!("Failed to bind signaling server to {ws_addr}"))?;
    info!(addr = %ws_addr, "Signaling server bound successfully");

    let ws_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        let server =
            axum::serve(ws_listener, signaling_app).with_graceful_shutdown(async move {
                ws_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            });
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });
    info!(addr = %ws_addr, "Signaling server started");

    // Ready to admit consultations
    health_state.set_ready();

    // Wait for shutdown signal
    info!("Consultation Controller running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Stop admitting immediately so the load balancer drains us
    health_state.set_not_ready();

    // Cancel the root token: rooms notify their occupants and close,
    // servers stop accepting
    registry.cancel();

    // Give tasks time to shut down
    tokio::time::sleep(Duration::from_secs(2)).await;

    if let Ok(status) = registry.status().await {
        if status.room_count > 0 {
            warn!(rooms = status.room_count, "Rooms still draining at exit");
        }
    }

    info!("Consultation Controller shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable
/// because without signal handlers the service cannot shut down
/// gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

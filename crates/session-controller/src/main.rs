//! Session Controller
//!
//! WebSocket signaling server orchestrating multi-party WebRTC rooms.
//!
//! # Servers
//!
//! - HTTP server for signaling (`/ws`) and room introspection (`/rooms`)
//!   (default: 0.0.0.0:3016)
//! - HTTP server for health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Start the media engine workers and their death monitors
//! 4. Initialize actor system (`RoomRegistryActorHandle`)
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start signaling HTTP server
//! 7. Mark ready and wait for shutdown signal
//!
//! A worker death is fatal: the process marks itself not live, waits the
//! configured grace period and exits with status 1.

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use session_controller::actors::{ActorMetrics, RoomRegistryActorHandle, RoomSettings};
use session_controller::config::Config;
use session_controller::engine::local::LocalEngine;
use session_controller::engine::EngineWorker;
use session_controller::observability::{health_router, init_metrics_recorder, HealthState};
use session_controller::signaling::{signaling_router, SignalingState};
use session_controller::workers::{WorkerDeath, WorkerPool};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Session Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        num_workers = config.num_workers,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        max_rooms = config.max_rooms,
        consumers_start_paused = config.consumers_start_paused,
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Start media workers
    info!(count = config.num_workers, "Starting media workers...");
    let engine = LocalEngine::new(config.rtc_min_port, config.rtc_max_port);
    let workers: Vec<Arc<dyn EngineWorker>> = (0..config.num_workers)
        .map(|_| engine.spawn_worker() as Arc<dyn EngineWorker>)
        .collect();
    let pool = WorkerPool::new(workers)?;
    info!(workers = ?pool.worker_ids(), "Media workers started");

    // Initialize actor system
    info!("Initializing actor system...");
    let actor_metrics = ActorMetrics::new();
    let settings = RoomSettings {
        transport_options: config.transport_options(),
        consumers_start_paused: config.consumers_start_paused,
    };

    let (death_tx, mut death_rx) = mpsc::channel::<WorkerDeath>(config.num_workers);
    let monitors_token = tokio_util::sync::CancellationToken::new();
    let _monitors = pool.spawn_death_monitors(death_tx, monitors_token.clone());

    let registry = RoomRegistryActorHandle::new(
        config.instance_id.clone(),
        pool,
        settings,
        config.max_rooms,
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    let shutdown_token = registry.child_token();

    // Worker death is unrecoverable
    let death_health = Arc::clone(&health_state);
    let grace = config.worker_death_grace;
    tokio::spawn(async move {
        if let Some(death) = death_rx.recv().await {
            error!(
                worker_id = %death.worker_id,
                pid = death.pid,
                reason = %death.reason,
                grace_ms = grace.as_millis(),
                "Media worker died, exiting after grace period"
            );
            death_health.set_fatal();
            tokio::time::sleep(grace).await;
            std::process::exit(1);
        }
    });

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_app = signaling_router(SignalingState {
        registry: registry.clone(),
        metrics: Arc::clone(&actor_metrics),
        cancel_token: shutdown_token.child_token(),
    });

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("Session Controller running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Closes sockets first; their teardown still reaches the registry
    shutdown_token.cancel();
    monitors_token.cancel();

    if let Err(e) = registry.shutdown().await {
        warn!(error = %e, "Actor system shutdown error");
    }

    info!("Session Controller shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
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

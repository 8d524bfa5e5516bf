//! Health endpoints for the Session Controller.
//!
//! - `GET /health` - Liveness: 200 while the media workers are usable
//! - `GET /ready` - Readiness: 200 once signaling is accepting connections
//!
//! `/metrics` is merged in by the binary from the Prometheus handle.
//!
//! A dead media worker flips both probes to 503 for the grace period
//! before the process exits.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags shared by the servers and the worker
/// death monitor.
#[derive(Debug)]
pub struct HealthState {
    ready: AtomicBool,
    /// Set once a media worker died; never cleared.
    fatal: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live, not ready).
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// Record an unrecoverable failure (worker death). Clears readiness.
    pub fn set_fatal(&self) {
        self.fatal.store(true, Ordering::SeqCst);
        self.set_not_ready();
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.fatal.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.is_live() && self.ready.load(Ordering::SeqCst)
    }
}

/// Router with `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

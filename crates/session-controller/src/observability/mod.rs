//! Observability for the Session Controller.
//!
//! # Privacy by Default
//!
//! Actor loops use `#[instrument(skip_all)]` with explicit fields. Negotiation
//! documents (SDP-derived RTP/DTLS parameters) are never logged.
//!
//! # Metrics
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sc_rooms_active` | Gauge | none |
//! | `sc_peers_active` | Gauge | none |
//! | `sc_connections_active` | Gauge | none |
//! | `sc_signaling_requests_total` | Counter | `event`, `status` |
//! | `sc_signaling_latency_seconds` | Histogram | `event` |
//! | `sc_engine_call_duration_seconds` | Histogram | `operation` |
//! | `sc_engine_errors_total` | Counter | `operation` |
//! | `sc_worker_deaths_total` | Counter | none |
//! | `sc_actor_panics_total` | Counter | `actor_type` |
//! | `sc_actor_mailbox_depth` | Gauge | `actor_type` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;

//! Session Controller Service Library
//!
//! Session orchestration for multi-party WebRTC conferencing:
//!
//! - Room registry with strict round-robin placement on media workers
//! - Peer lifecycle: join, leave, disconnect teardown
//! - Media object bookkeeping (transports, producers, consumers) per peer
//! - JSON request/response signaling over WebSocket with server pushes
//!
//! # Architecture
//!
//! ```text
//! WebSocket ──> ConnectionActor ──> RoomRegistryActor ──> RoomActor ──> engine
//!                     ^                                       │
//!                     └──────────── notifications ────────────┘
//! ```
//!
//! The media engine sits behind the [`engine`] traits. The crate ships an
//! in-process engine ([`engine::local`]) that models ports, DTLS state and
//! codec negotiation without moving media.
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and connection actors
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Media engine abstraction
//! - [`errors`] - Error types with client-facing codes
//! - [`observability`] - Metrics and health endpoints
//! - [`signaling`] - Wire protocol and WebSocket server
//! - [`workers`] - Fixed worker pool and death monitoring

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod signaling;
pub mod workers;

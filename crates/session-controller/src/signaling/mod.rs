//! Client signaling.
//!
//! - [`protocol`] - JSON frame format, request decoding and server frames
//! - [`server`] - axum router: the `/ws` upgrade and `/rooms` introspection

pub mod protocol;
pub mod server;

pub use protocol::{ClientFrame, ClientRequest, ProtocolError, ServerFrame};
pub use server::{signaling_router, SignalingState};

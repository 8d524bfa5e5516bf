//! # SC Test Utilities
//!
//! Shared test utilities for the Session Controller (SC) service.
//!
//! ## Modules
//!
//! - `fixtures` - Client negotiation documents (DTLS, RTP parameters and
//!   capabilities) accepted by the in-process engine, plus room and peer
//!   fixtures
//! - `harness` - In-process signaling server and clients that speak the
//!   JSON frame protocol without opening sockets
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let server = TestServer::builder().workers(2).build();
//!     let room = TestRoom::random();
//!
//!     let mut alice = server.connect();
//!     alice.ok("createRoom", room.create_payload()).await;
//!     alice.ok("join", room.join_payload(&TestPeer::new("Alice"))).await;
//!
//!     let transport = alice.create_transport().await;
//!     alice.connect_transport(&transport).await;
//!     let producer_id = alice.produce_video(&transport, 1).await;
//! }
//! ```

pub mod fixtures;
pub mod harness;

// Re-export commonly used items
pub use fixtures::*;
pub use harness::*;

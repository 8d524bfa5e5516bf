//! Actor model implementation for the Session Controller.
//!
//! ```text
//! RoomRegistryActor (singleton per instance)
//! ├── owns the WorkerPool (round-robin placement)
//! └── supervises N RoomActors
//!     └── RoomActor (one per room)
//!         ├── owns the routing context and every Peer's media objects
//!         └── pushes notifications to peers' ConnectionActors
//!
//! ConnectionActor (one per signaling socket, peer id = connection id)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single owner per room**: all peer and media-object state of a room
//!   lives in its `RoomActor`; nothing else mutates it
//! - **Engine calls off the loop**: the room spawns engine calls and handles
//!   their completions as messages, re-validating state on arrival
//! - **`CancellationToken` propagation**: rooms and connections run on child
//!   tokens of the registry's token
//! - **Mailbox monitoring**: depth thresholds with metrics (Room: 100/500,
//!   Connection: 50/200)
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton, room lookup and placement
//! - [`room`] - `RoomActor` per room
//! - [`peer`] - per-peer media object bookkeeping owned by a room
//! - [`connection`] - `ConnectionActor` per signaling socket
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod peer;
pub mod registry;
pub mod room;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use peer::Peer;
pub use registry::{RoomRegistryActor, RoomRegistryActorHandle};
pub use room::{RoomActor, RoomActorHandle, RoomSettings};

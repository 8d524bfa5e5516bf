//! Session Controller error types.
//!
//! Every error is caught at the signaling dispatch boundary and turned into a
//! structured error response. Internal details are logged server-side but
//! not exposed to clients.

use crate::engine::EngineError;
use thiserror::Error;

/// Session Controller error type.
///
/// Maps to signaling error codes:
/// - `NotFound` family: 4
/// - `AlreadyExists` / `DuplicateInRoom`: 5
/// - Internal, Config: 6
/// - `CapacityExceeded`, `Draining`: 7
/// - `Engine`: 8
/// - `NotReady`: 9
/// - `InvalidState`, `NotInRoom`: 10
#[derive(Debug, Error)]
pub enum SessionError {
    /// Room not present in the registry (or already closed).
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// A room with this id already exists.
    #[error("Room already exists: {0}")]
    RoomAlreadyExists(String),

    /// Peer not present in the room.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Peer id already present in the room.
    #[error("Peer already in room: {0}")]
    DuplicateInRoom(String),

    /// Transport not owned by the peer.
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// Producer not active in the room.
    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    /// Consumer not owned by the peer.
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Connection has not joined a room.
    #[error("Connection is not in a room")]
    NotInRoom,

    /// Routing context not established yet.
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Operation outside the permitted event ordering or object state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// External media engine rejected the call.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Registry is at its room limit.
    #[error("Room capacity exceeded")]
    CapacityExceeded,

    /// Registry is shutting down.
    #[error("Session controller is draining")]
    Draining,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor channel failures and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    EngineError,
    NotReady,
    InvalidState,
    Unavailable,
    Internal,
}

impl SessionError {
    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::RoomNotFound(_)
            | SessionError::PeerNotFound(_)
            | SessionError::TransportNotFound(_)
            | SessionError::ProducerNotFound(_)
            | SessionError::ConsumerNotFound(_) => ErrorKind::NotFound,
            SessionError::RoomAlreadyExists(_) | SessionError::DuplicateInRoom(_) => {
                ErrorKind::AlreadyExists
            }
            SessionError::Engine(_) => ErrorKind::EngineError,
            SessionError::NotReady(_) => ErrorKind::NotReady,
            SessionError::InvalidState(_) | SessionError::NotInRoom => ErrorKind::InvalidState,
            SessionError::CapacityExceeded | SessionError::Draining => ErrorKind::Unavailable,
            SessionError::Config(_) | SessionError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the signaling error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::NotFound => 4,
            ErrorKind::AlreadyExists => 5,
            ErrorKind::Internal => 6,
            ErrorKind::Unavailable => 7,
            ErrorKind::EngineError => 8,
            ErrorKind::NotReady => 9,
            ErrorKind::InvalidState => 10,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SessionError::RoomNotFound(_) => "room does not exist".to_string(),
            SessionError::RoomAlreadyExists(_) => "already exists".to_string(),
            SessionError::PeerNotFound(_) => "peer not found".to_string(),
            SessionError::DuplicateInRoom(_) => "already in room".to_string(),
            SessionError::TransportNotFound(_) => "transport not found".to_string(),
            SessionError::ProducerNotFound(_) => "producer not found".to_string(),
            SessionError::ConsumerNotFound(_) => "consumer not found".to_string(),
            SessionError::NotInRoom => "not currently in a room".to_string(),
            SessionError::NotReady(_) => "router not ready".to_string(),
            SessionError::InvalidState(msg) => msg.clone(),
            SessionError::Engine(EngineError::CannotConsume(_)) => "can not consume".to_string(),
            SessionError::Engine(_) => "media engine rejected the request".to_string(),
            SessionError::CapacityExceeded => "server is at capacity".to_string(),
            SessionError::Draining => "server is shutting down".to_string(),
            SessionError::Config(_) | SessionError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}

//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.
//!
//! Room messages come in two groups: requests from connection actors, and
//! completions posted back by the room's own engine-call tasks.

use crate::engine::{
    ConsumerType, DtlsParameters, EngineConsumer, EngineError, EngineProducer, EngineRouter,
    EngineTransport, MediaKind, RtpCapabilities, RtpParameters, TransportParams,
};
use crate::errors::SessionError;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::room::RoomActorHandle;

/// Outbound pushes from a room to one peer's connection.
pub type PeerNotifier = mpsc::UnboundedSender<PeerNotification>;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Create a room bound to the next worker.
    CreateRoom {
        room_id: String,
        respond_to: Reply<()>,
    },

    /// The room's routing context could not be created; drop the entry if
    /// it is still the one created under `generation`.
    RoomCreationFailed {
        room_id: String,
        generation: u64,
        error: SessionError,
        respond_to: Reply<()>,
    },

    GetRoom {
        room_id: String,
        respond_to: Reply<RoomActorHandle>,
    },

    /// Remove the room iff it has no peers. Replies whether it was removed.
    DeleteRoomIfEmpty {
        room_id: String,
        respond_to: Reply<bool>,
    },

    /// Handles of every room, for introspection.
    ListRooms {
        respond_to: oneshot::Sender<Vec<RoomActorHandle>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and close every room.
    Shutdown { respond_to: Reply<()> },
}

/// Messages sent to `ConnectionActor` by the socket reader.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// One text frame from the client.
    Frame { text: String },
    /// The socket closed.
    Disconnect,
}

/// Messages sent to `RoomActor`.
pub enum RoomMessage {
    Join {
        peer_id: String,
        name: String,
        notifier: PeerNotifier,
        respond_to: Reply<RoomSnapshot>,
    },

    Leave {
        peer_id: String,
        respond_to: Reply<PeerRemoval>,
    },

    GetRtpCapabilities {
        respond_to: Reply<RtpCapabilities>,
    },

    /// Active producers of every peer except `peer_id`.
    GetProducers {
        peer_id: String,
        respond_to: Reply<Vec<ProducerDescriptor>>,
    },

    CreateWebRtcTransport {
        peer_id: String,
        respond_to: Reply<TransportParams>,
    },

    ConnectTransport {
        peer_id: String,
        transport_id: String,
        dtls_parameters: DtlsParameters,
        respond_to: Reply<()>,
    },

    Produce {
        peer_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: Reply<String>,
    },

    Consume {
        peer_id: String,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
        respond_to: Reply<ConsumeResult>,
    },

    ResumeConsumer {
        peer_id: String,
        consumer_id: String,
        respond_to: Reply<()>,
    },

    /// Idempotent; an unknown producer is logged and acknowledged.
    CloseProducer {
        peer_id: String,
        producer_id: String,
        respond_to: Reply<()>,
    },

    GetSnapshot {
        respond_to: oneshot::Sender<RoomSnapshot>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// Mark the room closed iff it has no peers. Later joins see
    /// `RoomNotFound`.
    CloseIfEmpty {
        respond_to: oneshot::Sender<bool>,
    },

    // ------------------------------------------------------------------
    // Engine completions (posted by the room's own tasks)
    // ------------------------------------------------------------------
    RouterCreated {
        result: Result<Arc<dyn EngineRouter>, EngineError>,
    },

    TransportCreated {
        peer_id: String,
        result: Result<Arc<dyn EngineTransport>, EngineError>,
        respond_to: Reply<TransportParams>,
    },

    TransportConnected {
        peer_id: String,
        transport_id: String,
        result: Result<(), EngineError>,
        respond_to: Reply<()>,
    },

    ProducerCreated {
        peer_id: String,
        transport_id: String,
        result: Result<Arc<dyn EngineProducer>, EngineError>,
        respond_to: Reply<String>,
    },

    ConsumerCreated {
        peer_id: String,
        transport_id: String,
        producer_id: String,
        result: Result<Arc<dyn EngineConsumer>, EngineError>,
        respond_to: Reply<ConsumeResult>,
    },

    ConsumerResumed {
        peer_id: String,
        consumer_id: String,
        result: Result<(), EngineError>,
        respond_to: Reply<()>,
    },

    /// The engine reported a transport closed (DTLS failure, router close).
    TransportClosed {
        peer_id: String,
        transport_id: String,
    },
}

impl std::fmt::Debug for RoomMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl RoomMessage {
    /// Message name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            RoomMessage::Join { .. } => "Join",
            RoomMessage::Leave { .. } => "Leave",
            RoomMessage::GetRtpCapabilities { .. } => "GetRtpCapabilities",
            RoomMessage::GetProducers { .. } => "GetProducers",
            RoomMessage::CreateWebRtcTransport { .. } => "CreateWebRtcTransport",
            RoomMessage::ConnectTransport { .. } => "ConnectTransport",
            RoomMessage::Produce { .. } => "Produce",
            RoomMessage::Consume { .. } => "Consume",
            RoomMessage::ResumeConsumer { .. } => "ResumeConsumer",
            RoomMessage::CloseProducer { .. } => "CloseProducer",
            RoomMessage::GetSnapshot { .. } => "GetSnapshot",
            RoomMessage::GetState { .. } => "GetState",
            RoomMessage::CloseIfEmpty { .. } => "CloseIfEmpty",
            RoomMessage::RouterCreated { .. } => "RouterCreated",
            RoomMessage::TransportCreated { .. } => "TransportCreated",
            RoomMessage::TransportConnected { .. } => "TransportConnected",
            RoomMessage::ProducerCreated { .. } => "ProducerCreated",
            RoomMessage::ConsumerCreated { .. } => "ConsumerCreated",
            RoomMessage::ConsumerResumed { .. } => "ConsumerResumed",
            RoomMessage::TransportClosed { .. } => "TransportClosed",
        }
    }
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Push sent from a room to a peer's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerNotification {
    /// Producers the peer can consume.
    NewProducers(Vec<ProducerDescriptor>),
    /// A consumer of the peer was closed because its producer went away.
    ConsumerClosed { consumer_id: String },
}

/// A producer another peer may consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerDescriptor {
    pub producer_id: String,
    /// Owning peer (its connection id).
    #[serde(rename = "producer_socket_id")]
    pub peer_id: String,
}

/// Parameters the client needs to create its side of a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResult {
    pub producer_id: String,
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    pub producer_paused: bool,
}

/// Result of removing a peer from a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRemoval {
    pub was_present: bool,
    pub room_empty: bool,
}

/// Introspection view of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: String,
    pub name: String,
}

/// Introspection view of a room: ids and peer names, in join order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub id: String,
    /// Routing context id; `None` until the router is created.
    pub router_id: Option<String>,
    pub peers: Vec<PeerSummary>,
}

/// Counters describing a room actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub room_id: String,
    pub worker_id: String,
    pub router_ready: bool,
    pub closing: bool,
    pub peer_count: usize,
    pub transport_count: usize,
    pub producer_count: usize,
    pub consumer_count: usize,
}

/// Registry status for health/introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub peer_count: usize,
    pub connection_count: usize,
    pub worker_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

//! Media engine seam.
//!
//! The session controller never forwards media itself. It drives an external
//! routing engine through the traits below:
//!
//! ```text
//! EngineWorker ──create_router──▶ EngineRouter ──create_webrtc_transport──▶ EngineTransport
//!                                                                          ├─ produce ─▶ EngineProducer
//!                                                                          └─ consume ─▶ EngineConsumer
//! ```
//!
//! Negotiation documents (RTP capabilities, RTP parameters, DTLS/ICE
//! parameters) are passed through as opaque JSON.
//!
//! [`local`] provides an in-process engine used by the binary and the tests.

pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by the media engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine refused the request (bad parameters, internal failure).
    #[error("engine rejected request: {0}")]
    Rejected(String),

    /// `canConsume` failed for the given producer.
    #[error("cannot consume producer {0}")]
    CannotConsume(String),

    /// The target object is already closed.
    #[error("{0} is closed")]
    Closed(String),

    /// The worker process hosting the object is gone.
    #[error("worker {0} died")]
    WorkerDied(String),

    /// Transport port range is exhausted.
    #[error("no free RTC port in range")]
    PortsExhausted,
}

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RTP capabilities document (router or client side).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub Value);

/// RTP parameters document sent by a producing client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

/// DTLS parameters document sent by a connecting client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub Value);

/// Negotiation parameters of a freshly created WebRTC transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: Value,
}

/// Consumer type reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
    Svc,
    Pipe,
}

impl ConsumerType {
    /// Layered consumers accept preferred spatial/temporal layers.
    #[must_use]
    pub const fn is_layered(&self) -> bool {
        matches!(self, ConsumerType::Simulcast | ConsumerType::Svc)
    }
}

/// Spatial/temporal layer selection for layered consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    pub temporal_layer: Option<u8>,
}

/// Layers applied to every new layered consumer: the highest ones.
pub const HIGHEST_LAYERS: ConsumerLayers = ConsumerLayers {
    spatial_layer: 2,
    temporal_layer: Some(2),
};

/// Codec a router is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Value,
}

/// Router media codecs: Opus audio and VP8 video.
#[must_use]
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: json!({}),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: json!({ "x-google-start-bitrate": 1000 }),
        },
    ]
}

/// Options for `create_webrtc_transport`.
#[derive(Debug, Clone, PartialEq)]
pub struct WebRtcTransportOptions {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
    /// Applied after creation; `None` leaves the engine default.
    pub max_incoming_bitrate: Option<u32>,
}

impl Default for WebRtcTransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: Some(1_500_000),
        }
    }
}

/// One media engine worker process.
#[async_trait]
pub trait EngineWorker: Send + Sync {
    /// Worker identity.
    fn id(&self) -> &str;

    /// OS process id of the worker.
    fn pid(&self) -> u32;

    /// Whether the worker is still alive.
    fn is_alive(&self) -> bool;

    /// Create a routing context on this worker.
    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn EngineRouter>, EngineError>;

    /// Resolves once the worker dies, with a human readable reason.
    async fn died(&self) -> String;
}

/// Per-room routing context.
#[async_trait]
pub trait EngineRouter: Send + Sync {
    fn id(&self) -> &str;

    /// Negotiated router capabilities.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a consumer with the given capabilities can consume the producer.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError>;

    /// Close the router and everything created on it.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A WebRTC transport (ICE + DTLS path between one client and the router).
#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Parameters the client needs to create its side of the transport.
    fn params(&self) -> TransportParams;

    async fn connect(&self, dtls_parameters: &DtlsParameters) -> Result<(), EngineError>;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError>;

    /// Close the transport. Closing twice is a no-op.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the transport is closed, by us or by the engine.
    async fn closed(&self);
}

/// Outbound media stream.
pub trait EngineProducer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;
    /// Close the producer. Closing twice is a no-op.
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Inbound media stream bound to one producer.
#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;
    fn consumer_type(&self) -> ConsumerType;
    fn producer_paused(&self) -> bool;
    fn paused(&self) -> bool;

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<(), EngineError>;

    fn preferred_layers(&self) -> Option<ConsumerLayers>;

    async fn resume(&self) -> Result<(), EngineError>;

    /// Close the consumer. Closing twice is a no-op.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

//! Signaling wire format.
//!
//! Client frames carry an event name and a JSON payload:
//!
//! ```json
//! { "id": 7, "event": "connectTransport",
//!   "data": { "transport_id": "…", "dtlsParameters": { … } } }
//! ```
//!
//! Server frames are either a response to a request id or a push:
//!
//! ```json
//! { "type": "response", "id": 7, "data": "success" }
//! { "type": "response", "id": 8, "error": "room does not exist", "code": 4 }
//! { "type": "notification", "event": "newProducers", "data": [ … ] }
//! ```
//!
//! Frames are parsed in two steps: the envelope first, then the payload for
//! the named event. A bad payload is reported against the request id.

use crate::actors::messages::PeerNotification;
use crate::engine::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};
use crate::errors::SessionError;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Error code for frames that could not be parsed.
pub const PROTOCOL_ERROR_CODE: i32 = 2;

/// Raw client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Correlates the response. Absent for fire-and-forget events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Errors decoding a client frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(serde_json::Error),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("invalid payload for {event}: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// Caller-facing text. Serde messages name fields, never values.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            ProtocolError::MalformedFrame(_) => "malformed frame".to_string(),
            ProtocolError::UnknownEvent(event) => format!("unknown event: {event}"),
            ProtocolError::InvalidPayload { event, source } => {
                format!("invalid {event} payload: {source}")
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RoomIdPayload {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct JoinPayload {
    room_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ConnectTransportPayload {
    transport_id: String,
    #[serde(rename = "dtlsParameters")]
    dtls_parameters: DtlsParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducePayload {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    producer_transport_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumePayload {
    consumer_transport_id: String,
    producer_id: String,
    rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Deserialize)]
struct ResumePayload {
    #[serde(alias = "consumerId")]
    consumer_id: String,
}

#[derive(Debug, Deserialize)]
struct ProducerClosedPayload {
    producer_id: String,
}

/// A decoded client event.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    CreateRoom {
        room_id: String,
    },
    Join {
        room_id: String,
        name: String,
    },
    GetProducers,
    GetRouterRtpCapabilities,
    CreateWebRtcTransport,
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        producer_transport_id: String,
    },
    Consume {
        consumer_transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    Resume {
        consumer_id: String,
    },
    GetMyRoomInfo,
    ProducerClosed {
        producer_id: String,
    },
    ExitRoom,
    Disconnect,
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidPayload {
        event: event.to_string(),
        source,
    })
}

impl ClientRequest {
    /// Decode the payload of `frame` according to its event name.
    ///
    /// # Errors
    ///
    /// `UnknownEvent` for an unrecognised event, `InvalidPayload` when the
    /// payload does not match the event.
    pub fn parse(frame: ClientFrame) -> Result<Self, ProtocolError> {
        let ClientFrame { event, data, .. } = frame;
        let request = match event.as_str() {
            "createRoom" => {
                let p: RoomIdPayload = payload(&event, data)?;
                ClientRequest::CreateRoom { room_id: p.room_id }
            }
            "join" => {
                let p: JoinPayload = payload(&event, data)?;
                ClientRequest::Join {
                    room_id: p.room_id,
                    name: p.name,
                }
            }
            "getProducers" => ClientRequest::GetProducers,
            "getRouterRtpCapabilities" => ClientRequest::GetRouterRtpCapabilities,
            "createWebRtcTransport" => ClientRequest::CreateWebRtcTransport,
            "connectTransport" => {
                let p: ConnectTransportPayload = payload(&event, data)?;
                ClientRequest::ConnectTransport {
                    transport_id: p.transport_id,
                    dtls_parameters: p.dtls_parameters,
                }
            }
            "produce" => {
                let p: ProducePayload = payload(&event, data)?;
                ClientRequest::Produce {
                    kind: p.kind,
                    rtp_parameters: p.rtp_parameters,
                    producer_transport_id: p.producer_transport_id,
                }
            }
            "consume" => {
                let p: ConsumePayload = payload(&event, data)?;
                ClientRequest::Consume {
                    consumer_transport_id: p.consumer_transport_id,
                    producer_id: p.producer_id,
                    rtp_capabilities: p.rtp_capabilities,
                }
            }
            "resume" => {
                let p: ResumePayload = payload(&event, data)?;
                ClientRequest::Resume {
                    consumer_id: p.consumer_id,
                }
            }
            "getMyRoomInfo" => ClientRequest::GetMyRoomInfo,
            "producerClosed" => {
                let p: ProducerClosedPayload = payload(&event, data)?;
                ClientRequest::ProducerClosed {
                    producer_id: p.producer_id,
                }
            }
            "exitRoom" => ClientRequest::ExitRoom,
            "disconnect" => ClientRequest::Disconnect,
            _ => return Err(ProtocolError::UnknownEvent(event)),
        };
        Ok(request)
    }

    /// Event name, used as a metrics label.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            ClientRequest::CreateRoom { .. } => "createRoom",
            ClientRequest::Join { .. } => "join",
            ClientRequest::GetProducers => "getProducers",
            ClientRequest::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            ClientRequest::CreateWebRtcTransport => "createWebRtcTransport",
            ClientRequest::ConnectTransport { .. } => "connectTransport",
            ClientRequest::Produce { .. } => "produce",
            ClientRequest::Consume { .. } => "consume",
            ClientRequest::Resume { .. } => "resume",
            ClientRequest::GetMyRoomInfo => "getMyRoomInfo",
            ClientRequest::ProducerClosed { .. } => "producerClosed",
            ClientRequest::ExitRoom => "exitRoom",
            ClientRequest::Disconnect => "disconnect",
        }
    }
}

/// Frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    Notification {
        event: String,
        data: Value,
    },
}

impl ServerFrame {
    #[must_use]
    pub fn ok(id: Option<u64>, data: Value) -> Self {
        ServerFrame::Response {
            id,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    #[must_use]
    pub fn error(id: Option<u64>, err: &SessionError) -> Self {
        ServerFrame::Response {
            id,
            data: None,
            error: Some(err.client_message()),
            code: Some(err.error_code()),
        }
    }

    #[must_use]
    pub fn protocol_error(id: Option<u64>, err: &ProtocolError) -> Self {
        ServerFrame::Response {
            id,
            data: None,
            error: Some(err.client_message()),
            code: Some(PROTOCOL_ERROR_CODE),
        }
    }

    #[must_use]
    pub fn notification(event: &str, data: Value) -> Self {
        ServerFrame::Notification {
            event: event.to_string(),
            data,
        }
    }

    /// Push frame for a room notification.
    #[must_use]
    pub fn from_notification(notification: PeerNotification) -> Self {
        match notification {
            PeerNotification::NewProducers(producers) => Self::notification(
                "newProducers",
                serde_json::to_value(producers).unwrap_or_else(|_| json!([])),
            ),
            PeerNotification::ConsumerClosed { consumer_id } => {
                Self::notification("consumerClosed", json!({ "consumer_id": consumer_id }))
            }
        }
    }
}

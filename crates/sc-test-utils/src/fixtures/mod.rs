//! Pre-configured test data fixtures for SC testing.
//!
//! Provides:
//! - Rooms and peers with random or explicit ids
//! - Client-side DTLS parameters
//! - RTP parameters for audio, single-layer and simulcast video
//! - Client RTP capabilities, full and audio-only

use serde_json::{json, Value};
use uuid::Uuid;

/// Test room fixture.
#[derive(Debug, Clone)]
pub struct TestRoom {
    /// Room ID.
    pub id: String,
}

impl TestRoom {
    /// Create a new test room with the given ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Create a test room with a random ID.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("room-{}", Uuid::new_v4()))
    }

    /// `createRoom` payload.
    #[must_use]
    pub fn create_payload(&self) -> Value {
        json!({ "room_id": self.id })
    }

    /// `join` payload for `peer`.
    #[must_use]
    pub fn join_payload(&self, peer: &TestPeer) -> Value {
        json!({ "room_id": self.id, "name": peer.name })
    }
}

/// Test peer fixture. Only the display name is client-chosen; the peer id
/// is the connection id.
#[derive(Debug, Clone)]
pub struct TestPeer {
    /// Display name.
    pub name: String,
}

impl TestPeer {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Create a test peer with a random name.
    #[must_use]
    pub fn random() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::new(format!("Peer-{}", &suffix[..8]))
    }
}

/// Client DTLS parameters for `connectTransport`.
#[must_use]
pub fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{
            "algorithm": "sha-256",
            "value": "82:5A:68:3D:36:C3:0A:DE:AF:E7:32:43:D2:88:83:57:\
                      C3:3C:2A:A9:B6:2C:62:83:3A:6F:13:A3:05:4E:8F:0E",
        }],
    })
}

/// DTLS parameters the engine refuses (no fingerprints).
#[must_use]
pub fn invalid_dtls_parameters() -> Value {
    json!({ "role": "client", "fingerprints": [] })
}

/// Opus RTP parameters for `produce`.
#[must_use]
pub fn audio_rtp_parameters() -> Value {
    json!({
        "mid": "0",
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": 100,
            "clockRate": 48000,
            "channels": 2,
        }],
        "encodings": [{ "ssrc": 11_111_111 }],
    })
}

/// VP8 RTP parameters with `layers` encodings; more than one is simulcast.
#[must_use]
pub fn video_rtp_parameters(layers: usize) -> Value {
    let encodings: Vec<Value> = (0..layers.max(1))
        .map(|i| {
            json!({
                "rid": format!("r{i}"),
                "ssrc": 22_222_222 + i,
                "scaleResolutionDownBy": f64::from(1u32 << (layers.max(1) - 1 - i)),
            })
        })
        .collect();
    json!({
        "mid": "1",
        "codecs": [{
            "mimeType": "video/VP8",
            "payloadType": 101,
            "clockRate": 90000,
        }],
        "encodings": encodings,
    })
}

/// Client RTP capabilities covering audio and video.
#[must_use]
pub fn rtp_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 },
        ],
        "headerExtensions": [],
    })
}

/// Client RTP capabilities that can not receive video.
#[must_use]
pub fn audio_only_rtp_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
        ],
        "headerExtensions": [],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_rooms_differ() {
        assert_ne!(TestRoom::random().id, TestRoom::random().id);
    }

    #[test]
    fn test_join_payload() {
        let room = TestRoom::new("r1");
        let payload = room.join_payload(&TestPeer::new("Alice"));
        assert_eq!(payload, json!({ "room_id": "r1", "name": "Alice" }));
    }

    #[test]
    fn test_video_layers() {
        let simulcast = video_rtp_parameters(3);
        let encodings = simulcast["encodings"].as_array().unwrap();
        assert_eq!(encodings.len(), 3);
        assert_eq!(encodings[0]["scaleResolutionDownBy"], 4.0);
        assert_eq!(encodings[2]["scaleResolutionDownBy"], 1.0);

        let single = video_rtp_parameters(0);
        assert_eq!(single["encodings"].as_array().unwrap().len(), 1);
    }
}

//! Per-peer state owned by a `RoomActor`.
//!
//! A [`Peer`] is the only path to its transports, producers and consumers.
//! Lookups return `SessionError` not-found variants instead of panicking on
//! a missing entry.
//!
//! Closing follows a fixed order: a transport closes its producers, then its
//! consumers, then itself. The room uses the returned producer ids to close
//! consumers held by other peers.

use crate::engine::{EngineConsumer, EngineProducer, EngineTransport};
use crate::errors::SessionError;

use super::messages::{PeerNotification, PeerNotifier};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    /// `connect` is in flight.
    Connecting,
    Connected,
}

/// Direction of a transport, fixed by its first produce or consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    const fn as_str(self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "receive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Created paused, waiting for `resume`.
    Created,
    Active,
}

pub struct TransportRecord {
    pub engine: Arc<dyn EngineTransport>,
    pub state: TransportState,
    pub direction: Option<TransportDirection>,
}

pub struct ProducerRecord {
    pub engine: Arc<dyn EngineProducer>,
    pub transport_id: String,
}

pub struct ConsumerRecord {
    pub engine: Arc<dyn EngineConsumer>,
    pub transport_id: String,
    pub producer_id: String,
    pub state: ConsumerState,
    pub paused: bool,
}

/// Ids of everything closed by one transport close.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClosedObjects {
    pub producers: Vec<String>,
    pub consumers: Vec<String>,
}

/// One peer of a room and the media objects it owns.
pub struct Peer {
    id: String,
    name: String,
    notifier: PeerNotifier,
    transports: HashMap<String, TransportRecord>,
    producers: HashMap<String, ProducerRecord>,
    consumers: HashMap<String, ConsumerRecord>,
}

impl Peer {
    #[must_use]
    pub fn new(id: String, name: String, notifier: PeerNotifier) -> Self {
        Self {
            id,
            name,
            notifier,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push a notification to the peer's connection.
    ///
    /// A closed connection is not an error here; its teardown is already on
    /// the way.
    pub fn notify(&self, notification: PeerNotification) {
        if self.notifier.send(notification).is_err() {
            debug!(
                target: "sc.actor.room",
                peer_id = %self.id,
                "Dropping notification for closed connection"
            );
        }
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    pub fn add_transport(&mut self, engine: Arc<dyn EngineTransport>) {
        self.transports.insert(
            engine.id().to_string(),
            TransportRecord {
                engine,
                state: TransportState::Created,
                direction: None,
            },
        );
    }

    /// # Errors
    ///
    /// `TransportNotFound` if the peer does not own `transport_id`.
    pub fn transport(&self, transport_id: &str) -> Result<&TransportRecord, SessionError> {
        self.transports
            .get(transport_id)
            .ok_or_else(|| SessionError::TransportNotFound(transport_id.to_string()))
    }

    /// # Errors
    ///
    /// `TransportNotFound` if the peer does not own `transport_id`.
    pub fn transport_mut(
        &mut self,
        transport_id: &str,
    ) -> Result<&mut TransportRecord, SessionError> {
        self.transports
            .get_mut(transport_id)
            .ok_or_else(|| SessionError::TransportNotFound(transport_id.to_string()))
    }

    /// Move a transport from `Created` to `Connecting`.
    ///
    /// # Errors
    ///
    /// `TransportNotFound`, or `InvalidState` unless the transport is in
    /// `Created`.
    pub fn begin_connect(
        &mut self,
        transport_id: &str,
    ) -> Result<Arc<dyn EngineTransport>, SessionError> {
        let record = self.transport_mut(transport_id)?;
        if record.state != TransportState::Created {
            return Err(SessionError::InvalidState(format!(
                "transport {transport_id} is {:?}",
                record.state
            )));
        }
        record.state = TransportState::Connecting;
        Ok(Arc::clone(&record.engine))
    }

    /// Settle a `connect`: `Connected` on success, back to `Created` on
    /// failure. A transport closed in the meantime stays closed.
    pub fn finish_connect(&mut self, transport_id: &str, connected: bool) {
        if let Some(record) = self.transports.get_mut(transport_id) {
            if record.state == TransportState::Connecting {
                record.state = if connected {
                    TransportState::Connected
                } else {
                    TransportState::Created
                };
            }
        }
    }

    /// Check that `transport_id` can be used in `direction`.
    ///
    /// # Errors
    ///
    /// `TransportNotFound`, or `InvalidState` if the transport is already
    /// used in the other direction.
    pub fn check_direction(
        &self,
        transport_id: &str,
        direction: TransportDirection,
    ) -> Result<Arc<dyn EngineTransport>, SessionError> {
        let record = self.transport(transport_id)?;
        match record.direction {
            Some(existing) if existing != direction => Err(SessionError::InvalidState(format!(
                "transport {transport_id} is a {} transport",
                existing.as_str()
            ))),
            _ => Ok(Arc::clone(&record.engine)),
        }
    }

    fn claim_direction(
        &mut self,
        transport_id: &str,
        direction: TransportDirection,
    ) -> Result<(), SessionError> {
        self.check_direction(transport_id, direction)?;
        self.transport_mut(transport_id)?.direction = Some(direction);
        Ok(())
    }

    /// Close a transport together with its producers and consumers.
    ///
    /// Returns `None` if the transport is unknown (already closed).
    pub fn close_transport(&mut self, transport_id: &str) -> Option<ClosedObjects> {
        let record = self.transports.remove(transport_id)?;

        let producer_ids: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        let consumer_ids: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &producer_ids {
            self.close_producer(id);
        }
        for id in &consumer_ids {
            self.remove_consumer(id);
        }

        record.engine.close();

        Some(ClosedObjects {
            producers: producer_ids,
            consumers: consumer_ids,
        })
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Register a producer created on `transport_id`; fixes the transport
    /// as a send transport.
    ///
    /// # Errors
    ///
    /// `TransportNotFound` if the transport went away, `InvalidState` if it
    /// became a receive transport meanwhile.
    pub fn add_producer(
        &mut self,
        transport_id: &str,
        engine: Arc<dyn EngineProducer>,
    ) -> Result<(), SessionError> {
        self.claim_direction(transport_id, TransportDirection::Send)?;
        self.producers.insert(
            engine.id().to_string(),
            ProducerRecord {
                engine,
                transport_id: transport_id.to_string(),
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn has_producer(&self, producer_id: &str) -> bool {
        self.producers.contains_key(producer_id)
    }

    /// Ids of the peer's active producers.
    pub fn producer_ids(&self) -> impl Iterator<Item = &str> {
        self.producers.keys().map(String::as_str)
    }

    /// Close and remove a producer. Returns `None` if it is unknown.
    pub fn close_producer(&mut self, producer_id: &str) -> Option<ProducerRecord> {
        let record = self.producers.remove(producer_id)?;
        record.engine.close();
        Some(record)
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    /// Register a consumer created on `transport_id`; fixes the transport
    /// as a receive transport.
    ///
    /// # Errors
    ///
    /// `TransportNotFound` if the transport went away, `InvalidState` if it
    /// became a send transport meanwhile.
    pub fn add_consumer(
        &mut self,
        transport_id: &str,
        engine: Arc<dyn EngineConsumer>,
    ) -> Result<(), SessionError> {
        self.claim_direction(transport_id, TransportDirection::Recv)?;
        let paused = engine.paused();
        self.consumers.insert(
            engine.id().to_string(),
            ConsumerRecord {
                producer_id: engine.producer_id().to_string(),
                engine,
                transport_id: transport_id.to_string(),
                state: if paused {
                    ConsumerState::Created
                } else {
                    ConsumerState::Active
                },
                paused,
            },
        );
        Ok(())
    }

    /// # Errors
    ///
    /// `ConsumerNotFound` if the peer does not own `consumer_id`.
    pub fn consumer_mut(&mut self, consumer_id: &str) -> Result<&mut ConsumerRecord, SessionError> {
        self.consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SessionError::ConsumerNotFound(consumer_id.to_string()))
    }

    /// Ids of the peer's consumers of `producer_id`.
    #[must_use]
    pub fn consumers_of(&self, producer_id: &str) -> Vec<String> {
        self.consumers
            .iter()
            .filter(|(_, c)| c.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Close and remove a consumer. Returns `None` if it is unknown.
    pub fn remove_consumer(&mut self, consumer_id: &str) -> Option<ConsumerRecord> {
        let record = self.consumers.remove(consumer_id)?;
        record.engine.close();
        Some(record)
    }

    /// Close every transport. Returns the ids of the producers closed.
    pub fn close(&mut self) -> Vec<String> {
        let transport_ids: Vec<String> = self.transports.keys().cloned().collect();
        let mut closed_producers = Vec::new();
        for id in transport_ids {
            if let Some(closed) = self.close_transport(&id) {
                closed_producers.extend(closed.producers);
            }
        }
        closed_producers
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::local::LocalEngine;
    use crate::engine::{
        media_codecs, EngineRouter, EngineWorker, MediaKind, RtpCapabilities, RtpParameters,
        WebRtcTransportOptions,
    };
    use serde_json::json;
    use tokio::sync::mpsc;

    fn audio_rtp() -> RtpParameters {
        RtpParameters(json!({
            "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000, "payloadType": 100 }],
            "encodings": [{ "ssrc": 1111 }],
        }))
    }

    fn client_caps() -> RtpCapabilities {
        RtpCapabilities(json!({
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
                { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 },
            ]
        }))
    }

    async fn router(engine: &LocalEngine) -> Arc<dyn EngineRouter> {
        engine
            .spawn_worker()
            .create_router(&media_codecs())
            .await
            .unwrap()
    }

    fn peer(id: &str) -> (Peer, mpsc::UnboundedReceiver<PeerNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Peer::new(id.to_string(), "Alice".to_string(), tx), rx)
    }

    async fn add_transport(peer: &mut Peer, router: &Arc<dyn EngineRouter>) -> String {
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let id = transport.id().to_string();
        peer.add_transport(transport);
        id
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let (mut peer, _rx) = peer("conn-1");

        assert!(matches!(
            peer.transport("missing"),
            Err(SessionError::TransportNotFound(_))
        ));
        assert!(matches!(
            peer.consumer_mut("missing"),
            Err(SessionError::ConsumerNotFound(_))
        ));
        assert!(peer.close_producer("missing").is_none());
        assert!(peer.remove_consumer("missing").is_none());
        assert!(peer.close_transport("missing").is_none());
    }

    #[tokio::test]
    async fn test_connect_state_machine() {
        let engine = LocalEngine::new(41000, 41010);
        let router = router(&engine).await;
        let (mut peer, _rx) = peer("conn-1");
        let transport_id = add_transport(&mut peer, &router).await;

        peer.begin_connect(&transport_id).unwrap();
        assert_eq!(
            peer.transport(&transport_id).unwrap().state,
            TransportState::Connecting
        );
        assert!(matches!(
            peer.begin_connect(&transport_id),
            Err(SessionError::InvalidState(_))
        ));

        // A failed connect returns to Created and may be retried.
        peer.finish_connect(&transport_id, false);
        assert_eq!(
            peer.transport(&transport_id).unwrap().state,
            TransportState::Created
        );
        peer.begin_connect(&transport_id).unwrap();
        peer.finish_connect(&transport_id, true);
        assert_eq!(
            peer.transport(&transport_id).unwrap().state,
            TransportState::Connected
        );
    }

    #[tokio::test]
    async fn test_direction_fixed_by_first_use() {
        let engine = LocalEngine::new(41000, 41010);
        let router = router(&engine).await;
        let (mut peer, _rx) = peer("conn-1");
        let transport_id = add_transport(&mut peer, &router).await;

        let transport = peer
            .check_direction(&transport_id, TransportDirection::Send)
            .unwrap();
        let producer = transport.produce(MediaKind::Audio, &audio_rtp()).await.unwrap();
        peer.add_producer(&transport_id, producer).unwrap();

        assert_eq!(
            peer.transport(&transport_id).unwrap().direction,
            Some(TransportDirection::Send)
        );
        assert!(matches!(
            peer.check_direction(&transport_id, TransportDirection::Recv),
            Err(SessionError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_close_producer_is_idempotent() {
        let engine = LocalEngine::new(41000, 41010);
        let router = router(&engine).await;
        let (mut peer, _rx) = peer("conn-1");
        let transport_id = add_transport(&mut peer, &router).await;

        let transport = peer.transport(&transport_id).unwrap().engine.clone();
        let producer = transport.produce(MediaKind::Audio, &audio_rtp()).await.unwrap();
        let producer_id = producer.id().to_string();
        peer.add_producer(&transport_id, Arc::clone(&producer)).unwrap();
        assert!(peer.has_producer(&producer_id));

        let closed = peer.close_producer(&producer_id).unwrap();
        assert_eq!(closed.transport_id, transport_id);
        assert!(producer.is_closed());
        assert!(!peer.has_producer(&producer_id));
        assert!(peer.close_producer(&producer_id).is_none());
    }

    #[tokio::test]
    async fn test_close_transport_cascades_in_order() {
        let engine = LocalEngine::new(41000, 41010);
        let router = router(&engine).await;
        let (mut alice, _a) = peer("conn-a");
        let (mut bob, _b) = peer("conn-b");

        let send_id = add_transport(&mut alice, &router).await;
        let send = alice.transport(&send_id).unwrap().engine.clone();
        let producer = send.produce(MediaKind::Audio, &audio_rtp()).await.unwrap();
        let producer_id = producer.id().to_string();
        alice.add_producer(&send_id, producer).unwrap();

        let recv_id = add_transport(&mut bob, &router).await;
        let recv = bob.transport(&recv_id).unwrap().engine.clone();
        let consumer = recv
            .consume(&producer_id, &client_caps(), false)
            .await
            .unwrap();
        let consumer_id = consumer.id().to_string();
        bob.add_consumer(&recv_id, consumer).unwrap();
        assert_eq!(bob.consumers_of(&producer_id), vec![consumer_id.clone()]);

        let closed = bob.close_transport(&recv_id).unwrap();
        assert_eq!(closed.consumers, vec![consumer_id]);
        assert!(closed.producers.is_empty());
        assert_eq!(bob.consumer_count(), 0);
        assert!(recv.is_closed());
        // A closed transport is forgotten, not kept in a closed state.
        assert!(matches!(
            bob.check_direction(&recv_id, TransportDirection::Recv),
            Err(SessionError::TransportNotFound(_))
        ));
        assert!(bob.close_transport(&recv_id).is_none());

        let closed_producers = alice.close();
        assert_eq!(closed_producers, vec![producer_id]);
        assert_eq!(alice.transport_count(), 0);
        assert_eq!(alice.producer_count(), 0);
        assert!(send.is_closed());
    }

    #[tokio::test]
    async fn test_paused_consumer_starts_in_created() {
        let engine = LocalEngine::new(41000, 41010);
        let router = router(&engine).await;
        let (mut peer, _rx) = peer("conn-1");

        let send_id = add_transport(&mut peer, &router).await;
        let send = peer.transport(&send_id).unwrap().engine.clone();
        let producer = send.produce(MediaKind::Audio, &audio_rtp()).await.unwrap();
        let producer_id = producer.id().to_string();
        peer.add_producer(&send_id, producer).unwrap();

        let recv_id = add_transport(&mut peer, &router).await;
        let recv = peer.transport(&recv_id).unwrap().engine.clone();
        let consumer = recv.consume(&producer_id, &client_caps(), true).await.unwrap();
        let consumer_id = consumer.id().to_string();
        peer.add_consumer(&recv_id, consumer).unwrap();

        let record = peer.consumer_mut(&consumer_id).unwrap();
        assert_eq!(record.state, ConsumerState::Created);
        assert!(record.paused);
    }

    #[tokio::test]
    async fn test_notify_after_connection_closed_is_silent() {
        let (peer, rx) = peer("conn-1");
        drop(rx);
        peer.notify(PeerNotification::ConsumerClosed {
            consumer_id: "c1".to_string(),
        });
    }
}

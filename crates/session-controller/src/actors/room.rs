//! `RoomActor` - per-room actor that owns every peer of one room.
//!
//! Each `RoomActor`:
//! - Owns the room's routing context, created on its worker at startup
//! - Owns all `Peer` state (transports, producers, consumers)
//! - Pushes `newProducers` / `consumerClosed` to peers' connections
//!
//! # Engine calls
//!
//! The message loop never awaits the media engine. A request is validated,
//! the engine call runs in its own task, and the task posts a completion
//! message back into the mailbox. State changes happen when the completion
//! is handled, after re-validating that the peer, transport and producer
//! still exist. Engine objects created for a request that can no longer be
//! honoured are closed again.

use crate::engine::{
    media_codecs, DtlsParameters, EngineConsumer, EngineError, EngineProducer, EngineRouter,
    EngineTransport, EngineWorker, MediaKind, RtpCapabilities, RtpParameters, TransportParams,
    WebRtcTransportOptions, HIGHEST_LAYERS,
};
use crate::errors::SessionError;
use crate::observability::metrics as prom;

use super::messages::{
    ConsumeResult, PeerNotification, PeerNotifier, PeerRemoval, PeerSummary, ProducerDescriptor,
    Reply, RoomMessage, RoomSnapshot, RoomState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::peer::{ConsumerState, Peer, TransportDirection};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Per-room knobs taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct RoomSettings {
    pub transport_options: WebRtcTransportOptions,
    /// Create consumers paused; clients must `resume` them.
    pub consumers_start_paused: bool,
}

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
}

impl std::fmt::Debug for RoomActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomActorHandle")
            .field("room_id", &self.room_id)
            .finish_non_exhaustive()
    }
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> RoomMessage,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))?
    }

    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))
    }

    /// Add a peer. `notifier` receives the peer's server pushes.
    pub async fn join(
        &self,
        peer_id: String,
        name: String,
        notifier: PeerNotifier,
    ) -> Result<RoomSnapshot, SessionError> {
        self.request(|respond_to| RoomMessage::Join {
            peer_id,
            name,
            notifier,
            respond_to,
        })
        .await
    }

    /// Remove a peer, closing everything it owns. Unknown peers are a no-op.
    pub async fn leave(&self, peer_id: String) -> Result<PeerRemoval, SessionError> {
        self.request(|respond_to| RoomMessage::Leave {
            peer_id,
            respond_to,
        })
        .await
    }

    pub async fn rtp_capabilities(&self) -> Result<RtpCapabilities, SessionError> {
        self.request(|respond_to| RoomMessage::GetRtpCapabilities { respond_to })
            .await
    }

    /// Active producers of every other peer, in join order.
    pub async fn producers_for(
        &self,
        peer_id: String,
    ) -> Result<Vec<ProducerDescriptor>, SessionError> {
        self.request(|respond_to| RoomMessage::GetProducers {
            peer_id,
            respond_to,
        })
        .await
    }

    pub async fn create_webrtc_transport(
        &self,
        peer_id: String,
    ) -> Result<TransportParams, SessionError> {
        self.request(|respond_to| RoomMessage::CreateWebRtcTransport {
            peer_id,
            respond_to,
        })
        .await
    }

    pub async fn connect_transport(
        &self,
        peer_id: String,
        transport_id: String,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SessionError> {
        self.request(|respond_to| RoomMessage::ConnectTransport {
            peer_id,
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await
    }

    /// Returns the new producer id.
    pub async fn produce(
        &self,
        peer_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, SessionError> {
        self.request(|respond_to| RoomMessage::Produce {
            peer_id,
            transport_id,
            kind,
            rtp_parameters,
            respond_to,
        })
        .await
    }

    pub async fn consume(
        &self,
        peer_id: String,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeResult, SessionError> {
        self.request(|respond_to| RoomMessage::Consume {
            peer_id,
            transport_id,
            producer_id,
            rtp_capabilities,
            respond_to,
        })
        .await
    }

    pub async fn resume_consumer(
        &self,
        peer_id: String,
        consumer_id: String,
    ) -> Result<(), SessionError> {
        self.request(|respond_to| RoomMessage::ResumeConsumer {
            peer_id,
            consumer_id,
            respond_to,
        })
        .await
    }

    pub async fn close_producer(
        &self,
        peer_id: String,
        producer_id: String,
    ) -> Result<(), SessionError> {
        self.request(|respond_to| RoomMessage::CloseProducer {
            peer_id,
            producer_id,
            respond_to,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, SessionError> {
        self.query(|respond_to| RoomMessage::GetSnapshot { respond_to })
            .await
    }

    pub async fn get_state(&self) -> Result<RoomState, SessionError> {
        self.query(|respond_to| RoomMessage::GetState { respond_to })
            .await
    }

    /// Close the room to new peers iff it is empty.
    pub async fn close_if_empty(&self) -> Result<bool, SessionError> {
        self.query(|respond_to| RoomMessage::CloseIfEmpty { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    worker: Arc<dyn EngineWorker>,
    settings: RoomSettings,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Completions from engine-call tasks. Weak so that dropping every
    /// handle still stops the actor.
    completions: mpsc::WeakSender<RoomMessage>,
    cancel_token: CancellationToken,
    /// `None` until `RouterCreated` arrives.
    router: Option<Arc<dyn EngineRouter>>,
    ready_tx: Option<oneshot::Sender<Result<(), SessionError>>>,
    peers: HashMap<String, Peer>,
    /// Peer ids in join order.
    peer_order: Vec<String>,
    /// Set once the room agreed to close; joins are refused.
    closing: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor bound to `worker`.
    ///
    /// `ready_tx` resolves once the routing context exists, or with the
    /// engine error if it could not be created (the actor then exits).
    pub fn spawn(
        room_id: String,
        worker: Arc<dyn EngineWorker>,
        settings: RoomSettings,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
        ready_tx: oneshot::Sender<Result<(), SessionError>>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            worker,
            settings,
            receiver,
            completions: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            router: None,
            ready_tx: Some(ready_tx),
            peers: HashMap::new(),
            peer_order: Vec::new(),
            closing: false,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sc.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            worker_id = %self.worker.id(),
            "RoomActor started"
        );

        let worker = Arc::clone(&self.worker);
        self.spawn_engine_call(
            "create_router",
            async move { worker.create_router(&media_codecs()).await },
            |result| RoomMessage::RouterCreated { result },
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sc.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.mailbox.observe_queue_len(self.receiver.len());
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sc.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.graceful_shutdown();

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Run an engine call off the message loop and post its outcome back.
    fn spawn_engine_call<T, F, M>(&self, operation: &'static str, call: F, into_message: M)
    where
        T: Send + 'static,
        F: Future<Output = Result<T, EngineError>> + Send + 'static,
        M: FnOnce(Result<T, EngineError>) -> RoomMessage + Send + 'static,
    {
        let completions = self.completions.clone();
        let room_id = self.room_id.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = call.await;
            prom::record_engine_call(operation, started.elapsed());
            if let Err(e) = &result {
                prom::record_engine_error(operation);
                debug!(
                    target: "sc.engine",
                    room_id = %room_id,
                    operation,
                    error = %e,
                    "Engine call failed"
                );
            }

            let delivered = match completions.upgrade() {
                Some(sender) => sender.send(into_message(result)).await.is_ok(),
                None => false,
            };
            if !delivered {
                debug!(
                    target: "sc.actor.room",
                    room_id = %room_id,
                    operation,
                    "Room stopped before engine call completed"
                );
            }
        });
    }

    /// Post `TransportClosed` once the engine reports the transport closed.
    fn watch_transport(&self, peer_id: String, transport: Arc<dyn EngineTransport>) {
        let completions = self.completions.clone();
        let cancel_token = self.cancel_token.child_token();
        tokio::spawn(async move {
            tokio::select! {
                () = transport.closed() => {}
                () = cancel_token.cancelled() => return,
            }
            if let Some(sender) = completions.upgrade() {
                let _ = sender
                    .send(RoomMessage::TransportClosed {
                        peer_id,
                        transport_id: transport.id().to_string(),
                    })
                    .await;
            }
        });
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                peer_id,
                name,
                notifier,
                respond_to,
            } => {
                let result = self.handle_join(peer_id, name, notifier);
                let _ = respond_to.send(result);
            }

            RoomMessage::Leave {
                peer_id,
                respond_to,
            } => {
                let removal = self.remove_peer(&peer_id);
                let _ = respond_to.send(Ok(removal));
            }

            RoomMessage::GetRtpCapabilities { respond_to } => {
                let result = self.router().map(|router| router.rtp_capabilities());
                let _ = respond_to.send(result);
            }

            RoomMessage::GetProducers {
                peer_id,
                respond_to,
            } => {
                let result = self.producers_for(&peer_id);
                let _ = respond_to.send(result);
            }

            RoomMessage::CreateWebRtcTransport {
                peer_id,
                respond_to,
            } => self.start_create_transport(peer_id, respond_to),

            RoomMessage::ConnectTransport {
                peer_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => self.start_connect(peer_id, transport_id, dtls_parameters, respond_to),

            RoomMessage::Produce {
                peer_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => self.start_produce(peer_id, transport_id, kind, rtp_parameters, respond_to),

            RoomMessage::Consume {
                peer_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => self.start_consume(
                peer_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            ),

            RoomMessage::ResumeConsumer {
                peer_id,
                consumer_id,
                respond_to,
            } => self.start_resume(peer_id, consumer_id, respond_to),

            RoomMessage::CloseProducer {
                peer_id,
                producer_id,
                respond_to,
            } => {
                let result = self.handle_close_producer(&peer_id, &producer_id);
                let _ = respond_to.send(result);
            }

            RoomMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }

            RoomMessage::CloseIfEmpty { respond_to } => {
                if self.peers.is_empty() {
                    self.closing = true;
                }
                let _ = respond_to.send(self.closing);
            }

            RoomMessage::RouterCreated { result } => self.on_router_created(result),

            RoomMessage::TransportCreated {
                peer_id,
                result,
                respond_to,
            } => {
                let result = self.on_transport_created(peer_id, result);
                let _ = respond_to.send(result);
            }

            RoomMessage::TransportConnected {
                peer_id,
                transport_id,
                result,
                respond_to,
            } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.finish_connect(&transport_id, result.is_ok());
                }
                let _ = respond_to.send(result.map_err(SessionError::from));
            }

            RoomMessage::ProducerCreated {
                peer_id,
                transport_id,
                result,
                respond_to,
            } => {
                let result = self.on_producer_created(&peer_id, &transport_id, result);
                let _ = respond_to.send(result);
            }

            RoomMessage::ConsumerCreated {
                peer_id,
                transport_id,
                producer_id,
                result,
                respond_to,
            } => {
                let result =
                    self.on_consumer_created(&peer_id, &transport_id, &producer_id, result);
                let _ = respond_to.send(result);
            }

            RoomMessage::ConsumerResumed {
                peer_id,
                consumer_id,
                result,
                respond_to,
            } => {
                let result = self.on_consumer_resumed(&peer_id, &consumer_id, result);
                let _ = respond_to.send(result);
            }

            RoomMessage::TransportClosed {
                peer_id,
                transport_id,
            } => self.on_transport_closed(&peer_id, &transport_id),
        }
    }

    fn router(&self) -> Result<&Arc<dyn EngineRouter>, SessionError> {
        self.router
            .as_ref()
            .ok_or_else(|| SessionError::NotReady("routing context not established".to_string()))
    }

    fn peer(&self, peer_id: &str) -> Result<&Peer, SessionError> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))
    }

    fn peer_mut(&mut self, peer_id: &str) -> Result<&mut Peer, SessionError> {
        self.peers
            .get_mut(peer_id)
            .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))
    }

    fn producer_active(&self, producer_id: &str) -> bool {
        self.peers.values().any(|p| p.has_producer(producer_id))
    }

    // ------------------------------------------------------------------
    // Routing context
    // ------------------------------------------------------------------

    fn on_router_created(&mut self, result: Result<Arc<dyn EngineRouter>, EngineError>) {
        match result {
            Ok(router) => {
                info!(
                    target: "sc.actor.room",
                    room_id = %self.room_id,
                    router_id = %router.id(),
                    "Routing context ready"
                );
                self.router = Some(router);
                if let Some(ready_tx) = self.ready_tx.take() {
                    let _ = ready_tx.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(
                    target: "sc.actor.room",
                    room_id = %self.room_id,
                    error = %e,
                    "Failed to create routing context"
                );
                if let Some(ready_tx) = self.ready_tx.take() {
                    let _ = ready_tx.send(Err(e.into()));
                }
                self.cancel_token.cancel();
            }
        }
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    fn handle_join(
        &mut self,
        peer_id: String,
        name: String,
        notifier: PeerNotifier,
    ) -> Result<RoomSnapshot, SessionError> {
        if self.closing {
            return Err(SessionError::RoomNotFound(self.room_id.clone()));
        }
        if self.peers.contains_key(&peer_id) {
            return Err(SessionError::DuplicateInRoom(peer_id));
        }

        self.peers
            .insert(peer_id.clone(), Peer::new(peer_id.clone(), name, notifier));
        self.peer_order.push(peer_id.clone());
        self.metrics.peer_joined();

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peers = self.peers.len(),
            "Peer joined"
        );

        Ok(self.snapshot())
    }

    /// Close and remove a peer, cascading to consumers of its producers.
    fn remove_peer(&mut self, peer_id: &str) -> PeerRemoval {
        let Some(mut peer) = self.peers.remove(peer_id) else {
            return PeerRemoval {
                was_present: false,
                room_empty: self.peers.is_empty(),
            };
        };
        self.peer_order.retain(|id| id != peer_id);

        let closed_producers = peer.close();
        self.close_consumers_of(&closed_producers);
        self.metrics.peer_left();

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producers_closed = closed_producers.len(),
            peers = self.peers.len(),
            "Peer left"
        );

        PeerRemoval {
            was_present: true,
            room_empty: self.peers.is_empty(),
        }
    }

    /// Close every consumer of `producer_ids` and tell its owner.
    fn close_consumers_of(&mut self, producer_ids: &[String]) {
        for peer in self.peers.values_mut() {
            for producer_id in producer_ids {
                for consumer_id in peer.consumers_of(producer_id) {
                    peer.remove_consumer(&consumer_id);
                    debug!(
                        target: "sc.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer.id(),
                        consumer_id = %consumer_id,
                        producer_id = %producer_id,
                        "Consumer closed with its producer"
                    );
                    peer.notify(PeerNotification::ConsumerClosed { consumer_id });
                }
            }
        }
    }

    fn producers_for(&self, peer_id: &str) -> Result<Vec<ProducerDescriptor>, SessionError> {
        self.peer(peer_id)?;
        Ok(self
            .peer_order
            .iter()
            .filter(|id| id.as_str() != peer_id)
            .filter_map(|id| self.peers.get(id))
            .flat_map(|other| {
                other.producer_ids().map(|producer_id| ProducerDescriptor {
                    producer_id: producer_id.to_string(),
                    peer_id: other.id().to_string(),
                })
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    fn start_create_transport(&self, peer_id: String, respond_to: Reply<TransportParams>) {
        let router = match self.router().and_then(|router| {
            self.peer(&peer_id)?;
            Ok(Arc::clone(router))
        }) {
            Ok(router) => router,
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return;
            }
        };
        let options = self.settings.transport_options.clone();
        let room_id = self.room_id.clone();

        self.spawn_engine_call(
            "create_webrtc_transport",
            async move {
                let transport = router.create_webrtc_transport(&options).await?;
                if let Some(bitrate) = options.max_incoming_bitrate {
                    if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                        warn!(
                            target: "sc.engine",
                            room_id = %room_id,
                            transport_id = %transport.id(),
                            error = %e,
                            "Failed to set max incoming bitrate"
                        );
                    }
                }
                Ok(transport)
            },
            move |result| RoomMessage::TransportCreated {
                peer_id,
                result,
                respond_to,
            },
        );
    }

    fn on_transport_created(
        &mut self,
        peer_id: String,
        result: Result<Arc<dyn EngineTransport>, EngineError>,
    ) -> Result<TransportParams, SessionError> {
        let transport = result?;
        if self.closing || !self.peers.contains_key(&peer_id) {
            transport.close();
            return Err(SessionError::PeerNotFound(peer_id));
        }

        let params = transport.params();
        self.watch_transport(peer_id.clone(), Arc::clone(&transport));
        self.peer_mut(&peer_id)?.add_transport(transport);

        debug!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            transport_id = %params.id,
            "Transport created"
        );
        Ok(params)
    }

    fn start_connect(
        &mut self,
        peer_id: String,
        transport_id: String,
        dtls_parameters: DtlsParameters,
        respond_to: Reply<()>,
    ) {
        let transport = match self
            .peer_mut(&peer_id)
            .and_then(|peer| peer.begin_connect(&transport_id))
        {
            Ok(transport) => transport,
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        self.spawn_engine_call(
            "connect",
            async move { transport.connect(&dtls_parameters).await },
            move |result| RoomMessage::TransportConnected {
                peer_id,
                transport_id,
                result,
                respond_to,
            },
        );
    }

    /// The engine closed a transport on its own (DTLS failure, router
    /// close). Applies the same cascade as an explicit close.
    fn on_transport_closed(&mut self, peer_id: &str, transport_id: &str) {
        let Some(closed) = self
            .peers
            .get_mut(peer_id)
            .and_then(|peer| peer.close_transport(transport_id))
        else {
            return;
        };

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            producers_closed = closed.producers.len(),
            consumers_closed = closed.consumers.len(),
            "Transport closed by engine"
        );
        self.close_consumers_of(&closed.producers);
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    fn start_produce(
        &self,
        peer_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: Reply<String>,
    ) {
        let transport = match self
            .peer(&peer_id)
            .and_then(|peer| peer.check_direction(&transport_id, TransportDirection::Send))
        {
            Ok(transport) => transport,
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        self.spawn_engine_call(
            "produce",
            async move { transport.produce(kind, &rtp_parameters).await },
            move |result| RoomMessage::ProducerCreated {
                peer_id,
                transport_id,
                result,
                respond_to,
            },
        );
    }

    fn on_producer_created(
        &mut self,
        peer_id: &str,
        transport_id: &str,
        result: Result<Arc<dyn EngineProducer>, EngineError>,
    ) -> Result<String, SessionError> {
        let producer = result?;
        let producer_id = producer.id().to_string();

        let registered = self
            .peer_mut(peer_id)
            .and_then(|peer| peer.add_producer(transport_id, Arc::clone(&producer)));
        if let Err(e) = registered {
            producer.close();
            return Err(e);
        }

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %producer.kind(),
            "Producer created"
        );

        // Registered first; peers are only told about a producer that exists.
        let descriptor = ProducerDescriptor {
            producer_id: producer_id.clone(),
            peer_id: peer_id.to_string(),
        };
        for other in self
            .peer_order
            .iter()
            .filter(|id| id.as_str() != peer_id)
            .filter_map(|id| self.peers.get(id))
        {
            other.notify(PeerNotification::NewProducers(vec![descriptor.clone()]));
        }

        Ok(producer_id)
    }

    /// Closing an unknown producer is logged and acknowledged.
    fn handle_close_producer(
        &mut self,
        peer_id: &str,
        producer_id: &str,
    ) -> Result<(), SessionError> {
        if self.peer_mut(peer_id)?.close_producer(producer_id).is_none() {
            debug!(
                target: "sc.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                producer_id = %producer_id,
                "Producer already closed"
            );
            return Ok(());
        }

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            "Producer closed"
        );
        self.close_consumers_of(&[producer_id.to_string()]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    fn prepare_consume(
        &self,
        peer_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn EngineTransport>, SessionError> {
        let peer = self.peer(peer_id)?;
        peer.transport(transport_id)?;
        if !self.producer_active(producer_id) {
            return Err(SessionError::ProducerNotFound(producer_id.to_string()));
        }
        if !self.router()?.can_consume(producer_id, rtp_capabilities) {
            return Err(EngineError::CannotConsume(producer_id.to_string()).into());
        }
        peer.check_direction(transport_id, TransportDirection::Recv)
    }

    fn start_consume(
        &self,
        peer_id: String,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
        respond_to: Reply<ConsumeResult>,
    ) {
        let transport =
            match self.prepare_consume(&peer_id, &transport_id, &producer_id, &rtp_capabilities) {
                Ok(transport) => transport,
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                    return;
                }
            };
        let paused = self.settings.consumers_start_paused;
        let target = producer_id.clone();
        let room_id = self.room_id.clone();

        self.spawn_engine_call(
            "consume",
            async move {
                let consumer = transport.consume(&target, &rtp_capabilities, paused).await?;
                if consumer.consumer_type().is_layered() {
                    if let Err(e) = consumer.set_preferred_layers(HIGHEST_LAYERS).await {
                        warn!(
                            target: "sc.engine",
                            room_id = %room_id,
                            consumer_id = %consumer.id(),
                            error = %e,
                            "Failed to select highest layers"
                        );
                    }
                }
                Ok(consumer)
            },
            move |result| RoomMessage::ConsumerCreated {
                peer_id,
                transport_id,
                producer_id,
                result,
                respond_to,
            },
        );
    }

    fn on_consumer_created(
        &mut self,
        peer_id: &str,
        transport_id: &str,
        producer_id: &str,
        result: Result<Arc<dyn EngineConsumer>, EngineError>,
    ) -> Result<ConsumeResult, SessionError> {
        let consumer = result?;

        let registered = if self.producer_active(producer_id) {
            self.peer_mut(peer_id)
                .and_then(|peer| peer.add_consumer(transport_id, Arc::clone(&consumer)))
        } else {
            Err(SessionError::ProducerNotFound(producer_id.to_string()))
        };
        if let Err(e) = registered {
            consumer.close();
            return Err(e);
        }

        debug!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            consumer_id = %consumer.id(),
            producer_id = %producer_id,
            "Consumer created"
        );

        Ok(ConsumeResult {
            producer_id: producer_id.to_string(),
            id: consumer.id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            producer_paused: consumer.producer_paused(),
        })
    }

    fn start_resume(&mut self, peer_id: String, consumer_id: String, respond_to: Reply<()>) {
        let consumer = match self
            .peer_mut(&peer_id)
            .and_then(|peer| peer.consumer_mut(&consumer_id))
        {
            Ok(record) => Arc::clone(&record.engine),
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        self.spawn_engine_call(
            "resume",
            async move { consumer.resume().await },
            move |result| RoomMessage::ConsumerResumed {
                peer_id,
                consumer_id,
                result,
                respond_to,
            },
        );
    }

    fn on_consumer_resumed(
        &mut self,
        peer_id: &str,
        consumer_id: &str,
        result: Result<(), EngineError>,
    ) -> Result<(), SessionError> {
        result?;
        let record = self.peer_mut(peer_id)?.consumer_mut(consumer_id)?;
        record.paused = false;
        record.state = ConsumerState::Active;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            id: self.room_id.clone(),
            router_id: self.router.as_ref().map(|r| r.id().to_string()),
            peers: self
                .peer_order
                .iter()
                .filter_map(|id| self.peers.get(id))
                .map(|peer| PeerSummary {
                    id: peer.id().to_string(),
                    name: peer.name().to_string(),
                })
                .collect(),
        }
    }

    fn state(&self) -> RoomState {
        RoomState {
            room_id: self.room_id.clone(),
            worker_id: self.worker.id().to_string(),
            router_ready: self.router.is_some(),
            closing: self.closing,
            peer_count: self.peers.len(),
            transport_count: self.peers.values().map(Peer::transport_count).sum(),
            producer_count: self.peers.values().map(Peer::producer_count).sum(),
            consumer_count: self.peers.values().map(Peer::consumer_count).sum(),
        }
    }

    /// Close every peer, then the routing context.
    fn graceful_shutdown(&mut self) {
        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            peers = self.peers.len(),
            "Performing graceful shutdown"
        );

        self.closing = true;
        self.cancel_token.cancel();

        for peer_id in std::mem::take(&mut self.peer_order) {
            if let Some(mut peer) = self.peers.remove(&peer_id) {
                peer.close();
                self.metrics.peer_left();
            }
        }

        if let Some(router) = self.router.take() {
            router.close();
        }

        if let Some(ready_tx) = self.ready_tx.take() {
            let _ = ready_tx.send(Err(SessionError::Internal(
                "room stopped before its routing context was ready".to_string(),
            )));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::local::{LocalEngine, LocalWorker};
    use crate::engine::ConsumerType;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn dtls() -> DtlsParameters {
        DtlsParameters(json!({
            "role": "client",
            "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF" }],
        }))
    }

    fn video_rtp(encodings: usize) -> RtpParameters {
        let encodings: Vec<_> = (0..encodings)
            .map(|i| json!({ "rid": format!("r{i}"), "ssrc": 1000 + i }))
            .collect();
        RtpParameters(json!({
            "codecs": [{ "mimeType": "video/VP8", "clockRate": 90000, "payloadType": 101 }],
            "encodings": encodings,
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

    struct Fixture {
        engine: LocalEngine,
        worker: Arc<LocalWorker>,
        handle: RoomActorHandle,
        task: JoinHandle<()>,
    }

    async fn spawn_room(settings: RoomSettings) -> Fixture {
        let engine = LocalEngine::new(42000, 42050);
        let worker = engine.spawn_worker();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (handle, task) = RoomActor::spawn(
            "room-1".to_string(),
            Arc::clone(&worker) as Arc<dyn EngineWorker>,
            settings,
            CancellationToken::new(),
            ActorMetrics::new(),
            ready_tx,
        );
        ready_rx.await.unwrap().unwrap();
        Fixture {
            engine,
            worker,
            handle,
            task,
        }
    }

    async fn join(
        room: &RoomActorHandle,
        peer_id: &str,
        name: &str,
    ) -> mpsc::UnboundedReceiver<PeerNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        room.join(peer_id.to_string(), name.to_string(), tx)
            .await
            .unwrap();
        rx
    }

    async fn transport(room: &RoomActorHandle, peer_id: &str) -> String {
        let params = room
            .create_webrtc_transport(peer_id.to_string())
            .await
            .unwrap();
        room.connect_transport(peer_id.to_string(), params.id.clone(), dtls())
            .await
            .unwrap();
        params.id
    }

    async fn produce_video(room: &RoomActorHandle, peer_id: &str, encodings: usize) -> String {
        let transport_id = transport(room, peer_id).await;
        room.produce(
            peer_id.to_string(),
            transport_id,
            MediaKind::Video,
            video_rtp(encodings),
        )
        .await
        .unwrap()
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_room_join_returns_snapshot() {
        let fx = spawn_room(RoomSettings::default()).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let snapshot = fx
            .handle
            .join("conn-a".to_string(), "Alice".to_string(), tx)
            .await
            .unwrap();
        assert_eq!(snapshot.id, "room-1");
        assert!(snapshot.router_id.is_some());
        assert_eq!(snapshot.peers.len(), 1);
        assert_eq!(snapshot.peers[0].name, "Alice");

        let (tx, _rx) = mpsc::unbounded_channel();
        let snapshot = fx
            .handle
            .join("conn-b".to_string(), "Bob".to_string(), tx)
            .await
            .unwrap();
        let names: Vec<_> = snapshot.peers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_duplicate_join_rejected() {
        let fx = spawn_room(RoomSettings::default()).await;
        let _rx = join(&fx.handle, "conn-a", "Alice").await;

        let (tx, _rx2) = mpsc::unbounded_channel();
        let result = fx
            .handle
            .join("conn-a".to_string(), "Alice".to_string(), tx)
            .await;
        assert!(matches!(result, Err(SessionError::DuplicateInRoom(_))));
        assert_eq!(fx.handle.get_state().await.unwrap().peer_count, 1);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_router_failure_reports_not_ready_room() {
        let engine = LocalEngine::new(42000, 42010);
        engine
            .faults()
            .fail_create_router
            .store(true, Ordering::SeqCst);
        let worker = engine.spawn_worker();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (_handle, task) = RoomActor::spawn(
            "room-x".to_string(),
            worker,
            RoomSettings::default(),
            CancellationToken::new(),
            ActorMetrics::new(),
            ready_tx,
        );

        let result = ready_rx.await.unwrap();
        assert!(matches!(result, Err(SessionError::Engine(_))));
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("room should exit after router failure")
            .unwrap();
    }

    #[tokio::test]
    async fn test_room_capabilities_and_transport_params() {
        let fx = spawn_room(RoomSettings::default()).await;
        let _rx = join(&fx.handle, "conn-a", "Alice").await;

        let caps = fx.handle.rtp_capabilities().await.unwrap();
        assert_eq!(caps.0["codecs"].as_array().unwrap().len(), 2);

        let params = fx
            .handle
            .create_webrtc_transport("conn-a".to_string())
            .await
            .unwrap();
        assert!(!params.ice_candidates.is_empty());

        let missing = fx
            .handle
            .create_webrtc_transport("nobody".to_string())
            .await;
        assert!(matches!(missing, Err(SessionError::PeerNotFound(_))));

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_connect_twice_is_invalid_state() {
        let fx = spawn_room(RoomSettings::default()).await;
        let _rx = join(&fx.handle, "conn-a", "Alice").await;
        let transport_id = transport(&fx.handle, "conn-a").await;

        let again = fx
            .handle
            .connect_transport("conn-a".to_string(), transport_id, dtls())
            .await;
        assert!(matches!(again, Err(SessionError::InvalidState(_))));

        let unknown = fx
            .handle
            .connect_transport("conn-a".to_string(), "nope".to_string(), dtls())
            .await;
        assert!(matches!(unknown, Err(SessionError::TransportNotFound(_))));

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_failed_transport_creation_leaves_no_record() {
        let fx = spawn_room(RoomSettings::default()).await;
        let _rx = join(&fx.handle, "conn-a", "Alice").await;

        fx.engine
            .faults()
            .fail_create_transport
            .store(true, Ordering::SeqCst);
        let result = fx
            .handle
            .create_webrtc_transport("conn-a".to_string())
            .await;
        assert!(matches!(result, Err(SessionError::Engine(_))));
        assert_eq!(fx.handle.get_state().await.unwrap().transport_count, 0);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_produce_broadcasts_to_other_peers() {
        let fx = spawn_room(RoomSettings::default()).await;
        let mut alice_rx = join(&fx.handle, "conn-a", "Alice").await;
        let mut bob_rx = join(&fx.handle, "conn-b", "Bob").await;

        let producer_id = produce_video(&fx.handle, "conn-a", 1).await;

        let notification = bob_rx.recv().await.unwrap();
        assert_eq!(
            notification,
            PeerNotification::NewProducers(vec![ProducerDescriptor {
                producer_id: producer_id.clone(),
                peer_id: "conn-a".to_string(),
            }])
        );
        assert!(alice_rx.try_recv().is_err(), "producer owner is not notified");

        let for_bob = fx
            .handle
            .producers_for("conn-b".to_string())
            .await
            .unwrap();
        assert_eq!(for_bob.len(), 1);
        assert_eq!(for_bob[0].producer_id, producer_id);

        let for_alice = fx
            .handle
            .producers_for("conn-a".to_string())
            .await
            .unwrap();
        assert!(for_alice.is_empty());

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_consume_unknown_producer_creates_nothing() {
        let fx = spawn_room(RoomSettings::default()).await;
        let _rx = join(&fx.handle, "conn-b", "Bob").await;
        let transport_id = transport(&fx.handle, "conn-b").await;

        let result = fx
            .handle
            .consume(
                "conn-b".to_string(),
                transport_id,
                "no-such-producer".to_string(),
                client_caps(),
            )
            .await;
        assert!(matches!(result, Err(SessionError::ProducerNotFound(_))));
        assert_eq!(fx.handle.get_state().await.unwrap().consumer_count, 0);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_consume_incompatible_caps() {
        let fx = spawn_room(RoomSettings::default()).await;
        let _a = join(&fx.handle, "conn-a", "Alice").await;
        let _b = join(&fx.handle, "conn-b", "Bob").await;
        let producer_id = produce_video(&fx.handle, "conn-a", 1).await;
        let transport_id = transport(&fx.handle, "conn-b").await;

        let audio_only = RtpCapabilities(json!({
            "codecs": [{ "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000 }]
        }));
        let result = fx
            .handle
            .consume("conn-b".to_string(), transport_id, producer_id, audio_only)
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Engine(EngineError::CannotConsume(_)))
        ));

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_simulcast_consumer_and_direction() {
        let fx = spawn_room(RoomSettings::default()).await;
        let _a = join(&fx.handle, "conn-a", "Alice").await;
        let _b = join(&fx.handle, "conn-b", "Bob").await;

        let send_id = transport(&fx.handle, "conn-a").await;
        let producer_id = fx
            .handle
            .produce(
                "conn-a".to_string(),
                send_id.clone(),
                MediaKind::Video,
                video_rtp(3),
            )
            .await
            .unwrap();

        let recv_id = transport(&fx.handle, "conn-b").await;
        let result = fx
            .handle
            .consume(
                "conn-b".to_string(),
                recv_id.clone(),
                producer_id.clone(),
                client_caps(),
            )
            .await
            .unwrap();
        assert_eq!(result.producer_id, producer_id);
        assert_eq!(result.kind, MediaKind::Video);
        assert_eq!(result.consumer_type, ConsumerType::Simulcast);

        // The receive transport cannot be used to produce.
        let wrong_way = fx
            .handle
            .produce("conn-b".to_string(), recv_id, MediaKind::Video, video_rtp(1))
            .await;
        assert!(matches!(wrong_way, Err(SessionError::InvalidState(_))));

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_close_producer_cascades_and_is_idempotent() {
        let fx = spawn_room(RoomSettings::default()).await;
        let _a = join(&fx.handle, "conn-a", "Alice").await;
        let mut bob_rx = join(&fx.handle, "conn-b", "Bob").await;

        let producer_id = produce_video(&fx.handle, "conn-a", 1).await;
        let _ = bob_rx.recv().await.unwrap();
        let recv_id = transport(&fx.handle, "conn-b").await;
        let consumer = fx
            .handle
            .consume(
                "conn-b".to_string(),
                recv_id,
                producer_id.clone(),
                client_caps(),
            )
            .await
            .unwrap();

        fx.handle
            .close_producer("conn-a".to_string(), producer_id.clone())
            .await
            .unwrap();
        assert_eq!(
            bob_rx.recv().await.unwrap(),
            PeerNotification::ConsumerClosed {
                consumer_id: consumer.id
            }
        );

        let state = fx.handle.get_state().await.unwrap();
        assert_eq!(state.producer_count, 0);
        assert_eq!(state.consumer_count, 0);

        // Second close is tolerated.
        fx.handle
            .close_producer("conn-a".to_string(), producer_id)
            .await
            .unwrap();

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_paused_consumer_resume() {
        let settings = RoomSettings {
            consumers_start_paused: true,
            ..RoomSettings::default()
        };
        let fx = spawn_room(settings).await;
        let _a = join(&fx.handle, "conn-a", "Alice").await;
        let _b = join(&fx.handle, "conn-b", "Bob").await;
        let producer_id = produce_video(&fx.handle, "conn-a", 1).await;
        let recv_id = transport(&fx.handle, "conn-b").await;

        let consumer = fx
            .handle
            .consume("conn-b".to_string(), recv_id, producer_id, client_caps())
            .await
            .unwrap();

        fx.handle
            .resume_consumer("conn-b".to_string(), consumer.id)
            .await
            .unwrap();

        let unknown = fx
            .handle
            .resume_consumer("conn-b".to_string(), "nope".to_string())
            .await;
        assert!(matches!(unknown, Err(SessionError::ConsumerNotFound(_))));

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_leave_and_close_if_empty() {
        let fx = spawn_room(RoomSettings::default()).await;
        let _a = join(&fx.handle, "conn-a", "Alice").await;
        let _b = join(&fx.handle, "conn-b", "Bob").await;

        let removal = fx.handle.leave("conn-a".to_string()).await.unwrap();
        assert!(removal.was_present);
        assert!(!removal.room_empty);
        assert!(!fx.handle.close_if_empty().await.unwrap());

        let removal = fx.handle.leave("conn-b".to_string()).await.unwrap();
        assert!(removal.room_empty);

        let again = fx.handle.leave("conn-b".to_string()).await.unwrap();
        assert!(!again.was_present);

        assert!(fx.handle.close_if_empty().await.unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        let late = fx
            .handle
            .join("conn-c".to_string(), "Carol".to_string(), tx)
            .await;
        assert!(matches!(late, Err(SessionError::RoomNotFound(_))));

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_leave_releases_transport_ports() {
        let fx = spawn_room(RoomSettings::default()).await;
        let before = fx.engine.free_ports();
        let _a = join(&fx.handle, "conn-a", "Alice").await;
        let _ = transport(&fx.handle, "conn-a").await;
        assert_eq!(fx.engine.free_ports(), before - 1);

        fx.handle.leave("conn-a".to_string()).await.unwrap();
        settle().await;
        assert_eq!(fx.engine.free_ports(), before);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_leave_during_engine_calls_compensates() {
        let fx = spawn_room(RoomSettings::default()).await;
        let free = fx.engine.free_ports();
        let _a = join(&fx.handle, "conn-a", "Alice").await;
        let mut bob_rx = join(&fx.handle, "conn-b", "Bob").await;
        let transport_id = transport(&fx.handle, "conn-a").await;

        // The leave is queued behind both requests, so it lands while their
        // engine calls are still in flight.
        let (produced, created, left) = tokio::join!(
            fx.handle.produce(
                "conn-a".to_string(),
                transport_id,
                MediaKind::Video,
                video_rtp(1),
            ),
            fx.handle.create_webrtc_transport("conn-a".to_string()),
            fx.handle.leave("conn-a".to_string()),
        );
        assert!(produced.is_err(), "produce should fail: {produced:?}");
        assert!(created.is_err(), "transport creation should fail: {created:?}");
        assert!(left.unwrap().was_present);
        settle().await;

        let state = fx.handle.get_state().await.unwrap();
        assert_eq!(state.peer_count, 1);
        assert_eq!(state.transport_count, 0);
        assert_eq!(state.producer_count, 0);
        assert_eq!(fx.engine.free_ports(), free);
        assert!(bob_rx.try_recv().is_err(), "no producer was announced");

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_engine_close_cascades_to_consumers() {
        let fx = spawn_room(RoomSettings::default()).await;
        let _a = join(&fx.handle, "conn-a", "Alice").await;
        let mut bob_rx = join(&fx.handle, "conn-b", "Bob").await;
        let producer_id = produce_video(&fx.handle, "conn-a", 1).await;
        let _ = bob_rx.recv().await.unwrap();
        let recv_id = transport(&fx.handle, "conn-b").await;
        fx.handle
            .consume("conn-b".to_string(), recv_id, producer_id, client_caps())
            .await
            .unwrap();

        // Killing the worker closes the router and every transport on it.
        fx.worker.kill("test");
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let state = fx.handle.get_state().await.unwrap();
                if state.transport_count == 0 {
                    break state;
                }
                settle().await;
            }
        })
        .await
        .expect("transports should be pruned after engine close");

        let state = fx.handle.get_state().await.unwrap();
        assert_eq!(state.producer_count, 0);
        assert_eq!(state.consumer_count, 0);
        assert_eq!(state.peer_count, 2);

        fx.handle.cancel();
    }

    #[tokio::test]
    async fn test_room_cancel_stops_actor() {
        let fx = spawn_room(RoomSettings::default()).await;
        let _a = join(&fx.handle, "conn-a", "Alice").await;

        fx.handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), fx.task)
            .await
            .expect("room should stop on cancel")
            .unwrap();
        assert!(fx.handle.is_cancelled());
        assert!(fx.handle.snapshot().await.is_err());
    }
}

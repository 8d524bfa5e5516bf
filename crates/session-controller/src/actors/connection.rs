//! `ConnectionActor` - per-signaling-connection actor.
//!
//! Each `ConnectionActor`:
//! - Handles exactly one signaling socket; its connection id is the peer id
//! - Is in at most one room at a time
//! - Decodes client frames and dispatches them to the registry or its room
//! - Forwards room pushes (`newProducers`, `consumerClosed`) to the client
//!
//! # Lifecycle
//!
//! 1. Spawned when the socket is accepted
//! 2. `join` binds it to a room; `exitRoom` unbinds it
//! 3. On disconnect (or cancellation) it leaves its room and deletes the
//!    room if it became empty
//!
//! Requests are handled one at a time in arrival order. Pushes go out on the
//! same outbound channel as responses but are not ordered against pending
//! requests.

use crate::errors::SessionError;
use crate::observability::metrics as prom;
use crate::signaling::protocol::{ClientFrame, ClientRequest, ProtocolError, ServerFrame};

use super::messages::{ConnectionMessage, PeerNotification};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::RoomRegistryActorHandle;
use super::room::RoomActorHandle;

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Deliver one text frame received from the client.
    pub async fn send_frame(&self, text: String) -> Result<(), SessionError> {
        self.sender
            .send(ConnectionMessage::Frame { text })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))
    }

    /// Report that the socket closed.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.sender
            .send(ConnectionMessage::Disconnect)
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The room this connection has joined.
struct JoinedRoom {
    room_id: String,
    room: RoomActorHandle,
}

/// What to do after a request was handled.
enum Outcome {
    Respond(Value),
    /// No direct reply.
    Silent,
    /// Stop the connection.
    Close,
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: String,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Frames for the socket writer.
    outbound: mpsc::Sender<ServerFrame>,
    /// Handed to the room on join.
    notifier: mpsc::UnboundedSender<PeerNotification>,
    notifications: mpsc::UnboundedReceiver<PeerNotification>,
    registry: RoomRegistryActorHandle,
    joined: Option<JoinedRoom>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle. The actor stops when the
    /// client disconnects or `cancel_token` fires; `outbound` is dropped
    /// then, which ends the socket writer.
    pub fn spawn(
        connection_id: String,
        registry: RoomRegistryActorHandle,
        outbound: mpsc::Sender<ServerFrame>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let (notifier, notifications) = mpsc::unbounded_channel();

        metrics.connection_opened();

        let actor = Self {
            connection_id: connection_id.clone(),
            receiver,
            outbound,
            notifier,
            notifications,
            registry,
            joined: None,
            cancel_token: cancel_token.clone(),
            mailbox: MailboxMonitor::new(ActorType::Connection, &connection_id),
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sc.actor.connection", fields(connection_id = %self.connection_id))]
    async fn run(mut self) {
        info!(
            target: "sc.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sc.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                Some(notification) = self.notifications.recv() => {
                    self.send(ServerFrame::from_notification(notification)).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(ConnectionMessage::Frame { text }) => {
                            self.mailbox.record_enqueue();
                            self.mailbox.observe_queue_len(self.receiver.len());
                            let keep_running = self.handle_frame(&text).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            if !keep_running {
                                break;
                            }
                        }
                        Some(ConnectionMessage::Disconnect) | None => {
                            debug!(
                                target: "sc.actor.connection",
                                connection_id = %self.connection_id,
                                "Client disconnected"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.teardown().await;
        self.metrics.connection_closed();

        info!(
            target: "sc.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle one client frame. Returns `false` once the connection should
    /// stop.
    async fn handle_frame(&mut self, text: &str) -> bool {
        let started = Instant::now();

        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                let err = ProtocolError::MalformedFrame(e);
                debug!(
                    target: "sc.signaling",
                    connection_id = %self.connection_id,
                    error = %err,
                    "Rejecting malformed frame"
                );
                self.send(ServerFrame::protocol_error(None, &err)).await;
                return true;
            }
        };
        let id = frame.id;

        let request = match ClientRequest::parse(frame) {
            Ok(request) => request,
            Err(err) => {
                debug!(
                    target: "sc.signaling",
                    connection_id = %self.connection_id,
                    error = %err,
                    "Rejecting invalid request"
                );
                self.send(ServerFrame::protocol_error(id, &err)).await;
                return true;
            }
        };

        let event = request.event_name();
        let outcome = self.dispatch(request).await;
        prom::record_signaling_request(event, outcome.is_ok(), started.elapsed());

        match outcome {
            Ok(Outcome::Respond(data)) => {
                self.send(ServerFrame::ok(id, data)).await;
                true
            }
            Ok(Outcome::Silent) => true,
            Ok(Outcome::Close) => false,
            Err(e) => {
                debug!(
                    target: "sc.signaling",
                    connection_id = %self.connection_id,
                    event,
                    error = %e,
                    "Request failed"
                );
                self.send(ServerFrame::error(id, &e)).await;
                true
            }
        }
    }

    fn room(&self) -> Result<&RoomActorHandle, SessionError> {
        self.joined
            .as_ref()
            .map(|joined| &joined.room)
            .ok_or(SessionError::NotInRoom)
    }

    async fn dispatch(&mut self, request: ClientRequest) -> Result<Outcome, SessionError> {
        let peer_id = self.connection_id.clone();
        match request {
            ClientRequest::CreateRoom { room_id } => {
                self.registry.create_room(room_id.clone()).await?;
                Ok(Outcome::Respond(json!(room_id)))
            }

            ClientRequest::Join { room_id, name } => {
                if let Some(joined) = &self.joined {
                    return Err(SessionError::InvalidState(format!(
                        "already in room {}",
                        joined.room_id
                    )));
                }
                let room = self.registry.get_room(room_id.clone()).await?;
                let snapshot = room.join(peer_id, name, self.notifier.clone()).await?;
                info!(
                    target: "sc.actor.connection",
                    connection_id = %self.connection_id,
                    room_id = %room_id,
                    "Joined room"
                );
                self.joined = Some(JoinedRoom { room_id, room });
                respond(&snapshot)
            }

            ClientRequest::GetProducers => {
                let producers = self.room()?.producers_for(peer_id).await?;
                self.send(ServerFrame::from_notification(
                    PeerNotification::NewProducers(producers),
                ))
                .await;
                Ok(Outcome::Silent)
            }

            ClientRequest::GetRouterRtpCapabilities => {
                let capabilities = self.room()?.rtp_capabilities().await?;
                respond(&capabilities)
            }

            ClientRequest::CreateWebRtcTransport => {
                let params = self.room()?.create_webrtc_transport(peer_id).await?;
                respond(&params)
            }

            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.room()?
                    .connect_transport(peer_id, transport_id, dtls_parameters)
                    .await?;
                Ok(Outcome::Respond(json!("success")))
            }

            ClientRequest::Produce {
                kind,
                rtp_parameters,
                producer_transport_id,
            } => {
                let producer_id = self
                    .room()?
                    .produce(peer_id, producer_transport_id, kind, rtp_parameters)
                    .await?;
                Ok(Outcome::Respond(json!({ "producer_id": producer_id })))
            }

            ClientRequest::Consume {
                consumer_transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                let result = self
                    .room()?
                    .consume(peer_id, consumer_transport_id, producer_id, rtp_capabilities)
                    .await?;
                respond(&result)
            }

            ClientRequest::Resume { consumer_id } => {
                self.room()?.resume_consumer(peer_id, consumer_id).await?;
                Ok(Outcome::Respond(json!("success")))
            }

            ClientRequest::GetMyRoomInfo => {
                let snapshot = self.room()?.snapshot().await?;
                respond(&snapshot)
            }

            // Never answered, not even on failure.
            ClientRequest::ProducerClosed { producer_id } => {
                let result = match self.room() {
                    Ok(room) => room.close_producer(peer_id, producer_id.clone()).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    debug!(
                        target: "sc.signaling",
                        connection_id = %self.connection_id,
                        producer_id = %producer_id,
                        error = %e,
                        "producerClosed failed"
                    );
                }
                Ok(Outcome::Silent)
            }

            ClientRequest::ExitRoom => {
                let joined = self.joined.take().ok_or(SessionError::NotInRoom)?;
                self.leave(joined).await?;
                Ok(Outcome::Respond(json!("successfully exited room")))
            }

            ClientRequest::Disconnect => Ok(Outcome::Close),
        }
    }

    /// Leave `joined` and delete its room if this was the last peer.
    async fn leave(&self, joined: JoinedRoom) -> Result<(), SessionError> {
        let removal = joined.room.leave(self.connection_id.clone()).await?;
        if removal.room_empty {
            let deleted = self
                .registry
                .delete_room_if_empty(joined.room_id.clone())
                .await?;
            debug!(
                target: "sc.actor.connection",
                connection_id = %self.connection_id,
                room_id = %joined.room_id,
                deleted,
                "Room empty after leave"
            );
        }
        info!(
            target: "sc.actor.connection",
            connection_id = %self.connection_id,
            room_id = %joined.room_id,
            "Left room"
        );
        Ok(())
    }

    /// Full peer teardown on disconnect. No reply is sent.
    async fn teardown(&mut self) {
        if let Some(joined) = self.joined.take() {
            if let Err(e) = self.leave(joined).await {
                warn!(
                    target: "sc.actor.connection",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Teardown after disconnect failed"
                );
            }
        }
    }

    async fn send(&self, frame: ServerFrame) {
        if self.outbound.send(frame).await.is_err() {
            debug!(
                target: "sc.actor.connection",
                connection_id = %self.connection_id,
                "Socket writer gone, dropping frame"
            );
        }
    }
}

fn respond<T: Serialize>(data: &T) -> Result<Outcome, SessionError> {
    serde_json::to_value(data)
        .map(Outcome::Respond)
        .map_err(|e| SessionError::Internal(format!("response serialization failed: {e}")))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::actors::room::RoomSettings;
    use crate::engine::local::LocalEngine;
    use crate::engine::EngineWorker;
    use crate::workers::WorkerPool;
    use std::time::Duration;

    struct Conn {
        handle: ConnectionActorHandle,
        task: JoinHandle<()>,
        frames: mpsc::Receiver<ServerFrame>,
    }

    impl Conn {
        async fn request(&mut self, id: u64, event: &str, data: Value) -> ServerFrame {
            let text = json!({ "id": id, "event": event, "data": data }).to_string();
            self.handle.send_frame(text).await.unwrap();
            self.next().await
        }

        async fn next(&mut self) -> ServerFrame {
            tokio::time::timeout(Duration::from_secs(1), self.frames.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
        }
    }

    fn registry() -> RoomRegistryActorHandle {
        let engine = LocalEngine::new(44000, 44020);
        let worker: Arc<dyn EngineWorker> = engine.spawn_worker();
        RoomRegistryActorHandle::new(
            "sc-test".to_string(),
            WorkerPool::new(vec![worker]).unwrap(),
            RoomSettings::default(),
            10,
            ActorMetrics::new(),
        )
    }

    fn connect(registry: &RoomRegistryActorHandle, id: &str) -> Conn {
        let (tx, frames) = mpsc::channel(32);
        let (handle, task) = ConnectionActor::spawn(
            id.to_string(),
            registry.clone(),
            tx,
            registry.child_token(),
            ActorMetrics::new(),
        );
        Conn {
            handle,
            task,
            frames,
        }
    }

    fn response_data(frame: ServerFrame) -> Value {
        match frame {
            ServerFrame::Response {
                data: Some(data),
                error: None,
                ..
            } => data,
            other => panic!("expected success response, got {other:?}"),
        }
    }

    fn response_error(frame: ServerFrame) -> (String, i32) {
        match frame {
            ServerFrame::Response {
                error: Some(error),
                code: Some(code),
                ..
            } => (error, code),
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_requires_join() {
        let registry = registry();
        let mut conn = connect(&registry, "conn-a");

        let frame = conn
            .request(1, "getRouterRtpCapabilities", Value::Null)
            .await;
        assert_eq!(
            response_error(frame),
            ("not currently in a room".to_string(), 10)
        );

        let frame = conn.request(2, "exitRoom", Value::Null).await;
        assert_eq!(response_error(frame).0, "not currently in a room");

        registry.cancel();
    }

    #[tokio::test]
    async fn test_connection_producer_closed_never_replies() {
        let registry = registry();
        let mut conn = connect(&registry, "conn-a");

        // Not in a room yet: the failure is swallowed.
        let text = json!({ "id": 1, "event": "producerClosed", "data": { "producer_id": "p1" } })
            .to_string();
        conn.handle.send_frame(text).await.unwrap();

        // The next frame answers the following request, not producerClosed.
        let frame = conn.request(2, "getMyRoomInfo", Value::Null).await;
        match frame {
            ServerFrame::Response { id, .. } => assert_eq!(id, Some(2)),
            other => panic!("expected response, got {other:?}"),
        }

        registry.cancel();
    }

    #[tokio::test]
    async fn test_connection_create_join_and_info() {
        let registry = registry();
        let mut conn = connect(&registry, "conn-a");

        let created = conn
            .request(1, "createRoom", json!({ "room_id": "r1" }))
            .await;
        assert_eq!(response_data(created), json!("r1"));

        let duplicate = conn
            .request(2, "createRoom", json!({ "room_id": "r1" }))
            .await;
        assert_eq!(response_error(duplicate).0, "already exists");

        let joined = conn
            .request(3, "join", json!({ "room_id": "r1", "name": "Alice" }))
            .await;
        let snapshot = response_data(joined);
        assert_eq!(snapshot["id"], "r1");
        assert_eq!(snapshot["peers"][0]["name"], "Alice");

        let again = conn
            .request(4, "join", json!({ "room_id": "r1", "name": "Alice" }))
            .await;
        assert_eq!(response_error(again).1, 10);

        let info = response_data(conn.request(5, "getMyRoomInfo", Value::Null).await);
        assert_eq!(info, snapshot);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_connection_join_missing_room() {
        let registry = registry();
        let mut conn = connect(&registry, "conn-a");

        let frame = conn
            .request(1, "join", json!({ "room_id": "nope", "name": "Alice" }))
            .await;
        assert_eq!(response_error(frame), ("room does not exist".to_string(), 4));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_connection_bad_frames_keep_socket_open() {
        let registry = registry();
        let mut conn = connect(&registry, "conn-a");

        conn.handle.send_frame("not json".to_string()).await.unwrap();
        let (_, code) = response_error(conn.next().await);
        assert_eq!(code, 2);

        let frame = conn.request(7, "teleport", Value::Null).await;
        assert!(matches!(frame, ServerFrame::Response { id: Some(7), .. }));

        let frame = conn.request(8, "join", json!({ "room_id": 5 })).await;
        assert_eq!(response_error(frame).1, 2);

        // Still serving requests.
        let created = conn
            .request(9, "createRoom", json!({ "room_id": "r1" }))
            .await;
        assert_eq!(response_data(created), json!("r1"));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_connection_exit_room_deletes_empty_room() {
        let registry = registry();
        let mut conn = connect(&registry, "conn-a");

        conn.request(1, "createRoom", json!({ "room_id": "r1" }))
            .await;
        conn.request(2, "join", json!({ "room_id": "r1", "name": "Alice" }))
            .await;

        let exited = conn.request(3, "exitRoom", Value::Null).await;
        assert_eq!(response_data(exited), json!("successfully exited room"));
        assert!(registry.get_room("r1".to_string()).await.is_err());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_connection_disconnect_tears_down() {
        let registry = registry();
        let mut alice = connect(&registry, "conn-a");
        let mut bob = connect(&registry, "conn-b");

        alice
            .request(1, "createRoom", json!({ "room_id": "r1" }))
            .await;
        alice
            .request(2, "join", json!({ "room_id": "r1", "name": "Alice" }))
            .await;
        bob.request(1, "join", json!({ "room_id": "r1", "name": "Bob" }))
            .await;

        alice.handle.disconnect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), alice.task)
            .await
            .unwrap()
            .unwrap();

        let room = registry.get_room("r1".to_string()).await.unwrap();
        let snapshot = room.snapshot().await.unwrap();
        assert_eq!(snapshot.peers.len(), 1);
        assert_eq!(snapshot.peers[0].name, "Bob");

        bob.handle.disconnect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), bob.task)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.get_room("r1".to_string()).await.is_err());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_connection_get_producers_pushes_notification() {
        let registry = registry();
        let mut conn = connect(&registry, "conn-a");
        conn.request(1, "createRoom", json!({ "room_id": "r1" }))
            .await;
        conn.request(2, "join", json!({ "room_id": "r1", "name": "Alice" }))
            .await;

        conn.handle
            .send_frame(json!({ "event": "getProducers" }).to_string())
            .await
            .unwrap();
        assert_eq!(
            conn.next().await,
            ServerFrame::notification("newProducers", json!([]))
        );

        registry.cancel();
    }
}

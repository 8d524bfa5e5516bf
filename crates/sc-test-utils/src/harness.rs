//! In-process signaling harness.
//!
//! [`TestServer`] wires a [`LocalEngine`], its workers and a
//! `RoomRegistryActor` the way the binary does. [`TestClient`] drives one
//! `ConnectionActor` with JSON text frames, exactly what the WebSocket reader
//! would deliver, and reads back the frames the socket writer would send.
//!
//! # Example
//!
//! ```rust,ignore
//! let server = TestServer::builder().workers(2).build();
//! let mut client = server.connect();
//! let room_id = client.ok("createRoom", json!({ "room_id": "r1" })).await;
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use session_controller::actors::{
    ActorMetrics, ConnectionActor, ConnectionActorHandle, RoomRegistryActorHandle, RoomSettings,
};
use session_controller::engine::local::{LocalEngine, LocalWorker};
use session_controller::engine::EngineWorker;
use session_controller::signaling::ServerFrame;
use session_controller::workers::WorkerPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::fixtures;

/// How long a client waits for any expected frame.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Builder for [`TestServer`].
#[derive(Debug, Clone)]
pub struct TestServerBuilder {
    workers: usize,
    max_rooms: usize,
    min_port: u16,
    max_port: u16,
    consumers_start_paused: bool,
}

impl Default for TestServerBuilder {
    fn default() -> Self {
        Self {
            workers: 1,
            max_rooms: 100,
            min_port: 40000,
            max_port: 40199,
            consumers_start_paused: false,
        }
    }
}

impl TestServerBuilder {
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn max_rooms(mut self, max_rooms: usize) -> Self {
        self.max_rooms = max_rooms;
        self
    }

    /// Inclusive transport port range.
    #[must_use]
    pub fn ports(mut self, min_port: u16, max_port: u16) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }

    #[must_use]
    pub fn consumers_start_paused(mut self, paused: bool) -> Self {
        self.consumers_start_paused = paused;
        self
    }

    /// Start the workers and the registry. Must run inside a Tokio runtime.
    #[must_use]
    pub fn build(self) -> TestServer {
        let engine = LocalEngine::new(self.min_port, self.max_port);
        let workers: Vec<Arc<LocalWorker>> =
            (0..self.workers).map(|_| engine.spawn_worker()).collect();
        let pool = WorkerPool::new(
            workers
                .iter()
                .map(|w| Arc::clone(w) as Arc<dyn EngineWorker>)
                .collect(),
        )
        .expect("test server needs at least one worker");

        let metrics = ActorMetrics::new();
        let registry = RoomRegistryActorHandle::new(
            format!("sc-test-{}", Uuid::new_v4()),
            pool,
            RoomSettings {
                consumers_start_paused: self.consumers_start_paused,
                ..RoomSettings::default()
            },
            self.max_rooms,
            Arc::clone(&metrics),
        );

        TestServer {
            engine,
            workers,
            registry,
            metrics,
        }
    }
}

/// A running registry on in-process workers.
pub struct TestServer {
    engine: LocalEngine,
    workers: Vec<Arc<LocalWorker>>,
    registry: RoomRegistryActorHandle,
    metrics: Arc<ActorMetrics>,
}

impl TestServer {
    #[must_use]
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::default()
    }

    /// Server with one worker and default settings.
    #[must_use]
    pub fn start() -> Self {
        Self::builder().build()
    }

    /// Open a new signaling connection with a fresh connection id.
    #[must_use]
    pub fn connect(&self) -> TestClient {
        let connection_id = Uuid::new_v4().to_string();
        let (outbound, frames) = mpsc::channel(256);
        let (handle, task) = ConnectionActor::spawn(
            connection_id.clone(),
            self.registry.clone(),
            outbound,
            self.registry.child_token(),
            Arc::clone(&self.metrics),
        );
        TestClient {
            connection_id,
            handle,
            task: Some(task),
            frames,
            notifications: VecDeque::new(),
            next_id: 1,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryActorHandle {
        &self.registry
    }

    #[must_use]
    pub fn engine(&self) -> &LocalEngine {
        &self.engine
    }

    #[must_use]
    pub fn workers(&self) -> &[Arc<LocalWorker>] {
        &self.workers
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    /// Worker id the room was placed on.
    pub async fn worker_of(&self, room_id: &str) -> String {
        let room = self
            .registry
            .get_room(room_id.to_string())
            .await
            .expect("room should exist");
        room.get_state().await.expect("room should answer").worker_id
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.registry.cancel();
    }
}

/// One signaling connection.
pub struct TestClient {
    connection_id: String,
    handle: ConnectionActorHandle,
    task: Option<JoinHandle<()>>,
    frames: mpsc::Receiver<ServerFrame>,
    /// Pushes received while waiting for a response.
    notifications: VecDeque<(String, Value)>,
    next_id: u64,
}

impl TestClient {
    /// Connection id, which is also the peer id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.connection_id
    }

    /// Send a raw text frame.
    pub async fn send_raw(&mut self, text: impl Into<String>) {
        self.handle
            .send_frame(text.into())
            .await
            .expect("connection actor should accept frames");
    }

    /// Send an event without a request id. No reply is awaited.
    pub async fn fire(&mut self, event: &str, data: Value) {
        let text = json!({ "event": event, "data": data }).to_string();
        self.send_raw(text).await;
    }

    /// Send a request and wait for its response. Pushes that arrive first
    /// are buffered for [`TestClient::notification`].
    pub async fn request(&mut self, event: &str, data: Value) -> ServerFrame {
        let id = self.next_id;
        self.next_id += 1;
        let text = json!({ "id": id, "event": event, "data": data }).to_string();
        self.send_raw(text).await;
        self.response_for(Some(id)).await
    }

    /// Wait for the response carrying `id`.
    pub async fn response_for(&mut self, id: Option<u64>) -> ServerFrame {
        loop {
            match self.next_frame().await {
                ServerFrame::Notification { event, data } => {
                    self.notifications.push_back((event, data));
                }
                frame @ ServerFrame::Response { id: got, .. } if got == id => return frame,
                other => panic!("unexpected frame while waiting for {id:?}: {other:?}"),
            }
        }
    }

    /// Send a request that must succeed; returns its `data`.
    pub async fn ok(&mut self, event: &str, data: Value) -> Value {
        match self.request(event, data).await {
            ServerFrame::Response {
                data: Some(data),
                error: None,
                ..
            } => data,
            other => panic!("{event} should succeed, got {other:?}"),
        }
    }

    /// Send a request that must fail; returns `(error, code)`.
    pub async fn err(&mut self, event: &str, data: Value) -> (String, i32) {
        match self.request(event, data).await {
            ServerFrame::Response {
                error: Some(error),
                code: Some(code),
                ..
            } => (error, code),
            other => panic!("{event} should fail, got {other:?}"),
        }
    }

    /// Next push, buffered or newly received.
    pub async fn notification(&mut self) -> (String, Value) {
        if let Some(notification) = self.notifications.pop_front() {
            return notification;
        }
        match self.next_frame().await {
            ServerFrame::Notification { event, data } => (event, data),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    /// Assert nothing is pushed within `wait`.
    pub async fn assert_no_notification(&mut self, wait: Duration) {
        if let Some(n) = self.notifications.pop_front() {
            panic!("unexpected notification {n:?}");
        }
        if let Ok(Some(frame)) = tokio::time::timeout(wait, self.frames.recv()).await {
            panic!("unexpected frame {frame:?}");
        }
    }

    /// Close the socket and wait for teardown to finish.
    pub async fn disconnect(mut self) {
        let _ = self.handle.disconnect().await;
        if let Some(task) = self.task.take() {
            tokio::time::timeout(FRAME_TIMEOUT, task)
                .await
                .expect("connection teardown timed out")
                .expect("connection actor panicked");
        }
    }

    /// Whether the actor has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    async fn next_frame(&mut self) -> ServerFrame {
        tokio::time::timeout(FRAME_TIMEOUT, self.frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
    }

    // ------------------------------------------------------------------
    // Media flow shortcuts
    // ------------------------------------------------------------------

    /// `createWebRtcTransport`; returns the transport id.
    pub async fn create_transport(&mut self) -> String {
        let params = self.ok("createWebRtcTransport", Value::Null).await;
        params["id"]
            .as_str()
            .expect("transport params carry an id")
            .to_string()
    }

    pub async fn connect_transport(&mut self, transport_id: &str) {
        let data = json!({
            "transport_id": transport_id,
            "dtlsParameters": fixtures::dtls_parameters(),
        });
        assert_eq!(self.ok("connectTransport", data).await, json!("success"));
    }

    /// Create and connect a transport; returns its id.
    pub async fn ready_transport(&mut self) -> String {
        let transport_id = self.create_transport().await;
        self.connect_transport(&transport_id).await;
        transport_id
    }

    /// `produce` VP8 with `layers` encodings; returns the producer id.
    pub async fn produce_video(&mut self, transport_id: &str, layers: usize) -> String {
        self.produce(transport_id, "video", fixtures::video_rtp_parameters(layers))
            .await
    }

    pub async fn produce_audio(&mut self, transport_id: &str) -> String {
        self.produce(transport_id, "audio", fixtures::audio_rtp_parameters())
            .await
    }

    async fn produce(&mut self, transport_id: &str, kind: &str, rtp: Value) -> String {
        let data = json!({
            "kind": kind,
            "rtpParameters": rtp,
            "producerTransportId": transport_id,
        });
        let reply = self.ok("produce", data).await;
        reply["producer_id"]
            .as_str()
            .expect("produce replies with producer_id")
            .to_string()
    }

    /// `consume` with full capabilities; returns the consume result.
    pub async fn consume(&mut self, transport_id: &str, producer_id: &str) -> Value {
        self.ok("consume", consume_payload(transport_id, producer_id, fixtures::rtp_capabilities()))
            .await
    }
}

/// `consume` request payload.
#[must_use]
pub fn consume_payload(transport_id: &str, producer_id: &str, rtp_capabilities: Value) -> Value {
    json!({
        "consumerTransportId": transport_id,
        "producerId": producer_id,
        "rtpCapabilities": rtp_capabilities,
    })
}

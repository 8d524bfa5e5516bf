//! `RoomRegistryActor` - singleton supervisor for room actors.
//!
//! The `RoomRegistryActor` is the top-level actor of the session controller:
//!
//! - Singleton per instance
//! - Owns the worker pool and places each new room round-robin
//! - Supervises N `RoomActor` instances
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! # Room creation
//!
//! The room entry is inserted before its routing context exists, so a second
//! `create_room` for the same id fails immediately. The caller's reply waits
//! for the routing context; if the engine refuses it the entry is dropped
//! again and the caller sees the engine error.

use crate::errors::SessionError;
use crate::workers::WorkerPool;

use super::messages::{RegistryMessage, RegistryStatus, Reply, RoomSnapshot};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomSettings};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long shutdown waits for one room actor to finish.
const ROOM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `RoomRegistryActor`.
///
/// This is the public interface for interacting with the registry.
/// All methods are async and return results via oneshot channels.
#[derive(Clone)]
pub struct RoomRegistryActorHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryActorHandle {
    /// Create a new `RoomRegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    ///
    /// # Arguments
    ///
    /// * `instance_id` - Instance ID used in logs
    /// * `pool` - Started engine workers
    /// * `settings` - Per-room settings handed to every `RoomActor`
    /// * `max_rooms` - Room limit; creation beyond it fails
    /// * `metrics` - Shared actor metrics
    #[must_use]
    pub fn new(
        instance_id: String,
        pool: WorkerPool,
        settings: RoomSettings,
        max_rooms: usize,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor {
            mailbox: MailboxMonitor::new(ActorType::Registry, &instance_id),
            instance_id,
            receiver,
            completions: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            next_generation: 0,
            pool,
            settings,
            max_rooms,
            accepting_new: true,
            metrics,
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Create a room on the next worker.
    ///
    /// Resolves once the room's routing context exists.
    pub async fn create_room(&self, room_id: String) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::CreateRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))?
    }

    /// Look up a room.
    pub async fn get_room(&self, room_id: String) -> Result<RoomActorHandle, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove a room iff it has no peers. Returns whether it was removed.
    pub async fn delete_room_if_empty(&self, room_id: String) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::DeleteRoomIfEmpty {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))?
    }

    /// Snapshots of every live room, ordered by room id.
    pub async fn list_rooms(&self) -> Result<Vec<RoomSnapshot>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::ListRooms { respond_to: tx })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))?;

        let rooms = rx
            .await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))?;

        let mut snapshots = Vec::with_capacity(rooms.len());
        for room in rooms {
            // Rooms removed since the list was taken are skipped.
            if let Ok(snapshot) = room.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }

    /// Get the current registry status.
    pub async fn get_status(&self) -> Result<RegistryStatus, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting rooms, close every room and stop the registry.
    ///
    /// Resolves once every room actor has finished.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for tasks that should stop with the registry.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    /// Join handle for monitoring the actor task.
    task_handle: JoinHandle<()>,
    /// Room creation timestamp.
    created_at: i64,
    worker_id: String,
    /// Distinguishes this entry from earlier rooms created under the same id.
    generation: u64,
}

/// The `RoomRegistryActor` implementation.
///
/// This struct owns the actor state and runs the message loop.
pub struct RoomRegistryActor {
    instance_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Lets room-creation waiters report back.
    completions: mpsc::WeakSender<RegistryMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    rooms: HashMap<String, ManagedRoom>,
    next_generation: u64,
    pool: WorkerPool,
    settings: RoomSettings,
    max_rooms: usize,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "sc.actor.registry", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "sc.actor.registry",
            instance_id = %self.instance_id,
            workers = self.pool.len(),
            max_rooms = self.max_rooms,
            "RoomRegistryActor started"
        );

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sc.actor.registry",
                        instance_id = %self.instance_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.mailbox.observe_queue_len(self.receiver.len());
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sc.actor.registry",
                                instance_id = %self.instance_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sc.actor.registry",
            instance_id = %self.instance_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::CreateRoom {
                room_id,
                respond_to,
            } => self.create_room(room_id, respond_to),

            RegistryMessage::RoomCreationFailed {
                room_id,
                generation,
                error,
                respond_to,
            } => {
                self.discard_room(&room_id, generation);
                let _ = respond_to.send(Err(error));
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let result = self
                    .rooms
                    .get(&room_id)
                    .map(|managed| managed.handle.clone())
                    .ok_or(SessionError::RoomNotFound(room_id));
                let _ = respond_to.send(result);
            }

            RegistryMessage::DeleteRoomIfEmpty {
                room_id,
                respond_to,
            } => {
                let result = self.delete_room_if_empty(&room_id).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::ListRooms { respond_to } => {
                let handles = self.rooms.values().map(|m| m.handle.clone()).collect();
                let _ = respond_to.send(handles);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown { respond_to } => {
                self.graceful_shutdown().await;
                self.cancel_token.cancel();
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    /// Spawn a room actor and reply once its routing context is ready.
    fn create_room(&mut self, room_id: String, respond_to: Reply<()>) {
        if !self.accepting_new {
            let _ = respond_to.send(Err(SessionError::Draining));
            return;
        }
        if self.rooms.contains_key(&room_id) {
            let _ = respond_to.send(Err(SessionError::RoomAlreadyExists(room_id)));
            return;
        }
        if self.rooms.len() >= self.max_rooms {
            warn!(
                target: "sc.actor.registry",
                instance_id = %self.instance_id,
                max_rooms = self.max_rooms,
                "Room capacity reached"
            );
            let _ = respond_to.send(Err(SessionError::CapacityExceeded));
            return;
        }

        let worker = self.pool.acquire();
        let worker_id = worker.id().to_string();

        debug!(
            target: "sc.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            worker_id = %worker_id,
            "Creating new room actor"
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            worker,
            self.settings.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
            ready_tx,
        );

        let generation = self.next_generation;
        self.next_generation += 1;
        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle,
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
                worker_id: worker_id.clone(),
                generation,
            },
        );
        self.metrics.room_created();

        info!(
            target: "sc.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            worker_id = %worker_id,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let outcome = ready_rx.await.unwrap_or_else(|_| {
                Err(SessionError::Internal(
                    "room stopped before its routing context was ready".to_string(),
                ))
            });
            let error = match outcome {
                Ok(()) => {
                    let _ = respond_to.send(Ok(()));
                    return;
                }
                Err(error) => error,
            };

            let Some(registry) = completions.upgrade() else {
                let _ = respond_to.send(Err(error));
                return;
            };
            let failed = RegistryMessage::RoomCreationFailed {
                room_id,
                generation,
                error,
                respond_to,
            };
            if let Err(mpsc::error::SendError(RegistryMessage::RoomCreationFailed {
                error,
                respond_to,
                ..
            })) = registry.send(failed).await
            {
                let _ = respond_to.send(Err(error));
            }
        });
    }

    /// Drop a room whose routing context could not be created.
    ///
    /// The entry may already be gone (reaped by the health check) and the id
    /// reused by a newer room; only the entry of the failed creation is
    /// removed.
    fn discard_room(&mut self, room_id: &str, generation: u64) {
        let is_same_room = self
            .rooms
            .get(room_id)
            .is_some_and(|managed| managed.generation == generation);
        if !is_same_room {
            debug!(
                target: "sc.actor.registry",
                instance_id = %self.instance_id,
                room_id = %room_id,
                generation,
                "Failed room already removed"
            );
            return;
        }
        if let Some(managed) = self.rooms.remove(room_id) {
            managed.handle.cancel();
            self.metrics.room_removed();
            warn!(
                target: "sc.actor.registry",
                instance_id = %self.instance_id,
                room_id = %room_id,
                worker_id = %managed.worker_id,
                "Room creation failed, entry removed"
            );
        }
    }

    /// Remove a room iff it has no peers.
    ///
    /// The room marks itself closed in the same step, so a join racing with
    /// the deletion sees `RoomNotFound` rather than landing in a dead room.
    async fn delete_room_if_empty(&mut self, room_id: &str) -> Result<bool, SessionError> {
        let Some(managed) = self.rooms.get(room_id) else {
            return Ok(false);
        };

        match managed.handle.close_if_empty().await {
            Ok(false) => return Ok(false),
            Ok(true) => {}
            Err(e) => {
                // The actor is gone; its entry is stale either way.
                warn!(
                    target: "sc.actor.registry",
                    instance_id = %self.instance_id,
                    room_id = %room_id,
                    error = %e,
                    "Room actor unreachable, removing entry"
                );
            }
        }

        if let Some(managed) = self.rooms.remove(room_id) {
            self.remove_room(room_id, managed);
        }
        Ok(true)
    }

    /// Cancel a removed room and reap its task in the background.
    fn remove_room(&mut self, room_id: &str, managed: ManagedRoom) {
        managed.handle.cancel();

        // Don't block the message loop on the room's shutdown.
        let room_id_owned = room_id.to_string();
        let instance_id = self.instance_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sc.actor.registry",
                        instance_id = %instance_id,
                        room_id = %room_id_owned,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sc.actor.registry",
                        instance_id = %instance_id,
                        room_id = %room_id_owned,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sc.actor.registry",
                        instance_id = %instance_id,
                        room_id = %room_id_owned,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });

        self.metrics.room_removed();

        info!(
            target: "sc.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            lifetime_secs = chrono::Utc::now().timestamp() - managed.created_at,
            total_rooms = self.rooms.len(),
            "Room removed"
        );
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            peer_count: self.metrics.peer_count(),
            connection_count: self.metrics.connection_count(),
            worker_count: self.pool.len(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    /// Stop accepting rooms and wait for every room actor to finish.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sc.actor.registry",
            instance_id = %self.instance_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sc.actor.registry",
                        instance_id = %self.instance_id,
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sc.actor.registry",
                        instance_id = %self.instance_id,
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sc.actor.registry",
                        instance_id = %self.instance_id,
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "sc.actor.registry",
            instance_id = %self.instance_id,
            "Graceful shutdown complete"
        );
    }

    /// Check health of managed room actors.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            if let Some(managed) = self.rooms.remove(&room_id) {
                match managed.task_handle.await {
                    Ok(()) => {
                        info!(
                            target: "sc.actor.registry",
                            instance_id = %self.instance_id,
                            room_id = %room_id,
                            "Room actor exited"
                        );
                    }
                    Err(join_error) => {
                        if join_error.is_panic() {
                            error!(
                                target: "sc.actor.registry",
                                instance_id = %self.instance_id,
                                room_id = %room_id,
                                error = ?join_error,
                                "Room actor panicked - triggering investigation"
                            );
                            self.metrics.record_panic(ActorType::Room);
                        }
                    }
                }

                self.metrics.room_removed();
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::local::LocalEngine;
    use crate::engine::EngineWorker;
    use std::sync::atomic::Ordering;

    fn registry_with(engine: &LocalEngine, workers: usize, max_rooms: usize) -> RoomRegistryActorHandle {
        let workers: Vec<Arc<dyn EngineWorker>> = (0..workers)
            .map(|_| engine.spawn_worker() as Arc<dyn EngineWorker>)
            .collect();
        RoomRegistryActorHandle::new(
            "sc-test".to_string(),
            WorkerPool::new(workers).unwrap(),
            RoomSettings::default(),
            max_rooms,
            ActorMetrics::new(),
        )
    }

    #[tokio::test]
    async fn test_registry_create_and_get_room() {
        let engine = LocalEngine::new(43000, 43010);
        let registry = registry_with(&engine, 1, 10);

        registry.create_room("r1".to_string()).await.unwrap();
        let room = registry.get_room("r1".to_string()).await.unwrap();
        assert_eq!(room.room_id(), "r1");
        assert!(room.get_state().await.unwrap().router_ready);

        let missing = registry.get_room("nope".to_string()).await;
        assert!(matches!(missing, Err(SessionError::RoomNotFound(_))));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_registry_duplicate_room() {
        let engine = LocalEngine::new(43000, 43010);
        let registry = registry_with(&engine, 1, 10);

        registry.create_room("r1".to_string()).await.unwrap();
        let room = registry.get_room("r1".to_string()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        room.join("conn-a".to_string(), "Alice".to_string(), tx)
            .await
            .unwrap();

        let result = registry.create_room("r1".to_string()).await;
        assert!(matches!(result, Err(SessionError::RoomAlreadyExists(_))));

        // The duplicate call left the room's peers alone.
        assert_eq!(room.get_state().await.unwrap().peer_count, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_registry_concurrent_create_same_id() {
        let engine = LocalEngine::new(43000, 43010);
        let registry = registry_with(&engine, 1, 10);

        let (a, b) = tokio::join!(
            registry.create_room("r1".to_string()),
            registry.create_room("r1".to_string())
        );
        assert!(a.is_ok() != b.is_ok(), "exactly one creation should win");
        assert_eq!(registry.get_status().await.unwrap().room_count, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_registry_rooms_placed_round_robin() {
        let engine = LocalEngine::new(43000, 43010);
        let registry = registry_with(&engine, 2, 10);

        let mut workers = Vec::new();
        for id in ["r1", "r2", "r3"] {
            registry.create_room(id.to_string()).await.unwrap();
            let room = registry.get_room(id.to_string()).await.unwrap();
            workers.push(room.get_state().await.unwrap().worker_id);
        }
        assert_ne!(workers[0], workers[1]);
        assert_eq!(workers[0], workers[2]);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_registry_capacity_exceeded() {
        let engine = LocalEngine::new(43000, 43010);
        let registry = registry_with(&engine, 1, 1);

        registry.create_room("r1".to_string()).await.unwrap();
        let result = registry.create_room("r2".to_string()).await;
        assert!(matches!(result, Err(SessionError::CapacityExceeded)));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_registry_router_failure_drops_entry() {
        let engine = LocalEngine::new(43000, 43010);
        let registry = registry_with(&engine, 1, 10);
        engine
            .faults()
            .fail_create_router
            .store(true, Ordering::SeqCst);

        let result = registry.create_room("r1".to_string()).await;
        assert!(matches!(result, Err(SessionError::Engine(_))));
        assert!(registry.get_room("r1".to_string()).await.is_err());

        // The id is free again once the engine recovers.
        engine
            .faults()
            .fail_create_router
            .store(false, Ordering::SeqCst);
        registry.create_room("r1".to_string()).await.unwrap();

        registry.cancel();
    }

    #[tokio::test]
    async fn test_registry_late_creation_failure_keeps_newer_room() {
        let engine = LocalEngine::new(43000, 43010);
        let registry = registry_with(&engine, 1, 10);
        let faults = engine.faults();

        // Generation 0 fails and is dropped.
        faults.fail_create_router.store(true, Ordering::SeqCst);
        assert!(registry.create_room("r1".to_string()).await.is_err());
        faults.fail_create_router.store(false, Ordering::SeqCst);

        // Generation 1 reuses the id.
        registry.create_room("r1".to_string()).await.unwrap();

        // A failure report for the first attempt arriving now must not
        // remove the newer room.
        let (tx, rx) = oneshot::channel();
        registry
            .sender
            .send(RegistryMessage::RoomCreationFailed {
                room_id: "r1".to_string(),
                generation: 0,
                error: SessionError::Internal("stale".to_string()),
                respond_to: tx,
            })
            .await
            .unwrap();
        assert!(rx.await.unwrap().is_err());

        let room = registry.get_room("r1".to_string()).await.unwrap();
        assert!(!room.is_cancelled());
        assert!(room.get_state().await.unwrap().router_ready);
        assert_eq!(registry.get_status().await.unwrap().room_count, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_registry_delete_room_if_empty() {
        let engine = LocalEngine::new(43000, 43010);
        let registry = registry_with(&engine, 1, 10);

        registry.create_room("busy".to_string()).await.unwrap();
        registry.create_room("idle".to_string()).await.unwrap();
        let busy = registry.get_room("busy".to_string()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        busy.join("conn-a".to_string(), "Alice".to_string(), tx)
            .await
            .unwrap();

        assert!(!registry
            .delete_room_if_empty("busy".to_string())
            .await
            .unwrap());
        assert!(registry.get_room("busy".to_string()).await.is_ok());

        assert!(registry
            .delete_room_if_empty("idle".to_string())
            .await
            .unwrap());
        assert!(registry.get_room("idle".to_string()).await.is_err());

        assert!(!registry
            .delete_room_if_empty("unknown".to_string())
            .await
            .unwrap());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_registry_list_rooms() {
        let engine = LocalEngine::new(43000, 43010);
        let registry = registry_with(&engine, 1, 10);

        registry.create_room("b".to_string()).await.unwrap();
        registry.create_room("a".to_string()).await.unwrap();
        let room = registry.get_room("a".to_string()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        room.join("conn-a".to_string(), "Alice".to_string(), tx)
            .await
            .unwrap();

        let rooms = registry.list_rooms().await.unwrap();
        let ids: Vec<_> = rooms.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(rooms[0].peers[0].name, "Alice");
        assert!(rooms[1].peers.is_empty());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_registry_status_and_shutdown() {
        let engine = LocalEngine::new(43000, 43010);
        let registry = registry_with(&engine, 2, 10);

        let status = registry.get_status().await.unwrap();
        assert_eq!(status.room_count, 0);
        assert_eq!(status.worker_count, 2);
        assert!(!status.is_draining);

        registry.create_room("r1".to_string()).await.unwrap();
        let room = registry.get_room("r1".to_string()).await.unwrap();
        assert_eq!(registry.get_status().await.unwrap().room_count, 1);

        registry.shutdown().await.unwrap();
        assert!(registry.is_cancelled());
        assert!(room.is_cancelled());

        // The registry is gone; further requests fail.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.create_room("r2".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_registry_cancellation_token() {
        let engine = LocalEngine::new(43000, 43010);
        let registry = registry_with(&engine, 1, 10);

        let child = registry.child_token();
        assert!(!child.is_cancelled());

        registry.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(registry.is_cancelled());
        assert!(child.is_cancelled());
    }
}

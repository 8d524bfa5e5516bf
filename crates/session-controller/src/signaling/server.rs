//! WebSocket signaling server.
//!
//! One socket is one peer. Each accepted socket gets a fresh UUID v4
//! connection id and a [`ConnectionActor`]; the socket is split into a
//! reader that feeds text frames to the actor and a writer that serializes
//! the actor's [`ServerFrame`]s.

use crate::actors::{ActorMetrics, ConnectionActor, RoomRegistryActorHandle};
use crate::signaling::protocol::ServerFrame;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Frames queued for one socket's writer.
const OUTBOUND_BUFFER: usize = 64;

/// Shared state for the signaling routes.
#[derive(Clone)]
pub struct SignalingState {
    pub registry: RoomRegistryActorHandle,
    pub metrics: Arc<ActorMetrics>,
    /// Parent of every connection's token.
    pub cancel_token: CancellationToken,
}

/// Router with `/ws` (signaling) and `/rooms` (introspection).
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/rooms", get(list_rooms_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SignalingState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn list_rooms_handler(State(state): State<SignalingState>) -> Response {
    match state.registry.list_rooms().await {
        Ok(rooms) => Json(rooms).into_response(),
        Err(e) => {
            warn!(target: "sc.signaling", error = %e, "Failed to list rooms");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(target: "sc.signaling", connection_id = %connection_id, "Client connected");

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);

    let cancel_token = state.cancel_token.child_token();
    let (handle, actor_task) = ConnectionActor::spawn(
        connection_id.clone(),
        state.registry.clone(),
        outbound_tx,
        cancel_token.clone(),
        Arc::clone(&state.metrics),
    );

    // Ends when the actor drops its outbound sender.
    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(target: "sc.signaling", connection_id = %writer_id, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                debug!(target: "sc.signaling", connection_id = %writer_id, "Socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle.send_frame(text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(target: "sc.signaling", connection_id = %connection_id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(target: "sc.signaling", connection_id = %connection_id, error = %e, "Socket read failed");
                        break;
                    }
                }
            }
        }
    }

    // The actor may already be gone after cancellation.
    let _ = handle.disconnect().await;
    if let Err(e) = actor_task.await {
        warn!(target: "sc.signaling", connection_id = %connection_id, error = %e, "ConnectionActor task failed");
    }
    let _ = writer.await;

    info!(target: "sc.signaling", connection_id = %connection_id, "Client disconnected");
}

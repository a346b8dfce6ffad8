//! WebSocket signaling surface.
//!
//! One task pair per connection: the read loop parses client frames and
//! dispatches them to the session's room; the write loop drains the
//! outbound queue fed by the session's `ConnectionActor`. Both wind down
//! when the connection's cancellation token fires or the socket closes.
//!
//! The first frame on a connection must be `join-room`; admission runs
//! before the room is touched, so a denied identity never creates or
//! mutates room state. Malformed frames after join are logged and
//! ignored without affecting the peer.

use crate::actors::{RelayFrame, RoomActorHandle, RoomRegistryHandle};
use crate::admission::AdmissionGate;
use crate::errors::CoreError;
use crate::observability::CoreMetrics;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use common::types::{ConsultationId, SessionId, UserId};
use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use signal_protocol::{decode_client, encode_server, ClientMessage, Role, ServerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a fresh connection has to send its `join-room` frame.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frame queue depth per connection.
const OUTBOUND_BUFFER: usize = 64;

/// Shared state for the signaling router.
pub struct AppState {
    /// Room registry handle.
    pub registry: RoomRegistryHandle,
    /// Admission gate.
    pub gate: Arc<AdmissionGate>,
    /// Shared metrics.
    pub metrics: Arc<CoreMetrics>,
}

/// Build the signaling router.
pub fn signaling_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Upgrade handler for the signaling WebSocket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one signaling connection from upgrade to close.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sink, mut stream) = socket.split();

    let Some((consultation_id, user_id, declared_role)) = wait_for_join(&mut stream).await else {
        debug!(target: "cc.transport.ws", "Connection closed before a valid join-room frame");
        close_quietly(sink).await;
        return;
    };

    // Admission hand-off: the only blocking external call in the core.
    let grant = match state.gate.authorize(&consultation_id, &user_id).await {
        Ok(grant) => grant,
        Err(err) => {
            deny(sink, &consultation_id, &err, &state.metrics).await;
            return;
        }
    };

    if grant.role != declared_role {
        warn!(
            target: "cc.transport.ws",
            consultation_id = %consultation_id,
            declared = declared_role.as_str(),
            granted = grant.role.as_str(),
            "Declared role differs from directory grant, using the grant"
        );
    }

    let room = match state
        .registry
        .get_or_create(consultation_id.clone(), grant.config)
        .await
    {
        Ok(room) => room,
        Err(err) => {
            deny(sink, &consultation_id, &err, &state.metrics).await;
            return;
        }
    };

    let session_id = SessionId::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

    let outcome = match room
        .join(session_id, user_id.clone(), grant.role, outbound_tx)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            deny(sink, &consultation_id, &err, &state.metrics).await;
            return;
        }
    };

    let token = outcome.connection.child_token();
    let writer = tokio::spawn(write_loop(sink, outbound_rx, token.clone()));

    info!(
        target: "cc.transport.ws",
        consultation_id = %consultation_id,
        user_id = %user_id,
        session_id = %session_id,
        role = grant.role.as_str(),
        "Signaling connection established"
    );

    read_loop(&mut stream, &room, session_id, &token).await;

    // Implicit disconnect; a no-op if the session already left or was
    // evicted.
    let _ = room.disconnected(session_id).await;

    let _ = writer.await;

    debug!(
        target: "cc.transport.ws",
        consultation_id = %consultation_id,
        session_id = %session_id,
        "Signaling connection closed"
    );
}

/// Wait for the first text frame and require it to be `join-room`.
async fn wait_for_join(
    stream: &mut SplitStream<WebSocket>,
) -> Option<(ConsultationId, UserId, Role)> {
    let first_text = tokio::time::timeout(JOIN_TIMEOUT, async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    })
    .await
    .ok()
    .flatten()?;

    match decode_client(&first_text) {
        Ok(ClientMessage::JoinRoom {
            consultation_id,
            user_id,
            role,
        }) => Some((consultation_id, user_id, role)),
        Ok(other) => {
            warn!(
                target: "cc.transport.ws",
                frame = ?std::mem::discriminant(&other),
                "First frame was not join-room, closing"
            );
            None
        }
        Err(err) => {
            warn!(
                target: "cc.transport.ws",
                error = %err,
                "Malformed first frame, closing"
            );
            None
        }
    }
}

/// Answer a denied admission with its reason code, then close.
async fn deny(
    mut sink: SplitSink<WebSocket, Message>,
    consultation_id: &ConsultationId,
    err: &CoreError,
    metrics: &CoreMetrics,
) {
    if let Some(reason) = err.deny_reason() {
        info!(
            target: "cc.transport.ws",
            consultation_id = %consultation_id,
            reason = reason.as_str(),
            "Admission denied"
        );
        metrics.admission_denied(reason.as_str());

        if let Ok(text) = encode_server(&ServerMessage::JoinDenied { reason }) {
            let _ = sink.send(Message::Text(text)).await;
        }
    } else {
        warn!(
            target: "cc.transport.ws",
            consultation_id = %consultation_id,
            error = %err,
            "Join failed"
        );
    }

    close_quietly(sink).await;
}

/// Send a close frame, ignoring errors (the peer may already be gone).
async fn close_quietly(mut sink: SplitSink<WebSocket, Message>) {
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// Drain the outbound queue into the socket until close.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => {
                // Flush whatever is already queued before closing.
                while let Ok(message) = outbound.try_recv() {
                    if send_frame(&mut sink, &message).await.is_err() {
                        return;
                    }
                }
                close_quietly(sink).await;
                return;
            }

            frame = outbound.recv() => {
                match frame {
                    Some(message) => {
                        if send_frame(&mut sink, &message).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        close_quietly(sink).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Serialize and send one frame.
async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), ()> {
    match encode_server(message) {
        Ok(text) => sink.send(Message::Text(text)).await.map_err(|_| ()),
        Err(err) => {
            warn!(target: "cc.transport.ws", error = %err, "Frame encode failed, skipping");
            Ok(())
        }
    }
}

/// Parse and dispatch client frames until the connection ends.
async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    room: &RoomActorHandle,
    session_id: SessionId,
    token: &CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,

            frame = stream.next() => {
                let Some(Ok(message)) = frame else {
                    // Stream end or transport error: implicit disconnect.
                    return;
                };

                match message {
                    Message::Text(text) => match decode_client(&text) {
                        Ok(client_message) => {
                            if dispatch(room, session_id, client_message).await {
                                return;
                            }
                        }
                        Err(err) => {
                            // Contained to this connection; the peer is
                            // unaffected.
                            warn!(
                                target: "cc.transport.ws",
                                session_id = %session_id,
                                error = %err,
                                "Malformed frame, ignoring"
                            );
                        }
                    },
                    Message::Close(_) => return,
                    Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }
}

/// Route one client frame to the room. Returns true when the read loop
/// should end.
async fn dispatch(
    room: &RoomActorHandle,
    session_id: SessionId,
    message: ClientMessage,
) -> bool {
    let result = match message {
        ClientMessage::JoinRoom { .. } => {
            warn!(
                target: "cc.transport.ws",
                session_id = %session_id,
                "Duplicate join-room on a bound connection, ignoring"
            );
            Ok(())
        }

        ClientMessage::Offer { kind, sdp, target } => {
            room.relay(session_id, RelayFrame::Offer { kind, sdp, target })
                .await
        }
        ClientMessage::Answer { kind, sdp, target } => {
            room.relay(session_id, RelayFrame::Answer { kind, sdp, target })
                .await
        }
        ClientMessage::IceCandidate {
            kind,
            candidate,
            target,
        } => {
            room.relay(
                session_id,
                RelayFrame::IceCandidate {
                    kind,
                    candidate,
                    target,
                },
            )
            .await
        }

        ClientMessage::ToggleMedia {
            audio_enabled,
            video_enabled,
        } => {
            room.toggle_media(session_id, audio_enabled, video_enabled)
                .await
        }

        ClientMessage::StartScreenShare {} => room.start_screen_share(session_id).await,
        ClientMessage::StopScreenShare {} => room.stop_screen_share(session_id).await,

        ClientMessage::EndConsultation {} => {
            // The room broadcasts the end and closes every connection;
            // our token fires shortly after.
            room.end_consultation(session_id).await
        }

        ClientMessage::Leave {} => {
            let _ = room.leave(session_id).await;
            return true;
        }
    };

    if result.is_err() {
        // The room is gone; nothing more to route.
        debug!(
            target: "cc.transport.ws",
            session_id = %session_id,
            "Room unavailable, ending read loop"
        );
        return true;
    }

    false
}

//! `ConnectionActor` - per-transport-connection actor.
//!
//! Each `ConnectionActor`:
//! - Owns the outbound frame queue for exactly one WebSocket connection
//! - Delivers `ServerMessage`s from the room to the socket writer task
//! - Carries the close decision (eviction, consultation end, teardown)
//!
//! The actor mailbox is the single ordered channel per directed pair:
//! frames enqueued for this connection are written to the socket in
//! exactly the order the room emitted them.
//!
//! # Lifecycle
//!
//! 1. Spawned by the `RoomActor` when a join is accepted
//! 2. Runs until the connection closes, the participant leaves, or the
//!    room tears down
//! 3. Cancellation propagates to the socket read/write tasks via the
//!    shared token

use crate::errors::CoreError;

use super::messages::{CloseReason, ConnectionMessage};

use common::types::{SessionId, UserId};
use signal_protocol::ServerMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 64;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    session_id: SessionId,
    user_id: UserId,
}

impl ConnectionActorHandle {
    /// Get the session ID.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Get the user ID.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Deliver a frame to the client.
    pub async fn deliver(&self, message: ServerMessage) -> Result<(), CoreError> {
        self.sender
            .send(ConnectionMessage::Deliver { message })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))
    }

    /// Close the connection.
    pub async fn close(&self, reason: CloseReason) -> Result<(), CoreError> {
        self.sender
            .send(ConnectionMessage::Close { reason })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))
    }

    /// Cancel the connection actor (and the socket tasks watching the
    /// token).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for the socket read/write tasks.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    /// Session ID of this connection within its room.
    session_id: SessionId,
    /// Owning user.
    user_id: UserId,
    /// Message receiver.
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Outbound frame queue drained by the socket writer task.
    outbound: mpsc::Sender<ServerMessage>,
    /// Cancellation token (child of the room's token).
    cancel_token: CancellationToken,
    /// Whether the connection is closing.
    is_closing: bool,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        session_id: SessionId,
        user_id: UserId,
        outbound: mpsc::Sender<ServerMessage>,
        cancel_token: CancellationToken,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);

        let actor = Self {
            session_id,
            user_id: user_id.clone(),
            receiver,
            outbound,
            cancel_token: cancel_token.clone(),
            is_closing: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            session_id,
            user_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    async fn run(mut self) {
        debug!(
            target: "cc.actor.connection",
            session_id = %self.session_id,
            user_id = %self.user_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "cc.actor.connection",
                        session_id = %self.session_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            if self.handle_message(message).await {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "cc.actor.connection",
                                session_id = %self.session_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        // Make sure the socket tasks wind down with us.
        self.cancel_token.cancel();

        info!(
            target: "cc.actor.connection",
            session_id = %self.session_id,
            user_id = %self.user_id,
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Deliver { message } => {
                self.handle_deliver(message).await;
                false
            }

            ConnectionMessage::Close { reason } => {
                self.handle_close(reason);
                true
            }
        }
    }

    /// Forward a frame to the socket writer.
    async fn handle_deliver(&mut self, message: ServerMessage) {
        if self.is_closing {
            return;
        }

        if self.outbound.send(message).await.is_err() {
            // Writer task is gone; the transport already dropped.
            warn!(
                target: "cc.actor.connection",
                session_id = %self.session_id,
                "Outbound queue closed, cancelling connection"
            );
            self.is_closing = true;
            self.cancel_token.cancel();
        }
    }

    /// Begin closing the connection.
    fn handle_close(&mut self, reason: CloseReason) {
        if self.is_closing {
            return;
        }

        self.is_closing = true;

        debug!(
            target: "cc.actor.connection",
            session_id = %self.session_id,
            reason = reason.as_str(),
            "Closing connection"
        );

        self.cancel_token.cancel();
    }
}

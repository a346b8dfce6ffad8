//! `RoomActor` - per-consultation actor that owns room state.
//!
//! Each `RoomActor`:
//! - Owns the two participant slots, their media flags, and the
//!   negotiation-configuration payload handed to clients on join
//! - Supervises one `ConnectionActor` per occupant
//! - Relays opaque negotiation frames between the occupants and tracks
//!   the per-kind channel state machine
//! - Tears itself down when the last occupant leaves, on explicit end,
//!   or on cancellation from the registry
//!
//! # Admission rules
//!
//! - At most two concurrent sessions; a third distinct identity is
//!   rejected with `room-full`
//! - A repeat join by an identity that already holds a session follows
//!   last-writer-wins: the stale session is notified, closed, and
//!   replaced by the new one

use crate::channels::NegotiationCoordinator;
use crate::errors::CoreError;
use crate::observability::CoreMetrics;

use super::connection::{ConnectionActor, ConnectionActorHandle};
use super::messages::{
    CloseReason, JoinOutcome, OccupantInfo, RelayFrame, RoomMessage, RoomSnapshot,
};

use common::types::{ConsultationId, SessionId, UserId};
use signal_protocol::{ChannelKind, MediaFlags, PeerSummary, Role, ServerMessage, SessionConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 256;

/// How often the room checks its connection actors for silent exits.
const CONNECTION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// How long teardown waits for a connection actor task.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    consultation_id: ConsultationId,
}

impl RoomActorHandle {
    /// Get the consultation ID.
    #[must_use]
    pub fn consultation_id(&self) -> &ConsultationId {
        &self.consultation_id
    }

    /// Whether two handles address the same room actor.
    #[must_use]
    pub fn same_room(&self, other: &RoomActorHandle) -> bool {
        self.sender.same_channel(&other.sender)
    }

    /// Request admission of a new connection.
    ///
    /// `outbound` is the frame queue drained by the connection's socket
    /// writer; the room spawns a `ConnectionActor` in front of it and
    /// returns the actor handle in the outcome.
    pub async fn join(
        &self,
        session_id: SessionId,
        user_id: UserId,
        role: Role,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<JoinOutcome, CoreError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                session_id,
                user_id,
                role,
                outbound,
                respond_to: tx,
            })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CoreError::Internal(format!("response receive failed: {e}")))?
    }

    /// A participant leaves explicitly.
    pub async fn leave(&self, session_id: SessionId) -> Result<(), CoreError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Leave {
                session_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CoreError::Internal(format!("response receive failed: {e}")))?
    }

    /// A participant's transport dropped.
    pub async fn disconnected(&self, session_id: SessionId) -> Result<(), CoreError> {
        self.sender
            .send(RoomMessage::Disconnected { session_id })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))
    }

    /// Forward a negotiation frame.
    pub async fn relay(&self, session_id: SessionId, frame: RelayFrame) -> Result<(), CoreError> {
        self.sender
            .send(RoomMessage::Relay { session_id, frame })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))
    }

    /// Update the sender's microphone/camera flags.
    pub async fn toggle_media(
        &self,
        session_id: SessionId,
        audio_enabled: Option<bool>,
        video_enabled: Option<bool>,
    ) -> Result<(), CoreError> {
        self.sender
            .send(RoomMessage::ToggleMedia {
                session_id,
                audio_enabled,
                video_enabled,
            })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))
    }

    /// Begin (or restart) a screen-share.
    pub async fn start_screen_share(&self, session_id: SessionId) -> Result<(), CoreError> {
        self.sender
            .send(RoomMessage::StartScreenShare { session_id })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))
    }

    /// Stop an active screen-share.
    pub async fn stop_screen_share(&self, session_id: SessionId) -> Result<(), CoreError> {
        self.sender
            .send(RoomMessage::StopScreenShare { session_id })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))
    }

    /// End the consultation for both parties.
    pub async fn end_consultation(&self, session_id: SessionId) -> Result<(), CoreError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::EndConsultation {
                session_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CoreError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get current room state.
    pub async fn get_state(&self) -> Result<RoomSnapshot, CoreError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CoreError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token that follows the room's lifetime.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// One occupant slot.
struct Occupant {
    session_id: SessionId,
    user_id: UserId,
    role: Role,
    media: MediaFlags,
    /// Handle to the connection actor.
    connection: ConnectionActorHandle,
    /// Join handle for supervision.
    conn_task: JoinHandle<()>,
}

impl Occupant {
    fn to_summary(&self) -> PeerSummary {
        PeerSummary {
            user_id: self.user_id.clone(),
            role: self.role,
            media: self.media,
        }
    }

    fn to_info(&self) -> OccupantInfo {
        OccupantInfo {
            session_id: self.session_id,
            user_id: self.user_id.clone(),
            role: self.role,
            media: self.media,
        }
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    /// Consultation this room serves.
    consultation_id: ConsultationId,
    /// Message receiver.
    receiver: mpsc::Receiver<RoomMessage>,
    /// Cancellation token (child of the registry's token).
    cancel_token: CancellationToken,
    /// Negotiation configuration handed to clients on join.
    config: SessionConfig,
    /// Occupants by session ID (at most two).
    occupants: HashMap<SessionId, Occupant>,
    /// Negotiation channel coordinator.
    channels: NegotiationCoordinator,
    /// Room creation timestamp.
    created_at: i64,
    /// Most recent join/relay/flag activity.
    last_activity: Instant,
    /// Set while the room has zero occupants.
    empty_since: Option<Instant>,
    /// Whether the room is tearing down.
    is_closing: bool,
    /// Shared metrics.
    metrics: Arc<CoreMetrics>,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        consultation_id: ConsultationId,
        config: SessionConfig,
        cancel_token: CancellationToken,
        metrics: Arc<CoreMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        metrics.room_opened();

        let actor = Self {
            consultation_id: consultation_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            config,
            occupants: HashMap::new(),
            channels: NegotiationCoordinator::new(),
            created_at: chrono::Utc::now().timestamp(),
            last_activity: Instant::now(),
            empty_since: Some(Instant::now()),
            is_closing: false,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            consultation_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "cc.actor.room", fields(consultation_id = %self.consultation_id))]
    async fn run(mut self) {
        info!(
            target: "cc.actor.room",
            consultation_id = %self.consultation_id,
            "RoomActor started"
        );

        let mut health_check = tokio::time::interval(CONNECTION_CHECK_INTERVAL);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "cc.actor.room",
                        consultation_id = %self.consultation_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = health_check.tick() => {
                    self.check_connection_health().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                        }
                        None => {
                            info!(
                                target: "cc.actor.room",
                                consultation_id = %self.consultation_id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.metrics.room_closed();

        info!(
            target: "cc.actor.room",
            consultation_id = %self.consultation_id,
            "RoomActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                session_id,
                user_id,
                role,
                outbound,
                respond_to,
            } => {
                let result = self.handle_join(session_id, user_id, role, outbound).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Leave {
                session_id,
                respond_to,
            } => {
                let result = if self.remove_session(session_id, CloseReason::RoomClosed).await {
                    Ok(())
                } else {
                    Err(CoreError::SessionNotFound)
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::Disconnected { session_id } => {
                // Stale disconnects (already-evicted sessions) are no-ops.
                let _ = self.remove_session(session_id, CloseReason::RoomClosed).await;
            }

            RoomMessage::Relay { session_id, frame } => {
                self.handle_relay(session_id, frame).await;
            }

            RoomMessage::ToggleMedia {
                session_id,
                audio_enabled,
                video_enabled,
            } => {
                self.handle_toggle_media(session_id, audio_enabled, video_enabled)
                    .await;
            }

            RoomMessage::StartScreenShare { session_id } => {
                self.handle_start_screen_share(session_id).await;
            }

            RoomMessage::StopScreenShare { session_id } => {
                self.handle_stop_screen_share(session_id).await;
            }

            RoomMessage::EndConsultation {
                session_id,
                respond_to,
            } => {
                let result = self.handle_end_consultation(session_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    /// Handle a new connection joining.
    #[instrument(skip_all, fields(consultation_id = %self.consultation_id, user_id = %user_id))]
    async fn handle_join(
        &mut self,
        session_id: SessionId,
        user_id: UserId,
        role: Role,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<JoinOutcome, CoreError> {
        if self.is_closing {
            return Err(CoreError::Draining);
        }

        // Last-writer-wins: a repeat join by the same identity evicts the
        // stale session before the new one is admitted.
        let stale_session = self
            .occupants
            .values()
            .find(|o| o.user_id == user_id)
            .map(|o| o.session_id);
        if let Some(stale_id) = stale_session {
            self.evict_session(stale_id).await;
        }

        if self.occupants.len() >= 2 {
            return Err(CoreError::RoomFull);
        }

        // Spawn the connection actor in front of the socket writer queue.
        let conn_token = CancellationToken::new();
        let (conn_handle, conn_task) =
            ConnectionActor::spawn(session_id, user_id.clone(), outbound, conn_token);

        let other_occupant = self.occupants.values().next().map(Occupant::to_summary);

        // Deliver the join reply through the connection queue before any
        // broadcast can land there, so `room-joined` is always first.
        let _ = conn_handle
            .deliver(ServerMessage::RoomJoined {
                config: self.config.clone(),
                other_occupant: other_occupant.clone(),
            })
            .await;

        let occupant = Occupant {
            session_id,
            user_id: user_id.clone(),
            role,
            media: MediaFlags::default(),
            connection: conn_handle.clone(),
            conn_task,
        };
        let summary = occupant.to_summary();

        self.occupants.insert(session_id, occupant);
        self.empty_since = None;
        self.touch();
        self.metrics.session_opened();

        self.broadcast_to_others(session_id, ServerMessage::PeerJoined { peer: summary })
            .await;

        info!(
            target: "cc.actor.room",
            occupants = self.occupants.len(),
            role = role.as_str(),
            "Participant joined"
        );

        Ok(JoinOutcome {
            connection: conn_handle,
            config: self.config.clone(),
            other_occupant,
        })
    }

    /// Evict a stale session in favor of a newer connection for the same
    /// identity. Does not trigger room teardown even if the room is
    /// transiently empty: the replacement is admitted right after.
    async fn evict_session(&mut self, session_id: SessionId) {
        let Some(stale) = self.occupants.remove(&session_id) else {
            return;
        };

        info!(
            target: "cc.actor.room",
            consultation_id = %self.consultation_id,
            user_id = %stale.user_id,
            "Evicting stale session, newer connection takes over"
        );

        // The stale transport is gone as far as negotiation is concerned.
        self.settle_channels_after_leave(&stale.user_id).await;

        self.broadcast_to_all(ServerMessage::PeerLeft {
            user_id: stale.user_id.clone(),
        })
        .await;

        let _ = stale
            .connection
            .deliver(ServerMessage::SessionReplaced {})
            .await;
        let _ = stale.connection.close(CloseReason::Replaced).await;
        let _ = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, stale.conn_task).await;

        self.metrics.session_closed();
    }

    /// Remove a session (explicit leave or transport disconnect).
    ///
    /// Returns false when the session is unknown (stale event). When the
    /// last occupant goes, the room tears itself down; the registry reaps
    /// the finished task.
    async fn remove_session(&mut self, session_id: SessionId, reason: CloseReason) -> bool {
        let Some(occupant) = self.occupants.remove(&session_id) else {
            return false;
        };

        debug!(
            target: "cc.actor.room",
            consultation_id = %self.consultation_id,
            user_id = %occupant.user_id,
            reason = reason.as_str(),
            "Participant session removed"
        );

        self.touch();

        // Every open channel involved the leaver; close them all and let
        // the survivor release whatever it was rendering.
        self.settle_channels_after_leave(&occupant.user_id).await;

        self.broadcast_to_all(ServerMessage::PeerLeft {
            user_id: occupant.user_id.clone(),
        })
        .await;

        let _ = occupant.connection.close(reason).await;
        let _ = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, occupant.conn_task).await;

        self.metrics.session_closed();

        if self.occupants.is_empty() {
            self.empty_since = Some(Instant::now());

            info!(
                target: "cc.actor.room",
                consultation_id = %self.consultation_id,
                "Last occupant left, closing room"
            );

            self.is_closing = true;
            self.channels.close_all();
            self.cancel_token.cancel();
        } else {
            info!(
                target: "cc.actor.room",
                consultation_id = %self.consultation_id,
                remaining = self.occupants.len(),
                "Participant left"
            );
        }

        true
    }

    /// Close every channel after a participant is gone.
    ///
    /// A share the survivor originated dies with its viewer, so the
    /// survivor's flag resets too; a share the leaver originated gets a
    /// `peer-screen-share-stopped` so the viewer stops rendering a
    /// now-dead stream.
    async fn settle_channels_after_leave(&mut self, leaver: &UserId) {
        let closed = self.channels.participant_left();
        for channel in &closed {
            if channel.kind != ChannelKind::ScreenShare {
                continue;
            }

            if let Some(survivor) = self
                .occupants
                .values_mut()
                .find(|o| o.user_id == channel.originator)
            {
                survivor.media.screen_sharing = false;
            }

            if channel.originator == *leaver {
                self.broadcast_to_all(ServerMessage::PeerScreenShareStopped {
                    user_id: channel.originator.clone(),
                })
                .await;
            }
        }
    }

    /// Relay one opaque negotiation frame.
    ///
    /// The payload is never inspected; only the kind tag drives the
    /// channel state machine. A missing target is a silent drop:
    /// negotiation is transient and a stale target means the consultation
    /// has already moved on.
    async fn handle_relay(&mut self, session_id: SessionId, frame: RelayFrame) {
        let Some(sender) = self.occupants.get(&session_id) else {
            warn!(
                target: "cc.actor.room",
                consultation_id = %self.consultation_id,
                "Relay from unknown session, ignoring"
            );
            return;
        };
        let from_user = sender.user_id.clone();

        self.touch();

        let target_connection = match frame.target() {
            Some(user) if *user == from_user => None,
            Some(user) => self
                .occupants
                .values()
                .find(|o| o.user_id == *user)
                .map(|o| o.connection.clone()),
            None => self
                .occupants
                .values()
                .find(|o| o.session_id != session_id)
                .map(|o| o.connection.clone()),
        };

        let Some(target) = target_connection else {
            debug!(
                target: "cc.actor.room",
                consultation_id = %self.consultation_id,
                kind = frame.kind().as_str(),
                "Relay target absent, dropping frame"
            );
            self.metrics.relay_dropped();
            return;
        };

        match &frame {
            RelayFrame::Offer { kind, .. } => self.channels.offer(*kind, &from_user),
            RelayFrame::Answer { kind, .. } => self.channels.answer(*kind, &from_user),
            RelayFrame::IceCandidate { .. } => {}
        }

        let kind = frame.kind();
        if target.deliver(frame.into_server_message(from_user)).await.is_ok() {
            self.metrics.relay_forwarded(kind.as_str());
        } else {
            self.metrics.relay_dropped();
        }
    }

    /// Handle a microphone/camera flag update.
    async fn handle_toggle_media(
        &mut self,
        session_id: SessionId,
        audio_enabled: Option<bool>,
        video_enabled: Option<bool>,
    ) {
        let update = if let Some(occupant) = self.occupants.get_mut(&session_id) {
            if let Some(audio) = audio_enabled {
                occupant.media.audio_enabled = audio;
            }
            if let Some(video) = video_enabled {
                occupant.media.video_enabled = video;
            }

            Some(ServerMessage::PeerMediaChanged {
                user_id: occupant.user_id.clone(),
                media: occupant.media,
            })
        } else {
            None
        };

        if let Some(update) = update {
            self.touch();
            self.broadcast_to_others(session_id, update).await;
        }
    }

    /// Handle a screen-share start (or restart).
    async fn handle_start_screen_share(&mut self, session_id: SessionId) {
        let Some(occupant) = self.occupants.get_mut(&session_id) else {
            return;
        };
        occupant.media.screen_sharing = true;
        let user_id = occupant.user_id.clone();

        self.touch();

        let outcome = self.channels.start_screen_share(&user_id);
        if let Some(replaced) = outcome.replaced {
            // Implicit stop of the previous share: notify its viewer(s).
            if replaced.originator != user_id {
                if let Some(previous) = self
                    .occupants
                    .values_mut()
                    .find(|o| o.user_id == replaced.originator)
                {
                    previous.media.screen_sharing = false;
                }
            }
            self.broadcast_except_user(
                &replaced.originator,
                ServerMessage::PeerScreenShareStopped {
                    user_id: replaced.originator.clone(),
                },
            )
            .await;
        }

        self.broadcast_to_others(
            session_id,
            ServerMessage::PeerScreenShareStarted {
                user_id: user_id.clone(),
            },
        )
        .await;

        info!(
            target: "cc.actor.room",
            consultation_id = %self.consultation_id,
            user_id = %user_id,
            "Screen-share started"
        );
    }

    /// Handle a screen-share stop. Idempotent: stopping with no active
    /// share is a no-op.
    async fn handle_stop_screen_share(&mut self, session_id: SessionId) {
        let Some(occupant) = self.occupants.get_mut(&session_id) else {
            return;
        };
        occupant.media.screen_sharing = false;
        let user_id = occupant.user_id.clone();

        self.touch();

        if self.channels.stop_screen_share(&user_id).is_some() {
            self.broadcast_to_others(
                session_id,
                ServerMessage::PeerScreenShareStopped {
                    user_id: user_id.clone(),
                },
            )
            .await;

            info!(
                target: "cc.actor.room",
                consultation_id = %self.consultation_id,
                user_id = %user_id,
                "Screen-share stopped"
            );
        }
    }

    /// Handle an explicit end-consultation.
    async fn handle_end_consultation(&mut self, session_id: SessionId) -> Result<(), CoreError> {
        let Some(occupant) = self.occupants.get(&session_id) else {
            return Err(CoreError::SessionNotFound);
        };
        let ended_by = occupant.user_id.clone();

        info!(
            target: "cc.actor.room",
            consultation_id = %self.consultation_id,
            ended_by = %ended_by,
            occupants = self.occupants.len(),
            "Ending consultation"
        );

        self.is_closing = true;
        self.channels.close_all();

        self.broadcast_to_others(
            session_id,
            ServerMessage::ConsultationEnded {
                ended_by: Some(ended_by),
            },
        )
        .await;

        // Close every connection; the close lands behind any pending
        // deliveries in each mailbox.
        for (_, occupant) in self.occupants.drain() {
            let _ = occupant
                .connection
                .close(CloseReason::ConsultationEnded)
                .await;
            let _ = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, occupant.conn_task).await;
            self.metrics.session_closed();
        }

        self.empty_since = Some(Instant::now());
        self.cancel_token.cancel();

        Ok(())
    }

    /// Build a state snapshot.
    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            consultation_id: self.consultation_id.clone(),
            occupants: self.occupants.values().map(Occupant::to_info).collect(),
            channels: self.channels.open_channels(),
            created_at: self.created_at,
            idle_for_seconds: self.last_activity.elapsed().as_secs(),
            empty_for_seconds: self.empty_since.map(|t| t.elapsed().as_secs()),
            is_closing: self.is_closing,
        }
    }

    /// Record activity for idle accounting.
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Reap connection actors that exited without a disconnect event
    /// (e.g. after a socket task failure) and treat them as disconnects.
    async fn check_connection_health(&mut self) {
        let finished: Vec<SessionId> = self
            .occupants
            .values()
            .filter(|o| o.conn_task.is_finished())
            .map(|o| o.session_id)
            .collect();

        for session_id in finished {
            debug!(
                target: "cc.actor.room",
                consultation_id = %self.consultation_id,
                session_id = %session_id,
                "Connection actor exited, treating as disconnect"
            );
            let _ = self.remove_session(session_id, CloseReason::RoomClosed).await;
        }
    }

    /// Perform graceful shutdown (cancellation from the registry).
    async fn graceful_shutdown(&mut self) {
        if self.occupants.is_empty() {
            return;
        }

        info!(
            target: "cc.actor.room",
            consultation_id = %self.consultation_id,
            occupants = self.occupants.len(),
            "Performing graceful shutdown"
        );

        self.is_closing = true;
        self.channels.close_all();

        for (_, occupant) in self.occupants.drain() {
            let _ = occupant
                .connection
                .deliver(ServerMessage::ConsultationEnded { ended_by: None })
                .await;
            let _ = occupant.connection.close(CloseReason::RoomClosed).await;
            let _ = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, occupant.conn_task).await;
            self.metrics.session_closed();
        }
    }

    /// Broadcast to every occupant except the given session.
    async fn broadcast_to_others(&self, except_session: SessionId, message: ServerMessage) {
        for occupant in self.occupants.values() {
            if occupant.session_id != except_session {
                let _ = occupant.connection.deliver(message.clone()).await;
            }
        }
    }

    /// Broadcast to every occupant except the given user.
    async fn broadcast_except_user(&self, except_user: &UserId, message: ServerMessage) {
        for occupant in self.occupants.values() {
            if occupant.user_id != *except_user {
                let _ = occupant.connection.deliver(message.clone()).await;
            }
        }
    }

    /// Broadcast to every current occupant.
    async fn broadcast_to_all(&self, message: ServerMessage) {
        for occupant in self.occupants.values() {
            let _ = occupant.connection.deliver(message.clone()).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use signal_protocol::DenyReason;

    fn spawn_room() -> (RoomActorHandle, JoinHandle<()>) {
        RoomActor::spawn(
            ConsultationId::from("consult-1"),
            SessionConfig::default(),
            CancellationToken::new(),
            CoreMetrics::new(),
        )
    }

    async fn join(
        room: &RoomActorHandle,
        user: &str,
        role: Role,
    ) -> (SessionId, mpsc::Receiver<ServerMessage>, JoinOutcome) {
        let (tx, rx) = mpsc::channel(32);
        let session_id = SessionId::new();
        let outcome = room
            .join(session_id, UserId::from(user), role, tx)
            .await
            .expect("join should succeed");
        (session_id, rx, outcome)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame should arrive in time")
            .expect("queue should be open")
    }

    /// Skip frames until one matches the predicate.
    async fn next_matching(
        rx: &mut mpsc::Receiver<ServerMessage>,
        mut predicate: impl FnMut(&ServerMessage) -> bool,
    ) -> ServerMessage {
        loop {
            let frame = next_frame(rx).await;
            if predicate(&frame) {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn test_first_frame_is_room_joined() {
        let (room, _task) = spawn_room();

        let (_session, mut rx, _outcome) = join(&room, "dr-a", Role::Provider).await;
        let frame = next_frame(&mut rx).await;
        assert!(matches!(frame, ServerMessage::RoomJoined { other_occupant: None, .. }));

        room.cancel();
    }

    #[tokio::test]
    async fn test_second_join_sees_other_occupant_and_broadcasts() {
        let (room, _task) = spawn_room();

        let (_s1, mut rx1, _) = join(&room, "dr-a", Role::Provider).await;
        let _ = next_frame(&mut rx1).await; // room-joined

        let (_s2, mut rx2, outcome) = join(&room, "pt-b", Role::Patient).await;
        assert_eq!(
            outcome.other_occupant.as_ref().map(|p| p.user_id.clone()),
            Some(UserId::from("dr-a"))
        );

        let frame = next_frame(&mut rx2).await;
        assert!(matches!(
            frame,
            ServerMessage::RoomJoined { other_occupant: Some(ref peer), .. }
                if peer.user_id == UserId::from("dr-a")
        ));

        // The first occupant hears about the join.
        let frame = next_frame(&mut rx1).await;
        assert!(matches!(
            frame,
            ServerMessage::PeerJoined { ref peer } if peer.user_id == UserId::from("pt-b")
        ));

        room.cancel();
    }

    #[tokio::test]
    async fn test_third_distinct_identity_is_rejected_room_full() {
        let (room, _task) = spawn_room();

        let (_s1, _rx1, _) = join(&room, "dr-a", Role::Provider).await;
        let (_s2, _rx2, _) = join(&room, "pt-b", Role::Patient).await;

        let (tx, _rx) = mpsc::channel(32);
        let result = room
            .join(SessionId::new(), UserId::from("intruder"), Role::Patient, tx)
            .await;

        let err = result.expect_err("third join should be denied");
        assert!(matches!(err, CoreError::RoomFull));
        assert_eq!(err.deny_reason(), Some(DenyReason::RoomFull));

        let state = room.get_state().await.unwrap();
        assert_eq!(state.occupants.len(), 2);

        room.cancel();
    }

    #[tokio::test]
    async fn test_reconnect_evicts_stale_session() {
        let (room, _task) = spawn_room();

        let (_s1, mut rx1, outcome1) = join(&room, "dr-a", Role::Provider).await;
        let _ = next_frame(&mut rx1).await; // room-joined

        // Same identity joins again: last writer wins.
        let (_s2, mut rx2, _outcome2) = join(&room, "dr-a", Role::Provider).await;

        // The stale connection is told it was replaced, then closed.
        let frame = next_matching(&mut rx1, |f| {
            matches!(f, ServerMessage::SessionReplaced {})
        })
        .await;
        assert!(matches!(frame, ServerMessage::SessionReplaced {}));

        tokio::time::timeout(
            Duration::from_secs(1),
            outcome1.connection.child_token().cancelled(),
        )
        .await
        .expect("stale connection should be cancelled");

        // Exactly one active session for the identity remains.
        let state = room.get_state().await.unwrap();
        assert_eq!(state.occupants.len(), 1);
        assert_eq!(state.occupants[0].user_id, UserId::from("dr-a"));

        // The new connection got a normal join reply.
        let frame = next_frame(&mut rx2).await;
        assert!(matches!(frame, ServerMessage::RoomJoined { .. }));

        room.cancel();
    }

    #[tokio::test]
    async fn test_relay_preserves_order_per_directed_pair() {
        let (room, _task) = spawn_room();

        let (s1, _rx1, _) = join(&room, "dr-a", Role::Provider).await;
        let (_s2, mut rx2, _) = join(&room, "pt-b", Role::Patient).await;

        for i in 0..10 {
            room.relay(
                s1,
                RelayFrame::IceCandidate {
                    kind: ChannelKind::Primary,
                    candidate: format!("candidate:{i}"),
                    target: None,
                },
            )
            .await
            .unwrap();
        }

        for i in 0..10 {
            let frame =
                next_matching(&mut rx2, |f| matches!(f, ServerMessage::IceCandidate { .. })).await;
            assert!(matches!(
                frame,
                ServerMessage::IceCandidate { candidate, from, .. }
                    if candidate == format!("candidate:{i}") && from == UserId::from("dr-a")
            ));
        }

        room.cancel();
    }

    #[tokio::test]
    async fn test_relay_with_no_target_is_dropped_silently() {
        let metrics = CoreMetrics::new();
        let (room, _task) = RoomActor::spawn(
            ConsultationId::from("consult-drop"),
            SessionConfig::default(),
            CancellationToken::new(),
            Arc::clone(&metrics),
        );

        let (s1, mut rx1, _) = join(&room, "dr-a", Role::Provider).await;
        let _ = next_frame(&mut rx1).await; // room-joined

        room.relay(
            s1,
            RelayFrame::Offer {
                kind: ChannelKind::Primary,
                sdp: "v=0".to_string(),
                target: None,
            },
        )
        .await
        .unwrap();

        // Let the actor process the frame, then confirm nothing bounced
        // back and the drop was counted.
        let state = room.get_state().await.unwrap();
        assert_eq!(state.occupants.len(), 1);
        assert_eq!(metrics.relays_dropped(), 1);
        assert!(rx1.try_recv().is_err());

        room.cancel();
    }

    #[tokio::test]
    async fn test_toggle_media_broadcasts_to_peer_only() {
        let (room, _task) = spawn_room();

        let (s1, mut rx1, _) = join(&room, "dr-a", Role::Provider).await;
        let (_s2, mut rx2, _) = join(&room, "pt-b", Role::Patient).await;
        let _ = next_frame(&mut rx1).await; // room-joined
        let _ = next_frame(&mut rx1).await; // peer-joined
        let _ = next_frame(&mut rx2).await; // room-joined

        room.toggle_media(s1, Some(false), None).await.unwrap();

        let frame = next_frame(&mut rx2).await;
        assert!(matches!(
            frame,
            ServerMessage::PeerMediaChanged { ref user_id, media }
                if *user_id == UserId::from("dr-a")
                    && !media.audio_enabled
                    && media.video_enabled
        ));

        // Never echoed back to the originator.
        assert!(rx1.try_recv().is_err());

        room.cancel();
    }

    #[tokio::test]
    async fn test_screen_share_restart_emits_exactly_one_stop() {
        let (room, _task) = spawn_room();

        let (s1, _rx1, _) = join(&room, "dr-a", Role::Provider).await;
        let (s2, mut rx2, _) = join(&room, "pt-b", Role::Patient).await;
        let _ = next_frame(&mut rx2).await; // room-joined

        // First share reaches Established.
        room.start_screen_share(s1).await.unwrap();
        room.relay(
            s1,
            RelayFrame::Offer {
                kind: ChannelKind::ScreenShare,
                sdp: "v=0".to_string(),
                target: None,
            },
        )
        .await
        .unwrap();
        room.relay(
            s2,
            RelayFrame::Answer {
                kind: ChannelKind::ScreenShare,
                sdp: "v=0".to_string(),
                target: None,
            },
        )
        .await
        .unwrap();

        let state = room.get_state().await.unwrap();
        assert!(state
            .channels
            .iter()
            .any(|c| c.kind == ChannelKind::ScreenShare
                && c.state == crate::channels::ChannelState::Established));

        let frame = next_matching(&mut rx2, |f| {
            matches!(f, ServerMessage::PeerScreenShareStarted { .. })
        })
        .await;
        assert!(matches!(frame, ServerMessage::PeerScreenShareStarted { .. }));

        // Restart while established: the peer sees exactly one stop, then
        // the new share starting.
        room.start_screen_share(s1).await.unwrap();

        let frame = next_matching(&mut rx2, |f| {
            matches!(f, ServerMessage::PeerScreenShareStopped { .. })
        })
        .await;
        assert!(matches!(frame, ServerMessage::PeerScreenShareStopped { .. }));
        let frame = next_frame(&mut rx2).await;
        assert!(matches!(frame, ServerMessage::PeerScreenShareStarted { .. }));

        let state = room.get_state().await.unwrap();
        assert!(state
            .channels
            .iter()
            .any(|c| c.kind == ChannelKind::ScreenShare
                && c.state == crate::channels::ChannelState::Negotiating));

        // No second stop: the queue is drained after the new start.
        assert!(rx2.try_recv().is_err());

        room.cancel();
    }

    #[tokio::test]
    async fn test_stop_screen_share_without_share_is_noop() {
        let (room, _task) = spawn_room();

        let (s1, _rx1, _) = join(&room, "dr-a", Role::Provider).await;
        let (_s2, mut rx2, _) = join(&room, "pt-b", Role::Patient).await;
        let _ = next_frame(&mut rx2).await; // room-joined

        room.stop_screen_share(s1).await.unwrap();

        let state = room.get_state().await.unwrap();
        assert!(state.channels.is_empty());
        assert!(rx2.try_recv().is_err());

        room.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_cascade() {
        let (room, task) = spawn_room();

        let (s1, _rx1, _) = join(&room, "dr-a", Role::Provider).await;
        let (s2, mut rx2, _) = join(&room, "pt-b", Role::Patient).await;
        let _ = next_frame(&mut rx2).await; // room-joined

        // Establish primary and screen-share channels.
        room.relay(
            s1,
            RelayFrame::Offer {
                kind: ChannelKind::Primary,
                sdp: "v=0".to_string(),
                target: None,
            },
        )
        .await
        .unwrap();
        room.relay(
            s2,
            RelayFrame::Answer {
                kind: ChannelKind::Primary,
                sdp: "v=0".to_string(),
                target: None,
            },
        )
        .await
        .unwrap();
        room.start_screen_share(s1).await.unwrap();
        room.relay(
            s1,
            RelayFrame::Offer {
                kind: ChannelKind::ScreenShare,
                sdp: "v=0".to_string(),
                target: None,
            },
        )
        .await
        .unwrap();
        room.relay(
            s2,
            RelayFrame::Answer {
                kind: ChannelKind::ScreenShare,
                sdp: "v=0".to_string(),
                target: None,
            },
        )
        .await
        .unwrap();

        let state = room.get_state().await.unwrap();
        assert_eq!(state.channels.len(), 2);

        // A's transport drops.
        room.disconnected(s1).await.unwrap();

        // B is told the share died and that the peer left.
        let frame = next_matching(&mut rx2, |f| {
            matches!(f, ServerMessage::PeerScreenShareStopped { .. })
        })
        .await;
        assert!(matches!(
            frame,
            ServerMessage::PeerScreenShareStopped { ref user_id } if *user_id == UserId::from("dr-a")
        ));
        let frame = next_matching(&mut rx2, |f| matches!(f, ServerMessage::PeerLeft { .. })).await;
        assert!(matches!(
            frame,
            ServerMessage::PeerLeft { ref user_id } if *user_id == UserId::from("dr-a")
        ));

        // B alone is not enough to close the room.
        let state = room.get_state().await.unwrap();
        assert_eq!(state.occupants.len(), 1);
        assert!(state.channels.is_empty());
        assert!(!state.is_closing);

        // Once B leaves too, the room tears down.
        room.leave(s2).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("room task should finish")
            .expect("room task should not panic");
    }

    #[tokio::test]
    async fn test_survivor_share_flag_resets_when_viewer_leaves() {
        let (room, _task) = spawn_room();

        let (s1, _rx1, _) = join(&room, "dr-a", Role::Provider).await;
        let (s2, _rx2, _) = join(&room, "pt-b", Role::Patient).await;

        // The provider shares; the viewer then disconnects. The share has
        // nobody left to watch it, so it closes and the flag resets.
        room.start_screen_share(s1).await.unwrap();
        room.disconnected(s2).await.unwrap();

        let state = room.get_state().await.unwrap();
        assert!(state.channels.is_empty());
        assert_eq!(state.occupants.len(), 1);
        assert!(!state.occupants[0].media.screen_sharing);

        room.cancel();
    }

    #[tokio::test]
    async fn test_end_consultation_notifies_peer_and_closes_room() {
        let (room, task) = spawn_room();

        let (s1, _rx1, _) = join(&room, "dr-a", Role::Provider).await;
        let (_s2, mut rx2, outcome2) = join(&room, "pt-b", Role::Patient).await;
        let _ = next_frame(&mut rx2).await; // room-joined

        room.end_consultation(s1).await.unwrap();

        let frame = next_matching(&mut rx2, |f| {
            matches!(f, ServerMessage::ConsultationEnded { .. })
        })
        .await;
        assert!(matches!(
            frame,
            ServerMessage::ConsultationEnded { ended_by: Some(ref who) }
                if *who == UserId::from("dr-a")
        ));

        tokio::time::timeout(
            Duration::from_secs(1),
            outcome2.connection.child_token().cancelled(),
        )
        .await
        .expect("peer connection should be closed");

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("room task should finish")
            .expect("room task should not panic");
    }

    #[tokio::test]
    async fn test_leave_unknown_session_errors() {
        let (room, _task) = spawn_room();

        let result = room.leave(SessionId::new()).await;
        assert!(matches!(result, Err(CoreError::SessionNotFound)));

        room.cancel();
    }

    #[tokio::test]
    async fn test_stale_disconnect_after_eviction_keeps_new_session() {
        let (room, _task) = spawn_room();

        let (s1, _rx1, _) = join(&room, "dr-a", Role::Provider).await;
        let (_s2, _rx2, _) = join(&room, "dr-a", Role::Provider).await;

        // The old transport reports its disconnect after eviction; the
        // new session must survive.
        room.disconnected(s1).await.unwrap();

        let state = room.get_state().await.unwrap();
        assert_eq!(state.occupants.len(), 1);
        assert!(!state.is_closing);

        room.cancel();
    }
}

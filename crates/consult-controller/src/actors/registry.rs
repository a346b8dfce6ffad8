//! `RoomRegistryActor` - singleton owner of the consultation → room map.
//!
//! The registry is the only component that creates, looks up, or removes
//! rooms. All requests serialize through its mailbox, which makes room
//! creation exactly-once under concurrent first-join races and keeps
//! occupancy decisions consistent. Work inside a room never passes
//! through the registry: callers get a `RoomActorHandle` and talk to the
//! room directly, so rooms stay independent units of concurrency.
//!
//! The registry also runs the idle sweep: a periodic pass that reaps
//! rooms which have had zero occupants for longer than the grace period
//! (covering near-simultaneous disconnects and joins that never
//! completed), plus any room whose actor task already finished.

use crate::errors::CoreError;
use crate::observability::CoreMetrics;

use super::messages::{RegistryMessage, RegistryStatus};
use super::room::{RoomActor, RoomActorHandle};

use common::types::ConsultationId;
use signal_protocol::SessionConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 512;

/// How long the sweep waits for a room's state reply before treating the
/// room as unresponsive.
const SWEEP_STATE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long shutdown waits for each room task to drain.
const ROOM_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings the registry needs from configuration.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Grace period before a zero-occupant room is reaped.
    pub idle_grace: Duration,
    /// Interval of the idle sweep.
    pub sweep_interval: Duration,
    /// Maximum concurrent rooms before admissions are shed.
    pub max_rooms: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(20),
            max_rooms: 1_000,
        }
    }
}

/// Handle to the `RoomRegistryActor`.
///
/// This is the public interface for room lifecycle operations.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Create a new `RoomRegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(
        controller_id: String,
        settings: RegistrySettings,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor::new(
            controller_id,
            receiver,
            cancel_token.clone(),
            settings,
            metrics,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Look up the room for a consultation, creating it if absent.
    ///
    /// Creation is idempotent: concurrent calls for the same id all
    /// observe the same room.
    pub async fn get_or_create(
        &self,
        consultation_id: ConsultationId,
        config: SessionConfig,
    ) -> Result<RoomActorHandle, CoreError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreate {
                consultation_id,
                config,
                respond_to: tx,
            })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CoreError::Internal(format!("response receive failed: {e}")))?
    }

    /// Look up an existing room.
    pub async fn get(
        &self,
        consultation_id: ConsultationId,
    ) -> Result<Option<RoomActorHandle>, CoreError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Get {
                consultation_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CoreError::Internal(format!("response receive failed: {e}")))
    }

    /// Remove a room. Calling this for an already-removed or nonexistent
    /// room is a no-op, not an error.
    pub async fn remove(&self, consultation_id: ConsultationId) -> Result<(), CoreError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Remove {
                consultation_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CoreError::Internal(format!("response receive failed: {e}")))
    }

    /// Get the current registry status.
    pub async fn status(&self) -> Result<RegistryStatus, CoreError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Status { respond_to: tx })
            .await
            .map_err(|e| CoreError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CoreError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the registry (and, through child tokens, every room).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the registry is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token (used by the servers for graceful shutdown).
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    /// Handle to the room actor.
    handle: RoomActorHandle,
    /// Join handle for monitoring the actor task.
    task_handle: JoinHandle<()>,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    /// Controller instance ID (log context).
    controller_id: String,
    /// Message receiver.
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    /// Managed rooms by consultation ID.
    rooms: HashMap<ConsultationId, ManagedRoom>,
    /// Whether the registry is accepting new rooms.
    accepting_new: bool,
    /// Sweep and capacity settings.
    settings: RegistrySettings,
    /// Shared metrics.
    metrics: Arc<CoreMetrics>,
}

impl RoomRegistryActor {
    /// Create a new registry actor (not started).
    fn new(
        controller_id: String,
        receiver: mpsc::Receiver<RegistryMessage>,
        cancel_token: CancellationToken,
        settings: RegistrySettings,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            controller_id,
            receiver,
            cancel_token,
            rooms: HashMap::new(),
            accepting_new: true,
            settings,
            metrics,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "cc.actor.registry", fields(controller_id = %self.controller_id))]
    async fn run(mut self) {
        info!(
            target: "cc.actor.registry",
            controller_id = %self.controller_id,
            "RoomRegistryActor started"
        );

        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "cc.actor.registry",
                        controller_id = %self.controller_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = sweep.tick() => {
                    self.reap_finished();
                    self.sweep_idle_rooms().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                        }
                        None => {
                            info!(
                                target: "cc.actor.registry",
                                controller_id = %self.controller_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "cc.actor.registry",
            controller_id = %self.controller_id,
            rooms_remaining = self.rooms.len(),
            "RoomRegistryActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreate {
                consultation_id,
                config,
                respond_to,
            } => {
                let result = self.get_or_create(consultation_id, config);
                let _ = respond_to.send(result);
            }

            RegistryMessage::Get {
                consultation_id,
                respond_to,
            } => {
                let room = self
                    .rooms
                    .get(&consultation_id)
                    .filter(|m| !m.task_handle.is_finished())
                    .map(|m| m.handle.clone());
                let _ = respond_to.send(room);
            }

            RegistryMessage::Remove {
                consultation_id,
                respond_to,
            } => {
                self.remove_room(&consultation_id);
                let _ = respond_to.send(());
            }

            RegistryMessage::Status { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    room_count: self.rooms.len(),
                    is_draining: !self.accepting_new,
                });
            }
        }
    }

    /// Look up or create the room for a consultation.
    fn get_or_create(
        &mut self,
        consultation_id: ConsultationId,
        config: SessionConfig,
    ) -> Result<RoomActorHandle, CoreError> {
        if !self.accepting_new {
            return Err(CoreError::Draining);
        }

        // An existing live room wins; a finished one is reaped first so a
        // fresh consultation can re-form after teardown.
        if let Some(managed) = self.rooms.get(&consultation_id) {
            if managed.task_handle.is_finished() {
                debug!(
                    target: "cc.actor.registry",
                    consultation_id = %consultation_id,
                    "Replacing finished room"
                );
                self.rooms.remove(&consultation_id);
            } else {
                return Ok(managed.handle.clone());
            }
        }

        if self.rooms.len() >= self.settings.max_rooms {
            warn!(
                target: "cc.actor.registry",
                controller_id = %self.controller_id,
                max_rooms = self.settings.max_rooms,
                "Room capacity reached, shedding admission"
            );
            return Err(CoreError::CapacityExceeded);
        }

        let room_token = self.cancel_token.child_token();
        let (handle, task_handle) = RoomActor::spawn(
            consultation_id.clone(),
            config,
            room_token,
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            consultation_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );

        info!(
            target: "cc.actor.registry",
            controller_id = %self.controller_id,
            consultation_id = %consultation_id,
            total_rooms = self.rooms.len(),
            "Room created"
        );

        Ok(handle)
    }

    /// Remove a room, cancelling its actor. Idempotent.
    fn remove_room(&mut self, consultation_id: &ConsultationId) {
        let Some(managed) = self.rooms.remove(consultation_id) else {
            debug!(
                target: "cc.actor.registry",
                consultation_id = %consultation_id,
                "Remove for absent room, nothing to do"
            );
            return;
        };

        managed.handle.cancel();

        // Wait for cleanup off the message loop.
        let consultation = consultation_id.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(ROOM_DRAIN_TIMEOUT, managed.task_handle)
                .await
                .is_err()
            {
                warn!(
                    target: "cc.actor.registry",
                    consultation_id = %consultation,
                    "Room task cleanup timed out"
                );
            }
        });

        info!(
            target: "cc.actor.registry",
            controller_id = %self.controller_id,
            consultation_id = %consultation_id,
            total_rooms = self.rooms.len(),
            "Room removed"
        );
    }

    /// Drop map entries whose room actors already exited (self-teardown
    /// after the last occupant left, or a panic).
    fn reap_finished(&mut self) {
        let finished: Vec<ConsultationId> = self
            .rooms
            .iter()
            .filter(|(_, m)| m.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for consultation_id in finished {
            if let Some(managed) = self.rooms.remove(&consultation_id) {
                // Distinguish clean exits from panics for the log.
                tokio::spawn(async move {
                    match managed.task_handle.await {
                        Ok(()) => {
                            debug!(
                                target: "cc.actor.registry",
                                consultation_id = %consultation_id,
                                "Room actor exited cleanly"
                            );
                        }
                        Err(join_error) if join_error.is_panic() => {
                            error!(
                                target: "cc.actor.registry",
                                consultation_id = %consultation_id,
                                error = ?join_error,
                                "Room actor panicked"
                            );
                        }
                        Err(_) => {}
                    }
                });
            }
        }
    }

    /// Reap rooms that have had zero occupants past the grace period.
    ///
    /// Only empty rooms are considered; occupied rooms are never touched
    /// by the sweep, no matter how quiet their negotiation traffic is.
    async fn sweep_idle_rooms(&mut self) {
        let candidates: Vec<(ConsultationId, RoomActorHandle)> = self
            .rooms
            .iter()
            .map(|(id, m)| (id.clone(), m.handle.clone()))
            .collect();

        for (consultation_id, handle) in candidates {
            let state =
                match tokio::time::timeout(SWEEP_STATE_TIMEOUT, handle.get_state()).await {
                    Ok(Ok(state)) => state,
                    Ok(Err(_)) => {
                        // Mailbox closed: the room is gone; reap the entry.
                        self.rooms.remove(&consultation_id);
                        continue;
                    }
                    Err(_) => {
                        warn!(
                            target: "cc.actor.registry",
                            consultation_id = %consultation_id,
                            "Room state query timed out during sweep"
                        );
                        continue;
                    }
                };

            let expired = state
                .empty_for_seconds
                .is_some_and(|empty_for| empty_for >= self.settings.idle_grace.as_secs());

            if state.occupants.is_empty() && expired {
                info!(
                    target: "cc.actor.registry",
                    controller_id = %self.controller_id,
                    consultation_id = %consultation_id,
                    "Idle empty room past grace period, reaping"
                );
                self.remove_room(&consultation_id);
            }
        }
    }

    /// Perform graceful shutdown.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "cc.actor.registry",
            controller_id = %self.controller_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        // Answer whatever is already queued so in-flight admissions get a
        // draining denial instead of a dropped reply channel.
        while let Ok(message) = self.receiver.try_recv() {
            self.handle_message(message).await;
        }

        // Room tokens are children of ours, so cancellation has already
        // propagated; drain the tasks with a bounded wait.
        for (consultation_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(ROOM_DRAIN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "cc.actor.registry",
                        consultation_id = %consultation_id,
                        "Room completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "cc.actor.registry",
                        consultation_id = %consultation_id,
                        error = ?e,
                        "Room task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "cc.actor.registry",
                        consultation_id = %consultation_id,
                        "Room shutdown timed out"
                    );
                }
            }
        }

        info!(
            target: "cc.actor.registry",
            controller_id = %self.controller_id,
            "Graceful shutdown complete"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::{SessionId, UserId};
    use signal_protocol::Role;

    fn test_settings() -> RegistrySettings {
        RegistrySettings {
            idle_grace: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(20),
            max_rooms: 8,
        }
    }

    fn spawn_registry(settings: RegistrySettings) -> RoomRegistryHandle {
        RoomRegistryHandle::new("cc-test-001".to_string(), settings, CoreMetrics::new())
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = spawn_registry(test_settings());

        let first = registry
            .get_or_create(ConsultationId::from("consult-1"), SessionConfig::default())
            .await
            .unwrap();
        let second = registry
            .get_or_create(ConsultationId::from("consult-1"), SessionConfig::default())
            .await
            .unwrap();

        assert!(first.same_room(&second));

        let status = registry.status().await.unwrap();
        assert_eq!(status.room_count, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_concurrent_first_joins_create_one_room() {
        let registry = spawn_registry(test_settings());

        let r1 = registry.clone();
        let r2 = registry.clone();
        let (a, b) = tokio::join!(
            r1.get_or_create(ConsultationId::from("consult-race"), SessionConfig::default()),
            r2.get_or_create(ConsultationId::from("consult-race"), SessionConfig::default()),
        );

        let a = a.unwrap();
        let b = b.unwrap();
        assert!(a.same_room(&b));

        let status = registry.status().await.unwrap();
        assert_eq!(status.room_count, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_get_returns_none_for_unknown_room() {
        let registry = spawn_registry(test_settings());

        let room = registry.get(ConsultationId::from("nope")).await.unwrap();
        assert!(room.is_none());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = spawn_registry(test_settings());

        let _ = registry
            .get_or_create(ConsultationId::from("consult-rm"), SessionConfig::default())
            .await
            .unwrap();

        registry
            .remove(ConsultationId::from("consult-rm"))
            .await
            .unwrap();
        // Second removal of the same room: no-op, no error.
        registry
            .remove(ConsultationId::from("consult-rm"))
            .await
            .unwrap();
        // Removing a room that never existed: also fine.
        registry
            .remove(ConsultationId::from("never-existed"))
            .await
            .unwrap();

        let room = registry.get(ConsultationId::from("consult-rm")).await.unwrap();
        assert!(room.is_none());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_capacity_limit_sheds_admissions() {
        let registry = spawn_registry(RegistrySettings {
            max_rooms: 1,
            ..test_settings()
        });

        let _ = registry
            .get_or_create(ConsultationId::from("consult-a"), SessionConfig::default())
            .await
            .unwrap();

        let result = registry
            .get_or_create(ConsultationId::from("consult-b"), SessionConfig::default())
            .await;
        assert!(matches!(result, Err(CoreError::CapacityExceeded)));

        // The existing room is still reachable.
        let again = registry
            .get_or_create(ConsultationId::from("consult-a"), SessionConfig::default())
            .await;
        assert!(again.is_ok());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_room_reforms_after_self_teardown() {
        let registry = spawn_registry(test_settings());

        let room = registry
            .get_or_create(ConsultationId::from("consult-again"), SessionConfig::default())
            .await
            .unwrap();

        // One participant joins and leaves; the room tears itself down.
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let session = SessionId::new();
        room.join(session, UserId::from("dr-a"), Role::Provider, tx)
            .await
            .unwrap();
        room.leave(session).await.unwrap();

        // Wait for the room actor to wind down.
        tokio::time::timeout(Duration::from_secs(1), room.child_token().cancelled())
            .await
            .expect("room should cancel itself after last leave");
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A later admission for the same consultation forms a fresh room.
        let fresh = registry
            .get_or_create(ConsultationId::from("consult-again"), SessionConfig::default())
            .await
            .unwrap();
        assert!(!room.same_room(&fresh));

        registry.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reaps_never_joined_room_after_grace() {
        let registry = spawn_registry(RegistrySettings {
            idle_grace: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(20),
            max_rooms: 8,
        });

        let _ = registry
            .get_or_create(ConsultationId::from("consult-idle"), SessionConfig::default())
            .await
            .unwrap();

        // Within the grace period the room survives sweeps.
        tokio::time::advance(Duration::from_secs(40)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let room = registry.get(ConsultationId::from("consult-idle")).await.unwrap();
        assert!(room.is_some(), "room should survive inside the grace period");

        // Past the grace period the sweep reaps it.
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let room = registry.get(ConsultationId::from("consult-idle")).await.unwrap();
        assert!(room.is_none(), "empty room past grace should be reaped");

        registry.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_occupied_room_is_never_swept() {
        let registry = spawn_registry(RegistrySettings {
            idle_grace: Duration::from_secs(1),
            sweep_interval: Duration::from_millis(50),
            max_rooms: 8,
        });

        let room = registry
            .get_or_create(ConsultationId::from("consult-busy"), SessionConfig::default())
            .await
            .unwrap();

        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        room.join(SessionId::new(), UserId::from("dr-a"), Role::Provider, tx)
            .await
            .unwrap();

        // Give the sweep many cycles well past the grace period.
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let still_there = registry
            .get(ConsultationId::from("consult-busy"))
            .await
            .unwrap();
        assert!(still_there.is_some(), "occupied room must not be reaped");

        registry.cancel();
    }
}

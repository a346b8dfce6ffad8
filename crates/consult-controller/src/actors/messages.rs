//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply exchanges use `tokio::sync::oneshot`.

use crate::channels::NegotiationChannel;
use crate::errors::CoreError;

use super::room::RoomActorHandle;

use common::types::{ConsultationId, SessionId, UserId};
use signal_protocol::{ChannelKind, MediaFlags, PeerSummary, Role, ServerMessage, SessionConfig};
use tokio::sync::{mpsc, oneshot};

/// Messages sent to the `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Look up the room for a consultation, creating it if absent.
    ///
    /// Creation is idempotent under concurrent first-join races: all
    /// requests serialize through the registry mailbox, so exactly one
    /// creates and the rest observe the created room.
    GetOrCreate {
        consultation_id: ConsultationId,
        /// Negotiation configuration captured at creation time; ignored
        /// when the room already exists.
        config: SessionConfig,
        respond_to: oneshot::Sender<Result<RoomActorHandle, CoreError>>,
    },

    /// Look up an existing room.
    Get {
        consultation_id: ConsultationId,
        respond_to: oneshot::Sender<Option<RoomActorHandle>>,
    },

    /// Remove a room. Safe to call for an already-removed or nonexistent
    /// room (no-op, not an error).
    Remove {
        consultation_id: ConsultationId,
        respond_to: oneshot::Sender<()>,
    },

    /// Get current registry status (for health checks).
    Status {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
}

/// Messages sent to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// A connection wants to join this room.
    Join {
        session_id: SessionId,
        user_id: UserId,
        role: Role,
        /// Outbound frame queue owned by the connection's socket writer.
        outbound: mpsc::Sender<ServerMessage>,
        respond_to: oneshot::Sender<Result<JoinOutcome, CoreError>>,
    },

    /// A participant leaves explicitly without ending the consultation.
    Leave {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<(), CoreError>>,
    },

    /// A participant's transport dropped (implicit leave).
    Disconnected { session_id: SessionId },

    /// Forward a negotiation frame to the other occupant (or an explicit
    /// target).
    Relay {
        session_id: SessionId,
        frame: RelayFrame,
    },

    /// Update the sender's microphone/camera flags.
    ToggleMedia {
        session_id: SessionId,
        audio_enabled: Option<bool>,
        video_enabled: Option<bool>,
    },

    /// Begin (or restart) a screen-share.
    StartScreenShare { session_id: SessionId },

    /// Stop an active screen-share.
    StopScreenShare { session_id: SessionId },

    /// End the consultation for both parties.
    EndConsultation {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<(), CoreError>>,
    },

    /// Get current room state (for the idle sweep and tests).
    GetState {
        respond_to: oneshot::Sender<RoomSnapshot>,
    },
}

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Deliver a frame to the connected client.
    Deliver { message: ServerMessage },

    /// Close the connection.
    Close { reason: CloseReason },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Why a connection is being closed by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection for the same identity took over.
    Replaced,
    /// The consultation ended.
    ConsultationEnded,
    /// The room was torn down.
    RoomClosed,
}

impl CloseReason {
    /// Stable string form for log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            CloseReason::Replaced => "replaced",
            CloseReason::ConsultationEnded => "consultation-ended",
            CloseReason::RoomClosed => "room-closed",
        }
    }
}

/// An opaque negotiation frame in flight from one occupant to the other.
#[derive(Debug, Clone)]
pub enum RelayFrame {
    Offer {
        kind: ChannelKind,
        sdp: String,
        target: Option<UserId>,
    },
    Answer {
        kind: ChannelKind,
        sdp: String,
        target: Option<UserId>,
    },
    IceCandidate {
        kind: ChannelKind,
        candidate: String,
        target: Option<UserId>,
    },
}

impl RelayFrame {
    /// The channel this frame belongs to.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        match self {
            RelayFrame::Offer { kind, .. }
            | RelayFrame::Answer { kind, .. }
            | RelayFrame::IceCandidate { kind, .. } => *kind,
        }
    }

    /// The explicit target, if the sender addressed one.
    #[must_use]
    pub fn target(&self) -> Option<&UserId> {
        match self {
            RelayFrame::Offer { target, .. }
            | RelayFrame::Answer { target, .. }
            | RelayFrame::IceCandidate { target, .. } => target.as_ref(),
        }
    }

    /// Convert into the relayed server frame, tagged with the sender.
    #[must_use]
    pub fn into_server_message(self, from: UserId) -> ServerMessage {
        match self {
            RelayFrame::Offer { kind, sdp, .. } => ServerMessage::Offer { kind, sdp, from },
            RelayFrame::Answer { kind, sdp, .. } => ServerMessage::Answer { kind, sdp, from },
            RelayFrame::IceCandidate {
                kind, candidate, ..
            } => ServerMessage::IceCandidate {
                kind,
                candidate,
                from,
            },
        }
    }
}

/// Result of a successful join.
#[derive(Debug)]
pub struct JoinOutcome {
    /// Handle to the connection actor the room spawned for this session.
    pub connection: super::connection::ConnectionActorHandle,
    /// Negotiation configuration handed to the client.
    pub config: SessionConfig,
    /// The other occupant, if present.
    pub other_occupant: Option<PeerSummary>,
}

/// Information about one occupant (for snapshots).
#[derive(Debug, Clone)]
pub struct OccupantInfo {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub role: Role,
    pub media: MediaFlags,
}

/// Current state of a room (for the idle sweep, health, tests).
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    /// Consultation this room serves.
    pub consultation_id: ConsultationId,
    /// Current occupants.
    pub occupants: Vec<OccupantInfo>,
    /// Open negotiation channels.
    pub channels: Vec<NegotiationChannel>,
    /// Room creation timestamp (unix seconds).
    pub created_at: i64,
    /// Seconds since the last join/relay/flag activity.
    pub idle_for_seconds: u64,
    /// How long the room has been empty, in seconds; `None` while
    /// occupied.
    pub empty_for_seconds: Option<u64>,
    /// Whether the room is tearing down.
    pub is_closing: bool,
}

/// Status of the `RoomRegistryActor`.
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    /// Active rooms.
    pub room_count: usize,
    /// Whether the registry is draining for shutdown.
    pub is_draining: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_frame_kind_and_target() {
        let frame = RelayFrame::Offer {
            kind: ChannelKind::ScreenShare,
            sdp: "v=0".to_string(),
            target: Some(UserId::from("pt-b")),
        };
        assert_eq!(frame.kind(), ChannelKind::ScreenShare);
        assert_eq!(frame.target(), Some(&UserId::from("pt-b")));
    }

    #[test]
    fn test_relay_frame_tags_sender_on_conversion() {
        let frame = RelayFrame::IceCandidate {
            kind: ChannelKind::Primary,
            candidate: "candidate:1".to_string(),
            target: None,
        };
        let msg = frame.into_server_message(UserId::from("dr-a"));
        assert!(matches!(
            msg,
            ServerMessage::IceCandidate { from, .. } if from == UserId::from("dr-a")
        ));
    }

    #[test]
    fn test_close_reason_strings() {
        assert_eq!(CloseReason::Replaced.as_str(), "replaced");
        assert_eq!(
            CloseReason::ConsultationEnded.as_str(),
            "consultation-ended"
        );
    }
}

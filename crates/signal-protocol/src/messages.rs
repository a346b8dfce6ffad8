//! Client → server and server → client message frames.
//!
//! Every frame is one JSON object with a `type` tag. Negotiation payloads
//! (`sdp`, `candidate`) are opaque strings relayed verbatim.

use crate::types::{ChannelKind, DenyReason, MediaFlags, PeerSummary, Role, SessionConfig};
use common::types::{ConsultationId, UserId};
use serde::{Deserialize, Serialize};

/// Frames a client sends to the controller.
///
/// `JoinRoom` must be the first frame on a connection; every later frame
/// is implicitly scoped to the consultation and identity bound at join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Request admission into the room for a consultation.
    JoinRoom {
        consultation_id: ConsultationId,
        user_id: UserId,
        /// Declared role; the authorization collaborator's answer is
        /// authoritative if they disagree.
        role: Role,
    },

    /// Connection offer for the tagged channel, relayed to the peer.
    Offer {
        kind: ChannelKind,
        sdp: String,
        /// Optional explicit target; defaults to the other occupant.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<UserId>,
    },

    /// Connection answer for the tagged channel, relayed to the peer.
    Answer {
        kind: ChannelKind,
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<UserId>,
    },

    /// Transport candidate for the tagged channel, relayed to the peer.
    IceCandidate {
        kind: ChannelKind,
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<UserId>,
    },

    /// Update the sender's microphone/camera state. Omitted fields keep
    /// their current value.
    ToggleMedia {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_enabled: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video_enabled: Option<bool>,
    },

    /// Begin (or restart) a screen-share negotiation.
    StartScreenShare {},

    /// Stop the sender's active screen-share.
    StopScreenShare {},

    /// End the consultation for both parties.
    EndConsultation {},

    /// Leave the room without ending the consultation.
    Leave {},
}

/// Frames the controller sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Admission succeeded.
    RoomJoined {
        /// Negotiation-assistance configuration, handed over verbatim.
        config: SessionConfig,
        /// The other occupant, if already present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        other_occupant: Option<PeerSummary>,
    },

    /// Admission failed.
    JoinDenied { reason: DenyReason },

    /// The other party joined the room.
    PeerJoined { peer: PeerSummary },

    /// The other party left the room (explicit leave or disconnect).
    PeerLeft { user_id: UserId },

    /// Relayed connection offer.
    Offer {
        kind: ChannelKind,
        sdp: String,
        from: UserId,
    },

    /// Relayed connection answer.
    Answer {
        kind: ChannelKind,
        sdp: String,
        from: UserId,
    },

    /// Relayed transport candidate.
    IceCandidate {
        kind: ChannelKind,
        candidate: String,
        from: UserId,
    },

    /// The other party's microphone/camera/screen-share state changed.
    PeerMediaChanged { user_id: UserId, media: MediaFlags },

    /// The other party started sharing their screen.
    PeerScreenShareStarted { user_id: UserId },

    /// The other party stopped sharing their screen.
    PeerScreenShareStopped { user_id: UserId },

    /// The consultation ended; the room is gone.
    ConsultationEnded {
        /// Who ended it; absent when the room was torn down by the
        /// controller (e.g. last disconnect).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ended_by: Option<UserId>,
    },

    /// This connection was superseded by a newer connection for the same
    /// identity and is about to be closed.
    SessionReplaced {},
}

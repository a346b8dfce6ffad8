//! Shared protocol types: channel kinds, roles, media flags, denial
//! reasons, and the negotiation-assistance configuration handed to
//! clients on join.

use common::types::UserId;
use serde::{Deserialize, Serialize};

/// Which of the two independent peer connections a negotiation frame
/// belongs to.
///
/// A consultation carries up to two simultaneous negotiations: the
/// primary camera/microphone connection and an optional screen-share
/// connection. Both sides tag every offer/answer/candidate with the kind
/// so the receiver can route it to the matching peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    /// Camera + microphone connection, opened at room formation.
    Primary,
    /// Screen-share connection, opened on demand.
    ScreenShare,
}

impl ChannelKind {
    /// Stable string form, used in log fields and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Primary => "primary",
            ChannelKind::ScreenShare => "screen-share",
        }
    }
}

/// Declared role of a participant within a consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// The care provider.
    Provider,
    /// The patient.
    Patient,
}

impl Role {
    /// Stable string form, used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Provider => "provider",
            Role::Patient => "patient",
        }
    }
}

/// Live media state of one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    /// Microphone enabled.
    pub audio_enabled: bool,
    /// Camera enabled.
    pub video_enabled: bool,
    /// Screen-share currently active.
    pub screen_sharing: bool,
}

impl Default for MediaFlags {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
        }
    }
}

/// Why an admission attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenyReason {
    /// The identity is not one of the two parties bound to the
    /// consultation.
    NotAuthorized,
    /// Both participant slots are occupied by other identities.
    RoomFull,
    /// The same identity already holds a live session; surfaced to the
    /// evicted side of a last-writer-wins reconnect.
    AlreadyConnectedElsewhere,
    /// The authorization collaborator did not answer in time.
    AuthorizationTimeout,
    /// The controller is at its room capacity limit.
    ServerBusy,
}

impl DenyReason {
    /// Stable string form, used in log fields and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DenyReason::NotAuthorized => "not-authorized",
            DenyReason::RoomFull => "room-full",
            DenyReason::AlreadyConnectedElsewhere => "already-connected-elsewhere",
            DenyReason::AuthorizationTimeout => "authorization-timeout",
            DenyReason::ServerBusy => "server-busy",
        }
    }
}

/// Snapshot of the other occupant, included in join replies and join
/// broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    /// The peer's user identifier.
    pub user_id: UserId,
    /// The peer's role.
    pub role: Role,
    /// The peer's current media state.
    pub media: MediaFlags,
}

/// One connection-assistance (STUN/TURN) server entry, handed to clients
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs, e.g. `stun:stun.example.org:3478`.
    pub urls: Vec<String>,
    /// Optional credential username (TURN).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional credential secret (TURN).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A credential-less server entry (STUN).
    #[must_use]
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
        }
    }
}

/// Negotiation configuration handed to both participants on join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Connection-assistance servers for the peer-to-peer setup.
    pub ice_servers: Vec<IceServer>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_kind_wire_form() {
        assert_eq!(
            serde_json::to_string(&ChannelKind::ScreenShare).unwrap(),
            "\"screen-share\""
        );
        assert_eq!(
            serde_json::to_string(&ChannelKind::Primary).unwrap(),
            "\"primary\""
        );
    }

    #[test]
    fn test_deny_reason_wire_form_matches_as_str() {
        for reason in [
            DenyReason::NotAuthorized,
            DenyReason::RoomFull,
            DenyReason::AlreadyConnectedElsewhere,
            DenyReason::AuthorizationTimeout,
            DenyReason::ServerBusy,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_str()));
        }
    }

    #[test]
    fn test_media_flags_default() {
        let flags = MediaFlags::default();
        assert!(flags.audio_enabled);
        assert!(flags.video_enabled);
        assert!(!flags.screen_sharing);
    }

    #[test]
    fn test_ice_server_omits_empty_credentials() {
        let server = IceServer::new(vec!["stun:stun.example.org:3478".to_string()]);
        let json = serde_json::to_string(&server).unwrap();
        assert!(!json.contains("username"));
        assert!(!json.contains("credential"));
    }
}

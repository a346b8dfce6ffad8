//! Consultation Controller error types.
//!
//! Admission failures map to wire [`DenyReason`] codes so the transport
//! layer can answer a `join-room` with a specific, renderable denial.
//! Internal details are logged server-side but never exposed to clients.

use signal_protocol::DenyReason;
use thiserror::Error;

/// Consultation Controller error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The identity is not one of the two parties bound to the
    /// consultation.
    #[error("not authorized for consultation")]
    NotAuthorized,

    /// The authorization collaborator did not answer within the bounded
    /// timeout.
    #[error("authorization check timed out")]
    AuthorizationTimeout,

    /// The authorization collaborator failed (unreachable, 5xx, bad
    /// payload).
    #[error("directory error: {0}")]
    Directory(String),

    /// Both participant slots are held by other identities.
    #[error("room is full")]
    RoomFull,

    /// The same identity already holds a live session elsewhere.
    #[error("already connected elsewhere")]
    AlreadyConnectedElsewhere,

    /// The controller is at its configured room capacity.
    #[error("controller at capacity")]
    CapacityExceeded,

    /// The controller is draining for shutdown.
    #[error("controller is draining")]
    Draining,

    /// Room no longer exists (torn down between lookup and use).
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Participant session not found in the room.
    #[error("session not found")]
    SessionNotFound,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error (actor channel failures and the like).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns the wire denial reason for admission-path errors, or
    /// `None` for errors that never surface as a `join-denied`.
    ///
    /// Directory failures and capacity/draining states all map to
    /// `server-busy`: the caller did nothing wrong and may retry.
    #[must_use]
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            CoreError::NotAuthorized => Some(DenyReason::NotAuthorized),
            CoreError::AuthorizationTimeout => Some(DenyReason::AuthorizationTimeout),
            CoreError::RoomFull => Some(DenyReason::RoomFull),
            CoreError::AlreadyConnectedElsewhere => Some(DenyReason::AlreadyConnectedElsewhere),
            CoreError::Directory(_) | CoreError::CapacityExceeded | CoreError::Draining => {
                Some(DenyReason::ServerBusy)
            }
            CoreError::RoomNotFound(_)
            | CoreError::SessionNotFound
            | CoreError::Config(_)
            | CoreError::Internal(_) => None,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CoreError::NotAuthorized => {
                "You are not authorized for this consultation".to_string()
            }
            CoreError::AuthorizationTimeout => {
                "Authorization could not be confirmed in time, please retry".to_string()
            }
            CoreError::RoomFull => "This consultation already has two participants".to_string(),
            CoreError::AlreadyConnectedElsewhere => {
                "This consultation has already started elsewhere".to_string()
            }
            CoreError::CapacityExceeded | CoreError::Draining | CoreError::Directory(_) => {
                "The service is busy, please try again".to_string()
            }
            CoreError::RoomNotFound(_) => "Consultation not found".to_string(),
            CoreError::SessionNotFound => "Session not found".to_string(),
            CoreError::Config(_) | CoreError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}

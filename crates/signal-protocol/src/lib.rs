//! Signaling wire protocol for Televisit consultations.
//!
//! This crate defines the JSON message frames exchanged between a client
//! and the consultation controller over the persistent bidirectional
//! channel: room admission, opaque negotiation relay (offers, answers,
//! candidates), media-state changes, screen-share control, and
//! consultation end. Negotiation payloads are carried verbatim; the
//! controller never inspects them.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod messages;
pub mod types;

pub use codec::{decode_client, encode_server, ProtocolError};
pub use messages::{ClientMessage, ServerMessage};
pub use types::{
    ChannelKind, DenyReason, IceServer, MediaFlags, PeerSummary, Role, SessionConfig,
};

//! JSON frame encoding/decoding.

use crate::messages::{ClientMessage, ServerMessage};
use thiserror::Error;

/// Frame encode/decode failure.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not a well-formed protocol message.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decode one client frame from a JSON text payload.
pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode one server frame to a JSON text payload.
pub fn encode_server(message: &ServerMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

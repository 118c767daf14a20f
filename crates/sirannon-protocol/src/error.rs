use thiserror::Error;

/// Failures decoding a raw WebSocket text frame into a [`crate::ClientMessage`]
/// before any request id is known, so they cannot be reported via the normal
/// `{type:'error', id, ...}` shape.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed client message: {reason}")]
    Malformed { reason: String },
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed { .. } => "PROTOCOL_ERROR",
        }
    }
}

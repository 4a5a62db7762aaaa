//! Errors raised while decoding push frames.

use thiserror::Error;

/// A push frame that could not be turned into an [`EventEnvelope`](crate::EventEnvelope).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON or did not match the envelope shape.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The frame decoded but carried an empty topic.
    #[error("envelope {id} has an empty topic")]
    EmptyTopic { id: String },
}

impl ProtocolError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::EmptyTopic { .. } => "empty_topic",
        }
    }
}

//! Protocol parse errors.

use thiserror::Error;

/// Errors raised while decoding frames from the event session.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The frame was not valid JSON or did not match the envelope shape
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A known message type arrived without a field it requires
    #[error("{message_type} frame missing {field}")]
    MissingField {
        message_type: String,
        field: &'static str,
    },
}

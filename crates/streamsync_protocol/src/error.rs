//! Error types for protocol decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding or validating wire data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload was not valid JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload was JSON but did not have the expected shape.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A data frame decoded to something other than a JSON object.
    #[error("frame is not a json object")]
    NotAnObject,

    /// A reserved stream was subscribed without one of its parameters.
    #[error("stream '{stream}' requires parameter '{param}'")]
    MissingParameter {
        /// Stream name.
        stream: String,
        /// Name of the missing parameter.
        param: String,
    },
}

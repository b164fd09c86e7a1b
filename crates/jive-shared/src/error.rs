use thiserror::Error;

/// Errors raised while decoding or validating client payloads.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid {field}: {value}")]
    InvalidId { field: &'static str, value: String },

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Field must not be empty: {0}")]
    EmptyField(&'static str),

    #[error("Unsupported message type: {0}")]
    UnsupportedType(String),

    #[error("Malformed event: {0}")]
    Json(#[from] serde_json::Error),
}

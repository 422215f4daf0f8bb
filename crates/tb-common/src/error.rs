use thiserror::Error;

/// Failure to decode or encode a bus envelope.
///
/// Decode failures are terminal for the payload in question: retrying a
/// malformed envelope cannot succeed.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

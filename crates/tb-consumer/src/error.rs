use thiserror::Error;

/// Failure while delivering one outbound message.
///
/// [`DispatchError::is_transient`] drives the requeue decision: transient
/// failures go back to the queue, everything else is rejected for good.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("provider returned HTTP {status}")]
    UpstreamStatus { status: u16 },

    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("media source returned HTTP {status} for {url}")]
    MediaSource { url: String, status: u16 },

    #[error("unexpected provider response: {0}")]
    BadResponse(String),

    #[error("message cannot be rendered: {0}")]
    Unrenderable(String),

    #[error("claim store error: {0}")]
    Claims(#[from] tb_claims::ClaimError),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl DispatchError {
    /// Whether redelivering the message could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::UpstreamStatus { status } => *status >= 500,
            DispatchError::MediaSource { status, .. } => *status >= 500,
            DispatchError::Http(_) => true,
            DispatchError::Claims(_) => true,
            DispatchError::Amqp(_) => true,
            DispatchError::BadResponse(_) => false,
            DispatchError::Unrenderable(_) => false,
        }
    }

    /// The provider status code, when the failure was an HTTP status.
    pub fn status(&self) -> Option<u16> {
        match self {
            DispatchError::UpstreamStatus { status } => Some(*status),
            _ => None,
        }
    }
}

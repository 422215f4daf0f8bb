use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("timed out waiting for message lock {0}")]
    LockTimeout(String),
}

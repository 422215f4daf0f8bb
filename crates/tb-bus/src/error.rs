use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("codec error: {0}")]
    Codec(#[from] tb_common::CodecError),

    #[error("claim store error: {0}")]
    Claims(#[from] tb_claims::ClaimError),

    #[error("publish confirm timed out after {0:?}")]
    PublishTimeout(Duration),
}

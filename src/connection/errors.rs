use thiserror::Error;
use crate::{ds::Abandoned, error::BrokerError};

/// reasons a long-poll request ends without a json reply
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("empty message batch")]
    EmptyBatch,

    #[error("malformed request body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("request body read error: {0}")]
    BodyRead(String),

    /// the suspended `/meta/connect` was preempted
    #[error("duplicate heartbeat")]
    Duplicate(u16),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Abandoned(#[from] Abandoned),
}

impl TransportError {
    /// http status the failed request is answered with
    pub fn status(&self) -> u16 {
        match self {
            TransportError::EmptyBatch
            | TransportError::Malformed(_)
            | TransportError::BodyRead(_) => 400,
            TransportError::BodyTooLarge(_) => 413,
            TransportError::Duplicate(status) if *status >= 400 => *status,
            TransportError::Duplicate(_)
            | TransportError::Broker(_)
            | TransportError::Abandoned(_) => 500,
        }
    }
}

use thiserror::Error;
use crate::ds::Abandoned;

/// failure reported by application callbacks (extensions, policies, listeners)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// faults inside the broker; protocol-level refusals are
/// [`ErrorCode`](crate::protocol::ErrorCode) values on the reply instead
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid channel {0:?}")]
    InvalidChannel(String),

    #[error("invalid meta channel {0}")]
    UnknownMetaChannel(String),

    #[error("cannot publish to non-broadcast channel {0}")]
    NotBroadcast(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("extension failure: {0}")]
    Extension(#[source] BoxError),

    #[error("security policy failure: {0}")]
    Policy(#[source] BoxError),

    #[error("listener failure: {0}")]
    Listener(#[source] BoxError),

    #[error("broker is closed")]
    Closed,

    #[error(transparent)]
    Abandoned(#[from] Abandoned),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

use std::sync::Arc;
use async_trait::async_trait;
use crate::{error::BoxError, protocol::ServerMessage};
use super::{channel::ServerChannel, client::ServerSession};

/// authorization hooks consulted by the broker, everything is allowed
/// unless a method is overridden
#[async_trait]
pub trait SecurityPolicy: Send + Sync {
    async fn can_handshake(&self, _session: &Arc<ServerSession>, _message: &ServerMessage) -> Result<bool, BoxError> {
        Ok(true)
    }

    async fn can_create(&self, _session: &Arc<ServerSession>, _message: &ServerMessage, _channel: &str) -> Result<bool, BoxError> {
        Ok(true)
    }

    async fn can_subscribe(
        &self,
        _session: &Arc<ServerSession>,
        _message: &ServerMessage,
        _channel: &Arc<ServerChannel>,
    ) -> Result<bool, BoxError> {
        Ok(true)
    }

    async fn can_publish(
        &self,
        _session: &Arc<ServerSession>,
        _message: &ServerMessage,
        _channel: &Arc<ServerChannel>,
    ) -> Result<bool, BoxError> {
        Ok(true)
    }
}

pub struct AllowAll;

impl SecurityPolicy for AllowAll {}

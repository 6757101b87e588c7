use std::{sync::Arc, time::Duration};
use async_trait::async_trait;
use crate::{error::BoxError, protocol::ServerMessage};
use super::{channel::ServerChannel, client::ServerSession};

/// broker wide events, every method defaults to a no-op
pub trait BrokerListener: Send + Sync {
    fn session_added(&self, _session: &Arc<ServerSession>, _message: &ServerMessage) {}
    fn session_removed(&self, _session: &Arc<ServerSession>, _timeout: bool) {}
    fn channel_added(&self, _channel: &Arc<ServerChannel>) {}
    fn channel_removed(&self, _channel: &Arc<ServerChannel>) {}
    fn subscribed(&self, _channel: &Arc<ServerChannel>, _session: &Arc<ServerSession>, _message: Option<&ServerMessage>) {}
    fn unsubscribed(&self, _channel: &Arc<ServerChannel>, _session: &Arc<ServerSession>, _message: Option<&ServerMessage>) {}
}

pub trait ChannelListener: Send + Sync {
    fn subscribed(&self, _channel: &Arc<ServerChannel>, _session: &Arc<ServerSession>, _message: Option<&ServerMessage>) {}
    fn unsubscribed(&self, _channel: &Arc<ServerChannel>, _session: &Arc<ServerSession>, _message: Option<&ServerMessage>) {}
}

/// notified for every message published on the channel or, when registered
/// on a wildcard channel, on any channel it matches
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// `Ok(false)` stops the publish
    async fn on_message(
        &self,
        sender: Option<&Arc<ServerSession>>,
        channel: &Arc<ServerChannel>,
        message: &mut ServerMessage,
    ) -> Result<bool, BoxError>;
}

pub trait SessionListener: Send + Sync {
    fn suspended(&self, _session: &Arc<ServerSession>, _message: &ServerMessage, _timeout: Duration) {}
    fn resumed(&self, _session: &Arc<ServerSession>, _message: &ServerMessage, _timeout: bool) {}
    fn removed(&self, _session: &Arc<ServerSession>, _timeout: bool) {}
    fn queue_offer(&self, _session: &Arc<ServerSession>, _message: &Arc<ServerMessage>) {}
    fn queue_drain(&self, _session: &Arc<ServerSession>, _queue: &[Arc<ServerMessage>], _replies: &[Arc<ServerMessage>]) {}
}

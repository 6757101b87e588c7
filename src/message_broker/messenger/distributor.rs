use std::sync::Arc;
use tracing::{debug, warn};
use crate::{ds::fold_left, error::BrokerError, protocol::ServerMessage};
use crate::message_broker::{channel::ServerChannel, client::ServerSession, mediator::BrokerMediator};

/// delivery side of a publish: message listeners first, then subscribers
/// of the channel and of every wildcard channel matching it
pub struct MessageDistributor<'b> {
    broker: &'b BrokerMediator,
}

impl<'b> MessageDistributor<'b> {
    pub fn new(broker: &'b BrokerMediator) -> Self {
        Self { broker }
    }

    /// `Ok(false)` as soon as a listener vetoes, later listeners are skipped
    pub async fn notify_listeners(
        &self,
        channel: &Arc<ServerChannel>,
        sender: Option<&Arc<ServerSession>>,
        message: &mut ServerMessage,
    ) -> Result<bool, BrokerError> {
        let route = self.broker.channel_registry().route(channel);
        let name = channel.name();

        let (keep, _) = fold_left(route, (true, message), move |(keep, message), ch, advance| async move {
            if !keep {
                advance.next((false, message));
                return;
            }
            let listeners = ch.message_listeners();
            debug!(channel = name, on = ch.name(), listeners = listeners.len(), "notifying listeners");

            let ch = &ch;
            let outcome = fold_left(listeners, (true, message), move |(keep, message), listener, advance| async move {
                if !keep {
                    advance.next((false, message));
                    return;
                }
                let outcome = listener.on_message(sender, ch, &mut *message).await;
                match outcome {
                    Ok(keep) => advance.next((keep, message)),
                    Err(err) => advance.fail(BrokerError::Listener(err)),
                }
            }).await;

            match outcome {
                Ok(acc) => advance.next(acc),
                Err(err) => advance.fail(err),
            }
        }).await?;
        Ok(keep)
    }

    /// every subscriber gets the same instance, encoded once here, unless
    /// one of its session extensions rewrites it
    pub async fn notify_subscribers(
        &self,
        channel: &Arc<ServerChannel>,
        sender: Option<&Arc<ServerSession>>,
        message: Arc<ServerMessage>,
    ) -> Result<(), BrokerError> {
        message.encode()?;

        for ch in self.broker.channel_registry().route(channel) {
            let subscribers = ch.subscribers();
            debug!(channel = channel.name(), on = ch.name(), subscribers = subscribers.len(), "notifying subscribers");
            for subscriber in subscribers {
                if let Err(err) = subscriber.deliver1(sender, message.clone()).await {
                    warn!(session = %subscriber.id(), channel = channel.name(), "delivery failed: {}", err);
                }
            }
        }
        Ok(())
    }
}

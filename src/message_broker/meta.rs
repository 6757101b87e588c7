//! handlers of the five meta channels

use std::sync::Arc;
use tracing::{debug, info};
use crate::{
    ds::fold_left,
    error::BrokerError,
    protocol::{
        channel_id::{META_CONNECT, META_DISCONNECT, META_HANDSHAKE, META_SUBSCRIBE, META_UNSUBSCRIBE},
        ErrorCode, Reconnect, ServerMessage, BAYEUX_VERSION,
    },
};
use super::{channel::ServerChannel, client::ServerSession, mediator::BrokerMediator};

pub const LONG_POLLING: &str = "long-polling";

pub(crate) async fn dispatch(
    broker: &BrokerMediator,
    channel: &Arc<ServerChannel>,
    session: &Arc<ServerSession>,
    message: &mut ServerMessage,
) -> Result<(), BrokerError> {
    match channel.name() {
        META_HANDSHAKE => handshake(broker, session, message).await,
        META_CONNECT => {
            connect(session, message);
            Ok(())
        },
        META_SUBSCRIBE => subscribe(broker, session, message).await,
        META_UNSUBSCRIBE => unsubscribe(broker, session, message).await,
        META_DISCONNECT => disconnect(broker, session, message).await,
        other => Err(BrokerError::UnknownMetaChannel(other.to_string())),
    }
}

async fn handshake(broker: &BrokerMediator, session: &Arc<ServerSession>, message: &mut ServerMessage) -> Result<(), BrokerError> {
    let allowed = broker.policy()
        .can_handshake(session, message)
        .await
        .map_err(BrokerError::Policy)?;

    if !allowed {
        info!(session = %session.id(), "handshake denied");
        if let Some(reply) = message.reply_mut() {
            reply.fail(ErrorCode::HandshakeDenied);
            let advice = reply.advice_mut();
            if advice.reconnect.is_none() {
                advice.reconnect = Some(Reconnect::None);
            }
        }
        return Ok(());
    }

    session.handshake();
    broker.add_session(session, message);
    if let Some(reply) = message.reply_mut() {
        reply.successful = Some(true);
        reply.client_id = Some(session.id().to_string());
        reply.version = Some(BAYEUX_VERSION.to_string());
        reply.supported_connection_types = Some(vec![LONG_POLLING.to_string()]);
    }
    Ok(())
}

/// records the client's timeout and interval overrides, -1 when absent
fn connect(session: &Arc<ServerSession>, message: &mut ServerMessage) {
    let (timeout, interval) = match &message.payload().advice {
        Some(advice) => (advice.timeout.unwrap_or(-1), advice.interval.unwrap_or(-1)),
        None => (-1, -1),
    };
    session.set_client_timeout(timeout);
    session.set_client_interval(interval);

    if let Some(reply) = message.reply_mut() {
        reply.successful = Some(true);
    }
}

/// all channels are authorized before any subscription is committed
async fn subscribe(broker: &BrokerMediator, session: &Arc<ServerSession>, message: &mut ServerMessage) -> Result<(), BrokerError> {
    let subscription = message.payload().subscription.clone();
    if let Some(reply) = message.reply_mut() {
        reply.subscription = subscription.clone();
    }
    let Some(subscription) = subscription else {
        message.fail(ErrorCode::SubscriptionMissing);
        return Ok(());
    };
    let names = subscription.names();

    let policy = broker.policy();
    let policy = &policy;
    let msg: &ServerMessage = message;

    let authorized = fold_left(names.clone(), true, move |ok, name, advance| async move {
        if !ok {
            advance.next(false);
            return;
        }

        let channel = match broker.get_channel(&name) {
            Some(channel) => channel,
            None => {
                match policy.can_create(session, msg, &name).await {
                    Ok(true) => (),
                    Ok(false) => return advance.next(false),
                    Err(err) => return advance.fail(BrokerError::Policy(err)),
                }
                match broker.create_channel(&name) {
                    Ok(channel) => channel,
                    Err(BrokerError::InvalidChannel(_)) => return advance.next(false),
                    Err(err) => return advance.fail(err),
                }
            }
        };

        match policy.can_subscribe(session, msg, &channel).await {
            Ok(allowed) => advance.next(allowed),
            Err(err) => advance.fail(BrokerError::Policy(err)),
        }
    }).await?;

    if !authorized {
        debug!(session = %session.id(), ?names, "subscribe denied");
        message.fail(ErrorCode::SubscribeDenied);
        return Ok(());
    }

    let committed = fold_left::<_, _, BrokerError, _, _>(names, true, move |ok, name, advance| async move {
        if !ok {
            return advance.next(false);
        }
        match broker.get_channel(&name) {
            Some(channel) => advance.next(channel.subscribe(session, Some(msg))),
            None => advance.next(false),
        }
    }).await?;

    if committed {
        if let Some(reply) = message.reply_mut() {
            reply.successful = Some(true);
        }
    } else {
        message.fail(ErrorCode::SubscribeFailed);
    }
    Ok(())
}

/// unsubscribing from a channel that does not exist succeeds
async fn unsubscribe(broker: &BrokerMediator, session: &Arc<ServerSession>, message: &mut ServerMessage) -> Result<(), BrokerError> {
    let subscription = message.payload().subscription.clone();
    if let Some(reply) = message.reply_mut() {
        reply.subscription = subscription.clone();
    }
    let Some(subscription) = subscription else {
        message.fail(ErrorCode::SubscriptionMissing);
        return Ok(());
    };

    let msg: &ServerMessage = message;
    let ok = fold_left::<_, _, BrokerError, _, _>(subscription.names(), true, move |ok, name, advance| async move {
        if !ok {
            return advance.next(false);
        }
        match broker.get_channel(&name) {
            Some(channel) => advance.next(channel.unsubscribe(session, Some(msg))),
            None => advance.next(true),
        }
    }).await?;

    if ok {
        if let Some(reply) = message.reply_mut() {
            reply.successful = Some(true);
        }
    } else {
        message.fail(ErrorCode::UnsubscribeFailed);
    }
    Ok(())
}

async fn disconnect(broker: &BrokerMediator, session: &Arc<ServerSession>, message: &mut ServerMessage) -> Result<(), BrokerError> {
    if let Some(reply) = message.reply_mut() {
        reply.successful = Some(true);
    }
    broker.remove_session(session, false).await;
    session.flush();
    Ok(())
}

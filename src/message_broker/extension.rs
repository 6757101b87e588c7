use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};
use async_trait::async_trait;
use futures::FutureExt;
use tracing::warn;
use crate::{
    ds::fold_left,
    error::{BoxError, BrokerError},
    protocol::{Message, ServerMessage},
};
use super::{client::ServerSession, mediator::BrokerMediator};

/// server scope extension, sees every message of every session.
///
/// returning `Ok(false)` deletes the message, `Err` aborts the request,
/// a panic is logged and the message passes through untouched.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn incoming(
        &self,
        _broker: &BrokerMediator,
        _session: &Arc<ServerSession>,
        _message: &mut ServerMessage,
    ) -> Result<bool, BoxError> {
        Ok(true)
    }

    async fn outgoing(
        &self,
        _broker: &BrokerMediator,
        _sender: Option<&Arc<ServerSession>>,
        _session: Option<&Arc<ServerSession>>,
        _message: &mut OutgoingMessage,
    ) -> Result<bool, BoxError> {
        Ok(true)
    }
}

/// session scope extension, same contract as [`Extension`]
#[async_trait]
pub trait SessionExtension: Send + Sync {
    async fn incoming(&self, _session: &Arc<ServerSession>, _message: &mut ServerMessage) -> Result<bool, BoxError> {
        Ok(true)
    }

    async fn outgoing(
        &self,
        _sender: Option<&Arc<ServerSession>>,
        _session: &Arc<ServerSession>,
        _message: &mut OutgoingMessage,
    ) -> Result<bool, BoxError> {
        Ok(true)
    }
}

/// message on its way out, possibly shared by many recipients.
///
/// reading is free; the first write clones the message for this recipient
/// and drops its cached encoding.
#[derive(Debug, Clone)]
pub struct OutgoingMessage(Arc<ServerMessage>);

impl OutgoingMessage {
    pub fn new(message: ServerMessage) -> Self {
        Self(Arc::new(message))
    }

    pub fn shared(message: Arc<ServerMessage>) -> Self {
        Self(message)
    }

    pub fn message(&self) -> &ServerMessage {
        &self.0
    }

    pub fn payload(&self) -> &Message {
        self.0.payload()
    }

    pub fn payload_mut(&mut self) -> &mut Message {
        Arc::make_mut(&mut self.0).payload_mut()
    }

    pub fn into_shared(self) -> Arc<ServerMessage> {
        self.0
    }
}

pub(crate) fn same_extension<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return s;
    }
    match payload.downcast_ref::<String>() {
        Some(s) => s,
        None => "unknown panic"
    }
}

/// server extensions in registration order, then the session's own;
/// the session list is read after the server pass so extensions added
/// there already apply to this message
pub(crate) async fn incoming(
    broker: &BrokerMediator,
    session: &Arc<ServerSession>,
    message: &mut ServerMessage,
) -> Result<bool, BrokerError> {
    let (keep, message) = fold_left(broker.extensions(), (true, message), move |(keep, message), ext, advance| async move {
        if !keep {
            advance.next((false, message));
            return;
        }
        let outcome = AssertUnwindSafe(ext.incoming(broker, session, &mut *message))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(keep)) => advance.next((keep, message)),
            Ok(Err(err)) => advance.fail(BrokerError::Extension(err)),
            Err(panic) => {
                warn!(session = %session.id(), "extension failure: {}", panic_message(&*panic));
                advance.next((true, message));
            }
        }
    }).await?;

    if !keep {
        return Ok(false);
    }

    let (keep, _) = fold_left(session.extensions(), (true, message), move |(keep, message), ext, advance| async move {
        if !keep {
            advance.next((false, message));
            return;
        }
        let outcome = AssertUnwindSafe(ext.incoming(session, &mut *message))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(keep)) => advance.next((keep, message)),
            Ok(Err(err)) => advance.fail(BrokerError::Extension(err)),
            Err(panic) => {
                warn!(session = %session.id(), "session extension failure: {}", panic_message(&*panic));
                advance.next((true, message));
            }
        }
    }).await?;
    Ok(keep)
}

/// server extensions, newest first
pub(crate) async fn outgoing_server(
    broker: &BrokerMediator,
    sender: Option<&Arc<ServerSession>>,
    session: Option<&Arc<ServerSession>>,
    message: &mut OutgoingMessage,
) -> Result<bool, BrokerError> {
    let mut extensions = broker.extensions();
    extensions.reverse();

    let (keep, _) = fold_left(extensions, (true, message), move |(keep, message), ext, advance| async move {
        if !keep {
            advance.next((false, message));
            return;
        }
        let outcome = AssertUnwindSafe(ext.outgoing(broker, sender, session, &mut *message))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(keep)) => advance.next((keep, message)),
            Ok(Err(err)) => advance.fail(BrokerError::Extension(err)),
            Err(panic) => {
                warn!("extension failure: {}", panic_message(&*panic));
                advance.next((true, message));
            }
        }
    }).await?;
    Ok(keep)
}

/// session extensions, newest first
pub(crate) async fn outgoing_session(
    sender: Option<&Arc<ServerSession>>,
    session: &Arc<ServerSession>,
    message: &mut OutgoingMessage,
) -> Result<bool, BrokerError> {
    let mut extensions = session.extensions();
    extensions.reverse();

    let (keep, _) = fold_left(extensions, (true, message), move |(keep, message), ext, advance| async move {
        if !keep {
            advance.next((false, message));
            return;
        }
        let outcome = AssertUnwindSafe(ext.outgoing(sender, session, &mut *message))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(keep)) => advance.next((keep, message)),
            Ok(Err(err)) => advance.fail(BrokerError::Extension(err)),
            Err(panic) => {
                warn!(session = %session.id(), "session extension failure: {}", panic_message(&*panic));
                advance.next((true, message));
            }
        }
    }).await?;
    Ok(keep)
}

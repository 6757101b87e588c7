use std::{collections::HashMap, sync::{Arc, Weak}};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;
use crate::{
    ds::{ListenerId, Listeners},
    error::BrokerError,
    protocol::{ChannelId, ChannelKind, Message, ServerMessage},
};
use super::{
    cleanup::Cleanup,
    client::{ClientID, ServerSession},
    listener::{ChannelListener, MessageListener},
    mediator::BrokerMediator,
};

pub struct ServerChannel {
    id: ChannelId,
    broker: Weak<BrokerMediator>,
    subscribers: Mutex<Subscribers>,
    listeners: Listeners<dyn ChannelListener>,
    message_listeners: Listeners<dyn MessageListener>,
}

#[derive(Default)]
struct Subscribers {
    sessions: HashMap<ClientID, Arc<ServerSession>>,
    /// set under the lock when the sweeper takes the channel out of the registry
    swept: bool,
}

impl ServerChannel {
    pub(crate) fn new(id: ChannelId, broker: Weak<BrokerMediator>) -> Self {
        Self {
            id,
            broker,
            subscribers: Mutex::new(Subscribers::default()),
            listeners: Listeners::default(),
            message_listeners: Listeners::default(),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn kind(&self) -> ChannelKind {
        self.id.kind()
    }

    pub fn is_meta(&self) -> bool {
        self.id.is_meta()
    }

    pub fn is_service(&self) -> bool {
        self.id.is_service()
    }

    pub fn is_broadcast(&self) -> bool {
        self.id.is_broadcast()
    }

    pub fn wild_names(&self) -> &[String] {
        self.id.wild_names()
    }

    pub fn subscribers(&self) -> Vec<Arc<ServerSession>> {
        self.subscribers.lock().sessions.values().cloned().collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        self.message_listeners.add(listener)
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.message_listeners.remove(id)
    }

    pub(crate) fn message_listeners(&self) -> Vec<Arc<dyn MessageListener>> {
        self.message_listeners.snapshot()
    }

    /// server side publish; only broadcast channels accept it
    pub async fn publish(self: &Arc<Self>, sender: Option<&Arc<ServerSession>>, data: Value) -> Result<(), BrokerError> {
        let broker = self.broker.upgrade().ok_or(BrokerError::Closed)?;
        let mut message = ServerMessage::new(Message::new(self.name(), Some(data)));
        broker.publish(self, sender, &mut message, false).await
    }

    /// `false` for sessions that are not handshaken and for meta channels,
    /// service channels accept the request without tracking the subscriber
    pub fn subscribe(self: &Arc<Self>, session: &Arc<ServerSession>, message: Option<&ServerMessage>) -> bool {
        if !session.is_handshaken() || self.is_meta() {
            return false;
        }
        if !self.is_broadcast() {
            return true;
        }

        let added = {
            let mut subscribers = self.subscribers.lock();
            if subscribers.swept {
                None
            } else if subscribers.sessions.contains_key(session.id()) {
                Some(false)
            } else {
                subscribers.sessions.insert(session.id().clone(), session.clone());
                Some(true)
            }
        };
        match added {
            Some(true) => (),
            Some(false) => return true,
            None => return self.resubscribe(session, message),
        }

        session.subscribed(self);
        // lost a race with session removal
        if !session.is_handshaken() {
            self.unsubscribe(session, None);
            return false;
        }

        debug!(channel = %self.id, session = %session.id(), "subscribed");
        for listener in self.listeners.snapshot() {
            listener.subscribed(self, session, message);
        }
        if let Some(broker) = self.broker.upgrade() {
            for listener in broker.listeners() {
                listener.subscribed(self, session, message);
            }
        }
        true
    }

    /// the handle was swept while the subscribe was in flight;
    /// the subscription goes to the channel now registered under this name
    fn resubscribe(self: &Arc<Self>, session: &Arc<ServerSession>, message: Option<&ServerMessage>) -> bool {
        let Some(broker) = self.broker.upgrade() else {
            return false;
        };
        match broker.create_channel(self.name()) {
            Ok(live) if !Arc::ptr_eq(&live, self) => live.subscribe(session, message),
            _ => false,
        }
    }

    pub fn unsubscribe(self: &Arc<Self>, session: &Arc<ServerSession>, message: Option<&ServerMessage>) -> bool {
        let removed = self.subscribers.lock().sessions.remove(session.id());
        if removed.is_none() {
            return true;
        }

        session.unsubscribed(self);
        debug!(channel = %self.id, session = %session.id(), "unsubscribed");
        for listener in self.listeners.snapshot() {
            listener.unsubscribed(self, session, message);
        }
        if let Some(broker) = self.broker.upgrade() {
            for listener in broker.listeners() {
                listener.unsubscribed(self, session, message);
            }
        }
        true
    }

    fn is_idle(&self, subscribers: &Subscribers) -> bool {
        subscribers.sessions.is_empty()
            && self.listeners.is_empty()
            && self.message_listeners.is_empty()
    }
}

impl Cleanup for Arc<ServerChannel> {
    /// idle check and registry removal happen under the subscribers lock
    async fn sweep(&self) {
        if self.is_meta() {
            return;
        }
        let Some(broker) = self.broker.upgrade() else {
            return;
        };

        let removed = {
            let mut subscribers = self.subscribers.lock();
            if subscribers.swept || !self.is_idle(&subscribers) {
                return;
            }
            subscribers.swept = true;
            broker.channel_registry().remove(self)
        };
        if removed {
            broker.channel_removed(self);
        }
    }
}

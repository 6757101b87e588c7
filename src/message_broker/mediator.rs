use std::sync::{Arc, Weak};
use parking_lot::{Mutex, RwLock};
use tokio::{sync::broadcast::{self, Sender}, task::JoinHandle};
use tracing::{debug, info};
use crate::{
    config::{ConfigError, Options, ServerOptions},
    ds::{ListenerId, Listeners},
    error::BrokerError,
    protocol::{
        channel_id::{META_CHANNELS, META_CONNECT},
        ErrorCode, Message, Reconnect, ServerMessage,
    },
};
use super::{
    channel::ServerChannel,
    cleanup::{self, Cleanup},
    client::{Clients, ServerSession},
    extension::{self, same_extension, Extension, OutgoingMessage},
    listener::BrokerListener,
    messenger::MessageDistributor,
    meta,
    policy::{AllowAll, SecurityPolicy},
    router::ChannelRegistry,
};

/// the bayeux broker: sessions, channels, extensions and the security policy
pub struct BrokerMediator {
    me: Weak<BrokerMediator>,
    options: Options,
    server_options: ServerOptions,
    channels: ChannelRegistry,
    clients: Clients,
    extensions: Mutex<Vec<Arc<dyn Extension>>>,
    listeners: Listeners<dyn BrokerListener>,
    policy: RwLock<Arc<dyn SecurityPolicy>>,
    tx_shutdown: Sender<()>,
}

impl BrokerMediator {
    pub fn new(options: &Options) -> Result<Arc<Self>, ConfigError> {
        let server_options = ServerOptions::resolve(options)?;
        let (tx_shutdown, _) = broadcast::channel(1);

        let broker = Arc::new_cyclic(|me: &Weak<Self>| {
            let channels = ChannelRegistry::new();
            for name in META_CHANNELS {
                let _ = channels.create(name, me);
            }

            Self {
                me: me.clone(),
                options: options.clone(),
                server_options,
                channels,
                clients: Clients::new(),
                extensions: Mutex::new(Vec::new()),
                listeners: Listeners::default(),
                policy: RwLock::new(Arc::new(AllowAll)),
                tx_shutdown,
            }
        });
        Ok(broker)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn server_options(&self) -> &ServerOptions {
        &self.server_options
    }

    pub fn policy(&self) -> Arc<dyn SecurityPolicy> {
        self.policy.read().clone()
    }

    pub fn set_policy(&self, policy: Arc<dyn SecurityPolicy>) {
        *self.policy.write() = policy;
    }

    pub fn add_listener(&self, listener: Arc<dyn BrokerListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn BrokerListener>> {
        self.listeners.snapshot()
    }

    pub fn add_extension(&self, extension: Arc<dyn Extension>) {
        self.extensions.lock().push(extension);
    }

    pub fn remove_extension(&self, extension: &Arc<dyn Extension>) -> bool {
        let mut extensions = self.extensions.lock();
        match extensions.iter().position(|e| same_extension(e, extension)) {
            Some(i) => {
                extensions.remove(i);
                true
            },
            None => false
        }
    }

    pub fn extensions(&self) -> Vec<Arc<dyn Extension>> {
        self.extensions.lock().clone()
    }

    pub(crate) fn channel_registry(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn get_channel(&self, name: &str) -> Option<Arc<ServerChannel>> {
        self.channels.get(name)
    }

    pub fn create_channel(&self, name: &str) -> Result<Arc<ServerChannel>, BrokerError> {
        let (channel, created) = self.channels.create(name, &self.me)?;
        if created {
            debug!(channel = name, "channel added");
            for listener in self.listeners.snapshot() {
                listener.channel_added(&channel);
            }
        }
        Ok(channel)
    }

    pub fn channels(&self) -> Vec<Arc<ServerChannel>> {
        self.channels.snapshot()
    }

    /// `channel` already left the registry; see the channel sweep
    pub(crate) fn channel_removed(&self, channel: &Arc<ServerChannel>) {
        debug!(channel = channel.name(), "channel removed");
        for listener in self.listeners.snapshot() {
            listener.channel_removed(channel);
        }
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<ServerSession>> {
        self.clients.get(id)
    }

    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        self.clients.snapshot()
    }

    /// a tentative session, registered only by a successful handshake
    pub fn new_session(&self) -> Arc<ServerSession> {
        Arc::new(ServerSession::new(self.me.clone()))
    }

    pub(crate) fn add_session(&self, session: &Arc<ServerSession>, message: &ServerMessage) {
        self.clients.insert(session.clone());
        info!(session = %session.id(), "session added");
        for listener in self.listeners.snapshot() {
            listener.session_added(session, message);
        }
    }

    /// unregisters `session` and unsubscribes it everywhere; `false` if it
    /// was not registered
    pub(crate) async fn remove_session(&self, session: &Arc<ServerSession>, timeout: bool) -> bool {
        if self.clients.remove(session).is_none() {
            return false;
        }
        info!(session = %session.id(), timeout, "session removed");
        for listener in self.listeners.snapshot() {
            listener.session_removed(session, timeout);
        }
        session.removed(timeout).await;
        true
    }

    /// processes one inbound message, leaving the outcome in its reply
    pub async fn process(&self, session: Option<&Arc<ServerSession>>, message: &mut ServerMessage) -> Result<(), BrokerError> {
        message.ensure_reply();

        let Some(session) = session else {
            unknown(message);
            return Ok(());
        };
        if message.channel().is_none() {
            message.fail(ErrorCode::ChannelMissing);
            return Ok(());
        }

        if !extension::incoming(self, session, message).await? {
            message.fail(ErrorCode::MessageDeleted);
            return Ok(());
        }

        let Some(name) = message.channel().map(str::to_string) else {
            message.fail(ErrorCode::ChannelMissing);
            return Ok(());
        };
        session.cancel_expiration(name == META_CONNECT);

        let channel = match self.get_channel(&name) {
            Some(channel) => channel,
            None => {
                let allowed = self.policy()
                    .can_create(session, message, &name)
                    .await
                    .map_err(BrokerError::Policy)?;
                if !allowed {
                    message.fail(ErrorCode::ChannelDenied);
                    return Ok(());
                }
                match self.create_channel(&name) {
                    Ok(channel) => channel,
                    Err(BrokerError::InvalidChannel(_)) => {
                        message.fail(ErrorCode::ChannelDenied);
                        return Ok(());
                    },
                    Err(err) => return Err(err),
                }
            }
        };

        if channel.is_meta() {
            return self.publish(&channel, Some(session), message, true).await;
        }

        let allowed = self.policy()
            .can_publish(session, message, &channel)
            .await
            .map_err(BrokerError::Policy)?;
        if !allowed {
            message.fail(ErrorCode::PublishDenied);
            return Ok(());
        }
        if let Some(reply) = message.reply_mut() {
            reply.successful = Some(true);
        }
        self.publish(&channel, Some(session), message, true).await
    }

    /// listeners, then either the meta handler or the broadcast fan-out
    pub(crate) async fn publish(
        &self,
        channel: &Arc<ServerChannel>,
        sender: Option<&Arc<ServerSession>>,
        message: &mut ServerMessage,
        incoming: bool,
    ) -> Result<(), BrokerError> {
        if !channel.is_broadcast() && !incoming {
            return Err(BrokerError::NotBroadcast(channel.name().to_string()));
        }
        debug!(channel = channel.name(), "publishing");

        if channel.is_broadcast() {
            let payload = message.payload_mut();
            payload.id = None;
            payload.client_id = None;
        }

        let distributor = MessageDistributor::new(self);
        if !distributor.notify_listeners(channel, sender, message).await? {
            message.fail(ErrorCode::MessageDeleted);
            return Ok(());
        }

        if channel.is_broadcast() {
            let mut outgoing = OutgoingMessage::new(ServerMessage::new(message.payload().clone()));
            if !extension::outgoing_server(self, sender, None, &mut outgoing).await? {
                message.fail(ErrorCode::MessageDeleted);
                return Ok(());
            }
            return distributor.notify_subscribers(channel, sender, outgoing.into_shared()).await;
        }

        if channel.is_meta() {
            let Some(session) = sender else {
                return Err(BrokerError::ProtocolViolation("meta message without session"));
            };
            return meta::dispatch(self, channel, session, message).await;
        }
        Ok(())
    }

    /// server then session outgoing extensions on a reply; `None` if deleted
    pub async fn extend_reply(
        &self,
        session: Option<&Arc<ServerSession>>,
        reply: Message,
    ) -> Result<Option<Arc<ServerMessage>>, BrokerError> {
        let mut reply = OutgoingMessage::new(ServerMessage::new(reply));
        if !extension::outgoing_server(self, session, session, &mut reply).await? {
            return Ok(None);
        }
        if let Some(session) = session {
            if !extension::outgoing_session(Some(session), session, &mut reply).await? {
                return Ok(None);
            }
        }
        Ok(Some(reply.into_shared()))
    }

    /// starts the periodic sweeper, stopped by [`BrokerMediator::close`]
    pub fn join_handle(&self) -> JoinHandle<()> {
        let period = self.server_options.sweep_period;
        tokio::task::spawn(cleanup::sweeper(self.me.clone(), period, self.tx_shutdown.subscribe()))
    }

    pub fn close(&self) {
        let _ = self.tx_shutdown.send(());
    }
}

impl Cleanup for BrokerMediator {
    async fn sweep(&self) {
        for channel in self.channels.snapshot() {
            channel.sweep().await;
        }
        for session in self.clients.snapshot() {
            session.sweep().await;
        }
    }
}

fn unknown(message: &mut ServerMessage) {
    let meta = message.channel().map_or(false, |c| c.starts_with("/meta/"));
    if let Some(reply) = message.reply_mut() {
        reply.fail(ErrorCode::SessionUnknown);
        if meta {
            let advice = reply.advice_mut();
            advice.reconnect = Some(Reconnect::Handshake);
            advice.interval = Some(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use async_trait::async_trait;
    use serde_json::json;
    use crate::{
        error::BoxError,
        message_broker::{extension::SessionExtension, listener::MessageListener},
        protocol::{channel_id::{META_HANDSHAKE, META_SUBSCRIBE}, Subscription},
    };
    use super::*;

    fn broker() -> Arc<BrokerMediator> {
        BrokerMediator::new(&Options::new()).unwrap()
    }

    async fn handshaken(broker: &BrokerMediator) -> Arc<ServerSession> {
        let session = broker.new_session();
        let mut message = ServerMessage::incoming(Message::new(META_HANDSHAKE, None));
        broker.process(Some(&session), &mut message).await.unwrap();
        assert!(message.reply().unwrap().is_successful());
        session
    }

    async fn request(broker: &BrokerMediator, session: Option<&Arc<ServerSession>>, message: Message) -> Message {
        let mut message = ServerMessage::incoming(message);
        broker.process(session, &mut message).await.unwrap();
        message.take_reply().unwrap()
    }

    async fn subscribe(broker: &BrokerMediator, session: &Arc<ServerSession>, name: &str) -> Message {
        let mut message = Message::new(META_SUBSCRIBE, None);
        message.client_id = Some(session.id().to_string());
        message.subscription = Some(Subscription::One(name.to_string()));
        request(broker, Some(session), message).await
    }

    fn queued(session: &Arc<ServerSession>) -> Vec<Arc<ServerMessage>> {
        session.drain_queue(&[])
    }

    struct Tracer {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Tracer {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self { name, log: log.clone() })
        }
    }

    #[async_trait]
    impl Extension for Tracer {
        async fn incoming(&self, _: &BrokerMediator, _: &Arc<ServerSession>, _: &mut ServerMessage) -> Result<bool, BoxError> {
            self.log.lock().push(format!("in:{}", self.name));
            Ok(true)
        }

        async fn outgoing(
            &self,
            _: &BrokerMediator,
            _: Option<&Arc<ServerSession>>,
            _: Option<&Arc<ServerSession>>,
            _: &mut OutgoingMessage,
        ) -> Result<bool, BoxError> {
            self.log.lock().push(format!("out:{}", self.name));
            Ok(true)
        }
    }

    #[async_trait]
    impl SessionExtension for Tracer {
        async fn incoming(&self, _: &Arc<ServerSession>, _: &mut ServerMessage) -> Result<bool, BoxError> {
            self.log.lock().push(format!("in:{}", self.name));
            Ok(true)
        }

        async fn outgoing(
            &self,
            _: Option<&Arc<ServerSession>>,
            _: &Arc<ServerSession>,
            _: &mut OutgoingMessage,
        ) -> Result<bool, BoxError> {
            self.log.lock().push(format!("out:{}", self.name));
            Ok(true)
        }
    }

    #[tokio::test]
    async fn handshake_registers_session() {
        let broker = broker();
        let session = broker.new_session();
        let reply = request(&broker, Some(&session), Message::new(META_HANDSHAKE, None)).await;

        assert!(reply.is_successful());
        assert_eq!(reply.client_id.as_deref(), Some(session.id().as_str()));
        assert_eq!(reply.version.as_deref(), Some("1.0"));
        assert_eq!(reply.supported_connection_types, Some(vec!["long-polling".to_string()]));
        assert!(session.is_handshaken());
        assert!(broker.get_session(session.id().as_str()).is_some());
    }

    #[tokio::test]
    async fn unknown_session() {
        struct TestCase {
            channel: &'static str,
            advice: bool,
        }

        let test_table = [
            TestCase { channel: "/meta/connect", advice: true },
            TestCase { channel: "/meta/subscribe", advice: true },
            TestCase { channel: "/chat", advice: false },
        ];

        let broker = broker();
        for case in test_table {
            let reply = request(&broker, None, Message::new(case.channel, None)).await;
            assert_eq!(reply.error.as_deref(), Some("402::session_unknown"));
            assert_eq!(reply.successful, Some(false));
            match reply.advice {
                Some(advice) => {
                    assert!(case.advice, "{}", case.channel);
                    assert_eq!(advice.reconnect, Some(Reconnect::Handshake));
                    assert_eq!(advice.interval, Some(0));
                },
                None => assert!(!case.advice, "{}", case.channel),
            }
        }
    }

    #[tokio::test]
    async fn missing_channel() {
        let broker = broker();
        let session = handshaken(&broker).await;
        let reply = request(&broker, Some(&session), Message::default()).await;
        assert_eq!(reply.error.as_deref(), Some("400::channel_missing"));
    }

    #[tokio::test]
    async fn wildcard_fan_out() {
        struct TestCase {
            subscriptions: &'static [&'static str],
            received: usize,
        }

        let test_table = [
            TestCase { subscriptions: &["/a/*"], received: 1 },
            TestCase { subscriptions: &["/a/**"], received: 1 },
            TestCase { subscriptions: &["/**"], received: 1 },
            TestCase { subscriptions: &["/a/b"], received: 1 },
            TestCase { subscriptions: &["/a/b/c"], received: 0 },
            TestCase { subscriptions: &["/a"], received: 0 },
            TestCase { subscriptions: &["/*"], received: 0 },
            TestCase { subscriptions: &["/a/*", "/a/b"], received: 2 },
        ];

        let broker = broker();
        let mut sessions = Vec::new();
        for case in &test_table {
            let session = handshaken(&broker).await;
            for name in case.subscriptions {
                assert!(subscribe(&broker, &session, name).await.is_successful());
            }
            sessions.push(session);
        }

        let channel = broker.create_channel("/a/b").unwrap();
        channel.publish(None, json!("hello")).await.unwrap();

        for (case, session) in test_table.iter().zip(&sessions) {
            let queue = queued(session);
            assert_eq!(queue.len(), case.received, "{:?}", case.subscriptions);
            for message in queue {
                assert_eq!(message.channel(), Some("/a/b"));
                assert_eq!(message.payload().data, Some(json!("hello")));
            }
        }
    }

    #[tokio::test]
    async fn subscribers_share_one_encoding() {
        let broker = broker();
        let alice = handshaken(&broker).await;
        let bob = handshaken(&broker).await;
        subscribe(&broker, &alice, "/chat").await;
        subscribe(&broker, &bob, "/chat").await;

        broker.get_channel("/chat").unwrap().publish(None, json!({"text": "hi"})).await.unwrap();

        let a = queued(&alice);
        let b = queued(&bob);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert!(Arc::ptr_eq(&a[0], &b[0]));
        assert!(a[0].is_encoded());
    }

    #[tokio::test]
    async fn client_publish_strips_routing_fields() {
        let broker = broker();
        let publisher = handshaken(&broker).await;
        let subscriber = handshaken(&broker).await;
        subscribe(&broker, &subscriber, "/chat").await;

        let mut message = Message::new("/chat", Some(json!("hey")));
        message.id = Some(json!("42"));
        message.client_id = Some(publisher.id().to_string());
        let reply = request(&broker, Some(&publisher), message).await;

        assert!(reply.is_successful());
        assert_eq!(reply.id, Some(json!("42")));

        let queue = queued(&subscriber);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].payload().id, None);
        assert_eq!(queue[0].payload().client_id, None);
    }

    #[tokio::test]
    async fn extension_order() {
        let broker = broker();
        let session = handshaken(&broker).await;
        subscribe(&broker, &session, "/chat").await;

        let log = Arc::new(Mutex::new(Vec::new()));
        broker.add_extension(Tracer::new("a", &log));
        broker.add_extension(Tracer::new("b", &log));
        session.add_extension(Tracer::new("c", &log));
        session.add_extension(Tracer::new("d", &log));

        let reply = request(&broker, Some(&session), Message::new("/chat", Some(json!(1)))).await;
        assert!(reply.is_successful());
        assert_eq!(queued(&session).len(), 1);

        let log = log.lock().clone();
        assert_eq!(log, vec!["in:a", "in:b", "in:c", "in:d", "out:b", "out:a", "out:d", "out:c"]);
    }

    #[tokio::test]
    async fn remove_extension() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let tracer: Arc<dyn Extension> = Tracer::new("a", &log);
        broker.add_extension(tracer.clone());
        assert_eq!(broker.extensions().len(), 1);

        assert!(broker.remove_extension(&tracer));
        assert!(!broker.remove_extension(&tracer));
        assert!(broker.extensions().is_empty());
    }

    struct Installer {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Extension for Installer {
        async fn incoming(&self, _: &BrokerMediator, session: &Arc<ServerSession>, _: &mut ServerMessage) -> Result<bool, BoxError> {
            if session.extensions().is_empty() {
                session.add_extension(Tracer::new("late", &self.log));
            }
            Ok(true)
        }
    }

    #[tokio::test]
    async fn session_extension_added_by_server_pass_applies() {
        let broker = broker();
        let session = handshaken(&broker).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        broker.add_extension(Arc::new(Installer { log: log.clone() }));

        request(&broker, Some(&session), Message::new("/chat", Some(json!(1)))).await;
        assert_eq!(log.lock().first().map(String::as_str), Some("in:late"));
    }

    enum Behaviour {
        Delete,
        Fail,
        Panic,
    }

    struct Faulty(Behaviour);

    #[async_trait]
    impl Extension for Faulty {
        async fn incoming(&self, _: &BrokerMediator, _: &Arc<ServerSession>, _: &mut ServerMessage) -> Result<bool, BoxError> {
            match self.0 {
                Behaviour::Delete => Ok(false),
                Behaviour::Fail => Err("rejected".into()),
                Behaviour::Panic => panic!("extension bug"),
            }
        }
    }

    #[tokio::test]
    async fn faulty_incoming_extensions() {
        let broker = broker();
        let session = handshaken(&broker).await;

        let deleting: Arc<dyn Extension> = Arc::new(Faulty(Behaviour::Delete));
        broker.add_extension(deleting.clone());
        let reply = request(&broker, Some(&session), Message::new("/chat", Some(json!(1)))).await;
        assert_eq!(reply.error.as_deref(), Some("404::message_deleted"));
        broker.remove_extension(&deleting);

        let panicking: Arc<dyn Extension> = Arc::new(Faulty(Behaviour::Panic));
        broker.add_extension(panicking.clone());
        let reply = request(&broker, Some(&session), Message::new("/chat", Some(json!(1)))).await;
        assert!(reply.is_successful());
        broker.remove_extension(&panicking);

        broker.add_extension(Arc::new(Faulty(Behaviour::Fail)));
        let mut message = ServerMessage::incoming(Message::new("/chat", Some(json!(1))));
        let outcome = broker.process(Some(&session), &mut message).await;
        assert!(matches!(outcome, Err(BrokerError::Extension(_))));
    }

    struct Censor;

    #[async_trait]
    impl MessageListener for Censor {
        async fn on_message(
            &self,
            _: Option<&Arc<ServerSession>>,
            _: &Arc<ServerChannel>,
            message: &mut ServerMessage,
        ) -> Result<bool, BoxError> {
            if message.payload().data == Some(json!("secret")) {
                return Ok(false);
            }
            message.payload_mut().data = Some(json!("censored"));
            Ok(true)
        }
    }

    struct Veto;

    #[async_trait]
    impl Extension for Veto {
        async fn outgoing(
            &self,
            _: &BrokerMediator,
            _: Option<&Arc<ServerSession>>,
            _: Option<&Arc<ServerSession>>,
            _: &mut OutgoingMessage,
        ) -> Result<bool, BoxError> {
            Ok(false)
        }
    }

    #[async_trait]
    impl SessionExtension for Veto {
        async fn outgoing(
            &self,
            _: Option<&Arc<ServerSession>>,
            _: &Arc<ServerSession>,
            _: &mut OutgoingMessage,
        ) -> Result<bool, BoxError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn outgoing_veto() {
        struct TestCase {
            server_scope: bool,
        }

        let test_table = [
            TestCase { server_scope: true },
            TestCase { server_scope: false },
        ];

        for case in test_table {
            let broker = broker();
            let session = handshaken(&broker).await;
            if case.server_scope {
                broker.add_extension(Arc::new(Veto));
            } else {
                session.add_extension(Arc::new(Veto));
            }

            assert!(!session.deliver(None, "/private", json!(1)).await.unwrap());
            assert!(!session.has_messages());

            let mut reply = Message::new("/private", None);
            reply.successful = Some(true);
            assert!(broker.extend_reply(Some(&session), reply).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn message_listeners() {
        let broker = broker();
        let session = handshaken(&broker).await;
        subscribe(&broker, &session, "/chat/room").await;
        broker.create_channel("/chat/**").unwrap().add_message_listener(Arc::new(Censor));

        let reply = request(&broker, Some(&session), Message::new("/chat/room", Some(json!("secret")))).await;
        assert_eq!(reply.error.as_deref(), Some("404::message_deleted"));
        assert!(queued(&session).is_empty());

        let reply = request(&broker, Some(&session), Message::new("/chat/room", Some(json!("plain")))).await;
        assert!(reply.is_successful());
        let queue = queued(&session);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].payload().data, Some(json!("censored")));
    }

    #[derive(Default)]
    struct Deny {
        handshake: bool,
        create: bool,
        publish: bool,
    }

    #[async_trait]
    impl SecurityPolicy for Deny {
        async fn can_handshake(&self, _: &Arc<ServerSession>, _: &ServerMessage) -> Result<bool, BoxError> {
            Ok(!self.handshake)
        }

        async fn can_create(&self, _: &Arc<ServerSession>, _: &ServerMessage, _: &str) -> Result<bool, BoxError> {
            Ok(!self.create)
        }

        async fn can_publish(&self, _: &Arc<ServerSession>, _: &ServerMessage, _: &Arc<ServerChannel>) -> Result<bool, BoxError> {
            Ok(!self.publish)
        }
    }

    #[tokio::test]
    async fn policy_denials() {
        let broker = broker();
        broker.set_policy(Arc::new(Deny { handshake: true, ..Default::default() }));
        let session = broker.new_session();
        let reply = request(&broker, Some(&session), Message::new(META_HANDSHAKE, None)).await;
        assert_eq!(reply.error.as_deref(), Some("403::handshake_denied"));
        assert_eq!(reply.advice.and_then(|a| a.reconnect), Some(Reconnect::None));
        assert!(broker.sessions().is_empty());

        broker.set_policy(Arc::new(AllowAll));
        let session = handshaken(&broker).await;

        broker.set_policy(Arc::new(Deny { create: true, ..Default::default() }));
        let reply = request(&broker, Some(&session), Message::new("/fresh", Some(json!(1)))).await;
        assert_eq!(reply.error.as_deref(), Some("403::channel_denied"));
        assert!(broker.get_channel("/fresh").is_none());
        assert_eq!(subscribe(&broker, &session, "/fresh").await.error.as_deref(), Some("403::subscribe_denied"));

        broker.create_channel("/existing").unwrap();
        broker.set_policy(Arc::new(Deny { publish: true, ..Default::default() }));
        let reply = request(&broker, Some(&session), Message::new("/existing", Some(json!(1)))).await;
        assert_eq!(reply.error.as_deref(), Some("403::publish_denied"));
    }

    #[tokio::test]
    async fn subscribe_failures() {
        struct TestCase {
            subscription: Option<Subscription>,
            error: &'static str,
        }

        let test_table = [
            TestCase { subscription: None, error: "403::subscription_missing" },
            TestCase { subscription: Some(Subscription::One("chat".into())), error: "403::subscribe_denied" },
            TestCase { subscription: Some(Subscription::One("/meta/connect".into())), error: "403::subscribe_failed" },
        ];

        let broker = broker();
        let session = handshaken(&broker).await;
        for case in test_table {
            let mut message = Message::new(META_SUBSCRIBE, None);
            message.subscription = case.subscription;
            let reply = request(&broker, Some(&session), message).await;
            assert_eq!(reply.error.as_deref(), Some(case.error));
        }
    }

    #[tokio::test]
    async fn server_publish_needs_broadcast_channel() {
        let broker = broker();
        let channel = broker.create_channel("/service/echo").unwrap();
        let outcome = channel.publish(None, json!(1)).await;
        assert!(matches!(outcome, Err(BrokerError::NotBroadcast(_))));
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl BrokerListener for Events {
        fn session_added(&self, _: &Arc<ServerSession>, _: &ServerMessage) {
            self.0.lock().push("session_added".into());
        }

        fn session_removed(&self, _: &Arc<ServerSession>, timeout: bool) {
            self.0.lock().push(format!("session_removed:{}", timeout));
        }

        fn channel_added(&self, channel: &Arc<ServerChannel>) {
            self.0.lock().push(format!("channel_added:{}", channel.name()));
        }

        fn channel_removed(&self, channel: &Arc<ServerChannel>) {
            self.0.lock().push(format!("channel_removed:{}", channel.name()));
        }

        fn subscribed(&self, channel: &Arc<ServerChannel>, _: &Arc<ServerSession>, _: Option<&ServerMessage>) {
            self.0.lock().push(format!("subscribed:{}", channel.name()));
        }

        fn unsubscribed(&self, channel: &Arc<ServerChannel>, _: &Arc<ServerSession>, _: Option<&ServerMessage>) {
            self.0.lock().push(format!("unsubscribed:{}", channel.name()));
        }
    }

    #[tokio::test]
    async fn server_side_disconnect() {
        let broker = broker();
        let events = Arc::new(Events::default());
        broker.add_listener(events.clone());

        let session = handshaken(&broker).await;
        subscribe(&broker, &session, "/chat").await;

        assert!(session.disconnect().await.unwrap());
        assert!(!session.disconnect().await.unwrap());
        assert!(broker.get_session(session.id().as_str()).is_none());
        assert!(session.subscriptions().is_empty());
        assert!(broker.get_channel("/chat").unwrap().subscribers().is_empty());

        let queue = queued(&session);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].channel(), Some("/meta/disconnect"));
        assert!(queue[0].payload().is_successful());

        let events = events.0.lock().clone();
        assert_eq!(events, vec![
            "session_added",
            "channel_added:/chat",
            "subscribed:/chat",
            "session_removed:false",
            "unsubscribed:/chat",
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reclaims_expired_sessions_and_idle_channels() {
        let broker = broker();
        let events = Arc::new(Events::default());
        broker.add_listener(events.clone());

        let session = handshaken(&broker).await;
        subscribe(&broker, &session, "/chat").await;
        broker.create_channel("/idle").unwrap();
        session.schedule_expiration(0, 100);

        broker.sweep().await;
        assert!(broker.get_channel("/idle").is_none());
        assert!(broker.get_session(session.id().as_str()).is_some());

        tokio::time::advance(Duration::from_millis(101)).await;
        broker.sweep().await;
        assert!(broker.get_session(session.id().as_str()).is_none());
        assert!(broker.get_channel("/chat").is_some());

        broker.sweep().await;
        assert!(broker.get_channel("/chat").is_none());
        for name in META_CHANNELS {
            assert!(broker.get_channel(name).is_some());
        }
        assert!(events.0.lock().contains(&"session_removed:true".to_string()));
    }

    #[tokio::test]
    async fn close_stops_sweeper() {
        let broker = broker();
        let handle = broker.join_handle();
        broker.close();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}

use std::{future::Future, sync::{Arc, Weak}, time::Duration};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};
use crate::{
    ds::{fold_left, ListenerId, Listeners},
    error::BrokerError,
    message_broker::{
        channel::ServerChannel,
        cleanup::Cleanup,
        extension::{self, same_extension, OutgoingMessage, SessionExtension},
        listener::SessionListener,
        mediator::BrokerMediator,
    },
    protocol::{channel_id::META_DISCONNECT, Message, ServerMessage},
};
use super::{clobj::{ClientID, Expiration}, SessionController};

/// the suspended `/meta/connect` of a session, installed by the transport
pub trait Scheduler: Send + Sync {
    fn id(&self) -> u64;
    /// new messages are available
    fn resume(&self);
    /// a newer `/meta/connect` or the sweeper preempts this one
    fn cancel(&self);
}

struct SessionState {
    handshaken: bool,
    subscriptions: Vec<Weak<ServerChannel>>,
    queue: Vec<Arc<ServerMessage>>,
    batch: u32,
    client_timeout: i64,
    client_interval: i64,
    expiration: Expiration,
    meta_connect_delivery_only: bool,
    browser_id: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            handshaken: false,
            subscriptions: Vec::new(),
            queue: Vec::new(),
            batch: 0,
            client_timeout: -1,
            client_interval: -1,
            expiration: Expiration::default(),
            meta_connect_delivery_only: false,
            browser_id: None,
        }
    }
}

/// server side representation of a remote client
pub struct ServerSession {
    id: ClientID,
    broker: Weak<BrokerMediator>,
    state: Mutex<SessionState>,
    extensions: Mutex<Vec<Arc<dyn SessionExtension>>>,
    listeners: Listeners<dyn SessionListener>,
    scheduler: Mutex<Option<Arc<dyn Scheduler>>>,
}

impl ServerSession {
    pub(crate) fn new(broker: Weak<BrokerMediator>) -> Self {
        Self {
            id: ClientID::generate(),
            broker,
            state: Mutex::new(SessionState::default()),
            extensions: Mutex::new(Vec::new()),
            listeners: Listeners::default(),
            scheduler: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &ClientID {
        &self.id
    }

    pub fn is_handshaken(&self) -> bool {
        self.state.lock().handshaken
    }

    pub(crate) fn handshake(&self) {
        self.state.lock().handshaken = true;
    }

    pub fn add_extension(&self, extension: Arc<dyn SessionExtension>) {
        self.extensions.lock().push(extension);
    }

    pub fn remove_extension(&self, extension: &Arc<dyn SessionExtension>) -> bool {
        let mut extensions = self.extensions.lock();
        match extensions.iter().position(|e| same_extension(e, extension)) {
            Some(i) => {
                extensions.remove(i);
                true
            },
            None => false
        }
    }

    pub fn extensions(&self) -> Vec<Arc<dyn SessionExtension>> {
        self.extensions.lock().clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn SessionListener>> {
        self.listeners.snapshot()
    }

    pub fn subscriptions(&self) -> Vec<Arc<ServerChannel>> {
        self.state.lock().subscriptions.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn subscribed(&self, channel: &Arc<ServerChannel>) {
        self.state.lock().subscriptions.push(Arc::downgrade(channel));
    }

    pub(crate) fn unsubscribed(&self, channel: &ServerChannel) {
        let mut state = self.state.lock();
        let found = state.subscriptions.iter().position(|s| match s.upgrade() {
            Some(s) => s.name() == channel.name(),
            None => false
        });
        if let Some(i) = found {
            state.subscriptions.remove(i);
        }
    }

    /// sends `data` on `channel` to this session through the server and
    /// session outgoing extensions; `Ok(false)` when an extension deleted it
    pub async fn deliver(
        self: &Arc<Self>,
        sender: Option<&Arc<ServerSession>>,
        channel: &str,
        data: Value,
    ) -> Result<bool, BrokerError> {
        debug!(session = %self.id, channel, "delivering");
        self.deliver_message(sender, ServerMessage::new(Message::new(channel, Some(data)))).await
    }

    pub(crate) async fn deliver_message(
        self: &Arc<Self>,
        sender: Option<&Arc<ServerSession>>,
        message: ServerMessage,
    ) -> Result<bool, BrokerError> {
        let broker = self.broker.upgrade().ok_or(BrokerError::Closed)?;
        let mut message = OutgoingMessage::new(message);
        if !extension::outgoing_server(&broker, sender, Some(self), &mut message).await? {
            return Ok(false);
        }
        self.deliver1(sender, message.into_shared()).await
    }

    /// session outgoing pass and enqueue, used by the broadcast fan-out
    pub(crate) async fn deliver1(
        self: &Arc<Self>,
        sender: Option<&Arc<ServerSession>>,
        message: Arc<ServerMessage>,
    ) -> Result<bool, BrokerError> {
        let mut message = OutgoingMessage::shared(message);
        if !extension::outgoing_session(sender, self, &mut message).await? {
            return Ok(false);
        }
        let message = message.into_shared();
        message.encode()?;
        self.offer(message);
        Ok(true)
    }

    fn offer(self: &Arc<Self>, message: Arc<ServerMessage>) {
        let batching = {
            let mut state = self.state.lock();
            state.queue.push(message.clone());
            state.batch > 0
        };
        for listener in self.listeners.snapshot() {
            listener.queue_offer(self, &message);
        }
        if !batching {
            self.flush();
        }
    }

    pub fn has_messages(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }

    pub(crate) fn drain_queue(self: &Arc<Self>, replies: &[Arc<ServerMessage>]) -> Vec<Arc<ServerMessage>> {
        let queue = std::mem::take(&mut self.state.lock().queue);
        for listener in self.listeners.snapshot() {
            listener.queue_drain(self, &queue, replies);
        }
        queue
    }

    /// runs `task` as one batch: messages queued meanwhile are flushed
    /// once, when the outermost batch ends
    pub async fn batch<F: Future>(&self, task: F) -> F::Output {
        let _batch = self.start_batch();
        task.await
    }

    pub(crate) fn start_batch(&self) -> BatchGuard<'_> {
        self.state.lock().batch += 1;
        BatchGuard { session: self }
    }

    fn end_batch(&self) {
        let flush = {
            let mut state = self.state.lock();
            state.batch = state.batch.saturating_sub(1);
            state.batch == 0 && !state.queue.is_empty()
        };
        if flush {
            self.flush();
        }
    }

    pub fn is_batching(&self) -> bool {
        self.state.lock().batch > 0
    }

    /// disconnects from the server side; the client gets a
    /// `/meta/disconnect` on its next poll
    pub async fn disconnect(self: &Arc<Self>) -> Result<bool, BrokerError> {
        let broker = self.broker.upgrade().ok_or(BrokerError::Closed)?;
        let removed = broker.remove_session(self, false).await;
        if removed {
            let mut message = Message::new(META_DISCONNECT, None);
            message.successful = Some(true);
            self.deliver_message(Some(self), ServerMessage::new(message)).await?;
        }
        Ok(removed)
    }

    pub fn meta_connect_delivery_only(&self) -> bool {
        self.state.lock().meta_connect_delivery_only
    }

    /// when set, queued messages are only sent on `/meta/connect` replies
    pub fn set_meta_connect_delivery_only(&self, value: bool) {
        self.state.lock().meta_connect_delivery_only = value;
    }

    pub(crate) fn set_client_timeout(&self, timeout: i64) {
        self.state.lock().client_timeout = timeout;
    }

    pub(crate) fn set_client_interval(&self, interval: i64) {
        self.state.lock().client_interval = interval;
    }

    pub fn calculate_timeout(&self, default: i64) -> i64 {
        let timeout = self.state.lock().client_timeout;
        if timeout >= 0 { timeout } else { default }
    }

    pub fn calculate_interval(&self, default: i64) -> i64 {
        let interval = self.state.lock().client_interval;
        if interval >= 0 { interval } else { default }
    }

    pub fn schedule_expiration(&self, interval: i64, max_interval: i64) {
        let interval = millis(self.calculate_interval(interval));
        self.state.lock().expiration.schedule(Instant::now(), interval, millis(max_interval));
    }

    pub fn cancel_expiration(&self, meta_connect: bool) {
        self.state.lock().expiration.cancel(Instant::now(), meta_connect);
    }

    pub fn expiration_time(&self) -> Option<Instant> {
        self.state.lock().expiration.expiration_time()
    }

    pub fn browser_id(&self) -> Option<String> {
        self.state.lock().browser_id.clone()
    }

    pub(crate) fn bind_browser(&self, browser_id: String) {
        self.state.lock().browser_id = Some(browser_id);
    }

    pub(crate) fn scheduler(&self) -> Option<Arc<dyn Scheduler>> {
        self.scheduler.lock().clone()
    }

    pub(crate) fn install_scheduler(&self, scheduler: Arc<dyn Scheduler>) {
        *self.scheduler.lock() = Some(scheduler);
    }

    /// clears the scheduler slot if `id` still owns it
    pub(crate) fn detach_scheduler(&self, id: u64) {
        let mut slot = self.scheduler.lock();
        if slot.as_ref().map(|s| s.id()) == Some(id) {
            *slot = None;
        }
    }

    /// wakes the suspended `/meta/connect`, if any
    pub fn flush(&self) {
        let scheduler = self.scheduler();
        if let Some(scheduler) = scheduler {
            scheduler.resume();
        }
    }

    pub(crate) async fn removed(self: &Arc<Self>, timeout: bool) {
        let subscriptions = {
            let mut state = self.state.lock();
            state.handshaken = false;
            state.subscriptions.iter().filter_map(Weak::upgrade).collect::<Vec<_>>()
        };

        let unsubscribed: Result<(), BrokerError> = fold_left(subscriptions, (), move |_, channel, advance| async move {
            channel.unsubscribe(self, None);
            advance.next(());
        }).await;
        if let Err(err) = unsubscribed {
            debug!(session = %self.id, "unsubscribe on removal: {}", err);
        }

        for listener in self.listeners.snapshot() {
            listener.removed(self, timeout);
        }
    }
}

impl Cleanup for Arc<ServerSession> {
    async fn sweep(&self) {
        let expired = self.state.lock().expiration.is_expired(Instant::now());
        if !expired {
            return;
        }

        info!(session = %self.id, "session expired");
        let scheduler = self.scheduler();
        if let Some(scheduler) = scheduler {
            scheduler.cancel();
        }
        if let Some(broker) = self.broker.upgrade() {
            broker.remove_session(self, true).await;
        }
    }
}

/// ends the batch on drop, so a failing or panicking batch still flushes
pub(crate) struct BatchGuard<'a> {
    session: &'a ServerSession,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.session.end_batch();
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

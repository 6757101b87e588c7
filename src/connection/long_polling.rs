use std::{sync::{atomic::{AtomicU64, Ordering}, Arc}, time::Duration};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info};
use crate::{
    config::{ConfigError, Options, TransportOptions},
    ds::fold_left,
    error::BrokerError,
    message_broker::{client::clobj::random_token, BrokerMediator, ServerSession},
    protocol::{
        channel_id::{META_CONNECT, META_HANDSHAKE},
        Message, Reconnect, ServerMessage,
    },
};
use super::{
    browser::BrowserTable,
    errors::TransportError,
    scheduler::{LongPollScheduler, Wakeup},
};

/// the json-over-http long-polling transport
pub struct LongPollingTransport {
    broker: Arc<BrokerMediator>,
    options: TransportOptions,
    browsers: Arc<BrowserTable>,
    requests: AtomicU64,
}

/// a successful exchange, ready to be written back
pub struct Reply {
    pub body: Bytes,
    /// browser id issued by this request, to be set as a cookie
    pub browser_id: Option<String>,
    /// fires the session expiration once the response is done with
    pub expiration: Option<ExpirationHook>,
}

/// schedules the session expiration when dropped, also when the request
/// is abandoned before a response exists
pub struct ExpirationHook {
    session: Arc<ServerSession>,
    interval: i64,
    max_interval: i64,
    armed: bool,
}

impl ExpirationHook {
    fn new(session: &Arc<ServerSession>, options: &TransportOptions) -> Self {
        Self {
            session: session.clone(),
            interval: options.interval,
            max_interval: options.max_interval,
            armed: true,
        }
    }

    /// the session stays without a deadline
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ExpirationHook {
    fn drop(&mut self) {
        if self.armed {
            self.session.schedule_expiration(self.interval, self.max_interval);
        }
    }
}

#[derive(Default)]
struct Batch {
    replies: Vec<Arc<ServerMessage>>,
    send_queue: bool,
    expiration: Option<ExpirationHook>,
    browser_id: Option<String>,
}

impl Batch {
    fn schedule_expiration(&mut self, session: Option<&Arc<ServerSession>>, options: &TransportOptions) {
        let Some(session) = session else {
            return;
        };
        if self.expiration.is_none() {
            self.expiration = Some(ExpirationHook::new(session, options));
        }
    }
}

#[derive(Clone, Copy)]
struct Request<'a> {
    id: u64,
    session: Option<&'a Arc<ServerSession>>,
    browser_id: Option<&'a str>,
    total: usize,
}

impl LongPollingTransport {
    pub fn new(broker: Arc<BrokerMediator>, options: &Options) -> Result<Self, ConfigError> {
        let options = TransportOptions::resolve(options)?;
        let browsers = Arc::new(BrowserTable::new(options.max_sessions_per_browser));
        Ok(Self { broker, options, browsers, requests: AtomicU64::new(0) })
    }

    pub fn broker(&self) -> &Arc<BrokerMediator> {
        &self.broker
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn browsers(&self) -> &Arc<BrowserTable> {
        &self.browsers
    }

    /// `Set-Cookie` value carrying `browser_id`
    pub fn browser_cookie(&self, browser_id: &str) -> String {
        let mut cookie = format!("{}={}", self.options.browser_cookie_name, browser_id);
        if self.options.browser_cookie_http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.options.browser_cookie_secure {
            cookie.push_str("; Secure");
        }
        if let Some(same_site) = &self.options.browser_cookie_same_site {
            cookie.push_str("; SameSite=");
            cookie.push_str(same_site);
        }
        cookie
    }

    pub async fn handle(&self, browser_id: Option<&str>, body: &[u8]) -> Result<Reply, TransportError> {
        let messages: Vec<Message> = serde_json::from_slice(body)?;
        self.process(browser_id, messages).await
    }

    /// runs one batch of messages; the queue is sent ahead of the replies
    pub async fn process(&self, browser_id: Option<&str>, messages: Vec<Message>) -> Result<Reply, TransportError> {
        let id = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(request = id, messages = messages.len(), "processing request");

        let Some(first) = messages.first() else {
            debug!(request = id, "invalid request, no messages");
            return Err(TransportError::EmptyBatch);
        };
        let session = self.find_session(browser_id, first);
        let batching = first.channel() != Some(META_CONNECT);
        let guard = session.as_ref()
            .filter(|_| batching)
            .map(|session| session.start_batch());

        let request = Request {
            id,
            session: session.as_ref(),
            browser_id,
            total: messages.len(),
        };
        let batch = fold_left(messages, Batch::default(), move |mut batch, message, advance| async move {
            match self.step(&mut batch, request, message).await {
                Ok(()) => advance.next(batch),
                Err(err) => advance.fail(err),
            }
        }).await;

        let batch = match batch {
            Ok(batch) => batch,
            Err(err) => {
                info!(request = id, status = err.status(), "request failed: {}", err);
                return Err(err);
            }
        };
        let reply = self.respond(request, batch)?;
        drop(guard);
        Ok(reply)
    }

    fn find_session(&self, browser_id: Option<&str>, first: &Message) -> Option<Arc<ServerSession>> {
        if first.channel() == Some(META_HANDSHAKE) {
            return Some(self.broker.new_session());
        }
        let browser_id = browser_id?;
        let client_id = first.client_id.as_deref()?;
        self.browsers.find(browser_id, client_id)
    }

    async fn step(&self, batch: &mut Batch, request: Request<'_>, message: Message) -> Result<(), TransportError> {
        match message.channel() {
            Some(META_HANDSHAKE) => self.handshake(batch, request, message).await,
            Some(META_CONNECT) => self.connect(batch, request, message).await,
            _ => {
                let mut message = ServerMessage::incoming(message);
                self.broker.process(request.session, &mut message).await?;
                if let Some(reply) = message.take_reply() {
                    self.push_reply(batch, request.session, reply).await?;
                }
                batch.send_queue = !request.session.map_or(false, |s| s.meta_connect_delivery_only());
                Ok(())
            }
        }
    }

    async fn handshake(&self, batch: &mut Batch, request: Request<'_>, message: Message) -> Result<(), TransportError> {
        let Some(session) = request.session.filter(|_| request.total == 1) else {
            return Err(BrokerError::ProtocolViolation("handshake must be the only message of its batch").into());
        };

        let mut message = ServerMessage::incoming(message);
        self.broker.process(Some(session), &mut message).await?;
        let Some(mut reply) = message.take_reply() else {
            return Ok(());
        };

        if reply.is_successful() {
            let browser_id = match request.browser_id {
                Some(browser_id) => browser_id.to_string(),
                None => batch.browser_id.get_or_insert_with(random_token).clone(),
            };
            self.browsers.bind(&browser_id, session);
            self.advise(&mut reply);
        }

        self.push_reply(batch, Some(session), reply).await?;
        batch.send_queue = false;
        batch.schedule_expiration(Some(session), &self.options);
        Ok(())
    }

    async fn connect(&self, batch: &mut Batch, request: Request<'_>, message: Message) -> Result<(), TransportError> {
        if let Some(session) = request.session {
            let scheduler = session.scheduler();
            if let Some(scheduler) = scheduler {
                scheduler.cancel();
            }
        }

        let advised = message.advice.is_some();
        let mut message = ServerMessage::incoming(message);
        self.broker.process(request.session, &mut message).await?;
        let Some(mut reply) = message.take_reply() else {
            return Ok(());
        };

        if let Some(session) = request.session {
            let may_suspend = !session.has_messages() || session.is_batching();
            if request.total == 1 && may_suspend && reply.is_successful() {
                let browser_id = session.browser_id();
                if self.browsers.acquire(browser_id.as_deref()) {
                    if advised {
                        self.advise(&mut reply);
                    }
                    let timeout = session.calculate_timeout(self.options.timeout);
                    if timeout > 0 {
                        // armed before waiting, a dropped request still expires the session
                        batch.schedule_expiration(Some(session), &self.options);
                        let suspended = self.suspend(request, session, &message, Duration::from_millis(timeout as u64)).await;
                        if let Err(err) = suspended {
                            if let Some(hook) = batch.expiration.take() {
                                hook.disarm();
                            }
                            return Err(err);
                        }
                    } else {
                        self.browsers.release(browser_id.as_deref());
                    }
                } else {
                    debug!(request = request.id, session = %session.id(), "too many suspended connects for browser");
                    let interval = self.options.multi_session_interval;
                    if interval <= 0 {
                        reply.successful = Some(false);
                    }
                    let advice = reply.advice_mut();
                    advice.multiple_clients = Some(true);
                    if interval > 0 {
                        advice.reconnect = Some(Reconnect::Retry);
                        advice.interval = Some(interval);
                    } else {
                        advice.reconnect = Some(Reconnect::None);
                    }
                }
            }
        }

        self.push_reply(batch, request.session, reply).await?;
        batch.send_queue = true;
        batch.schedule_expiration(request.session, &self.options);
        Ok(())
    }

    async fn suspend(
        &self,
        request: Request<'_>,
        session: &Arc<ServerSession>,
        message: &ServerMessage,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let suspension = LongPollScheduler::arm(session, &self.browsers, timeout);
        for listener in session.listeners() {
            listener.suspended(session, message, timeout);
        }
        // messages offered between processing and arming found no scheduler
        if session.has_messages() && !session.is_batching() {
            session.flush();
        }

        let wakeup = suspension.wait().await;
        debug!(request = request.id, session = %session.id(), ?wakeup, "connect woken");
        if wakeup == Wakeup::Canceled {
            return Err(TransportError::Duplicate(self.options.duplicate_meta_connect_status));
        }
        for listener in session.listeners() {
            listener.resumed(session, message, wakeup == Wakeup::Expired);
        }
        Ok(())
    }

    fn advise(&self, reply: &mut Message) {
        let advice = reply.advice_mut();
        advice.reconnect = Some(Reconnect::Retry);
        advice.timeout = Some(self.options.timeout);
        advice.interval = Some(self.options.interval);
    }

    async fn push_reply(
        &self,
        batch: &mut Batch,
        session: Option<&Arc<ServerSession>>,
        reply: Message,
    ) -> Result<(), TransportError> {
        let Some(reply) = self.broker.extend_reply(session, reply).await? else {
            return Ok(());
        };
        reply.encode().map_err(BrokerError::from)?;
        batch.replies.push(reply);
        Ok(())
    }

    fn respond(&self, request: Request<'_>, batch: Batch) -> Result<Reply, TransportError> {
        let queue = match request.session {
            Some(session) if batch.send_queue => session.drain_queue(&batch.replies),
            _ => Vec::new(),
        };
        debug!(
            request = request.id,
            queued = queue.len(),
            replies = batch.replies.len(),
            "sending response"
        );

        let mut body = BytesMut::new();
        body.put_u8(b'[');
        for (i, message) in queue.iter().chain(batch.replies.iter()).enumerate() {
            if i > 0 {
                body.put_u8(b',');
            }
            body.put_slice(&message.encode().map_err(BrokerError::from)?);
        }
        body.put_u8(b']');

        Ok(Reply { body: body.freeze(), browser_id: batch.browser_id, expiration: batch.expiration })
    }
}

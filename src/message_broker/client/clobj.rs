use std::{borrow::Borrow, fmt::Display, time::Duration};
use rand::{rngs::OsRng, RngCore};
use tokio::time::Instant;
use super::SessionController;

pub const CLIENT_ID_BYTES: usize = 20;

/// session identifier, hex of 20 bytes from the os rng
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientID(String);

impl ClientID {
    pub fn new(raw_clid: String) -> ClientID {
        Self(raw_clid)
    }

    pub fn generate() -> ClientID {
        Self(random_token())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for ClientID {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// high-entropy hex token, shared by session ids and browser ids
pub fn random_token() -> String {
    let mut buffer = [0u8; CLIENT_ID_BYTES];
    OsRng.fill_bytes(&mut buffer);
    hex::encode(buffer)
}

/// expiration bookkeeping of a session.
///
/// no deadline while a `/meta/connect` is held, a deadline of
/// `interval + max_interval` after every response is written.
#[derive(Debug, Default, Clone)]
pub struct Expiration {
    schedule_time: Option<Instant>,
    expire_time: Option<Instant>,
}

impl SessionController for Expiration {
    fn schedule(&mut self, now: Instant, interval: Duration, max_interval: Duration) {
        self.schedule_time = Some(now);
        self.expire_time = Some(now + interval + max_interval);
    }

    fn cancel(&mut self, now: Instant, meta_connect: bool) {
        if meta_connect {
            self.expire_time = None;
            return;
        }
        if let (Some(expire), Some(scheduled)) = (self.expire_time, self.schedule_time) {
            self.expire_time = Some(expire + now.saturating_duration_since(scheduled));
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        match self.expire_time {
            Some(expire) => now > expire,
            None => false
        }
    }

    fn expiration_time(&self) -> Option<Instant> {
        self.expire_time
    }
}

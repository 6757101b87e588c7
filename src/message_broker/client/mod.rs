use std::time::Duration;
use tokio::time::Instant;

pub mod client;
pub mod clients;
pub mod clobj;

pub use client::{Scheduler, ServerSession};
pub use clients::Clients;
pub use clobj::{ClientID, Expiration};

/// time base session control for sweeping
///
/// a session carries a deadline only between two requests: writing a
/// response schedules it, an incoming `/meta/connect` clears it, any other
/// message pushes it back by the time spent since it was scheduled.
pub trait SessionController {
    fn schedule(&mut self, now: Instant, interval: Duration, max_interval: Duration);
    fn cancel(&mut self, now: Instant, meta_connect: bool);
    fn is_expired(&self, now: Instant) -> bool;
    fn expiration_time(&self) -> Option<Instant>;
}

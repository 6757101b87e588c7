use std::fmt::Display;

pub mod browser;
pub mod errors;
pub mod handler;
pub mod long_polling;
pub mod scheduler;

pub use errors::TransportError;
pub use handler::Proxy;
pub use long_polling::LongPollingTransport;

/// per tcp connection counter, for log correlation
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct ConnectionID(u32);

impl Display for ConnectionID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod channel;
pub mod cleanup;
pub mod client;
pub mod extension;
pub mod listener;
pub mod mediator;
pub mod messenger;
mod meta;
pub mod policy;
mod router;

pub use channel::ServerChannel;
pub use cleanup::Cleanup;
pub use client::{ClientID, Scheduler, ServerSession};
pub use extension::{Extension, OutgoingMessage, SessionExtension};
pub use listener::{BrokerListener, ChannelListener, MessageListener, SessionListener};
pub use mediator::BrokerMediator;
pub use meta::LONG_POLLING;
pub use policy::{AllowAll, SecurityPolicy};

pub mod channel_id;
pub mod error_code;
pub mod message;

pub use channel_id::{ChannelId, ChannelKind};
pub use error_code::ErrorCode;
pub use message::{Advice, Message, Reconnect, ServerMessage, Subscription};

pub const BAYEUX_VERSION: &str = "1.0";

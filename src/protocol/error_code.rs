// Protocol errors travel in the reply `error` field as `<status>::<reason>`:

// ·         400           channel_missing
// ·         402           session_unknown
// ·         403           handshake_denied, channel_denied, subscribe_denied,
//                         subscribe_failed, unsubscribe_failed,
//                         subscription_missing, publish_denied
// ·         404           message_deleted

use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ChannelMissing,
    SessionUnknown,
    HandshakeDenied,
    ChannelDenied,
    SubscribeDenied,
    SubscribeFailed,
    UnsubscribeFailed,
    SubscriptionMissing,
    PublishDenied,
    MessageDeleted,
}

impl ErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::ChannelMissing => 400,
            ErrorCode::SessionUnknown => 402,
            ErrorCode::HandshakeDenied
            | ErrorCode::ChannelDenied
            | ErrorCode::SubscribeDenied
            | ErrorCode::SubscribeFailed
            | ErrorCode::UnsubscribeFailed
            | ErrorCode::SubscriptionMissing
            | ErrorCode::PublishDenied => 403,
            ErrorCode::MessageDeleted => 404,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ErrorCode::ChannelMissing => "channel_missing",
            ErrorCode::SessionUnknown => "session_unknown",
            ErrorCode::HandshakeDenied => "handshake_denied",
            ErrorCode::ChannelDenied => "channel_denied",
            ErrorCode::SubscribeDenied => "subscribe_denied",
            ErrorCode::SubscribeFailed => "subscribe_failed",
            ErrorCode::UnsubscribeFailed => "unsubscribe_failed",
            ErrorCode::SubscriptionMissing => "subscription_missing",
            ErrorCode::PublishDenied => "publish_denied",
            ErrorCode::MessageDeleted => "message_deleted",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.code(), self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;

    #[test]
    fn wire_format() {
        let test_table = [
            (ErrorCode::SessionUnknown, "402::session_unknown"),
            (ErrorCode::HandshakeDenied, "403::handshake_denied"),
            (ErrorCode::SubscriptionMissing, "403::subscription_missing"),
            (ErrorCode::MessageDeleted, "404::message_deleted"),
            (ErrorCode::ChannelMissing, "400::channel_missing"),
        ];
        for (code, expected) in test_table {
            assert_eq!(code.to_string(), expected);
        }
    }
}

use std::fmt::Display;
use crate::error::BrokerError;

pub const META_HANDSHAKE: &str = "/meta/handshake";
pub const META_CONNECT: &str = "/meta/connect";
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";
pub const META_DISCONNECT: &str = "/meta/disconnect";

pub const META_CHANNELS: [&str; 5] = [
    META_HANDSHAKE,
    META_CONNECT,
    META_SUBSCRIBE,
    META_UNSUBSCRIBE,
    META_DISCONNECT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Meta,
    Service,
    Broadcast,
}

/// validated channel name with its wildcard ancestors.
///
/// `/a/b/c` matches `/a/b/*`, `/a/b/**`, `/a/**` and `/**`, in that order.
/// names ending in `*` or `**` have no ancestors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelId {
    name: String,
    kind: ChannelKind,
    wild_names: Vec<String>,
}

impl ChannelId {
    pub fn parse(name: &str) -> Result<Self, BrokerError> {
        if name.is_empty() || !name.starts_with('/') || name == "/" {
            return Err(BrokerError::InvalidChannel(name.to_string()));
        }

        let kind = if name.starts_with("/meta/") {
            ChannelKind::Meta
        } else if name.starts_with("/service/") {
            ChannelKind::Service
        } else {
            ChannelKind::Broadcast
        };

        Ok(Self {
            name: name.to_string(),
            kind,
            wild_names: wild_names(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_meta(&self) -> bool {
        self.kind == ChannelKind::Meta
    }

    pub fn is_service(&self) -> bool {
        self.kind == ChannelKind::Service
    }

    pub fn is_broadcast(&self) -> bool {
        self.kind == ChannelKind::Broadcast
    }

    pub fn wild_names(&self) -> &[String] {
        &self.wild_names
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

fn wild_names(name: &str) -> Vec<String> {
    let segments: Vec<&str> = name[1..].split('/').collect();
    match segments.last() {
        Some(&"*") | Some(&"**") => return Vec::new(),
        _ => ()
    }

    // every proper prefix gets a `**`, the parent also gets a `*`
    let parents = segments.len() - 1;
    let mut prefix = String::from("/");
    let mut deep = Vec::with_capacity(parents + 1);
    deep.push(format!("{}**", prefix));
    for segment in &segments[..parents] {
        prefix.push_str(segment);
        prefix.push('/');
        deep.push(format!("{}**", prefix));
    }

    let mut wild = Vec::with_capacity(deep.len() + 1);
    wild.push(format!("{}*", prefix));
    wild.extend(deep.into_iter().rev());
    wild
}

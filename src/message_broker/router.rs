use std::sync::{Arc, Weak};
use dashmap::{mapref::entry::Entry, DashMap};
use crate::{error::BrokerError, protocol::ChannelId};
use super::{channel::ServerChannel, mediator::BrokerMediator};

/// channel name to channel table
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<ServerChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerChannel>> {
        self.channels.get(name).map(|c| c.value().clone())
    }

    /// returns the channel and whether this call created it
    pub fn create(&self, name: &str, broker: &Weak<BrokerMediator>) -> Result<(Arc<ServerChannel>, bool), BrokerError> {
        if let Some(channel) = self.get(name) {
            return Ok((channel, false));
        }

        let id = ChannelId::parse(name)?;
        let created = match self.channels.entry(name.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let channel = Arc::new(ServerChannel::new(id, broker.clone()));
                entry.insert(channel.clone());
                (channel, true)
            }
        };
        Ok(created)
    }

    /// removes `channel` only if it is still the registered instance
    pub fn remove(&self, channel: &Arc<ServerChannel>) -> bool {
        self.channels
            .remove_if(channel.name(), |_, c| Arc::ptr_eq(c, channel))
            .is_some()
    }

    /// channels matching `channel`: existing wildcard ancestors first, then itself
    pub fn route(&self, channel: &Arc<ServerChannel>) -> Vec<Arc<ServerChannel>> {
        let mut route: Vec<_> = channel.wild_names()
            .iter()
            .filter_map(|name| self.get(name))
            .collect();
        route.push(channel.clone());
        route
    }

    pub fn snapshot(&self) -> Vec<Arc<ServerChannel>> {
        self.channels.iter().map(|c| c.value().clone()).collect()
    }
}

use std::sync::Arc;
use dashmap::DashMap;
use super::{client::ServerSession, clobj::ClientID};

/// handshaken sessions by id
pub struct Clients {
    list: DashMap<ClientID, Arc<ServerSession>>,
}

impl Clients {
    pub fn new() -> Self {
        Self { list: DashMap::new() }
    }

    pub fn insert(&self, session: Arc<ServerSession>) {
        self.list.insert(session.id().clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServerSession>> {
        self.list.get(id).map(|s| s.value().clone())
    }

    /// removes `session` only if it is the registered instance
    pub fn remove(&self, session: &Arc<ServerSession>) -> Option<Arc<ServerSession>> {
        self.list
            .remove_if(session.id(), |_, s| Arc::ptr_eq(s, session))
            .map(|(_, s)| s)
    }

    pub fn snapshot(&self) -> Vec<Arc<ServerSession>> {
        self.list.iter().map(|s| s.value().clone()).collect()
    }
}

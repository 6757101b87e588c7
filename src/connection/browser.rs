use std::sync::{Arc, Weak};
use dashmap::DashMap;
use tracing::debug;
use crate::message_broker::{ServerSession, SessionListener};

#[derive(Default)]
struct Browser {
    sessions: Vec<Arc<ServerSession>>,
    suspended: i64,
}

/// sessions and suspended connects per browser cookie
pub struct BrowserTable {
    browsers: DashMap<String, Browser>,
    max_sessions: i64,
}

impl BrowserTable {
    /// `max_sessions` caps suspended connects per browser, 0 never
    /// suspends and a negative value disables the cap
    pub fn new(max_sessions: i64) -> Self {
        Self { browsers: DashMap::new(), max_sessions }
    }

    /// ties `session` to the browser until the session is removed
    pub fn bind(self: &Arc<Self>, browser_id: &str, session: &Arc<ServerSession>) {
        session.bind_browser(browser_id.to_string());
        self.browsers
            .entry(browser_id.to_string())
            .or_default()
            .sessions
            .push(session.clone());
        session.add_listener(Arc::new(BrowserBinding {
            table: Arc::downgrade(self),
            browser_id: browser_id.to_string(),
        }));
        debug!(browser = browser_id, session = %session.id(), "bound to browser");
    }

    fn unbind(&self, browser_id: &str, session: &Arc<ServerSession>) {
        let empty = match self.browsers.get_mut(browser_id) {
            Some(mut browser) => {
                browser.sessions.retain(|s| !Arc::ptr_eq(s, session));
                browser.sessions.is_empty()
            },
            None => return,
        };
        if empty {
            self.browsers.remove_if(browser_id, |_, b| b.sessions.is_empty());
        }
    }

    pub fn find(&self, browser_id: &str, client_id: &str) -> Option<Arc<ServerSession>> {
        let browser = self.browsers.get(browser_id)?;
        browser.sessions
            .iter()
            .find(|s| s.id().as_str() == client_id)
            .cloned()
    }

    pub fn sessions(&self, browser_id: &str) -> Vec<Arc<ServerSession>> {
        match self.browsers.get(browser_id) {
            Some(browser) => browser.sessions.clone(),
            None => Vec::new()
        }
    }

    /// takes a suspension slot for the browser, `false` when the cap is hit
    pub fn acquire(&self, browser_id: Option<&str>) -> bool {
        if self.max_sessions < 0 {
            return true;
        }
        if self.max_sessions == 0 {
            return false;
        }
        let Some(browser_id) = browser_id else {
            return true;
        };
        let Some(mut browser) = self.browsers.get_mut(browser_id) else {
            return true;
        };
        if browser.suspended >= self.max_sessions {
            return false;
        }
        browser.suspended += 1;
        true
    }

    pub fn release(&self, browser_id: Option<&str>) {
        if self.max_sessions <= 0 {
            return;
        }
        let Some(browser_id) = browser_id else {
            return;
        };
        if let Some(mut browser) = self.browsers.get_mut(browser_id) {
            if browser.suspended > 0 {
                browser.suspended -= 1;
            }
        }
    }

    pub fn suspended(&self, browser_id: &str) -> i64 {
        self.browsers.get(browser_id).map_or(0, |b| b.suspended)
    }

    pub fn len(&self) -> usize {
        self.browsers.len()
    }
}

struct BrowserBinding {
    table: Weak<BrowserTable>,
    browser_id: String,
}

impl SessionListener for BrowserBinding {
    fn removed(&self, session: &Arc<ServerSession>, _timeout: bool) {
        if let Some(table) = self.table.upgrade() {
            table.unbind(&self.browser_id, session);
        }
    }
}

use std::{sync::{atomic::{AtomicU64, Ordering}, Arc, Weak}, time::Duration};
use parking_lot::Mutex;
use tokio::{select, sync::oneshot, time::{self, Instant}};
use tracing::debug;
use crate::message_broker::{Scheduler, ServerSession};
use super::browser::BrowserTable;

static SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// how a suspended `/meta/connect` came back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Resumed,
    Expired,
    Canceled,
}

/// the armed timer of one suspended `/meta/connect`.
///
/// the first transition wins; it detaches from the session, gives the
/// browser slot back and wakes the waiting request. later ones are no-ops.
pub struct LongPollScheduler {
    id: u64,
    session: Weak<ServerSession>,
    browser_id: Option<String>,
    browsers: Arc<BrowserTable>,
    armed: Mutex<Option<oneshot::Sender<Wakeup>>>,
}

impl LongPollScheduler {
    /// installs a scheduler on `session`; the browser slot must already be held
    pub fn arm(session: &Arc<ServerSession>, browsers: &Arc<BrowserTable>, timeout: Duration) -> Suspension {
        let (tx, rx) = oneshot::channel();
        let scheduler = Arc::new(Self {
            id: SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            session: Arc::downgrade(session),
            browser_id: session.browser_id(),
            browsers: browsers.clone(),
            armed: Mutex::new(Some(tx)),
        });
        session.install_scheduler(scheduler.clone());
        debug!(session = %session.id(), ?timeout, "suspended");

        Suspension { scheduler, rx, deadline: Instant::now() + timeout }
    }

    fn transition(&self, wakeup: Wakeup) {
        let armed = self.armed.lock().take();
        let Some(tx) = armed else {
            return;
        };
        if let Some(session) = self.session.upgrade() {
            session.detach_scheduler(self.id);
        }
        self.browsers.release(self.browser_id.as_deref());
        let _ = tx.send(wakeup);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }
}

impl Scheduler for LongPollScheduler {
    fn id(&self) -> u64 {
        self.id
    }

    fn resume(&self) {
        self.transition(Wakeup::Resumed);
    }

    fn cancel(&self) {
        self.transition(Wakeup::Canceled);
    }
}

/// the waiting side; dropping it cancels the scheduler
pub struct Suspension {
    scheduler: Arc<LongPollScheduler>,
    rx: oneshot::Receiver<Wakeup>,
    deadline: Instant,
}

impl Suspension {
    pub fn scheduler(&self) -> &Arc<LongPollScheduler> {
        &self.scheduler
    }

    pub async fn wait(mut self) -> Wakeup {
        let rx = &mut self.rx;
        let woken = select! {
            wakeup = &mut *rx => Some(wakeup.unwrap_or(Wakeup::Canceled)),
            _ = time::sleep_until(self.deadline) => None,
        };
        if let Some(wakeup) = woken {
            return wakeup;
        }

        // a resume may have raced the timer, whoever transitioned first wins
        self.scheduler.transition(Wakeup::Expired);
        (&mut self.rx).await.unwrap_or(Wakeup::Canceled)
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        self.scheduler.transition(Wakeup::Canceled);
    }
}

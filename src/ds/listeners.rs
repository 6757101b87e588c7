use std::{fmt::Display, sync::{atomic::{AtomicU64, Ordering}, Arc}};
use parking_lot::Mutex;

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

/// handle returned on registration, used to remove the listener later
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ListenerId(u64);

impl Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ordered observer list.
///
/// notification always works on a snapshot so listeners are free to
/// add or remove listeners while being notified.
pub struct Listeners<L: ?Sized> {
    list: Mutex<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self { list: Mutex::new(Vec::new()) }
    }
}

impl<L: ?Sized> Listeners<L> {
    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed));
        self.list.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut list = self.list.lock();
        match list.iter().position(|(lid, _)| *lid == id) {
            Some(i) => {
                list.remove(i);
                true
            },
            None => false
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.list.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }
}

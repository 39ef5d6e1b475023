//! Synchronous listener fan-out.
//!
//! Listeners are called on the thread that triggers the notification, in
//! registration order. The internal lock is released before any listener
//! runs, so a listener may subscribe or unsubscribe without deadlocking.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Callback type stored by a [`ListenerSet`].
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered set of listeners for values of type `T`.
pub struct ListenerSet<T> {
    entries: Mutex<Vec<(ListenerId, Listener<T>)>>,
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T> std::fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> ListenerSet<T> {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns its id and the listener count afterwards.
    pub fn add(&self, listener: Listener<T>) -> (ListenerId, usize) {
        let id = ListenerId::next();
        let mut entries = self.entries.lock();
        entries.push((id, listener));
        (id, entries.len())
    }

    /// Remove a listener. Returns the remaining count, or `None` if the id
    /// was not registered.
    pub fn remove(&self, id: ListenerId) -> Option<usize> {
        let mut entries = self.entries.lock();
        let position = entries.iter().position(|(entry_id, _)| *entry_id == id)?;
        entries.remove(position);
        Some(entries.len())
    }

    /// Drop every listener, returning how many were registered.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Call every listener with `value`.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifies_in_registration_order() {
        let set = ListenerSet::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            set.add(Arc::new(move |v: &u32| seen.lock().push(format!("{tag}{v}"))));
        }
        set.notify(&7);
        assert_eq!(*seen.lock(), vec!["a7", "b7", "c7"]);
    }

    #[test]
    fn remove_reports_remaining_count() {
        let set = ListenerSet::<()>::new();
        let (first, _) = set.add(Arc::new(|_| {}));
        let (second, count) = set.add(Arc::new(|_| {}));
        assert_eq!(count, 2);
        assert_eq!(set.remove(first), Some(1));
        assert_eq!(set.remove(first), None);
        assert_eq!(set.remove(second), Some(0));
        assert!(set.is_empty());
    }

    #[test]
    fn listener_may_unsubscribe_itself() {
        let set = Arc::new(ListenerSet::<()>::new());
        let id_slot = Arc::new(Mutex::new(None));
        let set_clone = set.clone();
        let slot = id_slot.clone();
        let (id, _) = set.add(Arc::new(move |_| {
            if let Some(id) = *slot.lock() {
                set_clone.remove(id);
            }
        }));
        *id_slot.lock() = Some(id);
        set.notify(&());
        assert_eq!(set.len(), 0);
    }
}

//! Ordered, panic-isolated fan-out to subscribers.
//!
//! Handlers run in registration order. Dispatch works on a snapshot of the
//! list taken before the first call, so a handler may subscribe or unsubscribe
//! (itself or others) without disturbing the delivery in progress: newly added
//! handlers start with the next event, removed ones are skipped from the
//! moment they are removed, and nobody is called twice.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    active: Arc<AtomicBool>,
    handler: Handler<T>,
}

struct ObserverList<T> {
    next_id: u64,
    entries: Vec<Entry<T>>,
}

/// A list of handlers for events of type `T`.
pub struct Observers<T> {
    name: &'static str,
    list: Arc<Mutex<ObserverList<T>>>,
}

impl<T: 'static> Observers<T> {
    /// `name` only shows up in logs when a handler panics.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            list: Arc::new(Mutex::new(ObserverList {
                next_id: 1,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a handler. It stays registered until
    /// [`Subscription::unsubscribe`] or [`Observers::clear`].
    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        let id = {
            let mut list = self.list.lock();
            let id = list.next_id;
            list.next_id += 1;
            list.entries.push(Entry {
                id,
                active: Arc::clone(&active),
                handler: Arc::new(handler),
            });
            id
        };

        let weak: Weak<Mutex<ObserverList<T>>> = Arc::downgrade(&self.list);
        Subscription {
            active,
            remove: Some(Box::new(move || {
                if let Some(list) = weak.upgrade() {
                    list.lock().entries.retain(|e| e.id != id);
                }
            })),
        }
    }

    /// Deliver `value` to every handler. Returns how many handlers ran.
    pub fn emit(&self, value: &T) -> usize {
        let snapshot: Vec<(Arc<AtomicBool>, Handler<T>)> = self
            .list
            .lock()
            .entries
            .iter()
            .map(|e| (Arc::clone(&e.active), Arc::clone(&e.handler)))
            .collect();

        let mut delivered = 0;
        for (active, handler) in snapshot {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            delivered += 1;
            if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
                warn!(observer = self.name, "Event handler panicked, continuing");
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.list.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every handler; outstanding subscriptions become inert.
    pub fn clear(&self) {
        let mut list = self.list.lock();
        for entry in &list.entries {
            entry.active.store(false, Ordering::Release);
        }
        list.entries.clear();
    }
}

/// Handle returned by [`Observers::subscribe`].
///
/// Dropping the handle does not unsubscribe.
pub struct Subscription {
    active: Arc<AtomicBool>,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handlers_run_in_registration_order() {
        let observers: Observers<u32> = Observers::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            let _ = observers.subscribe(move |v| seen.lock().push(format!("{tag}{v}")));
        }
        assert_eq!(observers.emit(&1), 3);
        assert_eq!(*seen.lock(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let observers: Observers<()> = Observers::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let _ = observers.subscribe(|()| panic!("boom"));
        let c = Arc::clone(&count);
        let _ = observers.subscribe(move |()| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        observers.emit(&());
        observers.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_during_dispatch_skips_nobody_else() {
        let observers: Arc<Observers<()>> = Arc::new(Observers::new("test"));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let c = Arc::clone(&calls);
        let s = Arc::clone(&slot);
        let first = observers.subscribe(move |()| {
            c.lock().push("first");
            if let Some(sub) = s.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(first);

        let c = Arc::clone(&calls);
        let _ = observers.subscribe(move |()| c.lock().push("second"));
        let c = Arc::clone(&calls);
        let _ = observers.subscribe(move |()| c.lock().push("third"));

        observers.emit(&());
        observers.emit(&());
        assert_eq!(
            *calls.lock(),
            vec!["first", "second", "third", "second", "third"]
        );
        assert_eq!(observers.len(), 2);
    }

    #[test]
    fn test_handler_removed_by_earlier_handler_is_not_called() {
        let observers: Observers<()> = Observers::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let victim_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&victim_slot);
        let _ = observers.subscribe(move |()| {
            if let Some(sub) = slot.lock().take() {
                sub.unsubscribe();
            }
        });
        let c = Arc::clone(&calls);
        let victim = observers.subscribe(move |()| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        *victim_slot.lock() = Some(victim);

        assert_eq!(observers.emit(&()), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_keeps_subscription() {
        let observers: Observers<()> = Observers::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        drop(observers.subscribe(move |()| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        observers.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_deactivates_handles() {
        let observers: Observers<()> = Observers::new("test");
        let sub = observers.subscribe(|()| {});
        observers.clear();
        assert!(!sub.is_active());
        assert!(observers.is_empty());
        sub.unsubscribe();
    }
}

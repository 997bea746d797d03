//! Observable single-value containers.
//!
//! `Cell<T>` is the foundational primitive of the client core: widgets own
//! cells, mutate them on interaction, and everything downstream (re-render
//! scheduling, the busy flag, the spinner debounce, the batched upload
//! flush) is driven by synchronous subscriber fan-out. Notification always
//! fires, even when the new value equals the old one; consumers are
//! expected to stay idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub mod bond;

pub use bond::{Bond, Mount};

type Callback<T> = Box<dyn FnMut(&T) + Send>;

struct Entry<T> {
    id: u64,
    // Taken out of the slot while its callback runs, so a reentrant `set`
    // on the same cell skips the subscriber that is currently executing.
    callback: Option<Callback<T>>,
}

struct Inner<T> {
    value: T,
    subscribers: Vec<Entry<T>>,
    next_id: u64,
}

pub struct Cell<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Cell {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Cell<T> {
    pub fn new(initial: T) -> Self {
        Cell {
            inner: Arc::new(Mutex::new(Inner {
                value: initial,
                subscribers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Side-effect-free read of the current value.
    pub fn get(&self) -> T {
        self.inner.lock().unwrap().value.clone()
    }

    /// Replace the value and synchronously notify every subscriber that was
    /// live at write time, in subscription order. Subscribers added during
    /// the pass wait for the next `set`; subscriptions disposed mid-pass
    /// are skipped. The lock is never held while a callback runs, so
    /// callbacks may freely read, write, subscribe, or dispose.
    pub fn set(&self, value: T) {
        let snapshot: Vec<u64> = {
            let mut inner = self.inner.lock().unwrap();
            inner.value = value.clone();
            inner.subscribers.iter().map(|entry| entry.id).collect()
        };

        for id in snapshot {
            let taken = {
                let mut inner = self.inner.lock().unwrap();
                inner
                    .subscribers
                    .iter_mut()
                    .find(|entry| entry.id == id)
                    .and_then(|entry| entry.callback.take())
            };
            let Some(mut callback) = taken else { continue };
            callback(&value);
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.subscribers.iter_mut().find(|entry| entry.id == id) {
                entry.callback = Some(callback);
            }
        }
    }

    /// Register a subscriber. The returned token detaches it on `dispose`;
    /// dropping the token without disposing leaves the subscriber attached
    /// for the lifetime of the cell.
    pub fn subscribe(&self, callback: impl FnMut(&T) + Send + 'static) -> Subscription {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.push(Entry {
                id,
                callback: Some(Box::new(callback)),
            });
            id
        };

        let weak = Arc::downgrade(&self.inner);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .lock()
                        .unwrap()
                        .subscribers
                        .retain(|entry| entry.id != id);
                }
            })),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

/// Watch a cell. Identical to `subscribe`; reads better at call sites that
/// react to a cell they do not own.
pub fn on<T, F>(cell: &Cell<T>, callback: F) -> Subscription
where
    T: Clone + Send + 'static,
    F: FnMut(&T) + Send + 'static,
{
    cell.subscribe(callback)
}

/// Disposer token for one subscription.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn dispose(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// Shared dirty flag used by `Mount` to collapse same-turn writes into a
/// single re-render.
#[derive(Clone, Default)]
pub(crate) struct DirtyFlag(Arc<AtomicBool>);

impl DirtyFlag {
    pub(crate) fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifies_in_subscription_order_exactly_once() {
        let cell = Cell::new(0u32);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        let _a = cell.subscribe(move |v| first.lock().unwrap().push(("a", *v)));
        let second = seen.clone();
        let _b = cell.subscribe(move |v| second.lock().unwrap().push(("b", *v)));

        cell.set(7);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn notifies_on_equal_writes() {
        let cell = Cell::new(1u32);
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        let _sub = cell.subscribe(move |_| *counter.lock().unwrap() += 1);

        cell.set(1);
        cell.set(1);
        assert_eq!(*hits.lock().unwrap(), 2);
    }

    #[test]
    fn subscriber_added_during_pass_waits_for_next_write() {
        let cell = Cell::new(0u32);
        let late_hits = Arc::new(Mutex::new(Vec::new()));

        let registrar = cell.clone();
        let late = late_hits.clone();
        let _a = cell.subscribe(move |_| {
            let late = late.clone();
            // Dropping the token keeps the subscriber attached.
            drop(registrar.subscribe(move |v| late.lock().unwrap().push(*v)));
        });

        cell.set(1);
        assert!(late_hits.lock().unwrap().is_empty());
        cell.set(2);
        // One late subscriber was added by each of the two writes; the
        // first of them sees the second write.
        assert_eq!(late_hits.lock().unwrap().first(), Some(&2));
    }

    #[test]
    fn disposal_mid_pass_suppresses_undelivered_calls() {
        let cell = Cell::new(0u32);
        let b_hits = Arc::new(Mutex::new(0));

        let pending: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let to_kill = pending.clone();
        let _a = cell.subscribe(move |_| {
            if let Some(sub) = to_kill.lock().unwrap().take() {
                sub.dispose();
            }
        });
        let counter = b_hits.clone();
        let b = cell.subscribe(move |_| *counter.lock().unwrap() += 1);
        *pending.lock().unwrap() = Some(b);

        cell.set(1);
        assert_eq!(*b_hits.lock().unwrap(), 0);
        cell.set(2);
        assert_eq!(*b_hits.lock().unwrap(), 0);
    }

    #[test]
    fn dispose_detaches_and_is_single_shot() {
        let cell = Cell::new(0u32);
        let sub = cell.subscribe(|_| {});
        assert_eq!(cell.subscriber_count(), 1);
        sub.dispose();
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn reentrant_write_skips_the_running_subscriber() {
        let cell = Cell::new(0u32);
        let observed = Arc::new(Mutex::new(Vec::new()));

        let inner_cell = cell.clone();
        let _a = cell.subscribe(move |v| {
            if *v == 1 {
                inner_cell.set(2);
            }
        });
        let log = observed.clone();
        let _b = cell.subscribe(move |v| log.lock().unwrap().push(*v));

        cell.set(1);
        // b saw the nested write first, then the original pass resumed
        // with its own (by then stale) value. Last write wins.
        assert_eq!(*observed.lock().unwrap(), vec![2, 1]);
        assert_eq!(cell.get(), 2);
    }
}

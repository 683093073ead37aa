//! Listener registries and unsubscribe handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

/// Handle returned by every `subscribe` method.
///
/// Dropping it unsubscribes; [`Subscription::unsubscribe`] does the same
/// explicitly. Call [`Subscription::detach`] to keep the listener registered
/// for the lifetime of its registry.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }

    /// Forget the handle without unsubscribing.
    pub fn detach(mut self) {
        self.unsubscribe = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

struct Entry<F: ?Sized> {
    seq: u64,
    listener: Arc<F>,
}

/// Registry of listeners of type `F` (usually `dyn Fn(..) + Send + Sync`).
///
/// Snapshots are returned in subscription order.
pub(crate) struct Listeners<F: ?Sized> {
    slots: Mutex<Slab<Entry<F>>>,
    seq: AtomicU64,
}

impl<F: ?Sized> Default for Listeners<F> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Slab::new()),
            seq: AtomicU64::new(0),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> Listeners<F> {
    /// Register a listener and return its slot.
    pub fn insert(&self, listener: Arc<F>) -> usize {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().insert(Entry { seq, listener })
    }

    /// Register a listener and report whether it is the only one.
    pub fn insert_first(&self, listener: Arc<F>) -> (usize, bool) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.lock();
        let first = slots.is_empty();
        (slots.insert(Entry { seq, listener }), first)
    }

    /// Remove the listener in `slot`. Returns `false` if it was already gone.
    pub fn remove(&self, slot: usize) -> bool {
        self.slots.lock().try_remove(slot).is_some()
    }

    /// Remove the listener in `slot` and report whether it was the last one.
    pub fn remove_last(&self, slot: usize) -> bool {
        let mut slots = self.slots.lock();
        slots.try_remove(slot).is_some() && slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current listeners, oldest first. Call them after the lock is released.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        let slots = self.slots.lock();
        let mut entries: Vec<(u64, Arc<F>)> = slots
            .iter()
            .map(|(_, entry)| (entry.seq, entry.listener.clone()))
            .collect();
        drop(slots);
        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, listener)| listener).collect()
    }
}

/// Register `listener` on a shared registry and return a handle removing it.
pub(crate) fn subscribe_to<F: ?Sized + Send + Sync + 'static>(
    registry: &Arc<Listeners<F>>,
    listener: Arc<F>,
) -> Subscription {
    let slot = registry.insert(listener);
    let registry = Arc::downgrade(registry);
    Subscription::new(move || {
        if let Some(registry) = registry.upgrade() {
            registry.remove(slot);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    type Listener = dyn Fn() -> u32 + Send + Sync;

    #[test]
    fn snapshot_preserves_subscription_order() {
        let registry: Arc<Listeners<Listener>> = Arc::default();
        let first = subscribe_to(&registry, Arc::new(|| 1u32) as Arc<Listener>);
        let _second = subscribe_to(&registry, Arc::new(|| 2u32) as Arc<Listener>);
        first.unsubscribe();
        // The freed slot is reused, but ordering follows subscription time.
        let _third = subscribe_to(&registry, Arc::new(|| 3u32) as Arc<Listener>);

        let values: Vec<u32> = registry.snapshot().iter().map(|l| l()).collect();
        assert_eq!(values, vec![2, 3]);
    }

    #[test]
    fn first_and_last_are_reported_atomically() {
        let registry: Listeners<Listener> = Listeners::default();
        let (a, first) = registry.insert_first(Arc::new(|| 1u32) as Arc<Listener>);
        assert!(first);
        let (b, first) = registry.insert_first(Arc::new(|| 2u32) as Arc<Listener>);
        assert!(!first);

        assert!(!registry.remove_last(a));
        assert!(!registry.remove_last(a), "already removed");
        assert!(registry.remove_last(b));
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let registry: Arc<Listeners<Listener>> = Arc::default();
        {
            let _sub = subscribe_to(&registry, Arc::new(|| 1u32) as Arc<Listener>);
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());

        subscribe_to(&registry, Arc::new(|| 1u32) as Arc<Listener>).detach();
        assert_eq!(registry.len(), 1);
    }
}

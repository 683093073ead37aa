//! Batching of notification callbacks.
//!
//! A single fetch settlement can update one query observed by many observers,
//! each of which fires option callbacks and listener callbacks. Running those
//! inside [`NotifyManager::batch`] defers them until the outermost batch ends
//! and then flushes them in FIFO order, so a consumer sees one coherent
//! notification per logical change.
//!
//! Batches are tracked per thread: a batch open on one thread never delays
//! callbacks scheduled on another.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};

/// A deferred notification.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Hook that runs a single callback, or a whole flushed batch.
///
/// Bindings use these to route notifications through their own scheduling
/// (for example a UI framework's batched-update primitive).
pub type NotifyFn = Arc<dyn Fn(Callback) + Send + Sync>;

#[derive(Default)]
struct BatchState {
    depth: usize,
    queue: VecDeque<(Option<u64>, Callback)>,
}

/// Batches callbacks scheduled while a batch is open.
///
/// One manager is shared by a [`QueryCache`](crate::QueryCache) and everything
/// built on it. Batches nest; only the outermost one on a thread flushes.
pub struct NotifyManager {
    batches: Mutex<HashMap<ThreadId, BatchState, ahash::RandomState>>,
    notify_fn: RwLock<NotifyFn>,
    batch_notify_fn: RwLock<NotifyFn>,
}

impl Default for NotifyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotifyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let batches = self.batches.lock();
        f.debug_struct("NotifyManager")
            .field("open_batches", &batches.len())
            .field("queued", &batches.values().map(|b| b.queue.len()).sum::<usize>())
            .finish()
    }
}

fn call(callback: Callback) {
    callback()
}

/// Decrements the batch depth even if the batched closure panics.
struct DepthGuard<'a>(&'a NotifyManager);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        let mut batches = self.0.batches.lock();
        if let Some(state) = batches.get_mut(&thread::current().id()) {
            state.depth = state.depth.saturating_sub(1);
        }
    }
}

impl NotifyManager {
    /// A manager that runs callbacks directly.
    pub fn new() -> Self {
        Self {
            batches: Mutex::default(),
            notify_fn: RwLock::new(Arc::new(call)),
            batch_notify_fn: RwLock::new(Arc::new(call)),
        }
    }

    /// Run `f`, deferring every callback scheduled during it until the
    /// outermost batch returns.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let thread = thread::current().id();
        self.batches.lock().entry(thread).or_default().depth += 1;
        let result = {
            let _guard = DepthGuard(self);
            f()
        };
        let queue = {
            let mut batches = self.batches.lock();
            match batches.get(&thread) {
                Some(state) if state.depth == 0 => batches.remove(&thread).map(|state| state.queue),
                _ => None,
            }
        };
        if let Some(queue) = queue {
            self.flush(queue);
        }
        result
    }

    /// Schedule `callback`: queued inside a batch, run immediately otherwise.
    pub fn schedule(&self, callback: impl FnOnce() + Send + 'static) {
        self.enqueue(None, Box::new(callback));
    }

    /// Schedule `callback` under `key`.
    ///
    /// If a callback with the same key is already queued in the current
    /// batch, it is replaced in place: the batch runs it once, at the position
    /// of the first scheduling, with the latest closure.
    pub fn schedule_keyed(&self, key: u64, callback: impl FnOnce() + Send + 'static) {
        self.enqueue(Some(key), Box::new(callback));
    }

    fn enqueue(&self, key: Option<u64>, callback: Callback) {
        {
            let mut batches = self.batches.lock();
            if let Some(state) = batches
                .get_mut(&thread::current().id())
                .filter(|state| state.depth > 0)
            {
                let existing = key.and_then(|key| {
                    state
                        .queue
                        .iter_mut()
                        .find(|(queued, _)| *queued == Some(key))
                });
                match existing {
                    Some(slot) => slot.1 = callback,
                    None => state.queue.push_back((key, callback)),
                }
                return;
            }
        }
        let notify = self.notify_fn.read().clone();
        notify(callback);
    }

    /// Wrap `f` so every invocation runs inside a batch.
    pub fn batch_calls<A, F>(self: &Arc<Self>, f: F) -> impl Fn(A) + Send + Sync + 'static
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        let manager = Arc::clone(self);
        move |arg| manager.batch(|| f(arg))
    }

    /// Replace the function used to run each individual callback.
    pub fn set_notify_fn(&self, f: impl Fn(Callback) + Send + Sync + 'static) {
        *self.notify_fn.write() = Arc::new(f);
    }

    /// Replace the function used to run a whole flushed batch.
    pub fn set_batch_notify_fn(&self, f: impl Fn(Callback) + Send + Sync + 'static) {
        *self.batch_notify_fn.write() = Arc::new(f);
    }

    fn flush(&self, queue: VecDeque<(Option<u64>, Callback)>) {
        if queue.is_empty() {
            return;
        }
        let notify = self.notify_fn.read().clone();
        let batch_notify = self.batch_notify_fn.read().clone();
        batch_notify(Box::new(move || {
            for (_, callback) in queue {
                notify(callback);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let push_log = log.clone();
        let push = move |name: &'static str| -> Callback {
            let log = push_log.clone();
            Box::new(move || log.lock().push(name))
        };
        (log, push)
    }

    #[test]
    fn schedule_outside_batch_runs_immediately() {
        let manager = NotifyManager::new();
        let (log, push) = recorder();
        manager.schedule(push("now"));
        assert_eq!(*log.lock(), vec!["now"]);
    }

    #[test]
    fn batch_defers_until_outermost_boundary() {
        let manager = NotifyManager::new();
        let (log, push) = recorder();

        let value = manager.batch(|| {
            manager.schedule(push("a"));
            manager.batch(|| manager.schedule(push("b")));
            assert!(log.lock().is_empty(), "inner batch must not flush");
            manager.schedule(push("c"));
            42
        });

        assert_eq!(value, 42);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn keyed_callbacks_run_once_per_batch() {
        let manager = NotifyManager::new();
        let (log, push) = recorder();

        manager.batch(|| {
            manager.schedule_keyed(1, push("first"));
            manager.schedule(push("other"));
            manager.schedule_keyed(1, push("latest"));
        });

        assert_eq!(*log.lock(), vec!["latest", "other"]);
    }

    #[test]
    fn batch_calls_wraps_in_batch() {
        let manager = Arc::new(NotifyManager::new());
        let (log, push) = recorder();
        let inner = manager.clone();
        let wrapped = manager.batch_calls(move |n: usize| {
            for _ in 0..n {
                inner.schedule_keyed(9, push("x"));
            }
        });
        wrapped(3);
        assert_eq!(*log.lock(), vec!["x"]);
    }

    #[test]
    fn notify_hooks_wrap_flushes() {
        let manager = NotifyManager::new();
        let batches = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let batches = batches.clone();
            manager.set_batch_notify_fn(move |cb| {
                batches.fetch_add(1, Ordering::SeqCst);
                cb()
            });
            let calls = calls.clone();
            manager.set_notify_fn(move |cb| {
                calls.fetch_add(1, Ordering::SeqCst);
                cb()
            });
        }

        manager.batch(|| {
            manager.schedule(|| {});
            manager.schedule(|| {});
        });

        assert_eq!(batches.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn batch_on_one_thread_does_not_delay_another() {
        let manager = Arc::new(NotifyManager::new());
        let (log, push) = recorder();

        manager.batch(|| {
            manager.schedule(push("batched"));
            let other = manager.clone();
            let callback = push("other thread");
            std::thread::spawn(move || other.schedule(callback))
                .join()
                .unwrap();
            assert_eq!(*log.lock(), vec!["other thread"]);
        });

        assert_eq!(*log.lock(), vec!["other thread", "batched"]);
    }

    #[test]
    fn depth_recovers_after_panic() {
        let manager = NotifyManager::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            manager.batch(|| panic!("inside batch"))
        }));
        assert!(result.is_err());

        let (log, push) = recorder();
        manager.schedule(push("after"));
        assert_eq!(*log.lock(), vec!["after"]);
    }
}

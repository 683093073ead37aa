//! Clock and deadline scheduling.
//!
//! Timestamps are milliseconds since the UNIX epoch so they can be compared
//! across caches (hydration relies on that). They are derived from one
//! process-wide wall-clock anchor plus the elapsed [`tokio::time::Instant`],
//! which lets tests drive them with a paused tokio clock.

use std::future::Future;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How far before the first reading the anchor is placed, so instants from
/// runtimes started earlier still map past it.
const ANCHOR_SLACK: Duration = Duration::from_secs(60 * 60);

struct Anchor {
    wall: u64,
    at: Instant,
}

static ANCHOR: OnceLock<Anchor> = OnceLock::new();

fn wall_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1)
}

fn anchor(instant: Instant) -> &'static Anchor {
    ANCHOR.get_or_init(|| {
        let at = instant.checked_sub(ANCHOR_SLACK).unwrap_or(instant);
        Anchor {
            wall: wall_clock().saturating_sub(millis(instant.duration_since(at))),
            at,
        }
    })
}

/// Current time in milliseconds since the UNIX epoch.
///
/// Every thread reads the same anchor, so timestamps taken on different
/// runtime workers are comparable.
pub fn now() -> u64 {
    let instant = Instant::now();
    let anchor = anchor(instant);
    anchor.wall + millis(instant.saturating_duration_since(anchor.at))
}

/// Milliseconds in `d`, saturating.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Durations this large are never armed.
pub(crate) fn is_finite(d: Duration) -> bool {
    d < Duration::from_secs(u64::MAX / 2_000)
}

/// Time left until data updated at `updated_at` becomes stale.
pub(crate) fn time_until_stale(updated_at: u64, stale_time: Duration) -> u64 {
    updated_at
        .saturating_add(millis(stale_time))
        .saturating_sub(now())
}

fn spawn(what: &'static str, fut: impl Future<Output = ()> + Send + 'static) -> Option<JoinHandle<()>> {
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(fut)),
        Err(_) => {
            tracing::trace!(what, "no tokio runtime, timer not armed");
            None
        }
    }
}

/// A one-shot deadline. Dropping it disarms it.
#[derive(Debug)]
pub(crate) struct Timeout {
    task: JoinHandle<()>,
}

impl Timeout {
    /// Arm a deadline running `f` after `delay`.
    ///
    /// Returns `None` for infinite delays or outside a tokio runtime.
    pub fn schedule(delay: Duration, f: impl FnOnce() + Send + 'static) -> Option<Self> {
        if !is_finite(delay) {
            return None;
        }
        spawn("timeout", async move {
            tokio::time::sleep(delay).await;
            f();
        })
        .map(|task| Self { task })
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A repeating deadline firing every `period` until dropped.
#[derive(Debug)]
pub(crate) struct Interval {
    task: JoinHandle<()>,
}

impl Interval {
    /// Run `f` every `period`. Returns `None` for zero or infinite periods or outside a tokio runtime.
    pub fn schedule(period: Duration, f: impl Fn() + Send + 'static) -> Option<Self> {
        if period.is_zero() || !is_finite(period) {
            return None;
        }
        spawn("interval", async move {
            loop {
                tokio::time::sleep(period).await;
                f();
            }
        })
        .map(|task| Self { task })
    }
}

impl Drop for Interval {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn clock_follows_paused_time() {
        let start = now();
        tokio::time::advance(Duration::from_millis(1500)).await;
        let elapsed = now() - start;
        assert!((1500..1510).contains(&elapsed), "elapsed {elapsed}");
    }

    #[test]
    fn clock_is_shared_across_threads() {
        let before = now();
        let other = std::thread::spawn(now).join().unwrap();
        let after = now();
        assert!(before <= other && other <= after, "{before} {other} {after}");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_drop_disarms() {
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let _kept = Timeout::schedule(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = fired.clone();
        let dropped = Timeout::schedule(Duration::from_millis(100), move || {
            counter.fetch_add(10, Ordering::SeqCst);
        });
        drop(dropped);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_repeats() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let interval = Interval::schedule(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(350)).await;
        drop(interval);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn infinite_durations_are_not_armed() {
        assert!(Timeout::schedule(Duration::MAX, || {}).is_none());
        assert!(time_until_stale(now(), Duration::MAX) > 1_000_000_000);
    }
}

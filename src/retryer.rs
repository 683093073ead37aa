//! Fetch execution with retry, backoff, cancellation and pausing.
//!
//! A [`Retryer`] runs one attempt sequence on a spawned tokio task and exposes
//! its outcome as a shared future, so every caller interested in the same
//! fetch awaits the same settlement.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::signals::{FocusManager, OnlineManager};
use crate::QueryError;

/// Upper bound of the default exponential backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Whether a failed attempt may be retried.
#[derive(Clone)]
pub enum Retry {
    /// Never retry.
    Never,
    /// Retry up to `n` times (so at most `n + 1` attempts).
    Count(u32),
    /// Retry forever.
    Always,
    /// Ask `(failure_count, error)` before each retry.
    If(Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>),
}

impl Default for Retry {
    fn default() -> Self {
        Retry::Count(3)
    }
}

impl Retry {
    /// Retry while `f(failure_count, error)` returns `true`.
    pub fn predicate(f: impl Fn(u32, &QueryError) -> bool + Send + Sync + 'static) -> Self {
        Retry::If(Arc::new(f))
    }

    fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            Retry::Never => false,
            Retry::Count(n) => failure_count < *n,
            Retry::Always => true,
            Retry::If(f) => f(failure_count, error),
        }
    }
}

impl From<bool> for Retry {
    fn from(retry: bool) -> Self {
        if retry {
            Retry::Always
        } else {
            Retry::Never
        }
    }
}

impl From<u32> for Retry {
    fn from(n: u32) -> Self {
        Retry::Count(n)
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retry::Never => f.write_str("Never"),
            Retry::Count(n) => f.debug_tuple("Count").field(n).finish(),
            Retry::Always => f.write_str("Always"),
            Retry::If(_) => f.write_str("If(..)"),
        }
    }
}

/// Delay before the next attempt.
#[derive(Clone, Default)]
pub enum RetryDelay {
    /// `min(1000ms * 2^failure_count, 30s)` plus up to 10% random jitter.
    #[default]
    Exponential,
    /// The same delay before every retry.
    Fixed(Duration),
    /// Delay computed from `(failure_count, error)`.
    With(Arc<dyn Fn(u32, &QueryError) -> Duration + Send + Sync>),
}

impl RetryDelay {
    /// Delay computed from `(failure_count, error)`.
    pub fn with(f: impl Fn(u32, &QueryError) -> Duration + Send + Sync + 'static) -> Self {
        RetryDelay::With(Arc::new(f))
    }

    fn delay(&self, failure_count: u32, error: &QueryError) -> Duration {
        match self {
            RetryDelay::Exponential => default_retry_delay(failure_count),
            RetryDelay::Fixed(d) => *d,
            RetryDelay::With(f) => f(failure_count, error),
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Exponential => f.write_str("Exponential"),
            RetryDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            RetryDelay::With(_) => f.write_str("With(..)"),
        }
    }
}

/// Exponential backoff capped at 30 seconds, with jitter.
pub fn default_retry_delay(failure_count: u32) -> Duration {
    let base = 2u64
        .checked_pow(failure_count)
        .and_then(|factor| factor.checked_mul(1000))
        .map_or(MAX_BACKOFF, Duration::from_millis)
        .min(MAX_BACKOFF);
    let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 10);
    base + Duration::from_millis(jitter_ms)
}

/// How fetching reacts to connectivity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetworkMode {
    /// Do not start or retry while offline.
    #[default]
    Online,
    /// Ignore connectivity.
    Always,
    /// Always run the first attempt, pause retries while offline.
    OfflineFirst,
}

/// How a cancellation affects the query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CancelOptions {
    /// Restore the state captured before the fetch started.
    pub revert: bool,
    /// Leave the query's state untouched.
    pub silent: bool,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }
}

/// Callbacks from a running attempt sequence into its owner.
///
/// `on_success`/`on_error` fire at most once, before awaiting callers
/// observe the outcome, and never after a successful [`Retryer::cancel`].
pub(crate) trait RetryerHooks<T>: Send + Sync + 'static {
    fn on_success(&self, value: &T);
    fn on_error(&self, error: &QueryError);
    fn on_fail(&self, failure_count: u32, error: &QueryError);
    fn on_pause(&self);
    fn on_continue(&self);
}

pub(crate) type FetchFn<T> = Box<dyn FnMut() -> BoxFuture<'static, Result<T, QueryError>> + Send>;

pub(crate) struct RetryerConfig<T> {
    pub fetch: FetchFn<T>,
    pub retry: Retry,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    pub focus: Arc<FocusManager>,
    pub online: Arc<OnlineManager>,
    pub hooks: Arc<dyn RetryerHooks<T>>,
}

impl<T> RetryerConfig<T> {
    fn should_pause(&self) -> bool {
        !self.focus.is_focused()
            || (self.network_mode != NetworkMode::Always && !self.online.is_online())
    }
}

/// The shared outcome of an attempt sequence.
pub type RetryerFuture<T> = Shared<BoxFuture<'static, Result<T, QueryError>>>;

struct Control<T> {
    sender: Mutex<Option<oneshot::Sender<Result<T, QueryError>>>>,
    failure_count: AtomicU32,
    paused: AtomicBool,
    cancel_retry: AtomicBool,
    wake: Notify,
}

impl<T: 'static> Control<T> {
    fn is_resolved(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Resolve the outcome unless someone else already did.
    fn settle(&self, result: Result<T, QueryError>, hooks: &dyn RetryerHooks<T>) {
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        match &result {
            Ok(value) => hooks.on_success(value),
            Err(error) => hooks.on_error(error),
        }
        let _ = sender.send(result);
    }

    async fn pause(&self, hooks: &dyn RetryerHooks<T>) {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        self.paused.store(true, Ordering::SeqCst);
        tracing::debug!("fetch paused");
        hooks.on_pause();
        notified.await;
        self.paused.store(false, Ordering::SeqCst);
        tracing::debug!("fetch continued");
        hooks.on_continue();
    }
}

/// One in-flight attempt sequence.
pub struct Retryer<T> {
    control: Arc<Control<T>>,
    outcome: RetryerFuture<T>,
    task: JoinHandle<()>,
}

impl<T: 'static> fmt::Debug for Retryer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retryer")
            .field("failure_count", &self.failure_count())
            .field("paused", &self.is_paused())
            .field("resolved", &self.control.is_resolved())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Retryer<T> {
    /// Spawn the attempt sequence on the current tokio runtime.
    pub(crate) fn start(config: RetryerConfig<T>) -> Result<Self, QueryError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| QueryError::configuration("fetching requires a tokio runtime"))?;
        let (sender, receiver) = oneshot::channel();
        let control = Arc::new(Control {
            sender: Mutex::new(Some(sender)),
            failure_count: AtomicU32::new(0),
            paused: AtomicBool::new(false),
            cancel_retry: AtomicBool::new(false),
            wake: Notify::new(),
        });
        let outcome = receiver
            .map(|received| {
                received.unwrap_or(Err(QueryError::Cancelled {
                    revert: false,
                    silent: true,
                }))
            })
            .boxed()
            .shared();
        let task = handle.spawn(run(control.clone(), config));
        Ok(Self {
            control,
            outcome,
            task,
        })
    }

    /// Future resolving with the sequence's final outcome.
    pub fn outcome(&self) -> RetryerFuture<T> {
        self.outcome.clone()
    }
}

impl<T: 'static> Retryer<T> {
    /// Failed attempts so far.
    pub fn failure_count(&self) -> u32 {
        self.control.failure_count.load(Ordering::SeqCst)
    }

    /// Waiting for connectivity or focus.
    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::SeqCst)
    }

    /// The sequence has settled.
    pub fn is_resolved(&self) -> bool {
        self.control.is_resolved()
    }

    /// Abandon the sequence.
    ///
    /// Awaiting callers receive [`QueryError::Cancelled`] right away and the
    /// running attempt is dropped. Returns `false` if the sequence had
    /// already settled.
    pub fn cancel(&self, options: CancelOptions) -> bool {
        let Some(sender) = self.control.sender.lock().take() else {
            return false;
        };
        tracing::debug!(revert = options.revert, silent = options.silent, "fetch cancelled");
        let _ = sender.send(Err(QueryError::Cancelled {
            revert: options.revert,
            silent: options.silent,
        }));
        self.task.abort();
        true
    }

    /// Let the current attempt finish but do not retry afterwards.
    pub fn cancel_retry(&self) {
        self.control.cancel_retry.store(true, Ordering::SeqCst);
    }

    /// Undo [`cancel_retry`](Self::cancel_retry).
    pub fn continue_retry(&self) {
        self.control.cancel_retry.store(false, Ordering::SeqCst);
    }

    /// Resume a paused sequence.
    pub fn resume(&self) {
        if self.is_paused() {
            self.control.wake.notify_waiters();
        }
    }
}

async fn run<T: 'static>(control: Arc<Control<T>>, mut config: RetryerConfig<T>) {
    let hooks = config.hooks.clone();
    if config.network_mode == NetworkMode::Online && !config.online.is_online() {
        control.pause(hooks.as_ref()).await;
    }
    loop {
        if control.is_resolved() {
            return;
        }
        let error = match (config.fetch)().await {
            Ok(value) => {
                control.settle(Ok(value), hooks.as_ref());
                return;
            }
            Err(error) => error,
        };

        let failure_count = control.failure_count.load(Ordering::SeqCst);
        let retry = error.is_retryable()
            && !control.cancel_retry.load(Ordering::SeqCst)
            && config.retry.should_retry(failure_count, &error);
        if !retry {
            control.settle(Err(error), hooks.as_ref());
            return;
        }

        let delay = config.retry_delay.delay(failure_count, &error);
        let failure_count = control.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(failure_count, ?delay, %error, "fetch failed, retrying");
        hooks.on_fail(failure_count, &error);

        tokio::time::sleep(delay).await;
        if config.should_pause() {
            control.pause(hooks.as_ref()).await;
        }
        if control.cancel_retry.load(Ordering::SeqCst) {
            control.settle(Err(error), hooks.as_ref());
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl RetryerHooks<u32> for Recorder {
        fn on_success(&self, value: &u32) {
            self.events.lock().push(format!("success {value}"));
        }
        fn on_error(&self, error: &QueryError) {
            self.events.lock().push(format!("error {error}"));
        }
        fn on_fail(&self, failure_count: u32, _error: &QueryError) {
            self.events.lock().push(format!("fail {failure_count}"));
        }
        fn on_pause(&self) {
            self.events.lock().push("pause".into());
        }
        fn on_continue(&self) {
            self.events.lock().push("continue".into());
        }
    }

    fn config(
        recorder: &Arc<Recorder>,
        attempts: &Arc<AtomicUsize>,
        fail_first: usize,
        retry: Retry,
    ) -> RetryerConfig<u32> {
        let attempts = attempts.clone();
        RetryerConfig {
            fetch: Box::new(move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if attempt < fail_first {
                        Err(QueryError::fetch(anyhow::anyhow!("attempt {attempt} failed")))
                    } else {
                        Ok(attempt as u32)
                    }
                }
                .boxed()
            }),
            retry,
            retry_delay: RetryDelay::Fixed(Duration::from_millis(100)),
            network_mode: NetworkMode::Online,
            focus: Arc::new(FocusManager::new()),
            online: Arc::new(OnlineManager::new()),
            hooks: recorder.clone(),
        }
    }

    #[test]
    fn default_delay_is_capped() {
        for n in 0..3 {
            let d = default_retry_delay(n);
            let base = Duration::from_millis(1000 << n);
            assert!(d >= base && d <= base + base / 10, "{n}: {d:?}");
        }
        assert!(default_retry_delay(10) <= MAX_BACKOFF + MAX_BACKOFF / 10);
        assert!(default_retry_delay(200) >= MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let recorder = Arc::new(Recorder::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        let retryer = Retryer::start(config(&recorder, &attempts, 2, Retry::default())).unwrap();

        assert_eq!(retryer.outcome().await.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            *recorder.events.lock(),
            vec!["fail 1", "fail 2", "success 2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_settle_with_error() {
        let recorder = Arc::new(Recorder::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        let retryer = Retryer::start(config(&recorder, &attempts, 10, Retry::Count(1))).unwrap();

        let err = retryer.outcome().await.unwrap_err();
        assert!(matches!(err, QueryError::Fetch(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let events = recorder.events.lock();
        assert_eq!(events.len(), 2);
        assert!(events[1].starts_with("error"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_resolves_immediately_and_skips_hooks() {
        let recorder = Arc::new(Recorder::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        let retryer = Retryer::start(config(&recorder, &attempts, 0, Retry::Never)).unwrap();
        tokio::task::yield_now().await;

        assert!(retryer.cancel(CancelOptions::default()));
        assert!(!retryer.cancel(CancelOptions::default()));
        let err = retryer.outcome().await.unwrap_err();
        assert_eq!(
            err,
            QueryError::Cancelled {
                revert: true,
                silent: false
            }
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.events.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_start_pauses_until_resumed() {
        let recorder = Arc::new(Recorder::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        let config = config(&recorder, &attempts, 0, Retry::Never);
        let online = config.online.clone();
        online.set_online(Some(false));

        let retryer = Retryer::start(config).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(retryer.is_paused());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);

        online.set_online(Some(true));
        retryer.resume();
        assert_eq!(retryer.outcome().await.unwrap(), 0);
        assert_eq!(
            *recorder.events.lock(),
            vec!["pause", "continue", "success 0"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_errors_are_not_retried() {
        let recorder = Arc::new(Recorder::default());
        let mut config = config(&recorder, &Arc::new(AtomicUsize::new(0)), 0, Retry::Always);
        config.fetch = Box::new(|| async { Err(QueryError::MissingQueryFn) }.boxed());

        let retryer = Retryer::start(config).unwrap();
        assert_eq!(retryer.outcome().await.unwrap_err(), QueryError::MissingQueryFn);
        assert_eq!(retryer.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_retry_stops_after_current_attempt() {
        let recorder = Arc::new(Recorder::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        let retryer = Retryer::start(config(&recorder, &attempts, 10, Retry::Always)).unwrap();

        // First attempt fails at 10ms, the retry delay runs until 110ms.
        tokio::time::sleep(Duration::from_millis(50)).await;
        retryer.cancel_retry();

        assert!(retryer.outcome().await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}

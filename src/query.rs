//! A single cache entry and its fetch lifecycle.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheShared, QueryCacheEvent};
use crate::data::{QueryData, QueryOutput};
use crate::key::{QueryHash, QueryKey, QueryKeyHashFn};
use crate::notify::NotifyManager;
use crate::retryer::{
    CancelOptions, FetchFn, NetworkMode, Retry, RetryDelay, Retryer, RetryerConfig,
    RetryerFuture, RetryerHooks,
};
use crate::signals::{FocusManager, OnlineManager};
use crate::timer::{self, Timeout};
use crate::QueryError;

/// Default time an unused query stays cached.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

static NEXT_FETCH_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a query's result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Never fetched and no data.
    #[default]
    Idle,
    /// First fetch in progress.
    Loading,
    /// The last fetch failed.
    Error,
    /// Data is available.
    Success,
}

/// Whether a fetch is running, independent of [`QueryStatus`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// No fetch is running.
    #[default]
    Idle,
    /// A fetch is running.
    Fetching,
    /// A fetch is pending but waits for connectivity or focus.
    Paused,
}

/// Which end of an infinite query is being fetched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchDirection {
    /// Append after the last page.
    Forward,
    /// Prepend before the first page.
    Backward,
}

/// Extra information attached to a fetch.
#[derive(Clone, Debug)]
pub struct FetchMeta {
    /// Which end is being fetched.
    pub direction: FetchDirection,
    /// Explicit page parameter, bypassing `get_*_page_param`.
    pub page_param: Option<QueryData>,
}

impl PartialEq for FetchMeta {
    fn eq(&self, other: &Self) -> bool {
        self.direction == other.direction
            && match (&self.page_param, &other.page_param) {
                (Some(a), Some(b)) => a.ptr_eq(b),
                (None, None) => true,
                _ => false,
            }
    }
}

/// Snapshot of a query's state.
#[derive(Clone, Debug, Default)]
pub struct QueryState {
    /// The cached value.
    pub data: Option<QueryData>,
    /// How many times data was written.
    pub data_update_count: u32,
    /// Milliseconds since the epoch, `0` when no data was ever produced.
    pub data_updated_at: u64,
    /// The last error, cleared by the next success.
    pub error: Option<QueryError>,
    /// How many times a fetch failed.
    pub error_update_count: u32,
    /// When the last error was recorded (ms since the epoch).
    pub error_updated_at: u64,
    /// Failed attempts of the running or last fetch.
    pub fetch_failure_count: u32,
    /// Meta of the running fetch.
    pub fetch_meta: Option<FetchMeta>,
    /// Marked stale regardless of time.
    pub is_invalidated: bool,
    /// Lifecycle status.
    pub status: QueryStatus,
    /// Whether a fetch is running or paused.
    pub fetch_status: FetchStatus,
}

impl QueryState {
    pub(crate) fn initial(config: &QueryConfig) -> Self {
        let data = config.initial_data.as_ref().and_then(|initial| initial());
        match data {
            Some(data) => Self {
                data: Some(data),
                data_updated_at: config.initial_data_updated_at.unwrap_or_else(timer::now),
                status: QueryStatus::Success,
                ..Self::default()
            },
            None => Self::default(),
        }
    }

    /// A fetch is running.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    pub(crate) fn apply(&self, action: &Action) -> Self {
        match action {
            Action::Fetch { meta, paused } => {
                let mut next = Self {
                    fetch_failure_count: 0,
                    fetch_meta: meta.clone(),
                    fetch_status: if *paused {
                        FetchStatus::Paused
                    } else {
                        FetchStatus::Fetching
                    },
                    ..self.clone()
                };
                if self.data_updated_at == 0 {
                    next.error = None;
                    next.status = QueryStatus::Loading;
                }
                next
            }
            Action::Success {
                data,
                updated_at,
                manual,
            } => {
                let mut next = Self {
                    data: Some(data.clone()),
                    data_update_count: self.data_update_count + 1,
                    data_updated_at: *updated_at,
                    error: None,
                    is_invalidated: false,
                    status: QueryStatus::Success,
                    ..self.clone()
                };
                if !manual {
                    next.fetch_status = FetchStatus::Idle;
                    next.fetch_failure_count = 0;
                    next.fetch_meta = None;
                }
                next
            }
            Action::Error { error, updated_at } => Self {
                error: Some(error.clone()),
                error_update_count: self.error_update_count + 1,
                error_updated_at: *updated_at,
                fetch_failure_count: self.fetch_failure_count + 1,
                fetch_status: FetchStatus::Idle,
                fetch_meta: None,
                status: QueryStatus::Error,
                ..self.clone()
            },
            Action::Failed { failure_count } => Self {
                fetch_failure_count: *failure_count,
                ..self.clone()
            },
            Action::Pause => Self {
                fetch_status: FetchStatus::Paused,
                ..self.clone()
            },
            Action::Continue => Self {
                fetch_status: FetchStatus::Fetching,
                ..self.clone()
            },
            Action::Invalidate => Self {
                is_invalidated: true,
                ..self.clone()
            },
            Action::SetState { state } => (**state).clone(),
        }
    }
}

/// A state transition of a query.
#[derive(Clone, Debug)]
pub enum Action {
    /// A fetch started.
    Fetch {
        /// Extra information about the fetch.
        meta: Option<FetchMeta>,
        /// The fetch waits for connectivity.
        paused: bool,
    },
    /// Data arrived.
    Success {
        /// The new value.
        data: QueryData,
        /// When it arrived (ms since the epoch).
        updated_at: u64,
        /// Written directly rather than fetched.
        manual: bool,
    },
    /// A fetch failed for good.
    Error {
        /// The final error.
        error: QueryError,
        /// When it failed (ms since the epoch).
        updated_at: u64,
    },
    /// One attempt failed and will be retried.
    Failed {
        /// Failed attempts so far.
        failure_count: u32,
    },
    /// The fetch is waiting for connectivity or focus.
    Pause,
    /// A paused fetch resumed.
    Continue,
    /// The data was marked stale.
    Invalidate,
    /// The whole state was replaced.
    SetState {
        /// The replacement.
        state: Box<QueryState>,
    },
}

/// Arguments passed to a query function.
#[derive(Clone, Debug)]
pub struct QueryFnContext {
    /// Key of the query being fetched.
    pub query_key: QueryKey,
    /// Meta passed to the fetch.
    pub meta: Option<FetchMeta>,
    /// Data cached when the fetch started.
    pub(crate) data: Option<QueryData>,
}

/// Async fetch implementation for queries producing `T`.
///
/// Closures are accepted directly by [`QueryFn::new`]; implement this trait
/// for fetchers that carry their own state (clients, connection pools).
#[async_trait]
pub trait Fetcher<T>: Send + Sync + 'static {
    /// Produce the data for `ctx.query_key`.
    async fn fetch(&self, ctx: QueryFnContext) -> anyhow::Result<T>;
}

type ErasedFn =
    dyn Fn(QueryFnContext) -> BoxFuture<'static, Result<QueryData, QueryError>> + Send + Sync;

/// Type-erased query function.
#[derive(Clone)]
pub struct QueryFn(Arc<ErasedFn>);

impl QueryFn {
    /// Wrap an async closure.
    pub fn new<T, F, Fut>(f: F) -> Self
    where
        T: QueryOutput,
        F: Fn(QueryFnContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::erased(move |ctx| {
            f(ctx)
                .map(|result| result.map(QueryData::new).map_err(QueryError::from))
                .boxed()
        })
    }

    /// Wrap a [`Fetcher`].
    pub fn from_fetcher<T: QueryOutput>(fetcher: impl Fetcher<T>) -> Self {
        let fetcher = Arc::new(fetcher);
        Self::erased(move |ctx| {
            let fetcher = fetcher.clone();
            async move { fetcher.fetch(ctx).await.map(QueryData::new).map_err(QueryError::from) }
                .boxed()
        })
    }

    pub(crate) fn erased(
        f: impl Fn(QueryFnContext) -> BoxFuture<'static, Result<QueryData, QueryError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        QueryFn(Arc::new(f))
    }

    pub(crate) fn call(&self, ctx: QueryFnContext) -> BoxFuture<'static, Result<QueryData, QueryError>> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for QueryFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueryFn(..)")
    }
}

/// Produces initial data for a newly created query.
pub type InitialDataFn = Arc<dyn Fn() -> Option<QueryData> + Send + Sync>;

/// Options stored on a query. Unset fields fall back to built-in defaults.
#[derive(Clone, Default)]
pub(crate) struct QueryConfig {
    pub query_fn: Option<QueryFn>,
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub network_mode: Option<NetworkMode>,
    pub cache_time: Option<Duration>,
    pub initial_data: Option<InitialDataFn>,
    pub initial_data_updated_at: Option<u64>,
    pub query_key_hash_fn: Option<QueryKeyHashFn>,
}

impl QueryConfig {
    /// Overlay `other` on top of `self`.
    fn overlay(&mut self, other: QueryConfig) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(
            query_fn,
            retry,
            retry_delay,
            network_mode,
            cache_time,
            initial_data,
            initial_data_updated_at,
            query_key_hash_fn
        );
    }
}

/// Options for a single fetch.
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// Cancel a running fetch and start over, if the query already has data.
    pub cancel_refetch: bool,
    /// Extra information passed to the query function.
    pub meta: Option<FetchMeta>,
    /// Retry policy for this fetch only. The query's stored policy is left
    /// untouched.
    pub retry: Option<Retry>,
}

/// Outcome of a fetch, shared by every caller deduplicated onto it.
pub type QueryFuture = RetryerFuture<QueryData>;

/// What a query needs from the observers subscribed to it.
pub(crate) trait QueryListener: Send + Sync {
    fn on_query_update(&self, action: &Action);
    fn is_enabled(&self) -> bool;
    fn is_result_stale(&self) -> bool;
    fn should_fetch_on_window_focus(&self) -> bool;
    fn should_fetch_on_reconnect(&self) -> bool;
    /// Refetch in response to a focus or connectivity signal.
    fn refetch_from_signal(&self);
    fn query_fn(&self) -> Option<QueryFn>;
}

struct QueryInner {
    state: QueryState,
    revert_state: Option<QueryState>,
    config: QueryConfig,
    cache_time: Duration,
    observers: Vec<(u64, Weak<dyn QueryListener>)>,
    retryer: Option<(u64, Retryer<QueryData>)>,
    gc: Option<Timeout>,
}

/// One cache entry: state machine, observer registry and active fetch.
///
/// Queries are owned by their [`QueryCache`](crate::QueryCache); observers
/// and callers only hold `Arc<Query>` handles obtained from it.
pub struct Query {
    hash: QueryHash,
    key: QueryKey,
    me: Weak<Query>,
    cache: Weak<CacheShared>,
    notify: Arc<NotifyManager>,
    focus: Arc<FocusManager>,
    online: Arc<OnlineManager>,
    inner: Mutex<QueryInner>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Query")
            .field("hash", &self.hash)
            .field("status", &inner.state.status)
            .field("fetch_status", &inner.state.fetch_status)
            .field("observers", &inner.observers.len())
            .finish()
    }
}

impl Query {
    pub(crate) fn new(
        cache: &Arc<CacheShared>,
        key: QueryKey,
        hash: QueryHash,
        config: QueryConfig,
        state: QueryState,
    ) -> Arc<Self> {
        let cache_time = config.cache_time.unwrap_or(DEFAULT_CACHE_TIME);
        Arc::new_cyclic(|me| Query {
            hash,
            key,
            me: me.clone(),
            cache: Arc::downgrade(cache),
            notify: cache.notify.clone(),
            focus: cache.focus.clone(),
            online: cache.online.clone(),
            inner: Mutex::new(QueryInner {
                state,
                revert_state: None,
                config,
                cache_time,
                observers: Vec::new(),
                retryer: None,
                gc: None,
            }),
        })
    }

    /// The key hash this query is stored under.
    pub fn hash(&self) -> &QueryHash {
        &self.hash
    }

    /// The key the query was created with.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> QueryState {
        self.inner.lock().state.clone()
    }

    /// How long the query stays cached once unobserved.
    pub fn cache_time(&self) -> Duration {
        self.inner.lock().cache_time
    }

    /// Number of subscribed observers.
    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    pub(crate) fn hash_fn(&self) -> Option<QueryKeyHashFn> {
        self.inner.lock().config.query_key_hash_fn.clone()
    }

    /// Whether any subscribed observer is enabled.
    pub fn is_active(&self) -> bool {
        self.observers().iter().any(|o| o.is_enabled())
    }

    /// A fetch is running.
    pub fn is_fetching(&self) -> bool {
        self.inner.lock().state.is_fetching()
    }

    /// Invalidated, never fetched, or stale for one of its observers.
    pub fn is_stale(&self) -> bool {
        {
            let inner = self.inner.lock();
            if inner.state.is_invalidated || inner.state.data_updated_at == 0 {
                return true;
            }
        }
        self.observers().iter().any(|o| o.is_result_stale())
    }

    /// Whether the data is older than `stale_time`, invalidated, or not a
    /// successful result.
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        let inner = self.inner.lock();
        let state = &inner.state;
        state.is_invalidated
            || state.status != QueryStatus::Success
            || state.data_updated_at == 0
            || timer::time_until_stale(state.data_updated_at, stale_time) == 0
    }

    /// Fetch with the options already stored on the query.
    pub fn fetch(&self, options: FetchOptions) -> QueryFuture {
        self.fetch_with(None, options)
    }

    /// Start a fetch, or attach to the one already running.
    pub(crate) fn fetch_with(&self, config: Option<QueryConfig>, options: FetchOptions) -> QueryFuture {
        let config = self.with_observer_query_fn(config);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.state.fetch_status != FetchStatus::Idle {
            let supersede = options.cancel_refetch && inner.state.data_updated_at > 0;
            if let Some((_, retryer)) = &inner.retryer {
                if !supersede {
                    tracing::trace!(query_hash = %self.hash, "attaching to running fetch");
                    retryer.continue_retry();
                    return retryer.outcome();
                }
            }
            if let Some((_, retryer)) = inner.retryer.take() {
                retryer.cancel(CancelOptions {
                    revert: false,
                    silent: true,
                });
            }
        }

        if let Some(config) = config {
            inner.set_config(config);
        }

        let query_fn = inner.config.query_fn.clone();
        let ctx = QueryFnContext {
            query_key: self.key.clone(),
            meta: options.meta.clone(),
            data: inner.state.data.clone(),
        };
        let fetch: FetchFn<QueryData> = Box::new(move || match &query_fn {
            Some(query_fn) => query_fn.call(ctx.clone()),
            None => future::ready(Err(QueryError::MissingQueryFn)).boxed(),
        });

        let network_mode = inner.config.network_mode.unwrap_or_default();
        let id = NEXT_FETCH_ID.fetch_add(1, Ordering::Relaxed);
        let retryer = Retryer::start(RetryerConfig {
            fetch,
            retry: options
                .retry
                .clone()
                .or_else(|| inner.config.retry.clone())
                .unwrap_or_default(),
            retry_delay: inner.config.retry_delay.clone().unwrap_or_default(),
            network_mode,
            focus: self.focus.clone(),
            online: self.online.clone(),
            hooks: Arc::new(FetchHooks {
                query: self.me.clone(),
                id,
            }),
        });
        let retryer = match retryer {
            Ok(retryer) => retryer,
            Err(err) => {
                tracing::warn!(query_hash = %self.hash, %err, "cannot start fetch");
                return future::ready(Err(err)).boxed().shared();
            }
        };
        tracing::debug!(query_hash = %self.hash, "fetch started");

        let outcome = retryer.outcome();
        inner.revert_state = Some(inner.state.clone());
        let action = (inner.state.fetch_status == FetchStatus::Idle
            || inner.state.fetch_meta != options.meta)
            .then(|| Action::Fetch {
                meta: options.meta,
                paused: network_mode == NetworkMode::Online && !self.online.is_online(),
            });
        inner.retryer = Some((id, retryer));
        if let Some(action) = &action {
            inner.state = inner.state.apply(action);
        }
        drop(guard);

        if let Some(action) = action {
            self.notify_observers(action);
        }
        outcome
    }

    /// Fill in a query function from a subscribed observer if none is known.
    fn with_observer_query_fn(&self, config: Option<QueryConfig>) -> Option<QueryConfig> {
        let has_fn = config.as_ref().is_some_and(|c| c.query_fn.is_some())
            || self.inner.lock().config.query_fn.is_some();
        if has_fn {
            return config;
        }
        match self.observers().iter().find_map(|o| o.query_fn()) {
            Some(query_fn) => {
                let mut config = config.unwrap_or_default();
                config.query_fn = Some(query_fn);
                Some(config)
            }
            None => config,
        }
    }

    /// Cancel the running fetch. Returns `false` if there was none.
    pub fn cancel(&self, options: CancelOptions) -> bool {
        let (action, unobserved) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match &inner.retryer {
                Some((_, retryer)) if retryer.cancel(options) => {}
                _ => return false,
            }
            inner.retryer = None;
            let mut next = if options.revert {
                inner
                    .revert_state
                    .take()
                    .unwrap_or_else(|| inner.state.clone())
            } else {
                inner.state.clone()
            };
            next.fetch_status = FetchStatus::Idle;
            next.fetch_meta = None;
            let unobserved = inner.observers.is_empty();
            if options.silent {
                inner.state = next;
                (None, unobserved)
            } else {
                let action = Action::SetState {
                    state: Box::new(next),
                };
                inner.state = inner.state.apply(&action);
                (Some(action), unobserved)
            }
        };
        if let Some(action) = action {
            self.notify_observers(action);
        }
        // A deadline that fired during the fetch was skipped; arm a new one.
        if unobserved {
            self.schedule_gc();
        }
        true
    }

    /// Write data directly, bypassing fetching.
    pub fn set_data(&self, data: QueryData, updated_at: Option<u64>) {
        self.dispatch(Action::Success {
            data,
            updated_at: updated_at.unwrap_or_else(timer::now),
            manual: true,
        });
    }

    pub(crate) fn set_state(&self, state: QueryState) {
        self.dispatch(Action::SetState {
            state: Box::new(state),
        });
    }

    /// Mark the data stale regardless of time.
    pub fn invalidate(&self) {
        if !self.inner.lock().state.is_invalidated {
            self.dispatch(Action::Invalidate);
        }
    }

    /// Cancel any fetch and go back to the initial state.
    pub fn reset(&self) {
        self.cancel(CancelOptions {
            revert: false,
            silent: true,
        });
        let config = self.inner.lock().config.clone();
        let initial = QueryState::initial(&config);
        self.set_state(initial);
    }

    pub(crate) fn dispatch(&self, action: Action) {
        {
            let mut inner = self.inner.lock();
            inner.state = inner.state.apply(&action);
        }
        self.notify_observers(action);
    }

    fn notify_observers(&self, action: Action) {
        let observers = self.observers();
        let cache = self.cache.upgrade();
        let me = self.me.upgrade();
        self.notify.batch(|| {
            for observer in &observers {
                observer.on_query_update(&action);
            }
            if let (Some(cache), Some(query)) = (cache, me) {
                cache.emit(QueryCacheEvent::Updated { query, action });
            }
        });
    }

    /// Apply the outcome of fetch `id` unless it was superseded.
    fn settle(&self, id: u64, result: Result<QueryData, QueryError>) {
        let (action, unobserved) = {
            let mut inner = self.inner.lock();
            match &inner.retryer {
                Some((current, _)) if *current == id => {}
                _ => return,
            }
            inner.retryer = None;
            let action = match result {
                Ok(data) => Action::Success {
                    data,
                    updated_at: timer::now(),
                    manual: false,
                },
                Err(error) => Action::Error {
                    error,
                    updated_at: timer::now(),
                },
            };
            inner.state = inner.state.apply(&action);
            (action, inner.observers.is_empty())
        };

        let cache = self.cache.upgrade();
        match &action {
            Action::Success { data, .. } => {
                tracing::debug!(query_hash = %self.hash, "fetch succeeded");
                if let (Some(cache), Some(me)) = (&cache, self.me.upgrade()) {
                    if let Some(on_success) = &cache.config.on_success {
                        on_success(data, &me);
                    }
                }
            }
            Action::Error { error, .. } => {
                tracing::warn!(query_hash = %self.hash, %error, "fetch failed");
                if let (Some(cache), Some(me)) = (&cache, self.me.upgrade()) {
                    if let Some(on_error) = &cache.config.on_error {
                        on_error(error, &me);
                    }
                }
            }
            _ => {}
        }
        self.notify_observers(action);
        if unobserved {
            self.schedule_gc();
        }
    }

    fn dispatch_for(&self, id: u64, action: Action) {
        {
            let mut inner = self.inner.lock();
            match &inner.retryer {
                Some((current, _)) if *current == id => {}
                _ => return,
            }
            inner.state = inner.state.apply(&action);
        }
        self.notify_observers(action);
    }

    pub(crate) fn add_observer(&self, id: u64, observer: Weak<dyn QueryListener>) {
        let added = {
            let mut inner = self.inner.lock();
            if inner.observers.iter().any(|(existing, _)| *existing == id) {
                false
            } else {
                inner.observers.push((id, observer));
                inner.gc = None;
                true
            }
        };
        if added {
            self.emit(|query| QueryCacheEvent::ObserverAdded { query });
        }
    }

    pub(crate) fn remove_observer(&self, id: u64) {
        let now_unobserved = {
            let mut inner = self.inner.lock();
            let before = inner.observers.len();
            inner.observers.retain(|(existing, _)| *existing != id);
            if inner.observers.len() == before {
                return;
            }
            if inner.observers.is_empty() {
                // Let the running attempt finish so its result is cached.
                if let Some((_, retryer)) = &inner.retryer {
                    retryer.cancel_retry();
                }
                true
            } else {
                false
            }
        };
        if now_unobserved {
            self.schedule_gc();
        }
        self.emit(|query| QueryCacheEvent::ObserverRemoved { query });
    }

    pub(crate) fn set_config(&self, config: QueryConfig) {
        self.inner.lock().set_config(config);
    }

    /// Arm the garbage collection deadline.
    pub(crate) fn schedule_gc(&self) {
        let cache_time = self.inner.lock().cache_time;
        let me = self.me.clone();
        let gc = Timeout::schedule(cache_time, move || {
            if let Some(query) = me.upgrade() {
                query.optional_remove();
            }
        });
        self.inner.lock().gc = gc;
    }

    fn optional_remove(&self) {
        let removable = {
            let inner = self.inner.lock();
            inner.observers.is_empty() && inner.retryer.is_none()
        };
        if removable {
            if let (Some(cache), Some(me)) = (self.cache.upgrade(), self.me.upgrade()) {
                tracing::debug!(query_hash = %self.hash, "garbage collecting query");
                cache.remove(&me);
            }
        }
    }

    /// Tear down timers and any fetch. Called when removed from the cache.
    pub(crate) fn destroy(&self) {
        let retryer = {
            let mut inner = self.inner.lock();
            inner.gc = None;
            inner.retryer.take()
        };
        if let Some((_, retryer)) = retryer {
            retryer.cancel(CancelOptions {
                revert: false,
                silent: true,
            });
        }
    }

    pub(crate) fn on_focus(&self) {
        let observers = self.observers();
        if let Some(observer) = observers.iter().find(|o| o.should_fetch_on_window_focus()) {
            observer.refetch_from_signal();
        }
        self.resume();
    }

    pub(crate) fn on_online(&self) {
        let observers = self.observers();
        if let Some(observer) = observers.iter().find(|o| o.should_fetch_on_reconnect()) {
            observer.refetch_from_signal();
        }
        self.resume();
    }

    fn resume(&self) {
        if let Some((_, retryer)) = &self.inner.lock().retryer {
            retryer.resume();
        }
    }

    fn observers(&self) -> Vec<Arc<dyn QueryListener>> {
        self.inner
            .lock()
            .observers
            .iter()
            .filter_map(|(_, observer)| observer.upgrade())
            .collect()
    }

    fn emit(&self, event: impl FnOnce(Arc<Query>) -> QueryCacheEvent) {
        if let (Some(cache), Some(me)) = (self.cache.upgrade(), self.me.upgrade()) {
            cache.emit(event(me));
        }
    }
}

impl QueryInner {
    fn set_config(&mut self, config: QueryConfig) {
        let requested = config.cache_time.unwrap_or(DEFAULT_CACHE_TIME);
        self.cache_time = self.cache_time.max(requested);
        self.config.overlay(config);
    }
}

struct FetchHooks {
    query: Weak<Query>,
    id: u64,
}

impl RetryerHooks<QueryData> for FetchHooks {
    fn on_success(&self, data: &QueryData) {
        if let Some(query) = self.query.upgrade() {
            query.settle(self.id, Ok(data.clone()));
        }
    }

    fn on_error(&self, error: &QueryError) {
        if let Some(query) = self.query.upgrade() {
            query.settle(self.id, Err(error.clone()));
        }
    }

    fn on_fail(&self, failure_count: u32, _error: &QueryError) {
        if let Some(query) = self.query.upgrade() {
            query.dispatch_for(self.id, Action::Failed { failure_count });
        }
    }

    fn on_pause(&self) {
        if let Some(query) = self.query.upgrade() {
            query.dispatch_for(self.id, Action::Pause);
        }
    }

    fn on_continue(&self) {
        if let Some(query) = self.query.upgrade() {
            query.dispatch_for(self.id, Action::Continue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(value: u32, at: u64) -> Action {
        Action::Success {
            data: QueryData::new(value),
            updated_at: at,
            manual: false,
        }
    }

    #[test]
    fn first_fetch_moves_to_loading() {
        let state = QueryState::default().apply(&Action::Fetch {
            meta: None,
            paused: false,
        });
        assert_eq!(state.status, QueryStatus::Loading);
        assert_eq!(state.fetch_status, FetchStatus::Fetching);

        let paused = QueryState::default().apply(&Action::Fetch {
            meta: None,
            paused: true,
        });
        assert_eq!(paused.fetch_status, FetchStatus::Paused);
    }

    #[test]
    fn refetch_keeps_success_status() {
        let state = QueryState::default()
            .apply(&success(1, 10))
            .apply(&Action::Fetch {
                meta: None,
                paused: false,
            });
        assert_eq!(state.status, QueryStatus::Success);
        assert!(state.is_fetching());
        assert_eq!(state.data_updated_at, 10);
    }

    #[test]
    fn error_keeps_previous_data_and_counts_failures() {
        let error = QueryError::fetch(anyhow::anyhow!("down"));
        let state = QueryState::default()
            .apply(&success(1, 10))
            .apply(&Action::Fetch {
                meta: None,
                paused: false,
            })
            .apply(&Action::Failed { failure_count: 2 })
            .apply(&Action::Error {
                error: error.clone(),
                updated_at: 20,
            });
        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(state.error, Some(error));
        assert_eq!(state.fetch_failure_count, 3);
        assert_eq!(state.error_update_count, 1);
        assert!(state.data.is_some());
        assert_eq!(state.fetch_status, FetchStatus::Idle);
    }

    #[test]
    fn success_clears_error_and_invalidation() {
        let state = QueryState::default()
            .apply(&Action::Error {
                error: QueryError::fetch(anyhow::anyhow!("x")),
                updated_at: 5,
            })
            .apply(&Action::Invalidate)
            .apply(&success(2, 10));
        assert_eq!(state.status, QueryStatus::Success);
        assert!(state.error.is_none());
        assert!(!state.is_invalidated);
        assert_eq!(state.data_update_count, 1);
    }

    #[test]
    fn manual_success_does_not_end_fetch() {
        let state = QueryState::default()
            .apply(&Action::Fetch {
                meta: None,
                paused: false,
            })
            .apply(&Action::Success {
                data: QueryData::new(1u32),
                updated_at: 3,
                manual: true,
            });
        assert_eq!(state.status, QueryStatus::Success);
        assert!(state.is_fetching());
    }

    #[test]
    fn initial_data_starts_successful() {
        let config = QueryConfig {
            initial_data: Some(Arc::new(|| Some(QueryData::new(7u32)))),
            initial_data_updated_at: Some(42),
            ..QueryConfig::default()
        };
        let state = QueryState::initial(&config);
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data_updated_at, 42);
        assert_eq!(state.data_update_count, 0);
    }
}

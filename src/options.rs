//! Typed per-query options and client-wide defaults.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::data::{QueryData, QueryOutput};
use crate::key::{hash_with, QueryHash, QueryKey, QueryKeyHashFn};
use crate::query::{Fetcher, QueryConfig, QueryFn, QueryFnContext};
use crate::retryer::{NetworkMode, Retry, RetryDelay};
use crate::QueryError;

/// When a signal (mount, focus, reconnect) triggers a refetch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefetchOn {
    /// Never refetch on this signal.
    Never,
    /// Refetch if the data is stale.
    #[default]
    IfStale,
    /// Refetch even if the data is fresh.
    Always,
}

impl From<bool> for RefetchOn {
    fn from(value: bool) -> Self {
        if value {
            RefetchOn::IfStale
        } else {
            RefetchOn::Never
        }
    }
}

/// A field of [`QueryObserverResult`](crate::QueryObserverResult).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultProp {
    /// `data`
    Data,
    /// `error`
    Error,
    /// `status`
    Status,
    /// `fetch_status`
    FetchStatus,
    /// `data_updated_at`
    DataUpdatedAt,
    /// `error_updated_at`
    ErrorUpdatedAt,
    /// `failure_count`
    FailureCount,
    /// `error_update_count`
    ErrorUpdateCount,
    /// `is_fetched`
    IsFetched,
    /// `is_fetched_after_mount`
    IsFetchedAfterMount,
    /// `is_fetching`
    IsFetching,
    /// `is_refetching`
    IsRefetching,
    /// `is_loading_error`
    IsLoadingError,
    /// `is_refetch_error`
    IsRefetchError,
    /// `is_placeholder_data`
    IsPlaceholderData,
    /// `is_previous_data`
    IsPreviousData,
    /// `is_stale`
    IsStale,
}

impl ResultProp {
    /// Every field, in declaration order.
    pub const ALL: [ResultProp; 17] = [
        ResultProp::Data,
        ResultProp::Error,
        ResultProp::Status,
        ResultProp::FetchStatus,
        ResultProp::DataUpdatedAt,
        ResultProp::ErrorUpdatedAt,
        ResultProp::FailureCount,
        ResultProp::ErrorUpdateCount,
        ResultProp::IsFetched,
        ResultProp::IsFetchedAfterMount,
        ResultProp::IsFetching,
        ResultProp::IsRefetching,
        ResultProp::IsLoadingError,
        ResultProp::IsRefetchError,
        ResultProp::IsPlaceholderData,
        ResultProp::IsPreviousData,
        ResultProp::IsStale,
    ];
}

/// Which result changes notify an observer's listeners.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NotifyOnChangeProps {
    /// Any change.
    #[default]
    All,
    /// Only changes to fields read through a
    /// [`TrackedResult`](crate::TrackedResult).
    Tracked,
    /// Only changes to the listed fields.
    Props(Vec<ResultProp>),
}

/// Untyped options shared by client defaults, per-key defaults and
/// per-observer options. `None` means "inherit".
#[derive(Clone, Debug, Default)]
pub struct QueryDefaults {
    /// Whether observers fetch automatically. Defaults to `true`.
    pub enabled: Option<bool>,
    /// How long data stays fresh. Defaults to zero.
    pub stale_time: Option<Duration>,
    /// How long an unobserved query is kept. Defaults to five minutes.
    pub cache_time: Option<Duration>,
    /// Retry policy. Defaults to three retries.
    pub retry: Option<Retry>,
    /// Delay between retries. Defaults to exponential backoff.
    pub retry_delay: Option<RetryDelay>,
    /// When fetches may run with respect to connectivity.
    pub network_mode: Option<NetworkMode>,
    /// Refetch periodically while observed.
    pub refetch_interval: Option<Duration>,
    /// Keep the interval running while the window is unfocused.
    pub refetch_interval_in_background: Option<bool>,
    /// Refetch when the window regains focus.
    pub refetch_on_window_focus: Option<RefetchOn>,
    /// Refetch when connectivity returns.
    pub refetch_on_reconnect: Option<RefetchOn>,
    /// Refetch when an observer mounts.
    pub refetch_on_mount: Option<RefetchOn>,
    /// Retry a failed query when an observer mounts.
    pub retry_on_mount: Option<bool>,
    /// Show the previous key's data while a new key loads.
    pub keep_previous_data: Option<bool>,
    /// Which result changes notify listeners.
    pub notify_on_change_props: Option<NotifyOnChangeProps>,
    /// Surface terminal errors as `Err` from the observer.
    pub use_error_boundary: Option<bool>,
}

impl QueryDefaults {
    /// Fill unset fields from `fallback`.
    pub fn or(mut self, fallback: &QueryDefaults) -> Self {
        macro_rules! inherit {
            ($($field:ident),*) => {
                $(if self.$field.is_none() {
                    self.$field = fallback.$field.clone();
                })*
            };
        }
        inherit!(
            enabled,
            stale_time,
            cache_time,
            retry,
            retry_delay,
            network_mode,
            refetch_interval,
            refetch_interval_in_background,
            refetch_on_window_focus,
            refetch_on_reconnect,
            refetch_on_mount,
            retry_on_mount,
            keep_previous_data,
            notify_on_change_props,
            use_error_boundary
        );
        self
    }
}

/// Client-wide defaults.
#[derive(Clone, Debug, Default)]
pub struct DefaultOptions {
    /// Defaults for every query.
    pub queries: QueryDefaults,
}

pub(crate) type SelectFn<T, D> = Arc<dyn Fn(&Arc<T>) -> Arc<D> + Send + Sync>;
pub(crate) type ProvideFn<T> = Arc<dyn Fn() -> Option<Arc<T>> + Send + Sync>;
type SuccessFn<D> = Arc<dyn Fn(&Arc<D>) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&QueryError) + Send + Sync>;
type SettledFn<D> = Arc<dyn Fn(Option<&Arc<D>>, Option<&QueryError>) + Send + Sync>;

/// Options of a query producing `T`, observed as `D` (via `select`).
///
/// ```ignore
/// let options = QueryOptions::<Vec<Todo>>::new(json!(["todos"]))
///     .query_fn(|_| async { api::todos().await })
///     .stale_time(Duration::from_secs(30))
///     .select(|todos| todos.len());
/// ```
pub struct QueryOptions<T, D = T> {
    pub(crate) key: QueryKey,
    pub(crate) query_fn: Option<QueryFn>,
    pub(crate) query_key_hash_fn: Option<QueryKeyHashFn>,
    pub(crate) defaults: QueryDefaults,
    pub(crate) select: SelectFn<T, D>,
    pub(crate) has_select: bool,
    pub(crate) placeholder_data: Option<ProvideFn<T>>,
    pub(crate) initial_data: Option<ProvideFn<T>>,
    pub(crate) initial_data_updated_at: Option<u64>,
    pub(crate) on_success: Option<SuccessFn<D>>,
    pub(crate) on_error: Option<ErrorFn>,
    pub(crate) on_settled: Option<SettledFn<D>>,
}

impl<T, D> Clone for QueryOptions<T, D> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            query_fn: self.query_fn.clone(),
            query_key_hash_fn: self.query_key_hash_fn.clone(),
            defaults: self.defaults.clone(),
            select: self.select.clone(),
            has_select: self.has_select,
            placeholder_data: self.placeholder_data.clone(),
            initial_data: self.initial_data.clone(),
            initial_data_updated_at: self.initial_data_updated_at,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<T, D> fmt::Debug for QueryOptions<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("defaults", &self.defaults)
            .field("has_select", &self.has_select)
            .finish_non_exhaustive()
    }
}

impl<T: QueryOutput> QueryOptions<T> {
    /// Options for the query stored under `key`.
    pub fn new(key: impl Into<QueryKey>) -> Self {
        Self {
            key: key.into(),
            query_fn: None,
            query_key_hash_fn: None,
            defaults: QueryDefaults::default(),
            select: Arc::new(|data: &Arc<T>| data.clone()),
            has_select: false,
            placeholder_data: None,
            initial_data: None,
            initial_data_updated_at: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<T: QueryOutput, D> QueryOptions<T, D> {
    /// The query key.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The async function producing the data.
    pub fn query_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(QueryFnContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.query_fn = Some(QueryFn::new(f));
        self
    }

    /// Fetch with a stateful [`Fetcher`] instead of a closure.
    pub fn fetcher(mut self, fetcher: impl Fetcher<T>) -> Self {
        self.query_fn = Some(QueryFn::from_fetcher(fetcher));
        self
    }

    pub(crate) fn raw_query_fn(mut self, query_fn: QueryFn) -> Self {
        self.query_fn = Some(query_fn);
        self
    }

    /// Transform the data observers receive. The cache keeps `T`.
    ///
    /// The result is memoized: it is recomputed only when the cached data or
    /// the selector changes. Callbacks typed on the previous output type are
    /// dropped, so set `on_success` / `on_settled` after `select`.
    pub fn select<D2: Send + Sync + 'static>(
        self,
        f: impl Fn(&T) -> D2 + Send + Sync + 'static,
    ) -> QueryOptions<T, D2> {
        QueryOptions {
            key: self.key,
            query_fn: self.query_fn,
            query_key_hash_fn: self.query_key_hash_fn,
            defaults: self.defaults,
            select: Arc::new(move |data: &Arc<T>| Arc::new(f(data))),
            has_select: true,
            placeholder_data: self.placeholder_data,
            initial_data: self.initial_data,
            initial_data_updated_at: self.initial_data_updated_at,
            on_success: None,
            on_error: self.on_error,
            on_settled: None,
        }
    }

    /// Set to `false` to stop observers from fetching automatically.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.defaults.enabled = Some(enabled);
        self
    }

    /// How long fetched data counts as fresh. `Duration::MAX` never goes stale.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.defaults.stale_time = Some(stale_time);
        self
    }

    /// How long the query stays cached once unobserved.
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.defaults.cache_time = Some(cache_time);
        self
    }

    /// Retry policy: a bool, a count, or a [`Retry`] value.
    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.defaults.retry = Some(retry.into());
        self
    }

    /// Delay between retries.
    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.defaults.retry_delay = Some(retry_delay);
        self
    }

    /// When fetches may run with respect to connectivity.
    pub fn network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.defaults.network_mode = Some(network_mode);
        self
    }

    /// Refetch every `interval` while observed.
    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.defaults.refetch_interval = Some(interval);
        self
    }

    /// Keep refetching on the interval while the window is unfocused.
    pub fn refetch_interval_in_background(mut self, in_background: bool) -> Self {
        self.defaults.refetch_interval_in_background = Some(in_background);
        self
    }

    /// Refetch when the window regains focus.
    pub fn refetch_on_window_focus(mut self, on: impl Into<RefetchOn>) -> Self {
        self.defaults.refetch_on_window_focus = Some(on.into());
        self
    }

    /// Refetch when connectivity returns.
    pub fn refetch_on_reconnect(mut self, on: impl Into<RefetchOn>) -> Self {
        self.defaults.refetch_on_reconnect = Some(on.into());
        self
    }

    /// Refetch when an observer mounts.
    pub fn refetch_on_mount(mut self, on: impl Into<RefetchOn>) -> Self {
        self.defaults.refetch_on_mount = Some(on.into());
        self
    }

    /// Set to `false` to keep a failed query in its error state on mount
    /// instead of retrying it.
    pub fn retry_on_mount(mut self, retry_on_mount: bool) -> Self {
        self.defaults.retry_on_mount = Some(retry_on_mount);
        self
    }

    /// Keep showing the previous key's data while a new key loads.
    pub fn keep_previous_data(mut self, keep: bool) -> Self {
        self.defaults.keep_previous_data = Some(keep);
        self
    }

    /// Which result changes notify listeners.
    pub fn notify_on_change_props(mut self, props: NotifyOnChangeProps) -> Self {
        self.defaults.notify_on_change_props = Some(props);
        self
    }

    /// Return terminal errors from [`QueryObserver::refetch`] and
    /// [`QueryObserver::result_or_error`] instead of only recording them.
    ///
    /// [`QueryObserver::refetch`]: crate::QueryObserver::refetch
    /// [`QueryObserver::result_or_error`]: crate::QueryObserver::result_or_error
    pub fn use_error_boundary(mut self, enabled: bool) -> Self {
        self.defaults.use_error_boundary = Some(enabled);
        self
    }

    /// Apply every set field of `defaults`, overriding what is already set.
    pub fn with_defaults(mut self, defaults: QueryDefaults) -> Self {
        self.defaults = defaults.or(&self.defaults);
        self
    }

    /// Data shown while the query has none. Not written to the cache.
    pub fn placeholder_data(mut self, data: T) -> Self {
        let data = Arc::new(data);
        self.placeholder_data = Some(Arc::new(move || Some(data.clone())));
        self
    }

    /// Placeholder data computed on demand.
    pub fn placeholder_data_with(mut self, f: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
        self.placeholder_data = Some(Arc::new(move || f().map(Arc::new)));
        self
    }

    /// Data a newly created query starts with. Written to the cache.
    pub fn initial_data(mut self, data: T) -> Self {
        let data = Arc::new(data);
        self.initial_data = Some(Arc::new(move || Some(data.clone())));
        self
    }

    /// Initial data computed when the query is created.
    pub fn initial_data_with(mut self, f: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
        self.initial_data = Some(Arc::new(move || f().map(Arc::new)));
        self
    }

    /// Timestamp (ms since the epoch) of the initial data. Defaults to now.
    pub fn initial_data_updated_at(mut self, updated_at: u64) -> Self {
        self.initial_data_updated_at = Some(updated_at);
        self
    }

    /// Hash keys with `f` instead of the default stable JSON hash.
    pub fn query_key_hash_fn(
        mut self,
        f: impl Fn(&QueryKey) -> Result<QueryHash, QueryError> + Send + Sync + 'static,
    ) -> Self {
        self.query_key_hash_fn = Some(Arc::new(f));
        self
    }

    /// Called with the (selected) data after each successful fetch.
    pub fn on_success(mut self, f: impl Fn(&Arc<D>) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Called after each failed fetch.
    pub fn on_error(mut self, f: impl Fn(&QueryError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called after each fetch, successful or not.
    pub fn on_settled(
        mut self,
        f: impl Fn(Option<&Arc<D>>, Option<&QueryError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }

    pub(crate) fn query_hash(&self) -> Result<QueryHash, QueryError> {
        hash_with(&self.key, self.query_key_hash_fn.as_ref())
    }

    /// The type-erased subset stored on the query.
    pub(crate) fn query_config(&self) -> QueryConfig {
        QueryConfig {
            query_fn: self.query_fn.clone(),
            retry: self.defaults.retry.clone(),
            retry_delay: self.defaults.retry_delay.clone(),
            network_mode: self.defaults.network_mode,
            cache_time: self.defaults.cache_time,
            initial_data: self.initial_data.clone().map(|initial| {
                Arc::new(move || initial().map(QueryData::from_arc))
                    as Arc<dyn Fn() -> Option<QueryData> + Send + Sync>
            }),
            initial_data_updated_at: self.initial_data_updated_at,
            query_key_hash_fn: self.query_key_hash_fn.clone(),
        }
    }
}

impl<T, D> QueryOptions<T, D> {
    pub(crate) fn is_enabled(&self) -> bool {
        self.defaults.enabled.unwrap_or(true)
    }

    pub(crate) fn stale_time_or_default(&self) -> Duration {
        self.defaults.stale_time.unwrap_or(Duration::ZERO)
    }

    pub(crate) fn refetch_on_mount_or_default(&self) -> RefetchOn {
        self.defaults.refetch_on_mount.unwrap_or_default()
    }

    pub(crate) fn refetch_on_window_focus_or_default(&self) -> RefetchOn {
        self.defaults.refetch_on_window_focus.unwrap_or_default()
    }

    pub(crate) fn refetch_on_reconnect_or_default(&self) -> RefetchOn {
        self.defaults.refetch_on_reconnect.unwrap_or_default()
    }

    pub(crate) fn keeps_previous_data(&self) -> bool {
        self.defaults.keep_previous_data.unwrap_or(false)
    }

    pub(crate) fn uses_error_boundary(&self) -> bool {
        self.defaults.use_error_boundary.unwrap_or(false)
    }

    pub(crate) fn notify_props(&self) -> NotifyOnChangeProps {
        self.defaults.notify_on_change_props.clone().unwrap_or_default()
    }
}

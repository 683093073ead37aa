//! Observers project one query's state into a typed result and notify
//! listeners when the parts they care about change.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::cache::QueryCacheEvent;
use crate::client::QueryClient;
use crate::data::{QueryData, QueryOutput};
use crate::key::QueryHash;
use crate::options::{NotifyOnChangeProps, ProvideFn, QueryOptions, RefetchOn, ResultProp, SelectFn};
use crate::query::{Action, FetchOptions, FetchStatus, Query, QueryFn, QueryFuture, QueryListener, QueryState, QueryStatus};
use crate::subscribable::{Listeners, Subscription};
use crate::timer::{self, Interval, Timeout};
use crate::QueryError;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

type RefetchFn = dyn Fn() -> BoxFuture<'static, Result<(), QueryError>> + Send + Sync;

#[derive(Clone)]
struct RefetchHandle(Arc<RefetchFn>);

/// What an observer exposes about its query.
pub struct QueryObserverResult<D> {
    /// Lifecycle status shown to the consumer.
    pub status: QueryStatus,
    /// Whether a fetch is running or paused.
    pub fetch_status: FetchStatus,
    /// The (selected) data, if any.
    pub data: Option<Arc<D>>,
    /// When the shown data was fetched (ms since the epoch).
    pub data_updated_at: u64,
    /// The last error, cleared by the next success.
    pub error: Option<QueryError>,
    /// When the last error was recorded (ms since the epoch).
    pub error_updated_at: u64,
    /// Failed attempts of the current or last fetch.
    pub failure_count: u32,
    /// How many times the query failed.
    pub error_update_count: u32,
    /// The query produced data or an error at least once.
    pub is_fetched: bool,
    /// ...since this observer was bound to it.
    pub is_fetched_after_mount: bool,
    /// A fetch is running.
    pub is_fetching: bool,
    /// Fetching while data (or an error) is already shown.
    pub is_refetching: bool,
    /// The first fetch failed, so there is no data.
    pub is_loading_error: bool,
    /// A refetch failed; `data` still holds the last success.
    pub is_refetch_error: bool,
    /// `data` comes from `placeholder_data` and is not cached.
    pub is_placeholder_data: bool,
    /// `data` belongs to the previously bound query (`keep_previous_data`).
    pub is_previous_data: bool,
    /// The data is older than `stale_time` or was invalidated.
    pub is_stale: bool,
    refetch: Option<RefetchHandle>,
}

impl<D> Clone for QueryObserverResult<D> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            fetch_status: self.fetch_status,
            data: self.data.clone(),
            data_updated_at: self.data_updated_at,
            error: self.error.clone(),
            error_updated_at: self.error_updated_at,
            failure_count: self.failure_count,
            error_update_count: self.error_update_count,
            is_fetched: self.is_fetched,
            is_fetched_after_mount: self.is_fetched_after_mount,
            is_fetching: self.is_fetching,
            is_refetching: self.is_refetching,
            is_loading_error: self.is_loading_error,
            is_refetch_error: self.is_refetch_error,
            is_placeholder_data: self.is_placeholder_data,
            is_previous_data: self.is_previous_data,
            is_stale: self.is_stale,
            refetch: self.refetch.clone(),
        }
    }
}

impl<D> fmt::Debug for QueryObserverResult<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserverResult")
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("is_stale", &self.is_stale)
            .finish_non_exhaustive()
    }
}

fn same_data<D>(a: &Option<Arc<D>>, b: &Option<Arc<D>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl<D> QueryObserverResult<D> {
    fn empty() -> Self {
        Self {
            status: QueryStatus::Idle,
            fetch_status: FetchStatus::Idle,
            data: None,
            data_updated_at: 0,
            error: None,
            error_updated_at: 0,
            failure_count: 0,
            error_update_count: 0,
            is_fetched: false,
            is_fetched_after_mount: false,
            is_fetching: false,
            is_refetching: false,
            is_loading_error: false,
            is_refetch_error: false,
            is_placeholder_data: false,
            is_previous_data: false,
            is_stale: true,
            refetch: None,
        }
    }

    /// Never fetched and not fetching.
    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    /// First fetch in progress.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// Data is available.
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// The last fetch failed.
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// A fetch waits for connectivity or focus.
    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// Refetch the query this result came from.
    pub fn refetch(&self) -> BoxFuture<'static, Result<(), QueryError>> {
        match &self.refetch {
            Some(handle) => (handle.0)(),
            None => future::ready(Ok(())).boxed(),
        }
    }

    /// Fields that differ from `prev`.
    pub fn changed_props(&self, prev: &Self) -> Vec<ResultProp> {
        let mut changed = Vec::new();
        if !same_data(&self.data, &prev.data) {
            changed.push(ResultProp::Data);
        }
        macro_rules! compare {
            ($($field:ident => $prop:ident),*) => {
                $(if self.$field != prev.$field {
                    changed.push(ResultProp::$prop);
                })*
            };
        }
        compare!(
            error => Error,
            status => Status,
            fetch_status => FetchStatus,
            data_updated_at => DataUpdatedAt,
            error_updated_at => ErrorUpdatedAt,
            failure_count => FailureCount,
            error_update_count => ErrorUpdateCount,
            is_fetched => IsFetched,
            is_fetched_after_mount => IsFetchedAfterMount,
            is_fetching => IsFetching,
            is_refetching => IsRefetching,
            is_loading_error => IsLoadingError,
            is_refetch_error => IsRefetchError,
            is_placeholder_data => IsPlaceholderData,
            is_previous_data => IsPreviousData,
            is_stale => IsStale
        );
        changed
    }
}

type TrackedProps = Arc<Mutex<HashSet<ResultProp, ahash::RandomState>>>;

/// A result that records which fields were read.
///
/// With [`NotifyOnChangeProps::Tracked`], the observer only notifies when one
/// of the fields read through any tracked result changes.
pub struct TrackedResult<D> {
    result: QueryObserverResult<D>,
    tracked: TrackedProps,
}

impl<D> fmt::Debug for TrackedResult<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TrackedResult").field(&self.result).finish()
    }
}

impl<D> TrackedResult<D> {
    fn track(&self, prop: ResultProp) {
        self.tracked.lock().insert(prop);
    }

    /// The (selected) data.
    pub fn data(&self) -> Option<&Arc<D>> {
        self.track(ResultProp::Data);
        self.result.data.as_ref()
    }

    /// The last error.
    pub fn error(&self) -> Option<&QueryError> {
        self.track(ResultProp::Error);
        self.result.error.as_ref()
    }

    /// The lifecycle status.
    pub fn status(&self) -> QueryStatus {
        self.track(ResultProp::Status);
        self.result.status
    }

    /// First fetch in progress.
    pub fn is_loading(&self) -> bool {
        self.status() == QueryStatus::Loading
    }

    /// Data is available.
    pub fn is_success(&self) -> bool {
        self.status() == QueryStatus::Success
    }

    /// The last fetch failed.
    pub fn is_error(&self) -> bool {
        self.status() == QueryStatus::Error
    }

    /// Whether a fetch is running or paused.
    pub fn fetch_status(&self) -> FetchStatus {
        self.track(ResultProp::FetchStatus);
        self.result.fetch_status
    }

    /// A fetch is running.
    pub fn is_fetching(&self) -> bool {
        self.track(ResultProp::IsFetching);
        self.result.is_fetching
    }

    /// A fetch is running while data is shown.
    pub fn is_refetching(&self) -> bool {
        self.track(ResultProp::IsRefetching);
        self.result.is_refetching
    }

    /// The data is stale.
    pub fn is_stale(&self) -> bool {
        self.track(ResultProp::IsStale);
        self.result.is_stale
    }

    /// When the data was fetched.
    pub fn data_updated_at(&self) -> u64 {
        self.track(ResultProp::DataUpdatedAt);
        self.result.data_updated_at
    }

    /// Failed attempts of the current or last fetch.
    pub fn failure_count(&self) -> u32 {
        self.track(ResultProp::FailureCount);
        self.result.failure_count
    }

    /// The query produced data or an error at least once.
    pub fn is_fetched(&self) -> bool {
        self.track(ResultProp::IsFetched);
        self.result.is_fetched
    }

    /// `data` comes from `placeholder_data`.
    pub fn is_placeholder_data(&self) -> bool {
        self.track(ResultProp::IsPlaceholderData);
        self.result.is_placeholder_data
    }

    /// `data` belongs to the previously observed key.
    pub fn is_previous_data(&self) -> bool {
        self.track(ResultProp::IsPreviousData);
        self.result.is_previous_data
    }

    /// The whole result, tracking every field.
    pub fn into_inner(self) -> QueryObserverResult<D> {
        self.tracked.lock().extend(ResultProp::ALL);
        self.result
    }
}

/// Which notifications a result update should produce.
#[derive(Clone, Copy)]
struct NotifyFlags {
    on_success: bool,
    on_error: bool,
    listeners: bool,
}

impl Default for NotifyFlags {
    fn default() -> Self {
        Self {
            on_success: false,
            on_error: false,
            listeners: true,
        }
    }
}

struct SelectMemo<T, D> {
    source: QueryData,
    select: SelectFn<T, D>,
    result: Arc<D>,
}

impl<T, D> Clone for SelectMemo<T, D> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            select: self.select.clone(),
            result: self.result.clone(),
        }
    }
}

/// Memoized decode, select and placeholder outputs.
struct ResultMemos<T, D> {
    decoded: Option<(QueryData, Arc<T>)>,
    select: Option<SelectMemo<T, D>>,
    placeholder: Option<ProvideFn<T>>,
}

impl<T, D> Clone for ResultMemos<T, D> {
    fn clone(&self) -> Self {
        Self {
            decoded: self.decoded.clone(),
            select: self.select.clone(),
            placeholder: self.placeholder.clone(),
        }
    }
}

impl<T, D> Default for ResultMemos<T, D> {
    fn default() -> Self {
        Self {
            decoded: None,
            select: None,
            placeholder: None,
        }
    }
}

/// Everything [`create_result`] reads from the observer, copied out so that
/// `select`, placeholder data and decoding run without the state lock.
struct ResultInputs<T, D> {
    options: QueryOptions<T, D>,
    query_initial_state: QueryState,
    previous_success: Option<QueryObserverResult<D>>,
    current_placeholder: Option<Option<Arc<D>>>,
    memos: ResultMemos<T, D>,
}

struct ObserverState<T, D> {
    options: QueryOptions<T, D>,
    query: Weak<Query>,
    query_initial_state: QueryState,
    previous_query_result: Option<QueryObserverResult<D>>,
    current_result: QueryObserverResult<D>,
    memos: ResultMemos<T, D>,
    stale_timeout: Option<Timeout>,
    refetch_interval: Option<Interval>,
    current_interval: Option<Duration>,
}

fn same_fn<F: ?Sized>(a: &Arc<F>, b: &Arc<F>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn decode<T: QueryOutput>(
    memo: &mut Option<(QueryData, Arc<T>)>,
    raw: &QueryData,
    hash: &QueryHash,
) -> Result<Arc<T>, QueryError> {
    if let Some((source, value)) = memo.as_ref() {
        if source.ptr_eq(raw) {
            return Ok(value.clone());
        }
    }
    let value = raw.downcast::<T>(hash)?;
    *memo = Some((raw.clone(), value.clone()));
    Ok(value)
}

fn create_result<T: QueryOutput, D>(
    inputs: &mut ResultInputs<T, D>,
    query: &Query,
    refetch: &RefetchHandle,
) -> QueryObserverResult<D> {
    let ResultInputs {
        options,
        query_initial_state,
        previous_success,
        current_placeholder,
        memos,
    } = inputs;
    let state = query.state();

    let mut status = state.status;
    let mut data_updated_at = state.data_updated_at;
    let mut error = state.error.clone();
    let mut data = None;
    let mut is_previous_data = false;
    let mut is_placeholder_data = false;

    match (previous_success.as_ref(), &state.data) {
        (Some(previous), _)
            if options.keeps_previous_data()
                && state.data_update_count == 0
                && status != QueryStatus::Error =>
        {
            data = previous.data.clone();
            data_updated_at = previous.data_updated_at;
            status = previous.status;
            is_previous_data = true;
        }
        (_, Some(raw)) => match decode::<T>(&mut memos.decoded, raw, query.hash()) {
            Ok(value) => {
                let reuse = memos
                    .select
                    .as_ref()
                    .filter(|memo| memo.source.ptr_eq(raw) && same_fn(&memo.select, &options.select))
                    .map(|memo| memo.result.clone());
                data = Some(match reuse {
                    Some(result) => result,
                    None => {
                        let result = (options.select)(&value);
                        memos.select = Some(SelectMemo {
                            source: raw.clone(),
                            select: options.select.clone(),
                            result: result.clone(),
                        });
                        result
                    }
                });
            }
            Err(err) => {
                tracing::warn!(query_hash = %query.hash(), %err, "cached data cannot be read");
                status = QueryStatus::Error;
                error = Some(err);
            }
        },
        _ => {}
    }

    if data.is_none() && matches!(status, QueryStatus::Loading | QueryStatus::Idle) {
        if let Some(placeholder) = &options.placeholder_data {
            let memoized = current_placeholder.is_some()
                && memos.placeholder.as_ref().is_some_and(|memo| same_fn(memo, placeholder));
            let value = match current_placeholder {
                Some(current) if memoized => current.clone(),
                _ => placeholder().map(|value| (options.select)(&value)),
            };
            if let Some(value) = value {
                memos.placeholder = Some(placeholder.clone());
                status = QueryStatus::Success;
                data = Some(value);
                is_placeholder_data = true;
            }
        }
    }

    let is_fetching = state.fetch_status == FetchStatus::Fetching;
    QueryObserverResult {
        status,
        fetch_status: state.fetch_status,
        data,
        data_updated_at,
        error,
        error_updated_at: state.error_updated_at,
        failure_count: state.fetch_failure_count,
        error_update_count: state.error_update_count,
        is_fetched: state.data_update_count > 0 || state.error_update_count > 0,
        is_fetched_after_mount: state.data_update_count > query_initial_state.data_update_count
            || state.error_update_count > query_initial_state.error_update_count,
        is_fetching,
        is_refetching: is_fetching && status != QueryStatus::Loading,
        is_loading_error: status == QueryStatus::Error && state.data_updated_at == 0,
        is_refetch_error: status == QueryStatus::Error && state.data_updated_at != 0,
        is_placeholder_data,
        is_previous_data,
        is_stale: query.is_stale_by_time(options.stale_time_or_default()),
        refetch: Some(refetch.clone()),
    }
}

impl<T: QueryOutput, D: Send + Sync + 'static> ObserverState<T, D> {
    fn result_inputs(&self) -> ResultInputs<T, D> {
        ResultInputs {
            options: self.options.clone(),
            query_initial_state: self.query_initial_state.clone(),
            previous_success: self
                .previous_query_result
                .clone()
                .filter(|previous| previous.is_success()),
            current_placeholder: self
                .current_result
                .is_placeholder_data
                .then(|| self.current_result.data.clone()),
            memos: self.memos.clone(),
        }
    }

    fn should_notify_listeners(
        &self,
        next: &QueryObserverResult<D>,
        prev: &QueryObserverResult<D>,
        tracked: &TrackedProps,
    ) -> bool {
        let changed = next.changed_props(prev);
        match self.options.notify_props() {
            NotifyOnChangeProps::All => true,
            NotifyOnChangeProps::Tracked => {
                let tracked = tracked.lock();
                tracked.is_empty() || changed.iter().any(|prop| tracked.contains(prop))
            }
            NotifyOnChangeProps::Props(props) => changed.iter().any(|prop| props.contains(prop)),
        }
    }
}

fn should_load_on_mount<T, D>(query: &Query, options: &QueryOptions<T, D>) -> bool {
    let state = query.state();
    options.is_enabled()
        && state.data_updated_at == 0
        && !(state.status == QueryStatus::Error && options.defaults.retry_on_mount == Some(false))
}

fn should_fetch_on_mount<T, D>(query: &Query, options: &QueryOptions<T, D>) -> bool {
    should_load_on_mount(query, options)
        || (query.state().data_updated_at > 0
            && should_fetch_on(query, options, options.refetch_on_mount_or_default()))
}

fn should_fetch_on<T, D>(query: &Query, options: &QueryOptions<T, D>, on: RefetchOn) -> bool {
    options.is_enabled()
        && match on {
            RefetchOn::Always => true,
            RefetchOn::IfStale => query.is_stale_by_time(options.stale_time_or_default()),
            RefetchOn::Never => false,
        }
}

fn should_fetch_optionally<T, D>(
    query: &Arc<Query>,
    prev_query: Option<&Arc<Query>>,
    options: &QueryOptions<T, D>,
    prev_options: &QueryOptions<T, D>,
) -> bool {
    let query_changed = prev_query.map_or(true, |prev| !Arc::ptr_eq(prev, query));
    options.is_enabled()
        && (query_changed || !prev_options.is_enabled())
        && query.is_stale_by_time(options.stale_time_or_default())
}

type ResultListener<D> = dyn Fn(&QueryObserverResult<D>) + Send + Sync;

struct ObserverInner<T, D> {
    id: u64,
    me: Weak<ObserverInner<T, D>>,
    client: QueryClient,
    listeners: Arc<Listeners<ResultListener<D>>>,
    tracked: TrackedProps,
    refetch: RefetchHandle,
    state: Mutex<ObserverState<T, D>>,
}

impl<T, D> Drop for ObserverInner<T, D> {
    fn drop(&mut self) {
        if let Some(query) = self.state.get_mut().query.upgrade() {
            query.remove_observer(self.id);
        }
    }
}

impl<T: QueryOutput, D: Send + Sync + 'static> ObserverInner<T, D> {
    fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    fn as_listener(&self) -> Weak<dyn QueryListener> {
        self.me.clone()
    }

    fn current_query(&self) -> Option<Arc<Query>> {
        self.state.lock().query.upgrade()
    }

    /// Rebind to the query matching the current options if it changed.
    fn update_query(&self) -> Result<Arc<Query>, QueryError> {
        let options = self.state.lock().options.clone();
        let query = self.client.build_query(&options)?;
        let prev = {
            let mut state = self.state.lock();
            let prev = state.query.upgrade();
            if prev.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &query)) {
                return Ok(query);
            }
            state.query = Arc::downgrade(&query);
            state.query_initial_state = query.state();
            state.previous_query_result = Some(state.current_result.clone());
            prev
        };
        tracing::trace!(query_hash = %query.hash(), "observer bound to query");
        if self.has_listeners() {
            if let Some(prev) = prev {
                prev.remove_observer(self.id);
            }
            query.add_observer(self.id, self.as_listener());
        }
        Ok(query)
    }

    fn execute_fetch(&self, options: FetchOptions) -> QueryFuture {
        let query = match self.update_query() {
            Ok(query) => query,
            Err(err) => return future::ready(Err(err)).boxed().shared(),
        };
        let config = self.state.lock().options.query_config();
        query.fetch_with(Some(config), options)
    }

    fn on_subscribe(&self) {
        let query = match self.update_query() {
            Ok(query) => query,
            Err(err) => {
                tracing::warn!(%err, "observer cannot bind to its query");
                return;
            }
        };
        query.add_observer(self.id, self.as_listener());
        let fetch = should_fetch_on_mount(&query, &self.state.lock().options);
        if fetch {
            drop(self.execute_fetch(FetchOptions::default()));
        }
        self.update_timers();
    }

    fn destroy(&self) {
        let query = {
            let mut state = self.state.lock();
            state.stale_timeout = None;
            state.refetch_interval = None;
            state.query.upgrade()
        };
        if let Some(query) = query {
            query.remove_observer(self.id);
        }
    }

    fn update_result(&self, flags: NotifyFlags) {
        let Some(query) = self.current_query() else {
            return;
        };
        let mut inputs = self.state.lock().result_inputs();
        let next = create_result(&mut inputs, &query, &self.refetch);
        let (result, notify_listeners, options) = {
            let mut state = self.state.lock();
            state.memos = inputs.memos;
            let prev = &state.current_result;
            if next.changed_props(prev).is_empty() {
                return;
            }
            let notify_listeners =
                flags.listeners && state.should_notify_listeners(&next, prev, &self.tracked);
            state.current_result = next.clone();
            (next, notify_listeners, state.options.clone())
        };
        self.notify(&query, &result, flags, notify_listeners, &options);
    }

    fn notify(
        &self,
        query: &Arc<Query>,
        result: &QueryObserverResult<D>,
        flags: NotifyFlags,
        notify_listeners: bool,
        options: &QueryOptions<T, D>,
    ) {
        let notify = self.client.cache().notify_manager().clone();
        notify.batch(|| {
            if flags.on_success {
                if let Some(data) = &result.data {
                    if let Some(on_success) = &options.on_success {
                        on_success(data);
                    }
                    if let Some(on_settled) = &options.on_settled {
                        on_settled(Some(data), None);
                    }
                }
            } else if flags.on_error {
                if let Some(error) = &result.error {
                    if let Some(on_error) = &options.on_error {
                        on_error(error);
                    }
                    if let Some(on_settled) = &options.on_settled {
                        on_settled(None, Some(error));
                    }
                }
            }
            if notify_listeners {
                let me = self.me.clone();
                notify.schedule_keyed(self.id, move || {
                    if let Some(inner) = me.upgrade() {
                        inner.notify_listeners();
                    }
                });
            }
            self.client
                .cache()
                .emit(QueryCacheEvent::ObserverResultsUpdated {
                    query: query.clone(),
                });
        });
    }

    /// Deliver the latest result to every listener.
    fn notify_listeners(&self) {
        let result = self.state.lock().current_result.clone();
        for listener in self.listeners.snapshot() {
            listener(&result);
        }
    }

    fn update_timers(&self) {
        self.update_stale_timeout();
        let interval = self.state.lock().options.defaults.refetch_interval;
        self.update_refetch_interval(interval);
    }

    fn update_stale_timeout(&self) {
        let mut state = self.state.lock();
        state.stale_timeout = None;
        let stale_time = state.options.stale_time_or_default();
        if state.current_result.is_stale || !timer::is_finite(stale_time) {
            return;
        }
        // Fire just after the data turns stale.
        let delay = timer::time_until_stale(state.current_result.data_updated_at, stale_time) + 1;
        let me = self.me.clone();
        state.stale_timeout = Timeout::schedule(Duration::from_millis(delay), move || {
            if let Some(inner) = me.upgrade() {
                let is_stale = inner.state.lock().current_result.is_stale;
                if !is_stale {
                    inner.update_result(NotifyFlags::default());
                }
            }
        });
    }

    fn update_refetch_interval(&self, interval: Option<Duration>) {
        let mut state = self.state.lock();
        state.refetch_interval = None;
        state.current_interval = interval;
        let Some(period) = interval else {
            return;
        };
        if !state.options.is_enabled() {
            return;
        }
        let in_background = state
            .options
            .defaults
            .refetch_interval_in_background
            .unwrap_or(false);
        let focus = self.client.cache().focus_manager().clone();
        let me = self.me.clone();
        state.refetch_interval = Interval::schedule(period, move || {
            if let Some(inner) = me.upgrade() {
                if in_background || focus.is_focused() {
                    tracing::trace!("interval refetch");
                    drop(inner.execute_fetch(FetchOptions::default()));
                }
            }
        });
    }
}

impl<T: QueryOutput, D: Send + Sync + 'static> QueryListener for ObserverInner<T, D> {
    fn on_query_update(&self, action: &Action) {
        let flags = match action {
            Action::Success { manual, .. } => NotifyFlags {
                on_success: !manual,
                ..NotifyFlags::default()
            },
            Action::Error { error, .. } if !error.is_cancelled() => NotifyFlags {
                on_error: true,
                ..NotifyFlags::default()
            },
            _ => NotifyFlags::default(),
        };
        self.update_result(flags);
        if self.has_listeners() {
            self.update_timers();
        }
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().options.is_enabled()
    }

    fn is_result_stale(&self) -> bool {
        self.state.lock().current_result.is_stale
    }

    fn should_fetch_on_window_focus(&self) -> bool {
        let state = self.state.lock();
        state.query.upgrade().is_some_and(|query| {
            should_fetch_on(&query, &state.options, state.options.refetch_on_window_focus_or_default())
        })
    }

    fn should_fetch_on_reconnect(&self) -> bool {
        let state = self.state.lock();
        state.query.upgrade().is_some_and(|query| {
            should_fetch_on(&query, &state.options, state.options.refetch_on_reconnect_or_default())
        })
    }

    fn refetch_from_signal(&self) {
        drop(self.execute_fetch(FetchOptions::default()));
    }

    fn query_fn(&self) -> Option<QueryFn> {
        self.state.lock().options.query_fn.clone()
    }
}

/// Watches one query (selected by the options' key) on behalf of a consumer.
///
/// The observer starts working when it gets its first subscriber: it
/// registers with the query, fetches if the data is missing or stale, and
/// arms its stale and refetch-interval timers. It stops when the last
/// [`Subscription`] is dropped.
///
/// ```ignore
/// let observer = QueryObserver::new(&client, QueryOptions::new("todos").query_fn(fetch_todos))?;
/// let _sub = observer.subscribe(|result| println!("{:?}", result.data));
/// ```
pub struct QueryObserver<T, D = T> {
    inner: Arc<ObserverInner<T, D>>,
}

impl<T, D> Clone for QueryObserver<T, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, D: 'static> fmt::Debug for QueryObserver<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("id", &self.inner.id)
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl<T: QueryOutput, D: Send + Sync + 'static> QueryObserver<T, D> {
    /// Create an observer and bind it to its query, creating the query if
    /// needed.
    ///
    /// Fails if the key cannot be hashed or the cached data is not a `T`.
    pub fn new(client: &QueryClient, options: QueryOptions<T, D>) -> Result<Self, QueryError> {
        let options = client.defaulted(options);
        let query = client.build_query(&options)?;
        let inner = Arc::new_cyclic(|me: &Weak<ObserverInner<T, D>>| {
            let weak = me.clone();
            let refetch = RefetchHandle(Arc::new(move || match weak.upgrade() {
                Some(inner) => inner
                    .execute_fetch(FetchOptions::default())
                    .map(|outcome| outcome.map(drop))
                    .boxed(),
                None => future::ready(Ok(())).boxed(),
            }));
            ObserverInner {
                id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
                me: me.clone(),
                client: client.clone(),
                listeners: Arc::default(),
                tracked: TrackedProps::default(),
                refetch,
                state: Mutex::new(ObserverState {
                    options,
                    query: Arc::downgrade(&query),
                    query_initial_state: query.state(),
                    previous_query_result: None,
                    current_result: QueryObserverResult::empty(),
                    memos: ResultMemos::default(),
                    stale_timeout: None,
                    refetch_interval: None,
                    current_interval: None,
                }),
            }
        });
        let mut inputs = inner.state.lock().result_inputs();
        let result = create_result(&mut inputs, &query, &inner.refetch);
        {
            let mut state = inner.state.lock();
            state.memos = inputs.memos;
            state.current_result = result;
        }
        Ok(Self { inner })
    }

    /// Register `listener`. The first subscriber mounts the observer.
    ///
    /// The subscription keeps the observer alive until it is dropped.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryObserverResult<D>) + Send + Sync + 'static,
    ) -> Subscription {
        let (slot, first) = self.inner.listeners.insert_first(Arc::new(listener));
        if first {
            self.inner.on_subscribe();
        }
        let inner = self.inner.clone();
        Subscription::new(move || {
            if inner.listeners.remove_last(slot) {
                inner.destroy();
            }
        })
    }

    /// Count as an observer of the query without receiving notifications.
    pub fn subscribe_silent(&self) -> Subscription {
        self.subscribe(|_| {})
    }

    /// Whether any subscription is alive.
    pub fn has_listeners(&self) -> bool {
        self.inner.has_listeners()
    }

    /// The latest result, without tracking reads.
    pub fn get_current_result(&self) -> QueryObserverResult<D> {
        self.inner.state.lock().current_result.clone()
    }

    /// The current result, recording which fields the caller reads.
    pub fn get_tracked_current_result(&self) -> TrackedResult<D> {
        let (result, error_boundary) = {
            let state = self.inner.state.lock();
            (state.current_result.clone(), state.options.uses_error_boundary())
        };
        if error_boundary {
            self.inner.tracked.lock().insert(ResultProp::Error);
        }
        TrackedResult {
            result,
            tracked: self.inner.tracked.clone(),
        }
    }

    /// The current result, or its error when `use_error_boundary` is set and
    /// the query failed.
    pub fn result_or_error(&self) -> Result<QueryObserverResult<D>, QueryError> {
        let state = self.inner.state.lock();
        let result = state.current_result.clone();
        match &result.error {
            Some(error) if result.is_error() && state.options.uses_error_boundary() => Err(error.clone()),
            _ => Ok(result),
        }
    }

    /// The observer's options, merged with client and per-key defaults.
    pub fn options(&self) -> QueryOptions<T, D> {
        self.inner.state.lock().options.clone()
    }

    /// Replace the options.
    ///
    /// Rebinds to another query if the key changed, fetches if that or
    /// enabling the observer calls for it, and re-arms the timers.
    pub fn set_options(&self, options: QueryOptions<T, D>) -> Result<(), QueryError> {
        let inner = &self.inner;
        let options = inner.client.defaulted(options);
        let (prev_options, prev_query) = {
            let mut state = inner.state.lock();
            let prev_options = std::mem::replace(&mut state.options, options.clone());
            (prev_options, state.query.upgrade())
        };
        let query = match inner.update_query() {
            Ok(query) => query,
            Err(err) => {
                inner.state.lock().options = prev_options;
                return Err(err);
            }
        };

        let mounted = inner.has_listeners();
        if mounted && should_fetch_optionally(&query, prev_query.as_ref(), &options, &prev_options) {
            drop(inner.execute_fetch(FetchOptions::default()));
        }
        inner.update_result(NotifyFlags::default());

        let query_changed = prev_query.map_or(true, |prev| !Arc::ptr_eq(&prev, &query));
        let enabled_changed = options.is_enabled() != prev_options.is_enabled();
        if mounted
            && (query_changed
                || enabled_changed
                || options.stale_time_or_default() != prev_options.stale_time_or_default())
        {
            inner.update_stale_timeout();
        }
        let interval = options.defaults.refetch_interval;
        let interval_changed = interval != inner.state.lock().current_interval;
        if mounted && (query_changed || enabled_changed || interval_changed) {
            inner.update_refetch_interval(interval);
        }
        Ok(())
    }

    /// Fetch regardless of staleness and return the updated result.
    ///
    /// With `use_error_boundary`, a terminal fetch error is returned as `Err`.
    pub async fn refetch(&self) -> Result<QueryObserverResult<D>, QueryError> {
        self.fetch(FetchOptions::default()).await
    }

    /// Fetch with explicit [`FetchOptions`] and return the updated result.
    pub async fn fetch(&self, options: FetchOptions) -> Result<QueryObserverResult<D>, QueryError> {
        let outcome = self.inner.execute_fetch(options).await;
        self.inner.update_result(NotifyFlags::default());
        match outcome {
            Err(err) if !err.is_cancelled() && self.options().uses_error_boundary() => Err(err),
            _ => Ok(self.get_current_result()),
        }
    }

    /// Resolve once the query has settled, counting as an observer meanwhile.
    pub async fn suspend(&self) -> Result<QueryObserverResult<D>, QueryError> {
        let _mounted = self.subscribe_silent();
        if self.get_current_result().is_loading() {
            self.refetch().await?;
        }
        self.result_or_error()
    }

    /// Remove the bound query from the cache.
    pub fn remove(&self) {
        if let Some(query) = self.inner.current_query() {
            self.inner.client.cache().remove(&query);
        }
    }

    /// The query this observer is bound to, if it is still cached.
    pub fn current_query(&self) -> Option<Arc<Query>> {
        self.inner.current_query()
    }

    pub(crate) fn downgrade(&self) -> WeakObserver<T, D> {
        WeakObserver(Arc::downgrade(&self.inner))
    }

    pub(crate) fn query_state(&self) -> Option<QueryState> {
        self.inner.current_query().map(|query| query.state())
    }

    /// The cached, unselected data.
    pub(crate) fn raw_data(&self) -> Option<Arc<T>> {
        let query = self.inner.current_query()?;
        let raw = query.state().data?;
        let mut memo = self.inner.state.lock().memos.decoded.clone();
        let value = decode::<T>(&mut memo, &raw, query.hash()).ok()?;
        self.inner.state.lock().memos.decoded = memo;
        Some(value)
    }
}

/// Non-owning handle to a [`QueryObserver`].
pub(crate) struct WeakObserver<T, D>(Weak<ObserverInner<T, D>>);

impl<T, D> WeakObserver<T, D> {
    /// The observer, if it is still alive.
    pub fn upgrade(&self) -> Option<QueryObserver<T, D>> {
        self.0.upgrade().map(|inner| QueryObserver { inner })
    }
}

//! The client: configuration defaults plus imperative cache operations.

use std::fmt;
use std::sync::Arc;

use futures::future;
use parking_lot::{Mutex, RwLock};

use crate::cache::{QueryCache, QueryFilters, QueryTypeFilter};
use crate::data::{QueryData, QueryOutput};
use crate::key::{partial_match_key, QueryKey};
use crate::options::{DefaultOptions, QueryDefaults, QueryOptions};
use crate::query::{FetchOptions, Query, QueryState};
use crate::retryer::{CancelOptions, Retry};
use crate::subscribable::Subscription;
use crate::QueryError;

/// Options for [`QueryClient::refetch_queries`].
#[derive(Clone, Copy, Debug)]
pub struct RefetchOptions {
    /// Restart fetches already running instead of joining them.
    pub cancel_refetch: bool,
    /// Return the first fetch error instead of swallowing it.
    pub throw_on_error: bool,
}

impl Default for RefetchOptions {
    fn default() -> Self {
        Self {
            cancel_refetch: true,
            throw_on_error: false,
        }
    }
}

/// Options for [`QueryClient::invalidate_queries`].
#[derive(Clone, Copy, Debug)]
pub struct InvalidateOptions {
    /// Refetch matching queries with an enabled observer.
    pub refetch_active: bool,
    /// Refetch matching queries without one.
    pub refetch_inactive: bool,
    /// How the selected queries are refetched.
    pub refetch: RefetchOptions,
}

impl Default for InvalidateOptions {
    fn default() -> Self {
        Self {
            refetch_active: true,
            refetch_inactive: false,
            refetch: RefetchOptions::default(),
        }
    }
}

#[derive(Default)]
struct Mounted {
    count: usize,
    subscriptions: Vec<Subscription>,
}

struct ClientInner {
    cache: QueryCache,
    default_options: RwLock<DefaultOptions>,
    query_defaults: RwLock<Vec<(QueryKey, QueryDefaults)>>,
    mounted: Mutex<Mounted>,
}

/// Entry point for reading and writing the cache.
///
/// This is cheap to clone, so you can pass it around by just cloning it.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<QueryClient>();
    assert_sync::<QueryClient>();
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

impl QueryClient {
    /// A client over a new, empty cache.
    pub fn new() -> Self {
        QueryClientBuilder::default().build()
    }

    /// Configure a client.
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::default()
    }

    /// The underlying cache.
    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    /// Start forwarding focus and connectivity signals to the cache.
    ///
    /// Mounting is counted; the signals stay connected until the matching
    /// number of [`unmount`](Self::unmount) calls.
    pub fn mount(&self) {
        let mut mounted = self.inner.mounted.lock();
        mounted.count += 1;
        if mounted.count > 1 {
            return;
        }
        let cache = self.cache().downgrade();
        let on_focus = self.cache().focus_manager().subscribe(move |focused| {
            if let Some(cache) = focused.then(|| QueryCache::upgrade(&cache)).flatten() {
                cache.on_focus();
            }
        });
        let cache = self.cache().downgrade();
        let on_online = self.cache().online_manager().subscribe(move |online| {
            if let Some(cache) = online.then(|| QueryCache::upgrade(&cache)).flatten() {
                cache.on_online();
            }
        });
        mounted.subscriptions = vec![on_focus, on_online];
        tracing::debug!("query client mounted");
    }

    /// Undo one [`mount`](Self::mount). The last call stops forwarding signals.
    pub fn unmount(&self) {
        let subscriptions = {
            let mut mounted = self.inner.mounted.lock();
            mounted.count = mounted.count.saturating_sub(1);
            if mounted.count > 0 {
                return;
            }
            std::mem::take(&mut mounted.subscriptions)
        };
        drop(subscriptions);
        tracing::debug!("query client unmounted");
    }

    /// Whether [`mount`](Self::mount) is in effect.
    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.lock().count > 0
    }

    /// Return the cached data if it is fresh, otherwise fetch it.
    ///
    /// Unlike observers, this does not retry unless the options say so.
    pub async fn fetch_query<T: QueryOutput>(
        &self,
        options: QueryOptions<T>,
    ) -> Result<Arc<T>, QueryError> {
        let options = self.defaulted(options);
        let query = self.build_query(&options)?;
        if !query.is_stale_by_time(options.stale_time_or_default()) {
            if let Some(data) = query.state().data {
                return data.downcast::<T>(query.hash());
            }
        }
        let data = query
            .fetch_with(
                Some(options.query_config()),
                FetchOptions {
                    retry: options.defaults.retry.is_none().then_some(Retry::Never),
                    ..FetchOptions::default()
                },
            )
            .await?;
        data.downcast::<T>(query.hash())
    }

    /// Like [`fetch_query`](Self::fetch_query), but only warms the cache.
    pub async fn prefetch_query<T: QueryOutput>(&self, options: QueryOptions<T>) {
        let key = options.key().clone();
        if let Err(err) = self.fetch_query(options).await {
            tracing::debug!(query_key = %key, %err, "prefetch failed");
        }
    }

    /// The cached data for exactly `key`.
    pub fn get_query_data<T: QueryOutput>(
        &self,
        key: impl Into<QueryKey>,
    ) -> Result<Option<Arc<T>>, QueryError> {
        match self.cache().find(&key.into()) {
            Some(query) => query
                .state()
                .data
                .map(|data| data.downcast::<T>(query.hash()))
                .transpose(),
            None => Ok(None),
        }
    }

    /// A snapshot of the state of the query with exactly this key.
    pub fn get_query_state(&self, key: impl Into<QueryKey>) -> Option<QueryState> {
        self.cache().find(&key.into()).map(|query| query.state())
    }

    /// Write data for `key` directly, creating the query if needed.
    ///
    /// `updater` receives the current data, if any.
    pub fn set_query_data<T: QueryOutput>(
        &self,
        key: impl Into<QueryKey>,
        updater: impl FnOnce(Option<Arc<T>>) -> T,
    ) -> Result<Arc<T>, QueryError> {
        self.set_query_data_at(key, updater, None)
    }

    /// [`set_query_data`](Self::set_query_data) with an explicit update
    /// timestamp in milliseconds since the epoch.
    pub fn set_query_data_at<T: QueryOutput>(
        &self,
        key: impl Into<QueryKey>,
        updater: impl FnOnce(Option<Arc<T>>) -> T,
        updated_at: Option<u64>,
    ) -> Result<Arc<T>, QueryError> {
        let options = self.defaulted(QueryOptions::<T>::new(key));
        let query = self.build_query(&options)?;
        let previous = query
            .state()
            .data
            .map(|data| data.downcast::<T>(query.hash()))
            .transpose()?;
        let data = Arc::new(updater(previous));
        query.set_data(QueryData::from_arc(data.clone()), updated_at);
        Ok(data)
    }

    /// Mark matching queries stale and refetch the ones selected by `options`.
    pub async fn invalidate_queries(
        &self,
        filters: QueryFilters,
        options: InvalidateOptions,
    ) -> Result<(), QueryError> {
        let queries = self.cache().find_all(&filters);
        tracing::debug!(count = queries.len(), "invalidating queries");
        self.cache().notify_manager().batch(|| {
            for query in &queries {
                query.invalidate();
            }
        });
        let kind = match (options.refetch_active, options.refetch_inactive) {
            (true, true) => QueryTypeFilter::All,
            (true, false) => QueryTypeFilter::Active,
            (false, true) => QueryTypeFilter::Inactive,
            (false, false) => return Ok(()),
        };
        let filters = QueryFilters { kind, ..filters };
        self.refetch_queries(filters, options.refetch).await
    }

    /// Fetch every matching query and wait for all of them.
    pub async fn refetch_queries(
        &self,
        filters: QueryFilters,
        options: RefetchOptions,
    ) -> Result<(), QueryError> {
        let fetches: Vec<_> = self.cache().notify_manager().batch(|| {
            self.cache()
                .find_all(&filters)
                .iter()
                .map(|query| {
                    query.fetch(FetchOptions {
                        cancel_refetch: options.cancel_refetch,
                        ..FetchOptions::default()
                    })
                })
                .collect()
        });
        let results = future::join_all(fetches).await;
        if options.throw_on_error {
            for result in results {
                result?;
            }
        }
        Ok(())
    }

    /// Cancel the running fetches of matching queries.
    pub fn cancel_queries(&self, filters: QueryFilters, options: CancelOptions) {
        self.cache().notify_manager().batch(|| {
            for query in self.cache().find_all(&filters) {
                query.cancel(options);
            }
        });
    }

    /// Remove matching queries from the cache.
    pub fn remove_queries(&self, filters: QueryFilters) {
        self.cache().notify_manager().batch(|| {
            for query in self.cache().find_all(&filters) {
                self.cache().remove(&query);
            }
        });
    }

    /// Reset matching queries to their initial state, then refetch the
    /// active ones.
    pub async fn reset_queries(
        &self,
        filters: QueryFilters,
        options: RefetchOptions,
    ) -> Result<(), QueryError> {
        self.cache().notify_manager().batch(|| {
            for query in self.cache().find_all(&filters) {
                query.reset();
            }
        });
        let filters = QueryFilters {
            kind: QueryTypeFilter::Active,
            ..filters
        };
        self.refetch_queries(filters, options).await
    }

    /// Number of matching queries currently fetching.
    pub fn is_fetching(&self, filters: QueryFilters) -> usize {
        self.cache().find_all(&filters.fetching(true)).len()
    }

    /// Remove every query.
    pub fn clear(&self) {
        self.cache().clear();
    }

    /// The client-wide defaults.
    pub fn default_options(&self) -> DefaultOptions {
        self.inner.default_options.read().clone()
    }

    /// Replace the client-wide defaults. Existing observers keep their merged options.
    pub fn set_default_options(&self, options: DefaultOptions) {
        *self.inner.default_options.write() = options;
    }

    /// Defaults for every query whose key starts with `key`.
    ///
    /// Replaces defaults registered for an equal key.
    pub fn set_query_defaults(&self, key: impl Into<QueryKey>, defaults: QueryDefaults) {
        let key = key.into();
        let mut registered = self.inner.query_defaults.write();
        match registered.iter_mut().find(|(existing, _)| existing.hash() == key.hash()) {
            Some((_, existing)) => *existing = defaults,
            None => registered.push((key, defaults)),
        }
    }

    /// The first registered defaults matching `key`.
    pub fn get_query_defaults(&self, key: &QueryKey) -> Option<QueryDefaults> {
        self.inner
            .query_defaults
            .read()
            .iter()
            .find(|(registered, _)| partial_match_key(key, registered))
            .map(|(_, defaults)| defaults.clone())
    }

    /// Fill unset options from per-key defaults, then client defaults.
    pub(crate) fn defaulted<T, D>(&self, mut options: QueryOptions<T, D>) -> QueryOptions<T, D> {
        let mut defaults = std::mem::take(&mut options.defaults);
        if let Some(key_defaults) = self.get_query_defaults(&options.key) {
            defaults = defaults.or(&key_defaults);
        }
        options.defaults = defaults.or(&self.inner.default_options.read().queries);
        options
    }

    /// Get or create the query for `options`, checking the cached data type.
    pub(crate) fn build_query<T: QueryOutput, D>(
        &self,
        options: &QueryOptions<T, D>,
    ) -> Result<Arc<Query>, QueryError> {
        let hash = options.query_hash()?;
        let query = self
            .cache()
            .build(options.key.clone(), hash, options.query_config(), None);
        match query.state().data {
            Some(data) if !data.accepts::<T>() => Err(QueryError::TypeMismatch {
                query_hash: query.hash().clone(),
                expected: std::any::type_name::<T>(),
            }),
            _ => Ok(query),
        }
    }
}

/// Builder for [`QueryClient`].
#[derive(Default)]
pub struct QueryClientBuilder {
    cache: Option<QueryCache>,
    default_options: DefaultOptions,
}

impl QueryClientBuilder {
    /// Use an existing cache instead of a new one.
    pub fn cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Defaults applied under every query's own options.
    pub fn default_options(mut self, options: DefaultOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Finish the client.
    pub fn build(self) -> QueryClient {
        QueryClient {
            inner: Arc::new(ClientInner {
                cache: self.cache.unwrap_or_default(),
                default_options: RwLock::new(self.default_options),
                query_defaults: RwLock::default(),
                mounted: Mutex::default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn option_precedence() {
        let client = QueryClient::builder()
            .default_options(DefaultOptions {
                queries: QueryDefaults {
                    stale_time: Some(Duration::from_secs(1)),
                    cache_time: Some(Duration::from_secs(1)),
                    retry: Some(Retry::Count(1)),
                    ..QueryDefaults::default()
                },
            })
            .build();
        client.set_query_defaults(
            json!(["todos"]),
            QueryDefaults {
                stale_time: Some(Duration::from_secs(2)),
                cache_time: Some(Duration::from_secs(2)),
                ..QueryDefaults::default()
            },
        );

        let options = client.defaulted(
            QueryOptions::<u32>::new(json!(["todos", 1])).stale_time(Duration::from_secs(3)),
        );
        assert_eq!(options.defaults.stale_time, Some(Duration::from_secs(3)));
        assert_eq!(options.defaults.cache_time, Some(Duration::from_secs(2)));
        assert!(matches!(options.defaults.retry, Some(Retry::Count(1))));

        let other = client.defaulted(QueryOptions::<u32>::new(json!(["posts"])));
        assert_eq!(other.defaults.stale_time, Some(Duration::from_secs(1)));
    }

    #[test]
    fn query_defaults_replace_equal_keys() {
        let client = QueryClient::new();
        let key = QueryKey::from(json!(["a"]));
        client.set_query_defaults(key.clone(), QueryDefaults {
            enabled: Some(false),
            ..QueryDefaults::default()
        });
        client.set_query_defaults(key.clone(), QueryDefaults {
            enabled: Some(true),
            ..QueryDefaults::default()
        });
        assert_eq!(client.get_query_defaults(&key).and_then(|d| d.enabled), Some(true));
        assert!(client.get_query_defaults(&QueryKey::from(json!(["b"]))).is_none());
    }

    #[tokio::test]
    async fn set_query_data_sees_previous_value() {
        let client = QueryClient::new();
        client.set_query_data::<u32>("count", |_| 1).unwrap();
        let next = client
            .set_query_data::<u32>("count", |prev| prev.map_or(0, |p| *p + 1))
            .unwrap();
        assert_eq!(*next, 2);
        assert_eq!(client.get_query_data::<u32>("count").unwrap().as_deref(), Some(&2));
        assert!(matches!(
            client.get_query_data::<String>("count"),
            Err(QueryError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn mount_is_counted() {
        let client = QueryClient::new();
        client.mount();
        client.mount();
        client.unmount();
        assert!(client.is_mounted());
        client.unmount();
        assert!(!client.is_mounted());
    }
}

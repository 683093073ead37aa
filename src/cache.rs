//! The query cache: sole owner of every [`Query`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::data::QueryData;
use crate::key::{hash_with, partial_match_key, QueryHash, QueryKey};
use crate::notify::NotifyManager;
use crate::query::{Action, Query, QueryConfig, QueryState};
use crate::signals::{FocusManager, OnlineManager};
use crate::subscribable::{subscribe_to, Listeners, Subscription};
use crate::QueryError;

/// Something that happened to a query in the cache.
#[derive(Clone, Debug)]
pub enum QueryCacheEvent {
    /// A query was created.
    Added {
        /// The new query.
        query: Arc<Query>,
    },
    /// A query was removed, by garbage collection or explicitly.
    Removed {
        /// The removed query.
        query: Arc<Query>,
    },
    /// A query's state changed.
    Updated {
        /// The updated query.
        query: Arc<Query>,
        /// The transition that was applied.
        action: Action,
    },
    /// An observer subscribed to a query.
    ObserverAdded {
        /// The observed query.
        query: Arc<Query>,
    },
    /// An observer stopped observing a query.
    ObserverRemoved {
        /// The query left behind.
        query: Arc<Query>,
    },
    /// An observer of the query computed a new result.
    ObserverResultsUpdated {
        /// The observed query.
        query: Arc<Query>,
    },
}

impl QueryCacheEvent {
    /// The query the event is about.
    pub fn query(&self) -> &Arc<Query> {
        match self {
            QueryCacheEvent::Added { query }
            | QueryCacheEvent::Removed { query }
            | QueryCacheEvent::Updated { query, .. }
            | QueryCacheEvent::ObserverAdded { query }
            | QueryCacheEvent::ObserverRemoved { query }
            | QueryCacheEvent::ObserverResultsUpdated { query } => query,
        }
    }
}

type EventListener = dyn Fn(&QueryCacheEvent) + Send + Sync;
type SuccessCallback = Arc<dyn Fn(&QueryData, &Arc<Query>) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&QueryError, &Arc<Query>) + Send + Sync>;

/// Cache-wide callbacks, run for every query.
#[derive(Clone, Default)]
pub(crate) struct CacheConfig {
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
}

#[derive(Default)]
struct CacheMap {
    /// Insertion order.
    list: Vec<Arc<Query>>,
    by_hash: HashMap<QueryHash, Arc<Query>, ahash::RandomState>,
}

pub(crate) struct CacheShared {
    queries: Mutex<CacheMap>,
    listeners: Arc<Listeners<EventListener>>,
    pub(crate) notify: Arc<NotifyManager>,
    pub(crate) focus: Arc<FocusManager>,
    pub(crate) online: Arc<OnlineManager>,
    pub(crate) config: CacheConfig,
}

impl CacheShared {
    pub(crate) fn emit(&self, event: QueryCacheEvent) {
        let listeners = self.listeners.snapshot();
        if listeners.is_empty() {
            return;
        }
        self.notify.batch(|| {
            for listener in &listeners {
                listener(&event);
            }
        });
    }

    pub(crate) fn remove(&self, query: &Arc<Query>) {
        let removed = {
            let mut map = self.queries.lock();
            match map.by_hash.get(query.hash()) {
                Some(existing) if Arc::ptr_eq(existing, query) => {
                    map.by_hash.remove(query.hash());
                    map.list.retain(|q| !Arc::ptr_eq(q, query));
                    true
                }
                _ => false,
            }
        };
        if removed {
            query.destroy();
            tracing::trace!(query_hash = %query.hash(), "query removed");
            self.emit(QueryCacheEvent::Removed {
                query: query.clone(),
            });
        }
    }
}

/// Owns every query, keyed by hash.
///
/// This is cheap to clone - all data is behind `Arc`.
#[derive(Clone)]
pub struct QueryCache {
    shared: Arc<CacheShared>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.shared.queries.lock().list.len())
            .finish()
    }
}

impl QueryCache {
    /// An empty cache with default managers.
    pub fn new() -> Self {
        QueryCacheBuilder::new().build()
    }

    /// Configure a cache.
    pub fn builder() -> QueryCacheBuilder {
        QueryCacheBuilder::new()
    }

    pub(crate) fn downgrade(&self) -> Weak<CacheShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(shared: &Weak<CacheShared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    /// The batcher every notification of this cache goes through.
    pub fn notify_manager(&self) -> &Arc<NotifyManager> {
        &self.shared.notify
    }

    /// Window focus signal consulted by fetches and observers.
    pub fn focus_manager(&self) -> &Arc<FocusManager> {
        &self.shared.focus
    }

    /// Connectivity signal consulted by fetches and observers.
    pub fn online_manager(&self) -> &Arc<OnlineManager> {
        &self.shared.online
    }

    /// Return the query for `hash`, creating it if absent.
    ///
    /// Insertion happens under the cache lock, so concurrent callers for the
    /// same hash always get the same instance. `initial_data` runs before the
    /// lock is taken.
    pub(crate) fn build(
        &self,
        key: QueryKey,
        hash: QueryHash,
        config: QueryConfig,
        state: Option<QueryState>,
    ) -> Arc<Query> {
        if let Some(existing) = self.get(&hash) {
            return existing;
        }
        let state = state.unwrap_or_else(|| QueryState::initial(&config));
        let query = {
            let mut map = self.shared.queries.lock();
            if let Some(existing) = map.by_hash.get(&hash) {
                return existing.clone();
            }
            let query = Query::new(&self.shared, key, hash.clone(), config, state);
            map.by_hash.insert(hash, query.clone());
            map.list.push(query.clone());
            query
        };
        tracing::trace!(query_hash = %query.hash(), "query added");
        query.schedule_gc();
        self.shared.emit(QueryCacheEvent::Added {
            query: query.clone(),
        });
        query
    }

    /// The query with exactly this hash.
    pub fn get(&self, hash: &QueryHash) -> Option<Arc<Query>> {
        self.shared.queries.lock().by_hash.get(hash).cloned()
    }

    /// Every query, oldest first.
    pub fn get_all(&self) -> Vec<Arc<Query>> {
        self.shared.queries.lock().list.clone()
    }

    /// The query whose key is exactly `key`.
    pub fn find(&self, key: &QueryKey) -> Option<Arc<Query>> {
        self.find_by(&QueryFilters::new().key(key.clone()).exact())
    }

    /// First query matching `filters`.
    pub fn find_by(&self, filters: &QueryFilters) -> Option<Arc<Query>> {
        self.get_all().into_iter().find(|q| filters.matches(q))
    }

    /// Every query matching `filters`, oldest first.
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Arc<Query>> {
        self.get_all()
            .into_iter()
            .filter(|q| filters.matches(q))
            .collect()
    }

    /// Remove `query`, cancelling its fetch and emitting [`QueryCacheEvent::Removed`].
    pub fn remove(&self, query: &Arc<Query>) {
        self.shared.remove(query);
    }

    /// Remove every query.
    pub fn clear(&self) {
        self.shared.notify.batch(|| {
            for query in self.get_all() {
                self.remove(&query);
            }
        });
    }

    /// Listen to every event of every query.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryCacheEvent) + Send + Sync + 'static,
    ) -> Subscription {
        subscribe_to(&self.shared.listeners, Arc::new(listener))
    }

    pub(crate) fn emit(&self, event: QueryCacheEvent) {
        self.shared.emit(event);
    }

    /// Refetch queries whose observers want it on focus; resume paused fetches.
    pub fn on_focus(&self) {
        self.shared.notify.batch(|| {
            for query in self.get_all() {
                query.on_focus();
            }
        });
    }

    /// Refetch queries whose observers want it on reconnect; resume paused fetches.
    pub fn on_online(&self) {
        self.shared.notify.batch(|| {
            for query in self.get_all() {
                query.on_online();
            }
        });
    }
}

/// Builder for [`QueryCache`].
#[derive(Default)]
pub struct QueryCacheBuilder {
    config: CacheConfig,
    notify: Option<Arc<NotifyManager>>,
    focus: Option<Arc<FocusManager>>,
    online: Option<Arc<OnlineManager>>,
}

impl QueryCacheBuilder {
    /// A builder with default managers and no global callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after any query of this cache fetches successfully.
    pub fn on_success(mut self, f: impl Fn(&QueryData, &Arc<Query>) + Send + Sync + 'static) -> Self {
        self.config.on_success = Some(Arc::new(f));
        self
    }

    /// Called after any query of this cache settles with an error.
    pub fn on_error(mut self, f: impl Fn(&QueryError, &Arc<Query>) + Send + Sync + 'static) -> Self {
        self.config.on_error = Some(Arc::new(f));
        self
    }

    /// Share a notification batcher with other caches.
    pub fn notify_manager(mut self, notify: Arc<NotifyManager>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Use a shared focus signal.
    pub fn focus_manager(mut self, focus: Arc<FocusManager>) -> Self {
        self.focus = Some(focus);
        self
    }

    /// Use a shared connectivity signal.
    pub fn online_manager(mut self, online: Arc<OnlineManager>) -> Self {
        self.online = Some(online);
        self
    }

    /// Finish the cache.
    pub fn build(self) -> QueryCache {
        QueryCache {
            shared: Arc::new(CacheShared {
                queries: Mutex::new(CacheMap::default()),
                listeners: Arc::default(),
                notify: self.notify.unwrap_or_default(),
                focus: self.focus.unwrap_or_default(),
                online: self.online.unwrap_or_default(),
                config: self.config,
            }),
        }
    }
}

/// Which queries to include based on whether they are observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueryTypeFilter {
    /// Every query.
    #[default]
    All,
    /// Queries with at least one enabled observer.
    Active,
    /// Queries without an enabled observer.
    Inactive,
}

type QueryPredicate = Arc<dyn Fn(&Query) -> bool + Send + Sync>;

/// Selects queries for bulk operations.
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Match keys equal to (`exact`) or containing this key.
    pub query_key: Option<QueryKey>,
    /// Compare hashes instead of matching a key prefix.
    pub exact: bool,
    /// Observed or unobserved queries only.
    pub kind: QueryTypeFilter,
    /// Only stale (`true`) or only fresh (`false`) queries.
    pub stale: Option<bool>,
    /// Only fetching (`true`) or only idle (`false`) queries.
    pub fetching: Option<bool>,
    /// Arbitrary extra condition.
    pub predicate: Option<QueryPredicate>,
}

impl fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("kind", &self.kind)
            .field("stale", &self.stale)
            .field("fetching", &self.fetching)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl QueryFilters {
    /// Matches every query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match queries whose key starts with `key`.
    pub fn key(mut self, key: impl Into<QueryKey>) -> Self {
        self.query_key = Some(key.into());
        self
    }

    /// Require the whole key to be equal.
    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }

    /// Only queries with an enabled observer.
    pub fn active(mut self) -> Self {
        self.kind = QueryTypeFilter::Active;
        self
    }

    /// Only queries without an enabled observer.
    pub fn inactive(mut self) -> Self {
        self.kind = QueryTypeFilter::Inactive;
        self
    }

    /// Filter by staleness.
    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    /// Filter by whether a fetch is running.
    pub fn fetching(mut self, fetching: bool) -> Self {
        self.fetching = Some(fetching);
        self
    }

    /// Add a custom condition.
    pub fn predicate(mut self, f: impl Fn(&Query) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(f));
        self
    }

    /// Whether `query` passes every set filter.
    pub fn matches(&self, query: &Query) -> bool {
        if let Some(key) = &self.query_key {
            if self.exact {
                match hash_with(key, query.hash_fn().as_ref()) {
                    Ok(hash) if &hash == query.hash() => {}
                    _ => return false,
                }
            } else if !partial_match_key(query.key(), key) {
                return false;
            }
        }
        match self.kind {
            QueryTypeFilter::All => {}
            QueryTypeFilter::Active if !query.is_active() => return false,
            QueryTypeFilter::Inactive if query.is_active() => return false,
            _ => {}
        }
        if self.stale.is_some_and(|stale| query.is_stale() != stale) {
            return false;
        }
        if self
            .fetching
            .is_some_and(|fetching| query.is_fetching() != fetching)
        {
            return false;
        }
        self.predicate.as_ref().map_or(true, |p| p(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(cache: &QueryCache, key: serde_json::Value) -> Arc<Query> {
        let key = QueryKey::from(key);
        let hash = key.hash();
        cache.build(key, hash, QueryConfig::default(), None)
    }

    #[tokio::test]
    async fn build_returns_existing_instance() {
        let cache = QueryCache::new();
        let a = build(&cache, json!(["todo", { "id": 1, "x": null }]));
        let b = build(&cache, json!(["todo", { "id": 1 }]));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.get_all().len(), 1);
    }

    #[tokio::test]
    async fn filters_match_by_partial_and_exact_key() {
        let cache = QueryCache::new();
        build(&cache, json!(["todos", 1]));
        build(&cache, json!(["todos", 2]));
        build(&cache, json!(["posts"]));

        assert_eq!(cache.find_all(&QueryFilters::new().key(json!(["todos"]))).len(), 2);
        assert!(cache.find(&QueryKey::from(json!(["todos"]))).is_none());
        assert!(cache.find(&QueryKey::from(json!(["todos", 2]))).is_some());
        assert_eq!(
            cache
                .find_all(&QueryFilters::new().predicate(|q| q.key().as_value()[0] == "posts"))
                .len(),
            1
        );
        // Never fetched, so stale and inactive.
        assert_eq!(cache.find_all(&QueryFilters::new().stale(true).inactive()).len(), 3);
        assert!(cache.find_all(&QueryFilters::new().active()).is_empty());
    }

    #[tokio::test]
    async fn events_are_emitted_for_add_and_remove() {
        let cache = QueryCache::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = cache.subscribe(move |event| {
            let name = match event {
                QueryCacheEvent::Added { .. } => "added",
                QueryCacheEvent::Removed { .. } => "removed",
                QueryCacheEvent::Updated { .. } => "updated",
                _ => "other",
            };
            sink.lock().push(name);
        });

        let query = build(&cache, json!("a"));
        query.set_data(QueryData::new(1u32), None);
        cache.remove(&query);
        cache.remove(&query);

        assert_eq!(*seen.lock(), vec!["added", "updated", "removed"]);
        assert!(cache.get(query.hash()).is_none());
    }
}

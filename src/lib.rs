#![deny(missing_docs)]
//! Query-Cache: an in-memory cache for the results of asynchronous queries.
//!
//! Results are keyed by a structured, serializable [`QueryKey`]. The cache
//! tracks staleness, deduplicates concurrent fetches, retries failures with
//! backoff, garbage collects unused entries and lets many observers watch
//! one entry while receiving a minimal, batched set of notifications.
//!
//! # Key Features
//!
//! - **Deduplication**: concurrent fetches of one key share a single attempt
//! - **Stale-while-revalidate**: cached data is served while a background refetch runs
//! - **Retries**: bounded, predicate or custom retries with exponential backoff and jitter
//! - **Pause and resume**: retries wait for connectivity and focus signals reported by the host
//! - **Batched notifications**: one settlement notifies each listener once
//! - **Infinite queries**: page-by-page accumulation in both directions
//! - **Hydration**: snapshot a cache and merge it into another by timestamp
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{QueryClient, QueryObserver, QueryOptions};
//!
//! let client = QueryClient::new();
//! client.mount();
//!
//! let observer = QueryObserver::new(
//!     &client,
//!     QueryOptions::<Vec<String>>::new(serde_json::json!(["todos"]))
//!         .query_fn(|_ctx| async { Ok(vec!["write docs".to_string()]) }),
//! )?;
//! let _subscription = observer.subscribe(|result| {
//!     println!("{:?} {:?}", result.status, result.data);
//! });
//! ```
//!
//! # Threading
//!
//! Fetches and timers run as tokio tasks, so operations that fetch or arm
//! timers must be called from within a tokio runtime. Callbacks and
//! listeners are never invoked while the cache holds a lock, so they may call
//! back into the cache. Notification batches are scoped to the thread
//! that opens them.

mod cache;
mod client;
mod data;
mod error;
mod hydration;
mod infinite;
mod key;
mod notify;
mod observer;
mod options;
mod query;
mod retryer;
mod signals;
mod subscribable;
mod timer;

pub use cache::{QueryCache, QueryCacheBuilder, QueryCacheEvent, QueryFilters, QueryTypeFilter};
pub use client::{InvalidateOptions, QueryClient, QueryClientBuilder, RefetchOptions};
pub use data::{QueryData, QueryOutput};
pub use error::{QueryError, QueryResultExt, TypedErr};
pub use hydration::{
    dehydrate, hydrate, DehydrateOptions, DehydratedQuery, DehydratedQueryState, DehydratedState,
};
pub use infinite::{
    InfiniteData, InfiniteQueryFnContext, InfiniteQueryObserver, InfiniteQueryObserverResult,
    InfiniteQueryOptions, PageParamFn,
};
pub use key::{hash_query_key, partial_match_key, QueryHash, QueryKey, QueryKeyHashFn};
pub use notify::{Callback, NotifyFn, NotifyManager};
pub use observer::{QueryObserver, QueryObserverResult, TrackedResult};
pub use options::{DefaultOptions, NotifyOnChangeProps, QueryDefaults, QueryOptions, RefetchOn, ResultProp};
pub use query::{
    Action, FetchDirection, FetchMeta, FetchOptions, FetchStatus, Fetcher, InitialDataFn, Query,
    QueryFn, QueryFnContext, QueryFuture, QueryState, QueryStatus, DEFAULT_CACHE_TIME,
};
pub use retryer::{default_retry_delay, CancelOptions, NetworkMode, Retry, RetryDelay, RetryerFuture};
pub use signals::{FocusManager, OnlineManager};
pub use subscribable::Subscription;
pub use timer::now;

//! Tests for the client's cache-wide operations.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, sleep_ms, Counter};
use parking_lot::Mutex;
use query_cache::{
    CancelOptions, FetchStatus, InvalidateOptions, QueryCacheEvent, QueryClient, QueryDefaults,
    QueryError, QueryFilters, QueryObserver, QueryOptions, QueryStatus, RetryDelay,
};
use serde_json::json;

fn slow_options(key: &str, calls: &Counter) -> QueryOptions<u32> {
    let calls = calls.clone();
    QueryOptions::<u32>::new(key).query_fn(move |_ctx| {
        let n = calls.incr() as u32;
        async move {
            sleep_ms(100).await;
            anyhow::Ok(n)
        }
    })
}

fn instant_options(key: impl Into<query_cache::QueryKey>, calls: &Counter) -> QueryOptions<u32> {
    let calls = calls.clone();
    QueryOptions::<u32>::new(key).query_fn(move |_ctx| {
        let n = calls.incr() as u32;
        async move { anyhow::Ok(n) }
    })
}

// ============================================================================
// Garbage Collection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unobserved_query_is_collected() {
    init_tracing();
    let client = QueryClient::new();
    let calls = Counter::default();
    client
        .prefetch_query(instant_options("gc", &calls).cache_time(Duration::from_secs(1)))
        .await;

    sleep_ms(500).await;
    assert!(client.cache().find(&"gc".into()).is_some());
    sleep_ms(1000).await;
    assert!(client.cache().find(&"gc".into()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_observed_query_is_kept() {
    let client = QueryClient::new();
    let calls = Counter::default();
    let observer = QueryObserver::new(
        &client,
        instant_options("kept", &calls).cache_time(Duration::from_secs(1)),
    )
    .unwrap();
    let sub = observer.subscribe(|_| {});

    sleep_ms(2000).await;
    assert!(client.cache().find(&"kept".into()).is_some());

    drop(sub);
    sleep_ms(1500).await;
    assert!(client.cache().find(&"kept".into()).is_none());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancel_first_fetch_reverts_to_idle() {
    let client = QueryClient::new();
    let calls = Counter::default();
    let fetch = tokio::spawn({
        let client = client.clone();
        let options = slow_options("slow", &calls);
        async move { client.fetch_query(options).await }
    });
    sleep_ms(5).await;
    assert_eq!(client.get_query_state("slow").unwrap().status, QueryStatus::Loading);

    client.cancel_queries(QueryFilters::new().key("slow"), CancelOptions::default());
    let state = client.get_query_state("slow").unwrap();
    assert_eq!(state.status, QueryStatus::Idle);
    assert_eq!(state.fetch_status, FetchStatus::Idle);

    let err = fetch.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    sleep_ms(200).await;
    assert!(client.get_query_data::<u32>("slow").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_refetch_keeps_data() {
    let client = QueryClient::new();
    let calls = Counter::default();
    client.set_query_data("slow", |_| 42u32).unwrap();

    let fetch = tokio::spawn({
        let client = client.clone();
        let options = slow_options("slow", &calls);
        async move { client.fetch_query(options).await }
    });
    sleep_ms(5).await;
    assert!(client.get_query_state("slow").unwrap().is_fetching());

    client.cancel_queries(QueryFilters::new(), CancelOptions::default());
    assert!(fetch.await.unwrap().unwrap_err().is_cancelled());
    let state = client.get_query_state("slow").unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(client.get_query_data::<u32>("slow").unwrap().as_deref(), Some(&42));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_unobserved_query_is_collected() {
    let client = QueryClient::new();
    let calls = Counter::default();
    let fetch = tokio::spawn({
        let client = client.clone();
        let options = slow_options("abandoned", &calls).cache_time(Duration::from_millis(10));
        async move { client.fetch_query(options).await }
    });

    // The collection deadline passes while the fetch is still running
    sleep_ms(50).await;
    assert!(client.cache().find(&"abandoned".into()).is_some());

    client.cancel_queries(QueryFilters::new().key("abandoned"), CancelOptions::default());
    assert!(fetch.await.unwrap().unwrap_err().is_cancelled());
    sleep_ms(20).await;
    assert!(client.cache().find(&"abandoned".into()).is_none());
}

// ============================================================================
// Invalidation and Refetching
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_invalidate_refetches_active_only() {
    let client = QueryClient::new();
    let calls = Counter::default();
    let observer = QueryObserver::new(
        &client,
        instant_options(json!(["todos", 1]), &calls).stale_time(Duration::MAX),
    )
    .unwrap();
    let _sub = observer.subscribe(|_| {});
    sleep_ms(1).await;
    client.set_query_data(json!(["todos", 2]), |_| 0u32).unwrap();
    assert_eq!(calls.get(), 1);

    client
        .invalidate_queries(QueryFilters::new().key(json!(["todos"])), InvalidateOptions::default())
        .await
        .unwrap();

    assert_eq!(calls.get(), 2);
    assert_eq!(observer.get_current_result().data.as_deref(), Some(&2));
    let active = client.get_query_state(json!(["todos", 1])).unwrap();
    assert!(!active.is_invalidated);
    let inactive = client.get_query_state(json!(["todos", 2])).unwrap();
    assert!(inactive.is_invalidated);
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_does_not_disable_observer_retries() {
    let client = QueryClient::new();
    let attempts = Counter::default();
    let flaky = || {
        let attempts = attempts.clone();
        QueryOptions::<u32>::new("flaky")
            .retry_delay(RetryDelay::Fixed(Duration::from_millis(1)))
            .query_fn(move |_ctx| {
                attempts.incr();
                async { Err::<u32, _>(anyhow::anyhow!("unavailable")) }
            })
    };

    // fetch_query does not retry by default
    client.prefetch_query(flaky()).await;
    assert_eq!(attempts.get(), 1);

    // The observer keeps the default policy: one attempt plus three retries
    let observer = QueryObserver::new(&client, flaky()).unwrap();
    let _sub = observer.subscribe(|_| {});
    sleep_ms(100).await;
    assert_eq!(attempts.get(), 5);
    assert!(observer.get_current_result().is_error());
}

#[tokio::test(start_paused = true)]
async fn test_refetch_queries_surfaces_errors_on_request() {
    let client = QueryClient::new();
    client
        .prefetch_query(
            QueryOptions::<u32>::new("failing")
                .query_fn(|_ctx| async { Err::<u32, _>(anyhow::anyhow!("down")) }),
        )
        .await;

    let quiet = client
        .refetch_queries(QueryFilters::new(), Default::default())
        .await;
    assert!(quiet.is_ok());

    let loud = client
        .refetch_queries(
            QueryFilters::new(),
            query_cache::RefetchOptions {
                throw_on_error: true,
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(loud, Err(QueryError::Fetch(_))));
}

#[tokio::test(start_paused = true)]
async fn test_is_fetching_counts_running_fetches() {
    let client = QueryClient::new();
    let calls = Counter::default();
    for key in ["a", "b"] {
        let client = client.clone();
        let options = slow_options(key, &calls);
        tokio::spawn(async move { client.prefetch_query(options).await });
    }
    sleep_ms(5).await;
    assert_eq!(client.is_fetching(QueryFilters::new()), 2);
    assert_eq!(client.is_fetching(QueryFilters::new().key("a")), 1);

    sleep_ms(200).await;
    assert_eq!(client.is_fetching(QueryFilters::new()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reset_restores_initial_data() {
    let client = QueryClient::new();
    let calls = Counter::default();
    client
        .prefetch_query(instant_options("reset", &calls).initial_data(7))
        .await;
    client.set_query_data("reset", |_| 8u32).unwrap();

    client
        .reset_queries(QueryFilters::new().key("reset"), Default::default())
        .await
        .unwrap();
    assert_eq!(client.get_query_data::<u32>("reset").unwrap().as_deref(), Some(&7));
}

// ============================================================================
// Data Access
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_set_query_data_creates_success_query() {
    let client = QueryClient::new();
    let data = client
        .set_query_data("manual", |previous: Option<Arc<u32>>| previous.map_or(1, |n| *n + 1))
        .unwrap();
    assert_eq!(*data, 1);
    let data = client
        .set_query_data("manual", |previous: Option<Arc<u32>>| previous.map_or(1, |n| *n + 1))
        .unwrap();
    assert_eq!(*data, 2);

    let state = client.get_query_state("manual").unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data_update_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_wrong_type_is_reported() {
    let client = QueryClient::new();
    client.set_query_data("typed", |_| 1u32).unwrap();
    let err = client.get_query_data::<String>("typed").unwrap_err();
    assert!(matches!(err, QueryError::TypeMismatch { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_query_defaults_apply_by_key_prefix() {
    let client = QueryClient::new();
    let calls = Counter::default();
    client.set_query_defaults(
        json!(["todos"]),
        QueryDefaults {
            stale_time: Some(Duration::MAX),
            ..Default::default()
        },
    );

    client.fetch_query(instant_options(json!(["todos", 1]), &calls)).await.unwrap();
    client.fetch_query(instant_options(json!(["todos", 1]), &calls)).await.unwrap();
    assert_eq!(calls.get(), 1);

    // Other keys keep the zero stale time
    client.fetch_query(instant_options(json!(["users"]), &calls)).await.unwrap();
    client.fetch_query(instant_options(json!(["users"]), &calls)).await.unwrap();
    assert_eq!(calls.get(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cache_events() {
    let client = QueryClient::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let events = events.clone();
        client.cache().subscribe(move |event| {
            let name = match event {
                QueryCacheEvent::Added { .. } => "added",
                QueryCacheEvent::Removed { .. } => "removed",
                QueryCacheEvent::Updated { .. } => "updated",
                QueryCacheEvent::ObserverAdded { .. } => "observer added",
                QueryCacheEvent::ObserverRemoved { .. } => "observer removed",
                QueryCacheEvent::ObserverResultsUpdated { .. } => "results updated",
            };
            events.lock().push(name);
        })
    };

    client.set_query_data("events", |_| 1u32).unwrap();
    client.remove_queries(QueryFilters::new().key("events").exact());
    assert_eq!(*events.lock(), vec!["added", "updated", "removed"]);
}

// ============================================================================
// Connectivity
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_offline_fetch_pauses_until_online() {
    let client = QueryClient::new();
    client.mount();
    let online = client.cache().online_manager().clone();
    online.set_online(Some(false));

    let calls = Counter::default();
    let observer = QueryObserver::new(&client, instant_options("offline", &calls)).unwrap();
    let _sub = observer.subscribe(|_| {});
    sleep_ms(10).await;
    let result = observer.get_current_result();
    assert!(result.is_paused());
    assert_eq!(result.status, QueryStatus::Loading);
    assert_eq!(calls.get(), 0);

    online.set_online(Some(true));
    sleep_ms(10).await;
    assert_eq!(calls.get(), 1);
    assert!(observer.get_current_result().is_success());
    client.unmount();
}

#[tokio::test(start_paused = true)]
async fn test_focus_refetches_stale_queries() {
    let client = QueryClient::new();
    client.mount();
    let calls = Counter::default();
    let observer = QueryObserver::new(&client, instant_options("focus", &calls)).unwrap();
    let _sub = observer.subscribe(|_| {});
    sleep_ms(1).await;
    assert_eq!(calls.get(), 1);

    let focus = client.cache().focus_manager().clone();
    focus.set_focused(Some(false));
    focus.set_focused(Some(true));
    sleep_ms(1).await;
    assert_eq!(calls.get(), 2);

    // After unmounting, focus no longer reaches the cache
    client.unmount();
    focus.set_focused(Some(false));
    focus.set_focused(Some(true));
    sleep_ms(1).await;
    assert_eq!(calls.get(), 2);
}

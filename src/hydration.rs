//! Snapshots of a cache that can be moved into another cache.
//!
//! A snapshot is plain serde data; how it is transported is up to the caller.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::QueryCache;
use crate::data::QueryData;
use crate::key::{QueryHash, QueryKey};
use crate::query::{FetchStatus, Query, QueryConfig, QueryState, QueryStatus};
use crate::QueryError;

/// The serializable part of a [`QueryState`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DehydratedQueryState {
    /// Data encoded as JSON.
    pub data: Option<Value>,
    /// How many times data was written.
    pub data_update_count: u32,
    /// When the data was last written (ms since the epoch).
    pub data_updated_at: u64,
    /// Display form of the error.
    pub error: Option<String>,
    /// How many times the query failed.
    pub error_update_count: u32,
    /// When the error was recorded (ms since the epoch).
    pub error_updated_at: u64,
    /// Failed attempts of the last fetch.
    pub fetch_failure_count: u32,
    /// Whether the data was explicitly marked stale.
    pub is_invalidated: bool,
    /// Lifecycle status at snapshot time.
    pub status: QueryStatus,
}

impl DehydratedQueryState {
    fn from_state(state: &QueryState) -> Result<Self, QueryError> {
        Ok(Self {
            data: state.data.as_ref().map(QueryData::to_json).transpose()?,
            data_update_count: state.data_update_count,
            data_updated_at: state.data_updated_at,
            error: state.error.as_ref().map(|error| match error.fetch_error() {
                Some(inner) => inner.to_string(),
                None => error.to_string(),
            }),
            error_update_count: state.error_update_count,
            error_updated_at: state.error_updated_at,
            fetch_failure_count: state.fetch_failure_count,
            is_invalidated: state.is_invalidated,
            status: state.status,
        })
    }

    fn to_state(&self) -> QueryState {
        QueryState {
            data: self.data.clone().map(QueryData::from_json),
            data_update_count: self.data_update_count,
            data_updated_at: self.data_updated_at,
            error: self
                .error
                .as_ref()
                .map(|message| QueryError::fetch(anyhow::anyhow!("{message}"))),
            error_update_count: self.error_update_count,
            error_updated_at: self.error_updated_at,
            fetch_failure_count: self.fetch_failure_count,
            fetch_meta: None,
            is_invalidated: self.is_invalidated,
            status: self.status,
            fetch_status: FetchStatus::Idle,
        }
    }
}

/// One query in a [`DehydratedState`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DehydratedQuery {
    /// Hash the query was stored under.
    pub query_hash: QueryHash,
    /// Key the query was created with.
    pub query_key: QueryKey,
    /// Serializable state.
    pub state: DehydratedQueryState,
}

/// Snapshot of selected queries, in cache order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DehydratedState {
    /// The selected queries.
    pub queries: Vec<DehydratedQuery>,
}

type ShouldDehydrate = Arc<dyn Fn(&Query) -> bool + Send + Sync>;

/// Which queries [`dehydrate`] includes.
#[derive(Clone, Default)]
pub struct DehydrateOptions {
    /// Defaults to queries with `status = success`.
    pub should_dehydrate: Option<ShouldDehydrate>,
}

impl fmt::Debug for DehydrateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DehydrateOptions")
            .field("should_dehydrate", &self.should_dehydrate.is_some())
            .finish()
    }
}

impl DehydrateOptions {
    /// Include exactly the queries for which `f` returns `true`.
    pub fn should_dehydrate(mut self, f: impl Fn(&Query) -> bool + Send + Sync + 'static) -> Self {
        self.should_dehydrate = Some(Arc::new(f));
        self
    }
}

/// Snapshot the selected queries of `cache`.
///
/// Fails if some selected data cannot be encoded as JSON.
pub fn dehydrate(cache: &QueryCache, options: &DehydrateOptions) -> Result<DehydratedState, QueryError> {
    let mut queries = Vec::new();
    for query in cache.get_all() {
        let selected = match &options.should_dehydrate {
            Some(should_dehydrate) => should_dehydrate(&query),
            None => query.state().status == QueryStatus::Success,
        };
        if !selected {
            continue;
        }
        queries.push(DehydratedQuery {
            query_hash: query.hash().clone(),
            query_key: query.key().clone(),
            state: DehydratedQueryState::from_state(&query.state())?,
        });
    }
    tracing::debug!(count = queries.len(), "dehydrated queries");
    Ok(DehydratedState { queries })
}

/// Merge a snapshot into `cache`.
///
/// Missing queries are created with the snapshot state. Existing queries are
/// overwritten only when the snapshot data is strictly newer, and keep their
/// own fetch status.
pub fn hydrate(cache: &QueryCache, state: &DehydratedState) {
    cache.notify_manager().batch(|| {
        for dehydrated in &state.queries {
            let restored = dehydrated.state.to_state();
            match cache.get(&dehydrated.query_hash) {
                Some(query) => {
                    let current = query.state();
                    if current.data_updated_at >= dehydrated.state.data_updated_at {
                        tracing::trace!(query_hash = %dehydrated.query_hash, "cached data is newer, skipping");
                        continue;
                    }
                    query.set_state(QueryState {
                        fetch_status: current.fetch_status,
                        fetch_meta: current.fetch_meta,
                        ..restored
                    });
                }
                None => {
                    cache.build(
                        dehydrated.query_key.clone(),
                        dehydrated.query_hash.clone(),
                        QueryConfig::default(),
                        Some(restored),
                    );
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_survives_json() {
        let state = DehydratedState {
            queries: vec![DehydratedQuery {
                query_hash: QueryHash::from("[\"a\"]"),
                query_key: QueryKey::from(json!(["a"])),
                state: DehydratedQueryState {
                    data: Some(json!({ "n": 1 })),
                    data_update_count: 1,
                    data_updated_at: 10,
                    status: QueryStatus::Success,
                    ..DehydratedQueryState::default()
                },
            }],
        };
        let text = serde_json::to_string(&state).unwrap();
        assert!(text.contains("\"status\":\"success\""));
        let back: DehydratedState = serde_json::from_str(&text).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn restored_errors_keep_their_message() {
        let dehydrated = DehydratedQueryState {
            error: Some("boom".into()),
            status: QueryStatus::Error,
            ..DehydratedQueryState::default()
        };
        let state = dehydrated.to_state();
        assert_eq!(state.error.map(|e| e.to_string()).as_deref(), Some("fetch failed: boom"));
        assert_eq!(state.fetch_status, FetchStatus::Idle);
    }
}

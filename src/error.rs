//! Error types for query execution.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::key::QueryHash;

/// Errors produced by the cache, its queries and their fetch functions.
///
/// Errors are stored in query state and shared between every observer of
/// that query, so the enum is cheap to clone: user errors live behind an
/// `Arc<anyhow::Error>`.
///
/// Any `anyhow::Error` converts into [`QueryError::Fetch`], so fetch
/// functions returning `anyhow::Result<T>` can use `?` freely.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// The fetch function itself failed.
    ///
    /// Fetch errors are recorded into the query's state once retries are
    /// exhausted. They are never returned from the cache's own bookkeeping
    /// methods.
    #[error("fetch failed: {0}")]
    Fetch(Arc<anyhow::Error>),

    /// The fetch was superseded or explicitly cancelled.
    ///
    /// Awaiting callers receive this instead of a value. The query's state
    /// is either left alone (`silent`), rolled back to the snapshot taken when
    /// the fetch started (`revert`), or simply marked idle.
    #[error("query cancelled")]
    Cancelled {
        /// Restore the state captured before the fetch started.
        revert: bool,
        /// Do not touch the query's state at all.
        silent: bool,
    },

    /// The observer or query was configured in a way that cannot work.
    #[error("invalid query configuration: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// Cached data exists for this hash but holds a different Rust type.
    #[error("query {query_hash} does not hold data of type {expected}")]
    TypeMismatch {
        /// Hash of the offending query.
        query_hash: QueryHash,
        /// Name of the type the caller asked for.
        expected: &'static str,
    },

    /// Converting data to or from JSON failed.
    #[error("serialization failed: {0}")]
    Serialization(Arc<serde_json::Error>),

    /// The query was asked to fetch but no fetch function is known for it.
    #[error("missing query function")]
    MissingQueryFn,
}

impl From<anyhow::Error> for QueryError {
    fn from(err: anyhow::Error) -> Self {
        QueryError::Fetch(Arc::new(err))
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Serialization(Arc::new(err))
    }
}

impl PartialEq for QueryError {
    /// User errors compare by identity: two `Fetch` errors are equal only if
    /// they are the same recorded failure.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (QueryError::Fetch(a), QueryError::Fetch(b)) => Arc::ptr_eq(a, b),
            (
                QueryError::Cancelled { revert, silent },
                QueryError::Cancelled {
                    revert: other_revert,
                    silent: other_silent,
                },
            ) => revert == other_revert && silent == other_silent,
            (
                QueryError::Configuration { message },
                QueryError::Configuration { message: other },
            ) => message == other,
            (
                QueryError::TypeMismatch {
                    query_hash,
                    expected,
                },
                QueryError::TypeMismatch {
                    query_hash: other_hash,
                    expected: other_expected,
                },
            ) => query_hash == other_hash && expected == other_expected,
            (QueryError::Serialization(a), QueryError::Serialization(b)) => Arc::ptr_eq(a, b),
            (QueryError::MissingQueryFn, QueryError::MissingQueryFn) => true,
            _ => false,
        }
    }
}

impl QueryError {
    /// Wrap any error as a fetch failure.
    pub fn fetch(err: impl Into<anyhow::Error>) -> Self {
        QueryError::Fetch(Arc::new(err.into()))
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        QueryError::Configuration {
            message: message.into(),
        }
    }

    /// Returns a reference to the inner user error if this is a `Fetch` variant.
    pub fn fetch_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            QueryError::Fetch(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the fetch error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.fetch_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a `Fetch` error containing an error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    /// Returns `true` for cancellation signals.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled { .. })
    }

    /// Whether a failed attempt with this error may be retried at all.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Fetch(_))
    }
}

/// A typed wrapper around a fetch error that derefs to the inner error type.
///
/// # Example
///
/// ```ignore
/// use query_cache::QueryResultExt;
///
/// match client.fetch_query(options).await.downcast_err::<ApiError>()? {
///     Ok(user) => println!("{}", user.name),
///     Err(api_err) => println!("status {}", api_err.status),
/// }
/// ```
#[derive(Clone)]
pub struct TypedErr<E> {
    arc: Arc<anyhow::Error>,
    _marker: PhantomData<E>,
}

impl<E: std::error::Error + Send + Sync + 'static> TypedErr<E> {
    fn new(arc: Arc<anyhow::Error>) -> Result<Self, Arc<anyhow::Error>> {
        if arc.downcast_ref::<E>().is_some() {
            Ok(Self {
                arc,
                _marker: PhantomData,
            })
        } else {
            Err(arc)
        }
    }

    /// Returns a reference to the inner error.
    pub fn get(&self) -> &E {
        match self.arc.downcast_ref::<E>() {
            Some(err) => err,
            // Checked in `new`.
            None => unreachable!("TypedErr holds an error of another type"),
        }
    }

    /// The shared error this wrapper was built from.
    pub fn into_inner(self) -> Arc<anyhow::Error> {
        self.arc
    }
}

impl<E: std::error::Error + Send + Sync + 'static> Deref for TypedErr<E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.get()
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Debug for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.get(), f)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Display for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.get(), f)
    }
}

/// Extension trait for query results that splits out one expected error type.
///
/// Fetch errors of type `E` become `Ok(Err(TypedErr<E>))`. Every other error
/// (cancellation, configuration, fetch errors of other types) is propagated
/// as the outer `Err`.
pub trait QueryResultExt<T> {
    /// Downcast the fetch error to `E`, propagating everything else.
    fn downcast_err<E: std::error::Error + Send + Sync + 'static>(
        self,
    ) -> Result<Result<T, TypedErr<E>>, QueryError>;
}

impl<T> QueryResultExt<T> for Result<T, QueryError> {
    fn downcast_err<E: std::error::Error + Send + Sync + 'static>(
        self,
    ) -> Result<Result<T, TypedErr<E>>, QueryError> {
        match self {
            Ok(value) => Ok(Ok(value)),
            Err(QueryError::Fetch(arc)) => match TypedErr::new(arc) {
                Ok(typed) => Ok(Err(typed)),
                Err(arc) => Err(QueryError::Fetch(arc)),
            },
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NotFound(u32);

    impl fmt::Display for NotFound {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "item {} not found", self.0)
        }
    }

    impl std::error::Error for NotFound {}

    #[test]
    fn anyhow_converts_into_fetch() {
        let err: QueryError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, QueryError::Fetch(_)));
        assert!(err.to_string().contains("boom"));
        assert!(err.is_retryable());
    }

    #[test]
    fn downcast_err_splits_expected_type() {
        let result: Result<u32, QueryError> = Err(QueryError::fetch(NotFound(7)));
        let typed = result.downcast_err::<NotFound>().unwrap().unwrap_err();
        assert_eq!(typed.0, 7);

        let other: Result<u32, QueryError> = Err(QueryError::fetch(anyhow::anyhow!("io")));
        assert!(other.downcast_err::<NotFound>().is_err());

        let cancelled: Result<u32, QueryError> = Err(QueryError::Cancelled {
            revert: true,
            silent: false,
        });
        assert!(cancelled.downcast_err::<NotFound>().unwrap_err().is_cancelled());
    }

    #[test]
    fn fetch_errors_compare_by_identity() {
        let a = QueryError::fetch(anyhow::anyhow!("same text"));
        let b = QueryError::fetch(anyhow::anyhow!("same text"));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(!QueryError::configuration("bad").is_retryable());
    }
}

//! Type-erased query payloads.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::key::QueryHash;
use crate::QueryError;

/// Output type of a query.
///
/// Serialization is required so the cache can be dehydrated into a snapshot
/// and restored into another cache.
pub trait QueryOutput: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> QueryOutput for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

type Encode = fn(&(dyn Any + Send + Sync)) -> Result<Value, serde_json::Error>;

#[derive(Clone, Copy)]
enum Repr {
    Typed {
        type_id: TypeId,
        type_name: &'static str,
        encode: Encode,
    },
    /// Restored from a snapshot, decoded on first typed access.
    Json,
}

/// Data cached by a query.
///
/// Cloning is cheap. Two `QueryData` values are the "same data" when
/// [`QueryData::ptr_eq`] holds, which is what observers use to detect changes.
#[derive(Clone)]
pub struct QueryData {
    value: Arc<dyn Any + Send + Sync>,
    repr: Repr,
}

fn encode<T: QueryOutput>(value: &(dyn Any + Send + Sync)) -> Result<Value, serde_json::Error> {
    match value.downcast_ref::<T>() {
        Some(value) => serde_json::to_value(value),
        None => Ok(Value::Null),
    }
}

impl QueryData {
    /// Wrap a typed value.
    pub fn new<T: QueryOutput>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap a value that is already shared.
    pub fn from_arc<T: QueryOutput>(value: Arc<T>) -> Self {
        Self {
            value,
            repr: Repr::Typed {
                type_id: TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
                encode: encode::<T>,
            },
        }
    }

    /// Untyped JSON data, as restored from a dehydrated snapshot.
    pub fn from_json(value: Value) -> Self {
        Self {
            value: Arc::new(value),
            repr: Repr::Json,
        }
    }

    /// Access the data as `T`.
    ///
    /// JSON data is deserialized into `T`; typed data must already be a `T`.
    pub fn downcast<T: QueryOutput>(&self, query_hash: &QueryHash) -> Result<Arc<T>, QueryError> {
        let mismatch = || QueryError::TypeMismatch {
            query_hash: query_hash.clone(),
            expected: std::any::type_name::<T>(),
        };
        match self.repr {
            Repr::Typed { .. } => self.value.clone().downcast::<T>().map_err(|_| mismatch()),
            Repr::Json => {
                let json = self.value.downcast_ref::<Value>().ok_or_else(mismatch)?;
                let decoded = serde_json::from_value::<T>(json.clone())?;
                Ok(Arc::new(decoded))
            }
        }
    }

    /// Encode the data as JSON.
    pub fn to_json(&self) -> Result<Value, QueryError> {
        match self.repr {
            Repr::Typed { encode, .. } => Ok(encode(self.value.as_ref())?),
            Repr::Json => Ok(self
                .value
                .downcast_ref::<Value>()
                .cloned()
                .unwrap_or(Value::Null)),
        }
    }

    /// Whether both values point to the same allocation.
    pub fn ptr_eq(&self, other: &QueryData) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }

    /// Rust type held by typed data, `None` for JSON data.
    pub fn type_id(&self) -> Option<TypeId> {
        match self.repr {
            Repr::Typed { type_id, .. } => Some(type_id),
            Repr::Json => None,
        }
    }

    /// Name of the wrapped type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self.repr {
            Repr::Typed { type_name, .. } => type_name,
            Repr::Json => "serde_json::Value",
        }
    }

    /// Whether data of type `T` can be read from this value.
    pub(crate) fn accepts<T: 'static>(&self) -> bool {
        self.type_id().map_or(true, |id| id == TypeId::of::<T>())
    }
}

impl fmt::Debug for QueryData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryData")
            .field("type", &self.type_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_roundtrip_keeps_identity() {
        let hash = QueryHash::from("h");
        let data = QueryData::new(String::from("v1"));
        let a = data.downcast::<String>(&hash).unwrap();
        let b = data.clone().downcast::<String>(&hash).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(data.accepts::<String>());
        assert!(!data.accepts::<u32>());
    }

    #[test]
    fn typed_mismatch_is_reported() {
        let hash = QueryHash::from("h");
        let err = QueryData::new(1u32).downcast::<String>(&hash).unwrap_err();
        assert!(matches!(err, QueryError::TypeMismatch { .. }));
    }

    #[test]
    fn json_data_decodes_on_access() {
        let hash = QueryHash::from("h");
        let data = QueryData::from_json(serde_json::json!([1, 2, 3]));
        assert!(data.accepts::<Vec<u8>>());
        assert_eq!(*data.downcast::<Vec<u8>>(&hash).unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            data.downcast::<String>(&hash),
            Err(QueryError::Serialization(_))
        ));
        assert_eq!(
            QueryData::new(vec![1, 2]).to_json().unwrap(),
            serde_json::json!([1, 2])
        );
    }
}

//! Query keys and their canonical hashes.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::QueryError;

/// Identity and parameters of a query: any JSON-serializable value.
///
/// ```ignore
/// let key = QueryKey::new(("todos", TodoFilter { done: false }))?;
/// let key = QueryKey::from(serde_json::json!(["todo", { "id": 5 }]));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Value);

impl QueryKey {
    /// Serialize `key` into a query key.
    ///
    /// Fails with [`QueryError::Configuration`] when the value cannot be
    /// represented as JSON (for example a map with non-string keys).
    pub fn new(key: impl Serialize) -> Result<Self, QueryError> {
        serde_json::to_value(key)
            .map(QueryKey)
            .map_err(|e| QueryError::configuration(format!("query key is not serializable: {e}")))
    }

    /// The underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Canonical hash of this key.
    pub fn hash(&self) -> QueryHash {
        hash_query_key(self)
    }
}

impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        QueryKey(value)
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        QueryKey(Value::String(value.to_owned()))
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        QueryKey(Value::String(value))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical string identity of a [`QueryKey`].
///
/// Cheap to clone and usable as a map key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(Arc<str>);

impl QueryHash {
    /// The hash as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for QueryHash {
    fn from(value: String) -> Self {
        QueryHash(value.into())
    }
}

impl From<&str> for QueryHash {
    fn from(value: &str) -> Self {
        QueryHash(value.into())
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Custom key hashing function, configurable per query.
pub type QueryKeyHashFn = Arc<dyn Fn(&QueryKey) -> Result<QueryHash, QueryError> + Send + Sync>;

/// Hash a key into its canonical form.
///
/// Sequences keep their order. Mapping members are emitted sorted by name,
/// recursively, and members whose value is `null` are left out, so
/// `{"a": 1, "b": null}` and `{"a": 1}` hash identically.
pub fn hash_query_key(key: &QueryKey) -> QueryHash {
    let mut out = String::new();
    write_canonical(&key.0, &mut out);
    QueryHash::from(out)
}

pub(crate) fn hash_with(
    key: &QueryKey,
    hash_fn: Option<&QueryKeyHashFn>,
) -> Result<QueryHash, QueryError> {
    match hash_fn {
        Some(hash_fn) => hash_fn(key),
        None => Ok(hash_query_key(key)),
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut members: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| !v.is_null()).collect();
            members.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, member)) in members.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(name, out);
                out.push(':');
                write_canonical(member, out);
            }
            out.push('}');
        }
        Value::String(s) => write_string(s, out),
        // Scalars already have a unique JSON spelling.
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    let _ = write!(out, "{}", Value::String(s.to_owned()));
}

/// Whether `a` contains `b`: equal scalars, `b` a prefix of sequence `a`
/// (element-wise partial match), or every member of mapping `b` matching the
/// same member of `a`.
pub fn partial_match_key(a: &QueryKey, b: &QueryKey) -> bool {
    partial_deep_equal(&a.0, &b.0)
}

fn partial_deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(a), Value::Array(b)) => {
            b.len() <= a.len() && a.iter().zip(b).all(|(a, b)| partial_deep_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => partial_object(a, b),
        (a, b) => a == b,
    }
}

fn partial_object(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    b.iter().all(|(name, expected)| match a.get(name) {
        Some(actual) => partial_deep_equal(actual, expected),
        None => expected.is_null(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(value: Value) -> QueryKey {
        QueryKey::from(value)
    }

    #[test]
    fn mapping_order_does_not_matter() {
        let a = key(json!(["todos", { "page": 1, "filter": { "done": true, "tag": "x" } }]));
        let b = key(json!(["todos", { "filter": { "tag": "x", "done": true }, "page": 1 }]));
        assert_eq!(a.hash(), b.hash());
        assert_eq!(
            a.hash().as_str(),
            r#"["todos",{"filter":{"done":true,"tag":"x"},"page":1}]"#
        );
    }

    #[test]
    fn sequence_order_matters() {
        assert_ne!(key(json!([1, 2])).hash(), key(json!([2, 1])).hash());
    }

    #[test]
    fn null_members_are_omitted() {
        let a = key(json!({ "id": 1, "extra": null }));
        let b = key(json!({ "id": 1 }));
        assert_eq!(a.hash(), b.hash());
        // Nulls inside sequences are positional and kept.
        assert_ne!(key(json!([1, null])).hash(), key(json!([1])).hash());
    }

    #[test]
    fn strings_are_escaped() {
        let hash = key(json!({ "a\"b": "line\nbreak" })).hash();
        assert_eq!(hash.as_str(), r#"{"a\"b":"line\nbreak"}"#);
    }

    #[test]
    fn non_serializable_key_is_configuration_error() {
        let mut map = std::collections::HashMap::new();
        map.insert((1, 2), "tuple keys are not JSON");
        let err = QueryKey::new(map).unwrap_err();
        assert!(matches!(err, QueryError::Configuration { .. }));
    }

    #[test]
    fn partial_matching() {
        let full = key(json!(["todos", { "page": 1, "done": false }, "x"]));
        assert!(partial_match_key(&full, &key(json!(["todos"]))));
        assert!(partial_match_key(&full, &key(json!(["todos", { "page": 1 }]))));
        assert!(!partial_match_key(&full, &key(json!(["todos", { "page": 2 }]))));
        assert!(!partial_match_key(&full, &key(json!(["posts"]))));
        assert!(!partial_match_key(&key(json!(["todos"])), &full));
        assert!(partial_match_key(&key(json!("a")), &key(json!("a"))));
    }
}

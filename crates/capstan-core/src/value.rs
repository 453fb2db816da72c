//! The state-bag value model.
//!
//! State flowing through a workflow is a tree of [`Value`]s rooted at a
//! [`StateBag`]. Every nested mapping read out of a bag is itself a bag,
//! so `.get_path("a.b.c")` works uniformly at any depth. Subtrees that
//! were offloaded to the blob store appear as [`BlockPointer`]s and are
//! resolved at hydration time — a pointer holds only primitives plus the
//! reference, and is never itself pointerized.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Inline reference replacing a large state subtree.
///
/// Wire shape: `{"type":"s3_reference","bucket":…,"key":…,"checksum":…,"size_bytes":…}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPointer {
    #[serde(rename = "type")]
    pub kind: PointerKind,
    pub bucket: String,
    pub key: String,
    pub checksum: String,
    pub size_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointerKind {
    #[serde(rename = "s3_reference")]
    S3Reference,
}

impl BlockPointer {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        checksum: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            kind: PointerKind::S3Reference,
            bucket: bucket.into(),
            key: key.into(),
            checksum: checksum.into(),
            size_bytes,
        }
    }
}

/// A single state value: scalar, ordered sequence, nested bag, or pointer.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Null, bool, number, or string. Never an object or array.
    Scalar(serde_json::Value),
    Seq(Vec<Value>),
    Map(StateBag),
    Pointer(BlockPointer),
}

impl Value {
    pub fn null() -> Self {
        Value::Scalar(serde_json::Value::Null)
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Scalar(serde_json::Value::String(s.into()))
    }

    pub fn uint(n: u64) -> Self {
        Value::Scalar(serde_json::Value::from(n))
    }

    pub fn int(n: i64) -> Self {
        Value::Scalar(serde_json::Value::from(n))
    }

    pub fn bool(b: bool) -> Self {
        Value::Scalar(serde_json::Value::Bool(b))
    }

    /// Convert arbitrary JSON into the tagged model, recognizing pointer
    /// objects and recursively wrapping nested mappings.
    pub fn from_json(raw: serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Array(items) => {
                Value::Seq(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if is_pointer_shape(&map) {
                    let obj = serde_json::Value::Object(map);
                    match serde_json::from_value::<BlockPointer>(obj.clone()) {
                        Ok(p) => Value::Pointer(p),
                        // Pointer-shaped but malformed: keep it as data.
                        Err(_) => Value::Map(StateBag::from_json_map(as_map(obj))),
                    }
                } else {
                    Value::Map(StateBag::from_json_map(map))
                }
            }
            scalar => Value::Scalar(scalar),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Scalar(s) => s.clone(),
            Value::Seq(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(bag) => bag.to_json(),
            Value::Pointer(p) => serde_json::to_value(p).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Value::Pointer(_))
    }

    pub fn as_map(&self) -> Option<&StateBag> {
        match self {
            Value::Map(bag) => Some(bag),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut StateBag> {
        match self {
            Value::Map(bag) => Some(bag),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Scalar(s) => s.as_u64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Scalar(s) => s.as_bool(),
            _ => None,
        }
    }

    /// Serialized size in bytes (compact JSON).
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    /// True if any pointer in this subtree contains another pointer
    /// beneath it. A well-formed tree never does: pointers are leaves.
    pub fn contains_pointer(&self) -> bool {
        match self {
            Value::Pointer(_) => true,
            Value::Seq(items) => items.iter().any(Value::contains_pointer),
            Value::Map(bag) => bag.values().any(Value::contains_pointer),
            Value::Scalar(_) => false,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(raw))
    }
}

impl From<serde_json::Value> for Value {
    fn from(raw: serde_json::Value) -> Self {
        Value::from_json(raw)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

fn is_pointer_shape(map: &serde_json::Map<String, serde_json::Value>) -> bool {
    map.get("type").and_then(|t| t.as_str()) == Some("s3_reference")
        && map.contains_key("bucket")
        && map.contains_key("key")
}

fn as_map(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match v {
        serde_json::Value::Object(m) => m,
        _ => serde_json::Map::new(),
    }
}

/// A semantically typed mapping from string keys to [`Value`]s.
///
/// Ordered (`BTreeMap`) so serialization is deterministic — content
/// addressing depends on it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateBag(BTreeMap<String, Value>);

impl StateBag {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_json_map(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(
            map.into_iter()
                .map(|(k, v)| (k, Value::from_json(v)))
                .collect(),
        )
    }

    /// Parse a JSON object into a bag. Non-objects yield an empty bag.
    pub fn from_json(raw: serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Object(map) => Self::from_json_map(map),
            _ => Self::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.0.get_mut(key)
    }

    /// Get with default — missing keys and nulls both yield the default.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        match self.0.get(key) {
            None | Some(Value::Scalar(serde_json::Value::Null)) => default,
            Some(v) => v.clone(),
        }
    }

    /// Walk a dotted path (`"user.profile.name"`) through nested bags.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.0.get(first)?;
        for part in parts {
            current = current.as_map()?.get(part)?;
        }
        Some(current)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn insert_json(&mut self, key: impl Into<String>, raw: serde_json::Value) -> Option<Value> {
        self.0.insert(key.into(), Value::from_json(raw))
    }

    /// Remove and return — the consumed-on-read semantics `__next_node`
    /// relies on.
    pub fn pop(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Convenience readers for the reserved metadata keys.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Serialized size in bytes (compact JSON).
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    /// True if any pointer anywhere in the tree sits beneath another
    /// pointer. Always false for bags produced by the kernel.
    pub fn has_nested_pointer(&self) -> bool {
        fn check(v: &Value, under_pointer: bool) -> bool {
            match v {
                Value::Pointer(_) => under_pointer,
                Value::Seq(items) => items.iter().any(|i| check(i, under_pointer)),
                Value::Map(bag) => bag.values().any(|i| check(i, under_pointer)),
                Value::Scalar(_) => false,
            }
        }
        self.values().any(|v| check(v, false))
    }
}

impl Serialize for StateBag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StateBag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(StateBag::from_json(raw))
    }
}

impl FromIterator<(String, Value)> for StateBag {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for StateBag {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_maps_wrap_recursively() {
        let bag = StateBag::from_json(serde_json::json!({
            "user": {"profile": {"name": "ada"}}
        }));
        assert_eq!(
            bag.get_path("user.profile.name").and_then(Value::as_str),
            Some("ada")
        );
    }

    #[test]
    fn pointer_shape_round_trips() {
        let raw = serde_json::json!({
            "type": "s3_reference",
            "bucket": "b",
            "key": "workflows/o/w/e/blocks/abc",
            "checksum": "deadbeef",
            "size_bytes": 4096
        });
        let value = Value::from_json(raw.clone());
        assert!(value.is_pointer());
        assert_eq!(value.to_json(), raw);
    }

    #[test]
    fn plain_map_with_type_field_stays_a_map() {
        let value = Value::from_json(serde_json::json!({"type": "llm", "model": "m"}));
        assert!(value.as_map().is_some());
    }

    #[test]
    fn get_or_promotes_default_over_null() {
        let mut bag = StateBag::new();
        bag.insert("k", Value::null());
        assert_eq!(bag.get_or("k", Value::uint(7)).as_u64(), Some(7));
        assert_eq!(bag.get_or("missing", Value::str("d")).as_str(), Some("d"));
    }

    #[test]
    fn pop_consumes() {
        let mut bag = StateBag::new();
        bag.insert("__next_node", Value::str("b"));
        assert_eq!(bag.pop("__next_node").and_then(|v| v.as_str().map(String::from)), Some("b".into()));
        assert!(bag.get("__next_node").is_none());
    }
}

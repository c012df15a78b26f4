//! Metadata Bags
//!
//! Open key/value maps attached to checkout sessions, orders and webhook
//! log entries. Every bag obeys one merge law: shallow, per key, and the
//! incoming value wins only when it is non-null. Nulls are never stored.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Shallow key/value metadata with non-null-wins merging
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetadataBag(BTreeMap<String, Value>);

impl MetadataBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value. Null values are dropped.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let value = value.into();
        if !value.is_null() {
            self.0.insert(key.into(), value);
        }
    }

    /// Insert only when `value` is `Some`.
    pub fn insert_opt<V: Into<Value>>(&mut self, key: impl Into<String>, value: Option<V>) {
        if let Some(value) = value {
            self.insert(key, value);
        }
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Merge `incoming` into `self`: new keys win, nulls never overwrite.
    pub fn merge(&mut self, incoming: &Self) {
        for (key, value) in &incoming.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Merge and return, leaving both inputs untouched.
    #[must_use]
    pub fn merged(&self, incoming: &Self) -> Self {
        let mut out = self.clone();
        out.merge(incoming);
        out
    }

    /// Fill keys that are absent, keeping every existing value.
    pub fn ensure(&mut self, defaults: &Self) {
        for (key, value) in &defaults.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Trimmed, non-empty string value. Numbers and booleans are rendered.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Build from a JSON value; anything other than an object yields an empty bag.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => Self::default(),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }

    /// Serialized form used by the SQL ledger.
    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }

    /// Parse the SQL ledger's stored form. Corrupt rows read as empty.
    pub fn from_json_str(raw: &str) -> Self {
        serde_json::from_str::<Value>(raw)
            .map(Self::from_json)
            .unwrap_or_default()
    }
}

impl FromIterator<(String, Value)> for MetadataBag {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut bag = Self::default();
        for (key, value) in iter {
            bag.insert(key, value);
        }
        bag
    }
}

impl From<HashMap<String, String>> for MetadataBag {
    fn from(map: HashMap<String, String>) -> Self {
        map.into_iter().map(|(k, v)| (k, Value::String(v))).collect()
    }
}

impl From<&HashMap<String, String>> for MetadataBag {
    fn from(map: &HashMap<String, String>) -> Self {
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect()
    }
}

impl<'de> Deserialize<'de> for MetadataBag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?;
        Ok(raw.unwrap_or_default().into_iter().collect())
    }
}

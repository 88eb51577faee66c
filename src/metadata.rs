//! Adapter metadata as stored in the safetensors `__metadata__` header entry
//!
//! The container format nominally stores string-to-string pairs, but files in
//! the wild are written by many trainers and some of them emit numbers or
//! nested objects. Values are therefore kept as a tagged union and every
//! "must be a string" check is a pattern match.

use serde_json::{Map, Number, Value};
use std::collections::HashMap;

use crate::error::{LoraError, Result};

/// A single metadata value of indeterminate type
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    String(String),
    Number(Number),
    Bool(bool),
    Null,
    /// JSON array or object
    Nested(Value),
}

impl MetadataValue {
    /// Name of the variant, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::Bool(_) => "bool",
            Self::Null => "null",
            Self::Nested(Value::Array(_)) => "array",
            Self::Nested(_) => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Value> for MetadataValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Self::String(s),
            Value::Number(n) => Self::Number(n),
            Value::Bool(b) => Self::Bool(b),
            Value::Null => Self::Null,
            nested @ (Value::Array(_) | Value::Object(_)) => Self::Nested(nested),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// Read-only key-value metadata of one adapter file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: HashMap<String, MetadataValue>,
}

impl Metadata {
    pub fn new(entries: HashMap<String, MetadataValue>) -> Self {
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up a string-typed field
    ///
    /// Returns `Ok(None)` when the key is absent and a
    /// [`LoraError::TypeMismatch`] when the value is present but not a string.
    pub fn string(&self, key: &str) -> Result<Option<&str>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(MetadataValue::String(s)) => Ok(Some(s)),
            Some(other) => Err(LoraError::TypeMismatch {
                key: key.to_string(),
                expected: "string",
                found: other.type_name(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The subset of entries that the container format can store
    pub fn string_entries(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect()
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self::new(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<MetadataValue>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

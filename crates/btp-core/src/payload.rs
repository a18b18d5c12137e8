//! Ordered custom payloads.

use serde::{Deserialize, Serialize};

/// A single custom payload value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PayloadValue {
    Binary(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl From<Vec<u8>> for PayloadValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<&str> for PayloadValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<serde_json::Value> for PayloadValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// Name → value map that keeps insertion order.
///
/// Order matters on the wire: custom entries become protocol-data items in
/// the order they were inserted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomData(Vec<(String, PayloadValue)>);

impl CustomData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. An existing entry with the same name is replaced in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<PayloadValue>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PayloadValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PayloadValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<PayloadValue>> FromIterator<(K, V)> for CustomData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut data = Self::new();
        for (name, value) in iter {
            data.insert(name, value);
        }
        data
    }
}

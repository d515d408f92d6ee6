use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Value stored under a bundle key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum BundleValue {
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
}

/// Key/value payload exchanged with the broker.
///
/// Getters are typed: asking for a string under a key holding bytes yields
/// `None`, the same as a missing key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bundle {
    entries: BTreeMap<String, BundleValue>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), BundleValue::Str(value.into()));
    }

    pub fn put_bytes(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.entries.insert(key.into(), BundleValue::Bytes(value));
    }

    pub fn put_bool(&mut self, key: impl Into<String>, value: bool) {
        self.entries.insert(key.into(), BundleValue::Bool(value));
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(BundleValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.entries.get(key) {
            Some(BundleValue::Bytes(value)) => Some(value),
            _ => None,
        }
    }

    /// Missing or non-boolean values read as false
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.entries.get(key), Some(BundleValue::Bool(true)))
    }

    pub fn get(&self, key: &str) -> Option<&BundleValue> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<BundleValue> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

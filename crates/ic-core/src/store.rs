use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// String key/value persistence used by the caches and telemetry
#[async_trait::async_trait]
pub trait NameValueStore: Send + Sync {
    /// Get a value by key
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store a value under a key
    async fn put(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Store several values; either all of them land or none do
    async fn put_all(&self, entries: &[(String, String)]) -> StoreResult<()>;

    /// Remove a key
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// All stored keys
    async fn keys(&self) -> StoreResult<Vec<String>>;

    /// Snapshot of every entry
    async fn get_all(&self) -> StoreResult<HashMap<String, String>>;

    /// Remove everything
    async fn clear(&self) -> StoreResult<()>;
}

/// In-memory name/value store for testing and simple use cases
#[derive(Debug, Clone, Default)]
pub struct MemoryNameValueStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryNameValueStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait::async_trait]
impl NameValueStore for MemoryNameValueStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| StoreError::LockPoisoned)?
            .get(key)
            .cloned())
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn put_all(&self, entries: &[(String, String)]) -> StoreResult<()> {
        let mut map = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .remove(key);
        Ok(())
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| StoreError::LockPoisoned)?
            .keys()
            .cloned()
            .collect())
    }

    async fn get_all(&self) -> StoreResult<HashMap<String, String>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| StoreError::LockPoisoned)?
            .clone())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .clear();
        Ok(())
    }
}

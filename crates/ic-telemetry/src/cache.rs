use std::sync::Arc;

use ic_core::{NameValueStore, StoreResult};
use tracing::{debug, warn};

use crate::request_telemetry::LastRequestTelemetry;
use crate::schema::CURRENT_SCHEMA_VERSION;

/// Store holding the last request telemetry, apart from the token cache
pub const LAST_REQUEST_TELEMETRY_STORE_NAME: &str =
    "com.microsoft.identity.client.last_request_telemetry";

pub const LAST_TELEMETRY_OBJECT_CACHE_KEY: &str = "last_request_telemetry_object";
pub const LAST_TELEMETRY_HEADER_STRING_CACHE_KEY: &str = "last_request_telemetry_header";
pub const LAST_TELEMETRY_SCHEMA_VERSION_CACHE_KEY: &str = "last_request_telemetry_schema_version";

/// Persists the last request telemetry as three entries written together:
/// the object, its header string and the schema version it was built with.
#[derive(Clone)]
pub struct LastRequestTelemetryCache {
    store: Arc<dyn NameValueStore>,
}

impl std::fmt::Debug for LastRequestTelemetryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LastRequestTelemetryCache").finish_non_exhaustive()
    }
}

impl LastRequestTelemetryCache {
    pub fn new(store: Arc<dyn NameValueStore>) -> Self {
        Self { store }
    }

    /// Stored telemetry, or None when nothing usable is stored.
    ///
    /// Entries written by a different schema version are ignored.
    pub async fn get_request_telemetry_from_cache(&self) -> Option<LastRequestTelemetry> {
        let stored_version = match self.store.get(LAST_TELEMETRY_SCHEMA_VERSION_CACHE_KEY).await {
            Ok(version) => version,
            Err(e) => {
                warn!("Failed to load last request telemetry: {}", e);
                return None;
            }
        };
        if let Some(version) = stored_version.as_deref()
            && version != CURRENT_SCHEMA_VERSION
        {
            debug!("Ignoring last request telemetry with schema version {}", version);
            return None;
        }

        let json = match self.store.get(LAST_TELEMETRY_OBJECT_CACHE_KEY).await {
            Ok(Some(json)) => json,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to load last request telemetry: {}", e);
                return None;
            }
        };

        match serde_json::from_str(&json) {
            Ok(telemetry) => Some(telemetry),
            Err(e) => {
                warn!("Discarding unreadable last request telemetry: {}", e);
                None
            }
        }
    }

    /// Stored header string, as it was when last saved
    pub async fn get_header_string(&self) -> StoreResult<Option<String>> {
        self.store.get(LAST_TELEMETRY_HEADER_STRING_CACHE_KEY).await
    }

    pub async fn save_request_telemetry_to_cache(
        &self,
        telemetry: &LastRequestTelemetry,
    ) -> StoreResult<()> {
        let entries = [
            (
                LAST_TELEMETRY_OBJECT_CACHE_KEY.to_string(),
                serde_json::to_string(telemetry)?,
            ),
            (
                LAST_TELEMETRY_HEADER_STRING_CACHE_KEY.to_string(),
                telemetry.header_string(),
            ),
            (
                LAST_TELEMETRY_SCHEMA_VERSION_CACHE_KEY.to_string(),
                telemetry.schema_version().to_string(),
            ),
        ];
        self.store.put_all(&entries).await
    }

    pub async fn clear(&self) -> StoreResult<()> {
        for key in [
            LAST_TELEMETRY_OBJECT_CACHE_KEY,
            LAST_TELEMETRY_HEADER_STRING_CACHE_KEY,
            LAST_TELEMETRY_SCHEMA_VERSION_CACHE_KEY,
        ] {
            self.store.remove(key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_telemetry::FailedRequest;
    use ic_core::MemoryNameValueStore;

    #[tokio::test]
    async fn test_save_writes_three_entries() {
        let store = Arc::new(MemoryNameValueStore::new());
        let cache = LastRequestTelemetryCache::new(store.clone());

        let mut telemetry = LastRequestTelemetry::new("2");
        telemetry.increment_silent_success_count();
        cache.save_request_telemetry_to_cache(&telemetry).await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[LAST_TELEMETRY_SCHEMA_VERSION_CACHE_KEY], "2");
        assert_eq!(all[LAST_TELEMETRY_HEADER_STRING_CACHE_KEY], "2|1|||2,");
        assert_eq!(
            all[LAST_TELEMETRY_OBJECT_CACHE_KEY],
            r#"{"silent_successful_count":1,"failed_requests":[],"schema_version":"2","platform_telemetry":{}}"#
        );
    }

    #[tokio::test]
    async fn test_load_saved() {
        let cache = LastRequestTelemetryCache::new(Arc::new(MemoryNameValueStore::new()));
        assert!(cache.get_request_telemetry_from_cache().await.is_none());

        let mut telemetry = LastRequestTelemetry::new("2");
        telemetry.append_failed_request(FailedRequest::new("API", "corr", "ERR"));
        cache.save_request_telemetry_to_cache(&telemetry).await.unwrap();

        let loaded = cache.get_request_telemetry_from_cache().await.unwrap();
        assert_eq!(loaded, telemetry);
    }

    #[tokio::test]
    async fn test_other_schema_version_ignored() {
        let store = Arc::new(MemoryNameValueStore::new());
        store
            .put(LAST_TELEMETRY_OBJECT_CACHE_KEY, r#"{"schema_version":"1"}"#)
            .await
            .unwrap();
        store.put(LAST_TELEMETRY_SCHEMA_VERSION_CACHE_KEY, "1").await.unwrap();

        let cache = LastRequestTelemetryCache::new(store);
        assert!(cache.get_request_telemetry_from_cache().await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_object_ignored() {
        let store = Arc::new(MemoryNameValueStore::new());
        store.put(LAST_TELEMETRY_OBJECT_CACHE_KEY, "{").await.unwrap();

        let cache = LastRequestTelemetryCache::new(store.clone());
        assert!(cache.get_request_telemetry_from_cache().await.is_none());

        cache.clear().await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }
}

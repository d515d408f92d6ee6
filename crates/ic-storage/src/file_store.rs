use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use ic_core::{NameValueStore, StoreError, StoreResult};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, instrument};

use crate::crypto::StorageEncryptionManager;

/// File-based name/value store
///
/// Each store is one JSON object mapping keys to values. When an encryption
/// manager is configured every value is encrypted; keys stay readable.
///
/// # Directory Structure
/// ```text
/// ~/.config/identity-common/storage/
/// ├── meta.json              # Key derivation metadata (passphrase keys)
/// ├── <store>.lock           # Advisory lock file
/// └── <store>.json           # Entries
/// ```
#[derive(Debug)]
pub struct FileNameValueStore {
    file_path: PathBuf,
    lock_file: PathBuf,
    encryption: Option<Arc<StorageEncryptionManager>>,
    /// Serializes writers inside this process; the file lock covers other processes
    write_guard: Mutex<()>,
    /// Decrypted entries, filled on first read
    cache: RwLock<Option<HashMap<String, String>>>,
}

impl FileNameValueStore {
    /// Open (or create) the store `store_name` under `storage_dir`
    pub async fn new(
        storage_dir: impl AsRef<Path>,
        store_name: &str,
        encryption: Option<Arc<StorageEncryptionManager>>,
    ) -> StoreResult<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        fs::create_dir_all(&storage_dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&storage_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self {
            file_path: storage_dir.join(format!("{}.json", store_name)),
            lock_file: storage_dir.join(format!("{}.lock", store_name)),
            encryption,
            write_guard: Mutex::new(()),
            cache: RwLock::new(None),
        })
    }

    /// Platform default directory for stores
    pub fn default_storage_dir() -> StoreResult<PathBuf> {
        ic_core::config::default_storage_dir()
            .map_err(|e| StoreError::InvalidData(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn acquire_lock(&self) -> StoreResult<std::fs::File> {
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::LockTimeout)?;

        Ok(lock_file)
    }

    async fn read_from_disk(&self) -> StoreResult<HashMap<String, String>> {
        if !self.file_path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(&self.file_path).await?;
        let stored: HashMap<String, String> = serde_json::from_str(&content)
            .map_err(|e| StoreError::InvalidData(format!("Invalid store file: {}", e)))?;

        let Some(encryption) = &self.encryption else {
            return Ok(stored);
        };

        let mut entries = HashMap::with_capacity(stored.len());
        for (key, value) in stored {
            let plaintext = encryption.decrypt_string(&value).await?;
            entries.insert(key, plaintext);
        }
        Ok(entries)
    }

    async fn write_to_disk(&self, entries: &HashMap<String, String>) -> StoreResult<()> {
        let stored = match &self.encryption {
            Some(encryption) => {
                let mut stored = HashMap::with_capacity(entries.len());
                for (key, value) in entries {
                    stored.insert(key.clone(), encryption.encrypt_string(value).await?);
                }
                stored
            }
            None => entries.clone(),
        };

        let json = serde_json::to_string_pretty(&stored)?;

        // Atomic write: temp file, fsync, rename
        let temp_path = self.file_path.with_extension("tmp");
        fs::write(&temp_path, json).await?;
        let file = std::fs::File::open(&temp_path)?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.file_path).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.file_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    async fn snapshot(&self) -> StoreResult<HashMap<String, String>> {
        {
            let cache = self.cache.read().await;
            if let Some(entries) = cache.as_ref() {
                return Ok(entries.clone());
            }
        }

        let entries = self.read_from_disk().await?;
        *self.cache.write().await = Some(entries.clone());
        Ok(entries)
    }

    /// Read-modify-write under both the in-process guard and the file lock
    async fn mutate<F>(&self, apply: F) -> StoreResult<()>
    where
        F: FnOnce(&mut HashMap<String, String>) + Send,
    {
        let _guard = self.write_guard.lock().await;
        let _lock = self.acquire_lock()?;

        let mut entries = self.read_from_disk().await?;
        apply(&mut entries);

        if let Err(e) = self.write_to_disk(&entries).await {
            error!("Failed to write store {}: {}", self.file_path.display(), e);
            *self.cache.write().await = None;
            return Err(e);
        }

        *self.cache.write().await = Some(entries);
        Ok(())
    }
}

#[async_trait::async_trait]
impl NameValueStore for FileNameValueStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.snapshot().await?.get(key).cloned())
    }

    #[instrument(skip(self, value))]
    async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.mutate(move |entries| {
            entries.insert(key, value);
        })
        .await
    }

    #[instrument(skip(self, entries), fields(count = entries.len()))]
    async fn put_all(&self, entries: &[(String, String)]) -> StoreResult<()> {
        let entries = entries.to_vec();
        self.mutate(move |map| map.extend(entries)).await
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.mutate(move |entries| {
            if entries.remove(&key).is_some() {
                debug!("Removed entry {}", key);
            }
        })
        .await
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.snapshot().await?.into_keys().collect())
    }

    async fn get_all(&self) -> StoreResult<HashMap<String, String>> {
        self.snapshot().await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.mutate(|entries| entries.clear()).await
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use ic_core::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::crypto::{EncryptionKey, fill_random};
use crate::secret::SecretProvider;

const SALT_LEN: usize = 32;

/// Identifier written into ciphertext produced with a caller supplied key
pub const PREDEFINED_KEY_IDENTIFIER: &str = "U001";
/// Identifier written into ciphertext produced with a passphrase derived key
pub const PASSPHRASE_KEY_IDENTIFIER: &str = "P001";

/// Supplies the key for one key identifier
#[async_trait::async_trait]
pub trait KeyLoader: Send + Sync {
    /// Human readable name, used in logs
    fn alias(&self) -> &str;

    /// Four byte identifier stored alongside ciphertext
    fn key_identifier(&self) -> &str;

    async fn load_key(&self) -> StoreResult<EncryptionKey>;
}

impl std::fmt::Debug for dyn KeyLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLoader")
            .field("alias", &self.alias())
            .field("key_identifier", &self.key_identifier())
            .finish()
    }
}

/// Key handed over by the embedding application
#[derive(Debug, Clone)]
pub struct PredefinedKeyLoader {
    alias: String,
    identifier: String,
    key: EncryptionKey,
}

impl PredefinedKeyLoader {
    pub fn new(alias: impl Into<String>, key: EncryptionKey) -> Self {
        Self::with_identifier(alias, PREDEFINED_KEY_IDENTIFIER, key)
    }

    pub fn with_identifier(
        alias: impl Into<String>,
        identifier: impl Into<String>,
        key: EncryptionKey,
    ) -> Self {
        Self {
            alias: alias.into(),
            identifier: identifier.into(),
            key,
        }
    }
}

#[async_trait::async_trait]
impl KeyLoader for PredefinedKeyLoader {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn key_identifier(&self) -> &str {
        &self.identifier
    }

    async fn load_key(&self) -> StoreResult<EncryptionKey> {
        Ok(self.key.clone())
    }
}

/// Metadata for key derivation, persisted as `meta.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMeta {
    pub version: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Base64-encoded salt for Argon2id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase_salt: Option<String>,
}

impl Default for KeyMeta {
    fn default() -> Self {
        Self {
            version: 1,
            created_at: chrono::Utc::now(),
            passphrase_salt: None,
        }
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // m=64MB, t=3, p=1
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 1,
        }
    }
}

/// Derives the storage key from a passphrase with Argon2id.
///
/// The salt lives in `meta.json` next to the store. The key is derived once
/// and kept for the lifetime of the loader.
pub struct PassphraseKeyLoader {
    meta_path: PathBuf,
    secret_provider: Arc<dyn SecretProvider>,
    kdf: KdfParams,
    key: OnceCell<EncryptionKey>,
}

impl PassphraseKeyLoader {
    pub fn new(storage_dir: &Path, secret_provider: Arc<dyn SecretProvider>) -> Self {
        Self {
            meta_path: storage_dir.join("meta.json"),
            secret_provider,
            kdf: KdfParams::default(),
            key: OnceCell::new(),
        }
    }

    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    async fn load_meta(&self) -> StoreResult<KeyMeta> {
        if !self.meta_path.exists() {
            return Ok(KeyMeta::default());
        }

        let content = fs::read_to_string(&self.meta_path).await?;
        serde_json::from_str(&content)
            .map_err(|e| StoreError::InvalidData(format!("Invalid meta.json: {}", e)))
    }

    async fn save_meta(&self, meta: &KeyMeta) -> StoreResult<()> {
        if let Some(parent) = self.meta_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let meta_json = serde_json::to_string_pretty(meta)?;
        fs::write(&self.meta_path, meta_json).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn derive(&self) -> StoreResult<EncryptionKey> {
        let mut meta = self.load_meta().await?;

        let salt = match meta.passphrase_salt {
            Some(ref salt_b64) => base64::engine::general_purpose::STANDARD
                .decode(salt_b64)
                .map_err(|_| StoreError::CorruptedStore)?,
            None => {
                let mut salt = vec![0u8; SALT_LEN];
                fill_random(&mut salt)?;
                meta.passphrase_salt =
                    Some(base64::engine::general_purpose::STANDARD.encode(&salt));
                self.save_meta(&meta).await?;
                debug!("Generated new passphrase salt");
                salt
            }
        };

        let passphrase = self
            .secret_provider
            .get_passphrase("Enter passphrase for token cache storage")
            .await
            .ok_or(StoreError::PassphraseUnavailable)?;

        let params = Params::new(
            self.kdf.memory_kib,
            self.kdf.iterations,
            self.kdf.parallelism,
            Some(32),
        )
            .map_err(|e| StoreError::Encryption(format!("Invalid Argon2 params: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
            .map_err(|e| StoreError::Encryption(format!("Key derivation failed: {}", e)))?;

        Ok(EncryptionKey::from_bytes(key))
    }
}

impl std::fmt::Debug for PassphraseKeyLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseKeyLoader")
            .field("meta_path", &self.meta_path)
            .field("kdf", &self.kdf)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait::async_trait]
impl KeyLoader for PassphraseKeyLoader {
    fn alias(&self) -> &str {
        "passphrase"
    }

    fn key_identifier(&self) -> &str {
        PASSPHRASE_KEY_IDENTIFIER
    }

    async fn load_key(&self) -> StoreResult<EncryptionKey> {
        self.key.get_or_try_init(|| self.derive()).await.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::{NoSecretProvider, StaticSecretProvider};
    use tempfile::TempDir;

    const FAST_KDF: KdfParams = KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    };

    fn loader(dir: &Path, provider: Arc<dyn SecretProvider>) -> PassphraseKeyLoader {
        PassphraseKeyLoader::new(dir, provider).with_kdf_params(FAST_KDF)
    }

    #[tokio::test]
    async fn test_same_passphrase_same_key() {
        let temp = TempDir::new().unwrap();
        let provider: Arc<dyn SecretProvider> = Arc::new(StaticSecretProvider::new("correct horse"));

        let first = loader(temp.path(), provider.clone());
        let key1 = first.load_key().await.unwrap();
        assert!(temp.path().join("meta.json").exists());

        let second = loader(temp.path(), provider);
        let key2 = second.load_key().await.unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[tokio::test]
    async fn test_different_passphrase_different_key() {
        let temp = TempDir::new().unwrap();
        let a = loader(temp.path(), Arc::new(StaticSecretProvider::new("a")));
        let b = loader(temp.path(), Arc::new(StaticSecretProvider::new("b")));

        let key_a = a.load_key().await.unwrap();
        let key_b = b.load_key().await.unwrap();
        assert_ne!(key_a.as_bytes(), key_b.as_bytes());
    }

    #[tokio::test]
    async fn test_missing_passphrase() {
        let temp = TempDir::new().unwrap();
        let result = loader(temp.path(), Arc::new(NoSecretProvider)).load_key().await;
        assert!(matches!(result, Err(StoreError::PassphraseUnavailable)));
    }

    #[tokio::test]
    async fn test_predefined_loader() {
        let key = EncryptionKey::from_bytes([1u8; 32]);
        let loader = PredefinedKeyLoader::new("app", key);
        assert_eq!(loader.key_identifier(), PREDEFINED_KEY_IDENTIFIER);
        assert_eq!(loader.load_key().await.unwrap().as_bytes(), &[1u8; 32]);
    }
}

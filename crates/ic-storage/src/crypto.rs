use std::sync::Arc;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ic_core::{StoreError, StoreResult};
use tracing::{debug, warn};
use zeroize::ZeroizeOnDrop;

use crate::key_loader::KeyLoader;

/// Prefix marking data produced by [`StorageEncryptionManager`]
pub const ENCODE_VERSION: &[u8; 2] = b"E1";
/// Length of the key identifier that follows the prefix
pub const KEY_IDENTIFIER_LEN: usize = 4;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = ENCODE_VERSION.len() + KEY_IDENTIFIER_LEN;

/// AES-256 key (32 bytes)
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    /// Generate a new random encryption key
    pub fn generate() -> StoreResult<Self> {
        let mut key = [0u8; 32];
        fill_random(&mut key)?;
        Ok(Self { key })
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { key: bytes }
    }

    /// Key bytes (sensitive)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

pub(crate) fn fill_random(buf: &mut [u8]) -> StoreResult<()> {
    getrandom::fill(buf)
        .map_err(|e| StoreError::Encryption(format!("Random source unavailable: {}", e)))
}

/// Encrypts values before they reach disk.
///
/// Output layout: `"E1"` ‖ key identifier (4 bytes) ‖ nonce (12 bytes) ‖ ciphertext+tag.
/// The prefix and identifier are bound to the ciphertext as associated data.
#[derive(Debug, Clone)]
pub struct StorageEncryptionManager {
    encryption_loader: Arc<dyn KeyLoader>,
    decryption_loaders: Vec<Arc<dyn KeyLoader>>,
}

impl StorageEncryptionManager {
    /// `encryption_loader` encrypts new data and is also tried first for decryption.
    /// `legacy_loaders` are only used to decrypt data written with older keys.
    pub fn new(
        encryption_loader: Arc<dyn KeyLoader>,
        legacy_loaders: Vec<Arc<dyn KeyLoader>>,
    ) -> Self {
        let mut decryption_loaders = vec![encryption_loader.clone()];
        decryption_loaders.extend(legacy_loaders);
        Self {
            encryption_loader,
            decryption_loaders,
        }
    }

    pub async fn encrypt(&self, plaintext: &[u8]) -> StoreResult<Vec<u8>> {
        let identifier = self.encryption_loader.key_identifier();
        if identifier.len() != KEY_IDENTIFIER_LEN {
            return Err(StoreError::Encryption(format!(
                "Key identifier '{}' must be {} bytes",
                identifier, KEY_IDENTIFIER_LEN
            )));
        }

        let key = self.encryption_loader.load_key().await?;
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(ENCODE_VERSION);
        header.extend_from_slice(identifier.as_bytes());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        fill_random(&mut nonce_bytes)?;

        let cipher = Aes256Gcm::new(key.as_bytes().into());
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|e| StoreError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut output = header;
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Decrypt data produced by [`encrypt`](Self::encrypt). Data without the
    /// `"E1"` prefix was never encrypted and is returned unchanged.
    pub async fn decrypt(&self, data: &[u8]) -> StoreResult<Vec<u8>> {
        if !data.starts_with(ENCODE_VERSION) {
            debug!("Data is not encrypted, returning as-is");
            return Ok(data.to_vec());
        }
        if data.len() < HEADER_LEN + NONCE_LEN {
            return Err(StoreError::CorruptedStore);
        }

        let (header, rest) = data.split_at(HEADER_LEN);
        let identifier = &header[ENCODE_VERSION.len()..];
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let mut failures = Vec::new();
        for loader in self.loaders_for(identifier) {
            match Self::decrypt_with(loader.as_ref(), header, nonce_bytes, ciphertext).await {
                Ok(plaintext) => return Ok(plaintext),
                Err(e) => {
                    warn!("Failed to decrypt with key '{}': {}", loader.alias(), e);
                    failures.push(e);
                }
            }
        }

        match failures.len() {
            0 => Err(StoreError::Decryption(format!(
                "No key loader available for identifier '{}'",
                String::from_utf8_lossy(identifier)
            ))),
            1 => Err(failures.remove(0)),
            _ => Err(StoreError::DecryptionExhausted { failures }),
        }
    }

    /// Loaders whose identifier matches first, then the rest
    fn loaders_for(&self, identifier: &[u8]) -> Vec<&Arc<dyn KeyLoader>> {
        let (mut matching, others): (Vec<_>, Vec<_>) = self
            .decryption_loaders
            .iter()
            .partition(|l| l.key_identifier().as_bytes() == identifier);
        matching.extend(others);
        matching
    }

    async fn decrypt_with(
        loader: &dyn KeyLoader,
        header: &[u8],
        nonce_bytes: &[u8],
        ciphertext: &[u8],
    ) -> StoreResult<Vec<u8>> {
        let key = loader.load_key().await?;
        let cipher = Aes256Gcm::new(key.as_bytes().into());
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| StoreError::CorruptedStore)
    }

    /// Encrypt a string into its URL-safe base64 form
    pub async fn encrypt_string(&self, plaintext: &str) -> StoreResult<String> {
        let encrypted = self.encrypt(plaintext.as_bytes()).await?;
        Ok(URL_SAFE_NO_PAD.encode(encrypted))
    }

    /// Inverse of [`encrypt_string`](Self::encrypt_string). Values that are not
    /// encrypted (legacy plaintext) come back unchanged.
    pub async fn decrypt_string(&self, value: &str) -> StoreResult<String> {
        let Ok(raw) = URL_SAFE_NO_PAD.decode(value) else {
            return Ok(value.to_string());
        };
        if !raw.starts_with(ENCODE_VERSION) {
            return Ok(value.to_string());
        }

        let plaintext = self.decrypt(&raw).await?;
        String::from_utf8(plaintext)
            .map_err(|e| StoreError::InvalidData(format!("Decrypted value is not UTF-8: {}", e)))
    }
}

//! Persistent token cache storage
//!
//! - [`FileNameValueStore`]: one JSON file per store, values optionally encrypted
//! - [`StorageEncryptionManager`]: AES-256-GCM with key identifiers so data
//!   written with an older key stays readable
//! - [`AccountCredentialCache`]: typed accounts and credentials on top of any
//!   [`NameValueStore`](ic_core::NameValueStore)

pub mod cache_key;
pub mod credential_cache;
pub mod crypto;
pub mod file_store;
pub mod key_loader;
pub mod secret;

pub use cache_key::{account_cache_key, credential_cache_key};
pub use credential_cache::{AccountCredentialCache, CredentialFilter};
pub use crypto::{EncryptionKey, StorageEncryptionManager};
pub use file_store::FileNameValueStore;
pub use key_loader::{KdfParams, KeyLoader, PassphraseKeyLoader, PredefinedKeyLoader};
pub use secret::{EnvSecretProvider, NoSecretProvider, SecretProvider, StaticSecretProvider};

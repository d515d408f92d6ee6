use zeroize::Zeroizing;

/// Environment variable read by [`EnvSecretProvider`]
pub const PASSPHRASE_ENV_VAR: &str = "IDENTITY_COMMON_PASSPHRASE";

/// Source of the passphrase a [`PassphraseKeyLoader`](crate::PassphraseKeyLoader)
/// derives its storage key from
#[async_trait::async_trait]
pub trait SecretProvider: Send + Sync {
    /// Returns None if no passphrase is available.
    /// The returned string is zeroized when dropped.
    async fn get_passphrase(&self, prompt: &str) -> Option<Zeroizing<String>>;
}

/// Provider that never has a passphrase
#[derive(Debug, Clone, Default)]
pub struct NoSecretProvider;

#[async_trait::async_trait]
impl SecretProvider for NoSecretProvider {
    async fn get_passphrase(&self, _prompt: &str) -> Option<Zeroizing<String>> {
        None
    }
}

/// Fixed passphrase, for tests and headless tools
#[derive(Clone)]
pub struct StaticSecretProvider {
    secret: Zeroizing<String>,
}

impl StaticSecretProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
        }
    }
}

impl std::fmt::Debug for StaticSecretProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticSecretProvider([REDACTED])")
    }
}

#[async_trait::async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_passphrase(&self, _prompt: &str) -> Option<Zeroizing<String>> {
        Some(self.secret.clone())
    }
}

/// Reads the passphrase from an environment variable
#[derive(Debug, Clone)]
pub struct EnvSecretProvider {
    var: String,
}

impl EnvSecretProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvSecretProvider {
    fn default() -> Self {
        Self::new(PASSPHRASE_ENV_VAR)
    }
}

#[async_trait::async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_passphrase(&self, prompt: &str) -> Option<Zeroizing<String>> {
        match std::env::var(&self.var) {
            Ok(value) if !value.is_empty() => Some(Zeroizing::new(value)),
            _ => {
                tracing::debug!("{} not set, cannot answer '{}'", self.var, prompt);
                None
            }
        }
    }
}

//! Encryption key providers for inspected databases
//!
//! Host-owned encrypted databases (SQLCipher) need a key before the
//! inspector can read them. The host registers a [`KeyProvider`] per
//! database; where the key actually lives (keychain, secure enclave,
//! remote config) is the host's business and out of scope here.

use async_trait::async_trait;
use thiserror::Error;

/// Failure modes a key provider may report. The inspector surfaces all
/// of them as `AccessDenied` with the provider's reason attached.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("key not found")]
    KeyNotFound,
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),
    #[error("{0}")]
    Other(String),
}

/// Provides the encryption key for one registered database.
///
/// `get_key` may be asynchronous (keychain prompts, remote fetches).
/// The returned string is either a plaintext passphrase or a hex keyspec
/// literal of the form `x'<hex>'`.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn get_key(&self) -> Result<String, KeyError>;
}

/// Key provider returning a fixed string; used in tests and by hosts
/// that resolve the key themselves before registration.
pub struct StaticKeyProvider {
    key: String,
}

impl StaticKeyProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn get_key(&self) -> Result<String, KeyError> {
        Ok(self.key.clone())
    }
}

/// Validate a key returned by a provider.
///
/// Accepted forms:
/// - `x'<hex>'` where hex is 64 digits (SQLCipher 3 raw key) or 96
///   digits (SQLCipher 4 raw key + salt)
/// - any other non-empty string, treated as a passphrase
pub fn validate_key(key: &str) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::InvalidKeyFormat("empty key".to_string()));
    }

    if let Some(inner) = key.strip_prefix("x'").and_then(|rest| rest.strip_suffix('\'')) {
        if inner.len() != 64 && inner.len() != 96 {
            return Err(KeyError::InvalidKeyFormat(format!(
                "hex keyspec must be 64 or 96 digits, got {}",
                inner.len()
            )));
        }
        if !inner.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(KeyError::InvalidKeyFormat(
                "hex keyspec contains non-hex characters".to_string(),
            ));
        }
    }

    Ok(())
}

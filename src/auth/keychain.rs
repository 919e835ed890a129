//! Platform keystore access
//!
//! Hardware-backed credentials keep their private material in the OS
//! keystore under an alias. The engine only ever reads; writing aliases is
//! the key-management side of the app. Uses the `keyring` crate for
//! cross-platform access.

use keyring::Entry;
use thiserror::Error;
use zeroize::Zeroizing;

/// Service name for keystore entries
const SERVICE_NAME: &str = "com.ironterm.keys";

#[derive(Error, Debug)]
pub enum KeychainError {
    #[error("Keystore error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Read access to keystore-held private key material.
///
/// `Ok(None)` means the alias has no entry (revoked or deleted outside the
/// app); callers surface that as a vanished key, not a keystore fault.
pub trait HardwareKeyStore: Send + Sync {
    fn retrieve(&self, alias: &str) -> Result<Option<Zeroizing<String>>, KeychainError>;
}

/// Keystore access via the platform keychain
pub struct KeychainKeyStore {
    service: String,
}

impl KeychainKeyStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Create with custom service name (for testing)
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    // Explicit username in the account keeps keychain identity stable on macOS
    fn account(alias: &str) -> String {
        format!("{}@{}", whoami::username(), alias)
    }

    /// Store key material under an alias (key import side)
    pub fn store(&self, alias: &str, material: &str) -> Result<(), KeychainError> {
        tracing::info!("Keystore store: service={}, alias={}", self.service, alias);
        let entry = Entry::new(&self.service, &Self::account(alias))?;
        entry.set_password(material)?;
        Ok(())
    }

    /// Delete the entry for an alias. Missing entries are not an error.
    pub fn delete(&self, alias: &str) -> Result<(), KeychainError> {
        let entry = Entry::new(&self.service, &Self::account(alias))?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }
}

impl Default for KeychainKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareKeyStore for KeychainKeyStore {
    fn retrieve(&self, alias: &str) -> Result<Option<Zeroizing<String>>, KeychainError> {
        let entry = Entry::new(&self.service, &Self::account(alias))?;
        match entry.get_password() {
            Ok(material) => {
                tracing::debug!("Keystore retrieve: alias={}, len={}", alias, material.len());
                Ok(Some(Zeroizing::new(material)))
            }
            Err(keyring::Error::NoEntry) => {
                tracing::warn!("Keystore retrieve: no entry for alias={}", alias);
                Ok(None)
            }
            Err(e) => {
                tracing::error!("Keystore retrieve failed: alias={}, error={:?}", alias, e);
                Err(KeychainError::Keyring(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests interact with the real system keychain and use a unique
    // service name to avoid conflicts.

    #[test]
    #[ignore] // Run manually: cargo test keystore -- --ignored
    fn test_keystore_roundtrip() {
        let store = KeychainKeyStore::with_service("com.ironterm.test");

        store.store("test-alias", "key material").unwrap();
        let material = store.retrieve("test-alias").unwrap().unwrap();
        assert_eq!(&*material, "key material");

        store.delete("test-alias").unwrap();
        assert!(store.retrieve("test-alias").unwrap().is_none());

        // Double delete is fine
        store.delete("test-alias").unwrap();
    }
}

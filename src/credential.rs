//! Stored credentials
//!
//! A credential is a saved SSH key plus metadata about where its private
//! half lives. The storage variants deliberately differ in what the app can
//! do with them: exportable keys can be read directly, encrypted blobs need
//! a passphrase, hardware-backed keys only surface through the OS keystore,
//! and resident security keys never leave the token at all.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Stable identifier of a stored credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(pub i64);

impl std::fmt::Display for CredentialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key algorithm family of a stored credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmFamily {
    Rsa,
    Dsa,
    Ecdsa,
    Ed25519,
}

impl AlgorithmFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsa => "RSA",
            Self::Dsa => "DSA",
            Self::Ecdsa => "ECDSA",
            Self::Ed25519 => "Ed25519",
        }
    }
}

/// Where the private half of a credential lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyStorage {
    /// Private key held verbatim (PEM/OpenSSH text, possibly passphrase-protected)
    Exportable { private_key: Vec<u8> },

    /// Private key sealed with an app-level passphrase (see `auth::blob`)
    EncryptedBlob { blob: Vec<u8> },

    /// Private key material lives in the OS keystore under this alias
    HardwareBacked { alias: String },

    /// FIDO2 resident key; private material never leaves the token
    SecurityKeyResident {
        credential_id: Vec<u8>,
        relying_party: String,
    },
}

/// A saved SSH key and its metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,

    /// User-facing name ("work laptop", "deploy key")
    pub name: String,

    pub algorithm: AlgorithmFamily,

    /// Whether the stored private material needs a passphrase to open
    pub encrypted: bool,

    /// Public key blob in SSH wire format
    pub public_key: Vec<u8>,

    pub storage: KeyStorage,
}

/// Read access to the user's stored credentials.
///
/// Lookups are infallible: a backing store that cannot answer simply has no
/// credentials to offer and the auth cascade moves on to interactive methods.
pub trait CredentialStore: Send + Sync {
    fn get(&self, id: CredentialId) -> Option<Credential>;

    /// All stored credentials, in the order they should be offered
    fn list(&self) -> Vec<Credential>;
}

/// In-memory credential store
pub struct MemoryCredentialStore {
    credentials: RwLock<Vec<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            credentials: RwLock::new(Vec::new()),
        }
    }

    pub fn insert(&self, credential: Credential) {
        self.credentials.write().push(credential);
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, id: CredentialId) -> Option<Credential> {
        self.credentials.read().iter().find(|c| c.id == id).cloned()
    }

    fn list(&self) -> Vec<Credential> {
        self.credentials.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: i64, name: &str) -> Credential {
        Credential {
            id: CredentialId(id),
            name: name.to_string(),
            algorithm: AlgorithmFamily::Ed25519,
            encrypted: false,
            public_key: vec![1, 2, 3],
            storage: KeyStorage::Exportable {
                private_key: b"key data".to_vec(),
            },
        }
    }

    #[test]
    fn test_memory_store_get_and_list() {
        let store = MemoryCredentialStore::new();
        store.insert(sample(1, "first"));
        store.insert(sample(2, "second"));

        assert_eq!(store.get(CredentialId(2)).unwrap().name, "second");
        assert!(store.get(CredentialId(9)).is_none());

        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "first");
    }

    #[test]
    fn test_storage_serde_tagging() {
        let json = serde_json::to_value(KeyStorage::HardwareBacked {
            alias: "android-key-1".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "hardware_backed");
        assert_eq!(json["alias"], "android-key-1");

        let parsed: KeyStorage = serde_json::from_str(
            r#"{"type":"security_key_resident","credential_id":[1,2],"relying_party":"ssh:"}"#,
        )
        .unwrap();
        match parsed {
            KeyStorage::SecurityKeyResident { relying_party, .. } => {
                assert_eq!(relying_party, "ssh:");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}

//! Key materialization
//!
//! Resolves a stored credential into key material russh can sign with,
//! prompting for passphrases and biometric approval along the way. Resident
//! security keys are the one storage kind that never materializes; they get
//! a marker and the external-authenticator path handles them.

use std::sync::Arc;

use russh::keys::{decode_secret_key, PrivateKey};
use thiserror::Error;

use crate::auth::blob;
use crate::auth::keychain::HardwareKeyStore;
use crate::credential::{Credential, KeyStorage};
use crate::prompt::{request_decision, request_secret, PromptHandler, PromptRequest};

#[derive(Error, Debug)]
pub enum KeyLoadError {
    /// The user backed out of a passphrase prompt
    #[error("Cancelled by user")]
    Cancelled,

    #[error("Key decode failed: {0}")]
    DecodeFailed(String),

    #[error("Biometric confirmation denied")]
    BiometricDenied,

    /// The keystore no longer has material under this alias
    #[error("Key material vanished from the platform keystore: {0}")]
    KeyVanished(String),
}

/// A private key ready for signing
#[derive(Clone)]
pub struct KeyMaterial {
    name: String,
    key: Arc<PrivateKey>,
}

impl KeyMaterial {
    pub fn new(name: impl Into<String>, key: PrivateKey) -> Self {
        Self {
            name: name.into(),
            key: Arc::new(key),
        }
    }

    /// User-facing credential name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn private_key(&self) -> &Arc<PrivateKey> {
        &self.key
    }

    /// Key algorithm name ("ssh-ed25519", "ssh-rsa")
    pub fn algorithm(&self) -> String {
        self.key.algorithm().to_string()
    }
}

// Key bytes stay out of Debug output
impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

/// Outcome of resolving one credential
#[derive(Debug)]
pub enum MaterializedKey {
    /// Raw key material, ready for public-key auth
    Loaded(KeyMaterial),

    /// Resident security key; signing happens on the token
    SecurityKeyResident,
}

/// Resolves stored credentials into signing material
pub struct KeyMaterializer {
    hardware: Arc<dyn HardwareKeyStore>,
    prompts: Arc<dyn PromptHandler>,
}

impl KeyMaterializer {
    pub fn new(hardware: Arc<dyn HardwareKeyStore>, prompts: Arc<dyn PromptHandler>) -> Self {
        Self { hardware, prompts }
    }

    pub async fn materialize(
        &self,
        credential: &Credential,
    ) -> Result<MaterializedKey, KeyLoadError> {
        match &credential.storage {
            KeyStorage::Exportable { private_key } => {
                let content = String::from_utf8_lossy(private_key);
                let passphrase = if credential.encrypted || looks_encrypted(&content) {
                    Some(self.ask_passphrase(&credential.name).await?)
                } else {
                    None
                };
                let key = decode_key(&content, passphrase.as_deref().map(|s| s.as_str()))?;
                Ok(MaterializedKey::Loaded(KeyMaterial::new(
                    &credential.name,
                    key,
                )))
            }

            KeyStorage::EncryptedBlob { blob: data } => {
                let key = if blob::is_sealed(data) {
                    let passphrase = self.ask_passphrase(&credential.name).await?;
                    let plaintext = blob::unseal(data, &passphrase)
                        .map_err(|e| KeyLoadError::DecodeFailed(e.to_string()))?;
                    let content = String::from_utf8_lossy(&plaintext).into_owned();
                    decode_key(&content, None)?
                } else {
                    // Stored unsealed (user chose no passphrase at import)
                    let content = String::from_utf8_lossy(data);
                    decode_key(&content, None)?
                };
                Ok(MaterializedKey::Loaded(KeyMaterial::new(
                    &credential.name,
                    key,
                )))
            }

            KeyStorage::HardwareBacked { alias } => {
                let confirmed = request_decision(
                    self.prompts.as_ref(),
                    PromptRequest::Biometric {
                        reason: format!("Unlock key '{}'", credential.name),
                    },
                )
                .await;
                if !confirmed {
                    tracing::info!("Biometric denied for key '{}'", credential.name);
                    return Err(KeyLoadError::BiometricDenied);
                }
                let material = self
                    .hardware
                    .retrieve(alias)
                    .map_err(|e| KeyLoadError::DecodeFailed(e.to_string()))?
                    .ok_or_else(|| KeyLoadError::KeyVanished(alias.clone()))?;
                let key = decode_key(&material, None)?;
                Ok(MaterializedKey::Loaded(KeyMaterial::new(
                    &credential.name,
                    key,
                )))
            }

            KeyStorage::SecurityKeyResident { .. } => Ok(MaterializedKey::SecurityKeyResident),
        }
    }

    async fn ask_passphrase(
        &self,
        name: &str,
    ) -> Result<zeroize::Zeroizing<String>, KeyLoadError> {
        request_secret(
            self.prompts.as_ref(),
            format!("Passphrase for key '{}'", name),
        )
        .await
        .ok_or(KeyLoadError::Cancelled)
    }
}

/// Encrypted-PEM markers. OpenSSH-format encryption is not text-detectable,
/// so the credential's `encrypted` flag is the primary signal and this the
/// fallback for imported keys with a stale flag.
fn looks_encrypted(content: &str) -> bool {
    content.contains("ENCRYPTED") || content.contains("Proc-Type: 4,ENCRYPTED")
}

fn decode_key(content: &str, passphrase: Option<&str>) -> Result<PrivateKey, KeyLoadError> {
    decode_secret_key(content, passphrase).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("decrypt") || msg.contains("password") {
            KeyLoadError::DecodeFailed("invalid passphrase".to_string())
        } else {
            KeyLoadError::DecodeFailed(msg)
        }
    })
}

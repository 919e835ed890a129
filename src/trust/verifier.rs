//! Host key verification (Trust On First Use)
//!
//! Classifies the key a server presents against what is on record for the
//! host, asks the user when the two disagree, and persists accepted keys.
//! Hosts routinely hold several keys (one per algorithm), so classification
//! is per `(record, algorithm)`: a known host offering an algorithm we have
//! never seen is its own case, distinct from a changed key.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::host::{HostIdentity, HostRecordId};
use crate::prompt::{request_decision, PromptHandler, PromptRequest};
use crate::trust::store::{HostTrustStore, KnownHostEntry, TrustStoreError};

/// How a presented key relates to the keys on record for its host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyClassification {
    /// Matches the key on record for this algorithm
    Verified,

    /// No keys on record for this host at all
    NewKey,

    /// A different key is on record for this algorithm
    ChangedKey,

    /// Keys are on record for this host, but none for this algorithm
    NewAlgorithmForKnownHost,
}

/// Outcome of verifying one presented host key
#[derive(Debug, Clone)]
pub struct Verification {
    pub classification: KeyClassification,

    /// Whether the connection may proceed with this key
    pub accepted: bool,

    /// SHA-256 fingerprint of the presented key
    pub fingerprint: String,
}

/// `SHA256:...` fingerprint of a public key blob, OpenSSH style
/// (base64 without padding)
pub fn fingerprint(key: &[u8]) -> String {
    let hash = Sha256::digest(key);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Display name for a negotiated key algorithm
pub fn friendly_algorithm_name(algorithm: &str) -> &str {
    match algorithm {
        "ssh-ed25519" => "Ed25519",
        "ssh-rsa" => "RSA",
        "ssh-dss" => "DSA",
        a if a.starts_with("rsa-sha2-") => "RSA",
        a if a.starts_with("ecdsa-sha2-") => "ECDSA",
        a if a.starts_with("sk-") => "Security Key",
        other => other,
    }
}

/// Classifies presented host keys and walks the user through trust decisions.
///
/// Cheap to clone; both collaborators are shared.
#[derive(Clone)]
pub struct HostKeyVerifier {
    store: Arc<dyn HostTrustStore>,
    prompts: Arc<dyn PromptHandler>,
}

impl HostKeyVerifier {
    pub fn new(store: Arc<dyn HostTrustStore>, prompts: Arc<dyn PromptHandler>) -> Self {
        Self { store, prompts }
    }

    /// Classify a presented key without touching the store or the user
    pub fn classify(
        &self,
        record: HostRecordId,
        algorithm: &str,
        key: &[u8],
    ) -> KeyClassification {
        match self.store.entry_for(record, algorithm) {
            Some(entry) if entry.key == key => KeyClassification::Verified,
            Some(_) => KeyClassification::ChangedKey,
            None => {
                if self.store.entries_for(record).is_empty() {
                    KeyClassification::NewKey
                } else {
                    KeyClassification::NewAlgorithmForKnownHost
                }
            }
        }
    }

    /// Verify a presented key, prompting the user unless it already matches
    /// the record. Accepting records the key (replacing any previous key for
    /// the same algorithm); declining records nothing.
    pub async fn verify(
        &self,
        identity: &HostIdentity,
        algorithm: &str,
        key: &[u8],
    ) -> Verification {
        let record = identity.record_id;
        let classification = self.classify(record, algorithm, key);
        let presented = fingerprint(key);

        if classification == KeyClassification::Verified {
            tracing::debug!(
                "Host key verified for {} ({} {})",
                identity.address(),
                algorithm,
                presented
            );
            return Verification {
                classification,
                accepted: true,
                fingerprint: presented,
            };
        }

        let previous_fingerprint = match classification {
            KeyClassification::ChangedKey => self
                .store
                .entry_for(record, algorithm)
                .map(|e| fingerprint(&e.key)),
            _ => None,
        };

        match classification {
            KeyClassification::ChangedKey => {
                tracing::warn!(
                    "Host key CHANGED for {} ({}): {} -> {}",
                    identity.address(),
                    algorithm,
                    previous_fingerprint.as_deref().unwrap_or("?"),
                    presented
                );
            }
            _ => {
                tracing::info!(
                    "Unrecognized host key for {} ({} {}), asking user",
                    identity.address(),
                    algorithm,
                    presented
                );
            }
        }

        let accepted = request_decision(
            self.prompts.as_ref(),
            PromptRequest::HostKey {
                host: identity.hostname.clone(),
                port: identity.port,
                algorithm: friendly_algorithm_name(algorithm).to_string(),
                fingerprint: presented.clone(),
                previous_fingerprint,
                classification,
            },
        )
        .await;

        if accepted {
            let entry = KnownHostEntry {
                host_record_id: record,
                hostname: identity.hostname.clone(),
                port: identity.port,
                algorithm: algorithm.to_string(),
                key: key.to_vec(),
            };
            // The user said yes; a failed save must not kill the connection.
            match self.store.record(entry) {
                Ok(()) => {
                    tracing::info!(
                        "Recorded {} host key for {} ({})",
                        algorithm,
                        identity.address(),
                        presented
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Accepted host key for {} could not be saved: {}",
                        identity.address(),
                        e
                    );
                }
            }
        } else {
            tracing::warn!(
                "User declined {} host key for {} ({})",
                algorithm,
                identity.address(),
                presented
            );
        }

        Verification {
            classification,
            accepted,
            fingerprint: presented,
        }
    }

    /// Algorithms with a key on record for this host, used to steer
    /// negotiation toward keys we can actually verify
    pub fn known_algorithms_for(&self, record: HostRecordId) -> Vec<String> {
        self.store
            .entries_for(record)
            .into_iter()
            .map(|e| e.algorithm)
            .collect()
    }

    /// Drop every key on record for a host. The next connection starts
    /// over as first use.
    pub fn forget(&self, record: HostRecordId) -> Result<usize, TrustStoreError> {
        let removed = self.store.remove_all(record)?;
        if removed > 0 {
            tracing::info!("Forgot {} host key(s) for record {}", removed, record);
        }
        Ok(removed)
    }
}

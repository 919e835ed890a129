//! Host identity trust
//!
//! Records which host keys the user has accepted and classifies the key a
//! server presents against that record. Trust is keyed by host record id,
//! not hostname, so renaming a saved host keeps its trust state.

mod store;
mod verifier;

pub use store::{
    normalize_hostname, FileTrustStore, HostTrustStore, KnownHostEntry, MemoryTrustStore,
    TrustStoreError,
};
pub use verifier::{
    fingerprint, friendly_algorithm_name, HostKeyVerifier, KeyClassification, Verification,
};

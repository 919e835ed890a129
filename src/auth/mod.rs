//! Authentication
//!
//! Turns stored credentials into usable key material and runs the method
//! cascade against a server: none probe, public keys, keyboard-interactive,
//! password. Secrets only ever surface through the injected prompt handler
//! and are zeroized when dropped.

pub mod blob;
mod keychain;
mod materializer;
mod orchestrator;

pub use blob::SealError;
pub use keychain::{HardwareKeyStore, KeychainError, KeychainKeyStore};
pub use materializer::{KeyLoadError, KeyMaterial, KeyMaterializer, MaterializedKey};
pub use orchestrator::{
    AuthenticationOrchestrator, SecurityKeyAuthenticator, AUTH_RETRY_BUDGET,
};

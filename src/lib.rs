//! IronTerm core - SSH connection management
//!
//! Host-key trust on first use, stored-credential handling, the
//! authentication method cascade and a registry of live sessions. All user
//! interaction flows through one injected [`prompt::PromptHandler`]; nothing
//! in here talks to a UI directly.

pub mod auth;
pub mod credential;
pub mod error;
pub mod host;
pub mod prompt;
pub mod session;
pub mod transport;
pub mod trust;

#[cfg(test)]
mod testutil;

pub use auth::{
    AuthenticationOrchestrator, HardwareKeyStore, KeychainKeyStore, KeyLoadError, KeyMaterial,
    KeyMaterializer, SecurityKeyAuthenticator, AUTH_RETRY_BUDGET,
};
pub use credential::{
    AlgorithmFamily, Credential, CredentialId, CredentialStore, KeyStorage, MemoryCredentialStore,
};
pub use error::{AuthExhaustedReason, ConnectError, TransportError};
pub use host::{CredentialSelector, HostIdentity, HostProfile, HostRecordId};
pub use prompt::{InteractivePrompt, PromptHandler, PromptReply, PromptRequest};
pub use session::{SessionInfo, SessionRegistry};
pub use transport::{
    OperationsHandle, PingResult, RusshTransportFactory, SessionOperations, Transport,
    TransportFactory,
};
pub use trust::{
    FileTrustStore, HostKeyVerifier, HostTrustStore, KeyClassification, KnownHostEntry,
    MemoryTrustStore, TrustStoreError, Verification,
};

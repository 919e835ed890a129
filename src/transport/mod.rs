//! Transport abstraction
//!
//! The auth cascade and the session registry talk to these traits, not to
//! russh directly. That keeps the protocol surface in one place and lets
//! tests drive the cascade with a scripted transport.

mod handle_owner;
mod russh_client;

pub use handle_owner::{HandleController, PingResult};
pub use russh_client::{HostVerifyHandler, RusshTransportFactory};

use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::KeyMaterial;
use crate::error::{ConnectError, TransportError};
use crate::host::HostIdentity;
use crate::prompt::InteractivePrompt;
use crate::trust::HostKeyVerifier;

/// Methods the server currently advertises for the user.
///
/// Servers shrink this set as auth progresses (partial success), so the
/// cascade re-reads it every cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvertisedMethods {
    pub public_key: bool,
    pub keyboard_interactive: bool,
    pub password: bool,
}

impl AdvertisedMethods {
    pub fn any(&self) -> bool {
        self.public_key || self.keyboard_interactive || self.password
    }
}

/// Answers keyboard-interactive challenges as the server sends them
#[async_trait]
pub trait InteractiveResponder: Send + Sync {
    /// One challenge round. `None` means the user backed out.
    async fn respond(
        &self,
        name: &str,
        instruction: &str,
        prompts: &[InteractivePrompt],
    ) -> Option<Vec<String>>;
}

/// A connected SSH transport in its authentication phase.
///
/// Each `authenticate_*` call reports method success (`Ok(true)`) or method
/// failure (`Ok(false)`); `Err` is reserved for the link itself breaking.
/// After a success, `into_operations` converts the transport into the
/// long-lived session surface.
#[async_trait]
pub trait Transport: Send {
    fn is_authenticated(&self) -> bool;

    /// The server's current method list, probing with `none` if no auth
    /// exchange has happened yet
    async fn advertised_methods(&mut self, user: &str)
        -> Result<AdvertisedMethods, TransportError>;

    async fn authenticate_none(&mut self, user: &str) -> Result<bool, TransportError>;

    async fn authenticate_public_key(
        &mut self,
        user: &str,
        key: &KeyMaterial,
    ) -> Result<bool, TransportError>;

    async fn authenticate_keyboard_interactive(
        &mut self,
        user: &str,
        responder: &dyn InteractiveResponder,
    ) -> Result<bool, TransportError>;

    async fn authenticate_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<bool, TransportError>;

    /// Hand the authenticated connection to its owner task
    async fn into_operations(self: Box<Self>) -> Result<OperationsHandle, TransportError>;

    /// Tear down an unauthenticated or abandoned connection
    async fn close(self: Box<Self>) -> Result<(), TransportError>;
}

/// Dials hosts and returns transports ready to authenticate
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        identity: &HostIdentity,
        verifier: HostKeyVerifier,
    ) -> Result<Box<dyn Transport>, ConnectError>;
}

/// Post-auth surface of a live session, shared by the registry
#[async_trait]
pub trait SessionOperations: Send + Sync {
    /// Passive check; no wire traffic
    fn is_connected(&self) -> bool;

    /// Active liveness probe
    async fn ping(&self) -> PingResult;

    /// Orderly shutdown. Idempotent: closing a dead session is `Ok`.
    async fn close(&self) -> Result<(), TransportError>;
}

// Keeps Result<OperationsHandle, _> usable with unwrap_err and friends
impl std::fmt::Debug for dyn SessionOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOperations")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

pub type OperationsHandle = Arc<dyn SessionOperations>;

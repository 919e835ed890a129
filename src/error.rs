//! Connection error taxonomy
//!
//! Failures are grouped by who can act on them: the user (cancelled, host
//! key declined), the credential layer (key load), the auth cascade
//! (exhausted), or the network (transport).

use thiserror::Error;

use crate::auth::KeyLoadError;

/// Why an auth cascade ran out of road
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthExhaustedReason {
    /// Server no longer advertises any method we can attempt
    NoMethodsLeft,

    /// Attempt ran through its full retry budget without success
    RetryBudgetExceeded,
}

impl std::fmt::Display for AuthExhaustedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMethodsLeft => write!(f, "no authentication methods left"),
            Self::RetryBudgetExceeded => write!(f, "retry budget exceeded"),
        }
    }
}

/// Errors from the wire: dialing, the SSH protocol, loss of the link
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout after {0}s")]
    Timeout(u64),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for TransportError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => TransportError::Disconnected,
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::ConnectionFailed(err.to_string())
    }
}

/// Top-level outcome of a failed connection attempt
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The user backed out of a prompt somewhere in the attempt
    #[error("Cancelled by user")]
    UserCancelled,

    #[error("Key load failed: {0}")]
    KeyLoad(#[from] KeyLoadError),

    /// The user declined the presented host key
    #[error("Host key rejected for {host}")]
    HostKeyRejected { host: String },

    #[error("Authentication exhausted: {0}")]
    AuthExhausted(AuthExhaustedReason),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<russh::Error> for ConnectError {
    fn from(err: russh::Error) -> Self {
        ConnectError::Transport(err.into())
    }
}

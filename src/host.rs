//! Host records and connection profiles
//!
//! A host record is the durable identity of a remote endpoint as the user
//! saved it. Trust decisions (known host keys) hang off the record id, not
//! off the hostname string, so renaming a saved host keeps its trust state.

use serde::{Deserialize, Serialize};

/// Stable identifier of a saved host record.
///
/// Known-host entries are keyed by this id. Two records pointing at the same
/// `hostname:port` still have independent trust state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostRecordId(pub i64);

impl std::fmt::Display for HostRecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network identity of a remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    /// Record id this endpoint belongs to
    pub record_id: HostRecordId,

    /// Remote host address (name or IP)
    pub hostname: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,
}

impl HostIdentity {
    pub fn new(record_id: HostRecordId, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            record_id,
            hostname: hostname.into(),
            port,
        }
    }

    /// `host:port` form used for dialing and log output
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Which stored credentials a connection attempt may use
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSelector {
    /// Never offer stored keys; interactive methods only
    Never,

    /// Offer every stored key in turn
    #[default]
    Any,

    /// Offer exactly one stored key
    Pinned { id: crate::credential::CredentialId },
}

/// Everything needed to open and authenticate a connection to a saved host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProfile {
    /// Endpoint and record id
    pub identity: HostIdentity,

    /// Username for authentication
    pub username: String,

    /// Which stored keys the auth cascade may try
    #[serde(default)]
    pub key_selection: CredentialSelector,
}

impl HostProfile {
    pub fn new(identity: HostIdentity, username: impl Into<String>) -> Self {
        Self {
            identity,
            username: username.into(),
            key_selection: CredentialSelector::default(),
        }
    }
}

fn default_port() -> u16 {
    22
}

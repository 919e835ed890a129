//! Session registry
//!
//! One live session per host record, shared by every caller that asks for
//! that record. Connecting is a three-phase affair: check for an existing
//! session under the lock, dial and authenticate outside it (prompts can
//! take arbitrarily long), then re-acquire the lock to install. Two attempts
//! racing for the same record both get a handle back; the loser's
//! freshly-built session is torn down, never leaked.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{
    AuthenticationOrchestrator, HardwareKeyStore, KeyMaterializer, SecurityKeyAuthenticator,
};
use crate::credential::CredentialStore;
use crate::error::ConnectError;
use crate::host::{HostProfile, HostRecordId};
use crate::prompt::PromptHandler;
use crate::transport::{OperationsHandle, PingResult, TransportFactory};
use crate::trust::{HostKeyVerifier, HostTrustStore};

/// Snapshot of one live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub host_record_id: HostRecordId,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub connected_at: DateTime<Utc>,
}

struct SessionEntry {
    info: SessionInfo,
    operations: OperationsHandle,
}

/// Registry of live sessions, keyed by host record
pub struct SessionRegistry {
    sessions: Mutex<HashMap<HostRecordId, SessionEntry>>,
    factory: Arc<dyn TransportFactory>,
    trust: Arc<dyn HostTrustStore>,
    credentials: Arc<dyn CredentialStore>,
    hardware: Arc<dyn HardwareKeyStore>,
    security_keys: Option<Arc<dyn SecurityKeyAuthenticator>>,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        trust: Arc<dyn HostTrustStore>,
        credentials: Arc<dyn CredentialStore>,
        hardware: Arc<dyn HardwareKeyStore>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            factory,
            trust,
            credentials,
            hardware,
            security_keys: None,
        }
    }

    pub fn with_security_keys(mut self, authenticator: Arc<dyn SecurityKeyAuthenticator>) -> Self {
        self.security_keys = Some(authenticator);
        self
    }

    /// Returns a session for the profile's host record, connecting if needed.
    ///
    /// A live session is reused as-is; no prompts, no handshake. The prompt
    /// handler only comes into play when a fresh connection has to be made.
    pub async fn connect(
        &self,
        profile: &HostProfile,
        prompts: Arc<dyn PromptHandler>,
    ) -> Result<OperationsHandle, ConnectError> {
        let record = profile.identity.record_id;

        // Phase 1: reuse under the lock, then release before any network IO
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(entry) = sessions.get(&record) {
                if entry.operations.is_connected() {
                    info!("Reusing live session for record {}", record);
                    return Ok(entry.operations.clone());
                }
                debug!("Dropping dead session entry for record {}", record);
                sessions.remove(&record);
            }
        }

        // Phase 2: dial, verify the host key, run the auth cascade. The lock
        // stays free; a prompt can sit unanswered for minutes.
        let verifier = HostKeyVerifier::new(self.trust.clone(), prompts.clone());
        let mut transport = self.factory.connect(&profile.identity, verifier).await?;

        let materializer = KeyMaterializer::new(self.hardware.clone(), prompts.clone());
        let mut orchestrator =
            AuthenticationOrchestrator::new(self.credentials.clone(), materializer, prompts);
        if let Some(authenticator) = &self.security_keys {
            orchestrator = orchestrator.with_security_keys(authenticator.clone());
        }

        if let Err(e) = orchestrator.authenticate(transport.as_mut(), profile).await {
            if let Err(close_err) = transport.close().await {
                warn!(
                    "Teardown after failed authentication for {} also failed: {}",
                    profile.identity.address(),
                    close_err
                );
            }
            return Err(e);
        }

        let operations = transport.into_operations().await?;

        // Phase 3: install, unless a concurrent attempt won the race
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&record) {
            if existing.operations.is_connected() {
                let winner = existing.operations.clone();
                drop(sessions);
                warn!(
                    "Concurrent connect for record {}; closing the extra session",
                    record
                );
                if let Err(e) = operations.close().await {
                    warn!("Failed to close duplicate session: {}", e);
                }
                return Ok(winner);
            }
            sessions.remove(&record);
        }
        sessions.insert(
            record,
            SessionEntry {
                info: SessionInfo {
                    host_record_id: record,
                    hostname: profile.identity.hostname.clone(),
                    port: profile.identity.port,
                    username: profile.username.clone(),
                    connected_at: Utc::now(),
                },
                operations: operations.clone(),
            },
        );
        info!(
            "Session installed for {}@{}",
            profile.username,
            profile.identity.address()
        );
        Ok(operations)
    }

    /// Closes the session for a record. Returns whether one existed.
    ///
    /// Close errors are logged and swallowed; the entry is gone either way.
    pub async fn disconnect(&self, record: HostRecordId) -> bool {
        let entry = self.sessions.lock().await.remove(&record);
        match entry {
            Some(entry) => {
                if let Err(e) = entry.operations.close().await {
                    warn!("Error closing session for record {}: {}", record, e);
                }
                info!("Disconnected record {}", record);
                true
            }
            None => false,
        }
    }

    /// Closes every session and returns how many there were.
    pub async fn disconnect_all(&self) -> usize {
        // Drain under the lock, close outside it
        let drained: Vec<SessionEntry> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        if count > 0 {
            info!("Disconnecting all {} session(s)", count);
        }
        for entry in drained {
            if let Err(e) = entry.operations.close().await {
                warn!(
                    "Error closing session for record {}: {}",
                    entry.info.host_record_id, e
                );
            }
        }
        count
    }

    /// Whether a live session exists for the record
    pub async fn is_connected(&self, record: HostRecordId) -> bool {
        self.sessions
            .lock()
            .await
            .get(&record)
            .map(|entry| entry.operations.is_connected())
            .unwrap_or(false)
    }

    /// Snapshots of all registered sessions, ordered by record id
    pub async fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by_key(|info| info.host_record_id);
        infos
    }

    /// Pings the session for a record. `None` when no session is registered.
    pub async fn health_check(&self, record: HostRecordId) -> Option<PingResult> {
        // Clone the handle out so the ping does not hold the registry lock
        let operations = self
            .sessions
            .lock()
            .await
            .get(&record)
            .map(|entry| entry.operations.clone());
        match operations {
            Some(operations) => Some(operations.ping().await),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostIdentity;
    use crate::prompt::PromptReply;
    use crate::testutil::{FakeTransportFactory, MemoryHardwareStore, ScriptedPrompts};
    use crate::credential::MemoryCredentialStore;
    use crate::error::AuthExhaustedReason;
    use crate::trust::MemoryTrustStore;
    use tokio::sync::Barrier;

    fn profile(record: i64, host: &str) -> HostProfile {
        HostProfile::new(HostIdentity::new(HostRecordId(record), host, 22), "ops")
    }

    fn registry(factory: Arc<FakeTransportFactory>) -> SessionRegistry {
        SessionRegistry::new(
            factory,
            Arc::new(MemoryTrustStore::new()),
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(MemoryHardwareStore::new()),
        )
    }

    fn no_prompts() -> Arc<dyn PromptHandler> {
        Arc::new(ScriptedPrompts::new())
    }

    #[tokio::test]
    async fn test_connect_installs_session() {
        let factory = Arc::new(FakeTransportFactory::new());
        let registry = registry(factory.clone());
        let profile = profile(1, "alpha.example");

        let handle = registry.connect(&profile, no_prompts()).await.unwrap();
        assert!(handle.is_connected());
        assert!(registry.is_connected(HostRecordId(1)).await);
        assert_eq!(factory.connects(), 1);

        let sessions = registry.active_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].host_record_id, HostRecordId(1));
        assert_eq!(sessions[0].hostname, "alpha.example");
        assert_eq!(sessions[0].username, "ops");
    }

    #[tokio::test]
    async fn test_connect_reuses_live_session() {
        let factory = Arc::new(FakeTransportFactory::new());
        let registry = registry(factory.clone());
        let profile = profile(1, "alpha.example");

        let first = registry.connect(&profile, no_prompts()).await.unwrap();
        let second = registry.connect(&profile, no_prompts()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.connects(), 1);
    }

    #[tokio::test]
    async fn test_connect_replaces_dead_session() {
        let factory = Arc::new(FakeTransportFactory::new());
        let registry = registry(factory.clone());
        let profile = profile(1, "alpha.example");

        let first = registry.connect(&profile, no_prompts()).await.unwrap();
        factory.operations()[0].set_connected(false);

        let second = registry.connect(&profile, no_prompts()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.connects(), 2);
        assert_eq!(registry.active_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_auth_tears_down_transport() {
        let factory = Arc::new(FakeTransportFactory::new().reject_auth());
        let registry = registry(factory.clone());

        let err = registry
            .connect(&profile(1, "alpha.example"), no_prompts())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectError::AuthExhausted(AuthExhaustedReason::NoMethodsLeft)
        ));
        assert_eq!(factory.transport_closes(), 1);
        assert!(registry.active_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_host_key_decline_aborts_connect() {
        let factory = Arc::new(
            FakeTransportFactory::new().with_host_key("ssh-ed25519", b"server key blob"),
        );
        let registry = registry(factory.clone());
        let prompts: Arc<dyn PromptHandler> =
            Arc::new(ScriptedPrompts::new().push(PromptReply::Decision(false)));

        let err = registry
            .connect(&profile(1, "alpha.example"), prompts)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::HostKeyRejected { .. }));
        assert!(registry.active_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_host_key_accept_records_and_connects() {
        let factory = Arc::new(
            FakeTransportFactory::new().with_host_key("ssh-ed25519", b"server key blob"),
        );
        let trust = Arc::new(MemoryTrustStore::new());
        let registry = SessionRegistry::new(
            factory.clone(),
            trust.clone(),
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(MemoryHardwareStore::new()),
        );
        let prompts: Arc<dyn PromptHandler> =
            Arc::new(ScriptedPrompts::new().push(PromptReply::Decision(true)));

        registry
            .connect(&profile(1, "alpha.example"), prompts)
            .await
            .unwrap();
        let entries = trust.entries_for(HostRecordId(1));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].algorithm, "ssh-ed25519");
    }

    #[tokio::test]
    async fn test_disconnect() {
        let factory = Arc::new(FakeTransportFactory::new());
        let registry = registry(factory.clone());
        registry
            .connect(&profile(1, "alpha.example"), no_prompts())
            .await
            .unwrap();

        assert!(registry.disconnect(HostRecordId(1)).await);
        assert_eq!(factory.operations()[0].closes(), 1);
        assert!(!registry.is_connected(HostRecordId(1)).await);

        // Second disconnect finds nothing
        assert!(!registry.disconnect(HostRecordId(1)).await);
    }

    #[tokio::test]
    async fn test_disconnect_all_closes_each_once() {
        let factory = Arc::new(FakeTransportFactory::new());
        let registry = registry(factory.clone());
        for (record, host) in [(1, "alpha"), (2, "beta"), (3, "gamma")] {
            registry
                .connect(&profile(record, host), no_prompts())
                .await
                .unwrap();
        }

        assert_eq!(registry.disconnect_all().await, 3);
        assert!(registry.active_sessions().await.is_empty());
        for operations in factory.operations() {
            assert_eq!(operations.closes(), 1);
        }
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_session() {
        crate::testutil::init_tracing();
        let barrier = Arc::new(Barrier::new(2));
        let factory = Arc::new(FakeTransportFactory::new().with_barrier(barrier));
        let registry = registry(factory.clone());
        let profile = profile(1, "alpha.example");

        let (first, second) = tokio::join!(
            registry.connect(&profile, no_prompts()),
            registry.connect(&profile, no_prompts()),
        );
        let first = first.unwrap();
        let second = second.unwrap();

        // Both callers share the winner's session; the loser's was closed
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.connects(), 2);
        assert_eq!(registry.active_sessions().await.len(), 1);
        let total_closes: usize = factory
            .operations()
            .iter()
            .map(|operations| operations.closes())
            .sum();
        assert_eq!(total_closes, 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let factory = Arc::new(FakeTransportFactory::new());
        let registry = registry(factory.clone());
        registry
            .connect(&profile(1, "alpha.example"), no_prompts())
            .await
            .unwrap();

        assert_eq!(
            registry.health_check(HostRecordId(1)).await,
            Some(PingResult::Ok)
        );
        assert_eq!(registry.health_check(HostRecordId(9)).await, None);
    }
}

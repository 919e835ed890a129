//! russh-backed transport
//!
//! Dials the endpoint, verifies the host key through the injected verifier
//! during the handshake, and maps the method-level auth calls onto russh.
//! When a host already has keys on record, negotiation is steered toward
//! those algorithms so the server presents a key we can actually verify.

use std::borrow::Cow;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{Algorithm, PublicKey, PublicKeyBase64};
use russh::{MethodKind, MethodSet};
use tracing::{debug, info, warn};

use super::handle_owner::spawn_handle_owner_task;
use super::{
    AdvertisedMethods, InteractiveResponder, OperationsHandle, Transport, TransportFactory,
};
use crate::auth::KeyMaterial;
use crate::error::{ConnectError, TransportError};
use crate::host::HostIdentity;
use crate::prompt::InteractivePrompt;
use crate::trust::HostKeyVerifier;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Disconnect after this many missed keepalives
const KEEPALIVE_MAX: usize = 3;

/// Client handler for russh callbacks.
///
/// Host key checking happens here, inside the handshake: the verifier may
/// suspend on a user prompt, and russh waits on this future meanwhile.
pub struct HostVerifyHandler {
    identity: HostIdentity,
    verifier: HostKeyVerifier,
}

impl HostVerifyHandler {
    pub fn new(identity: HostIdentity, verifier: HostKeyVerifier) -> Self {
        Self { identity, verifier }
    }
}

impl client::Handler for HostVerifyHandler {
    type Error = ConnectError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let algorithm = server_public_key.algorithm().to_string();
        let key_blob = server_public_key.public_key_bytes();

        let verification = self
            .verifier
            .verify(&self.identity, &algorithm, &key_blob)
            .await;

        if verification.accepted {
            Ok(true)
        } else {
            Err(ConnectError::HostKeyRejected {
                host: self.identity.address(),
            })
        }
    }
}

/// Dials hosts with russh
pub struct RusshTransportFactory {
    connect_timeout: Duration,
}

impl RusshTransportFactory {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for RusshTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for RusshTransportFactory {
    async fn connect(
        &self,
        identity: &HostIdentity,
        verifier: HostKeyVerifier,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let addr = identity.address();
        info!("Connecting to SSH server at {}", addr);

        // Resolve address
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("Failed to resolve address: {}", e))
            })?
            .next()
            .ok_or_else(|| TransportError::ConnectionFailed("No address found".to_string()))?;

        let mut config = client::Config {
            inactivity_timeout: None, // App-level pings handle liveness
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        };

        // Prefer host key algorithms we already trust, so a known host is
        // verified instead of presenting an unfamiliar key type
        let known = verifier.known_algorithms_for(identity.record_id);
        if !known.is_empty() {
            debug!(
                "Seeding host key negotiation for {} from known algorithms: {:?}",
                addr, known
            );
            let order = known_first_key_order(&known, &config.preferred.key);
            config.preferred.key = order;
        }

        let handler = HostVerifyHandler::new(identity.clone(), verifier);

        // Connect with timeout
        let handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(Arc::new(config), socket_addr, handler),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.connect_timeout.as_secs()))??;

        debug!("SSH handshake completed for {}", addr);

        Ok(Box::new(RusshTransport {
            handle,
            address: addr,
            authenticated: false,
            methods: None,
        }))
    }
}

/// One russh connection in its authentication phase
struct RusshTransport {
    handle: client::Handle<HostVerifyHandler>,
    address: String,
    authenticated: bool,
    /// Latest method list from the server, refreshed by every failure
    methods: Option<AdvertisedMethods>,
}

impl RusshTransport {
    fn absorb(&mut self, result: AuthResult, method: &str) -> bool {
        match result {
            AuthResult::Success => {
                info!("{} authentication succeeded for {}", method, self.address);
                self.authenticated = true;
                true
            }
            AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                self.remember_failure(&remaining_methods, partial_success, method);
                false
            }
        }
    }

    fn remember_failure(&mut self, remaining: &MethodSet, partial_success: bool, method: &str) {
        let methods = advertised_from(remaining);
        if partial_success {
            // The server accepted this factor but wants more
            debug!(
                "{} partially succeeded for {}, server still requires {:?}",
                method, self.address, methods
            );
        } else {
            debug!(
                "{} rejected for {}, server advertises {:?}",
                method, self.address, methods
            );
        }
        self.methods = Some(methods);
    }
}

#[async_trait]
impl Transport for RusshTransport {
    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn advertised_methods(
        &mut self,
        user: &str,
    ) -> Result<AdvertisedMethods, TransportError> {
        if let Some(methods) = self.methods {
            return Ok(methods);
        }
        // No auth exchange yet; a none probe makes the server tell us
        self.authenticate_none(user).await?;
        Ok(self.methods.unwrap_or_default())
    }

    async fn authenticate_none(&mut self, user: &str) -> Result<bool, TransportError> {
        let result = self.handle.authenticate_none(user).await?;
        Ok(self.absorb(result, "none"))
    }

    async fn authenticate_public_key(
        &mut self,
        user: &str,
        key: &KeyMaterial,
    ) -> Result<bool, TransportError> {
        // RSA keys sign with the best hash the server supports
        let hash_alg = match key.private_key().algorithm() {
            Algorithm::Rsa { .. } => self.handle.best_supported_rsa_hash().await?.flatten(),
            _ => None,
        };
        let key_with_hash = PrivateKeyWithHashAlg::new(key.private_key().clone(), hash_alg);
        let result = self.handle.authenticate_publickey(user, key_with_hash).await?;
        Ok(self.absorb(result, "publickey"))
    }

    async fn authenticate_keyboard_interactive(
        &mut self,
        user: &str,
        responder: &dyn InteractiveResponder,
    ) -> Result<bool, TransportError> {
        let mut response = self
            .handle
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await?;
        let mut cancelled = false;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => {
                    info!(
                        "keyboard-interactive authentication succeeded for {}",
                        self.address
                    );
                    self.authenticated = true;
                    return Ok(true);
                }
                KeyboardInteractiveAuthResponse::Failure {
                    remaining_methods,
                    partial_success,
                } => {
                    self.remember_failure(
                        &remaining_methods,
                        partial_success,
                        "keyboard-interactive",
                    );
                    return Ok(false);
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    if cancelled {
                        // The user already backed out and the server keeps
                        // prompting; stop answering and report failure
                        warn!(
                            "Abandoning keyboard-interactive exchange with {} after cancel",
                            self.address
                        );
                        return Ok(false);
                    }

                    debug!(
                        "keyboard-interactive InfoRequest with {} prompt(s) from {}",
                        prompts.len(),
                        self.address
                    );
                    let converted: Vec<InteractivePrompt> = prompts
                        .iter()
                        .map(|p| InteractivePrompt {
                            text: p.prompt.clone(),
                            echo: p.echo,
                        })
                        .collect();

                    let answers = match responder.respond(&name, &instructions, &converted).await {
                        Some(answers) => answers,
                        None => {
                            // The server is owed a response for this round;
                            // empty answers let it fail the exchange cleanly
                            cancelled = true;
                            vec![String::new(); converted.len()]
                        }
                    };

                    response = self
                        .handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await?;
                }
            }
        }
    }

    async fn authenticate_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<bool, TransportError> {
        let result = self.handle.authenticate_password(user, password).await?;
        Ok(self.absorb(result, "password"))
    }

    async fn into_operations(self: Box<Self>) -> Result<OperationsHandle, TransportError> {
        if !self.authenticated {
            return Err(TransportError::Protocol(
                "connection is not authenticated".to_string(),
            ));
        }
        let controller = spawn_handle_owner_task(self.handle, self.address);
        Ok(Arc::new(controller))
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await
            .map_err(TransportError::from)
    }
}

fn advertised_from(remaining: &MethodSet) -> AdvertisedMethods {
    let mut methods = AdvertisedMethods::default();
    for kind in remaining.iter() {
        match kind {
            MethodKind::PublicKey => methods.public_key = true,
            MethodKind::KeyboardInteractive => methods.keyboard_interactive = true,
            MethodKind::Password => methods.password = true,
            _ => {}
        }
    }
    methods
}

/// Known algorithms first (in stored order), then the remaining defaults.
/// Names that russh's default set does not cover are dropped.
fn known_first_key_order(
    known: &[String],
    defaults: &[Algorithm],
) -> Cow<'static, [Algorithm]> {
    let mut ordered: Vec<Algorithm> = Vec::with_capacity(defaults.len());
    for name in known {
        if let Ok(alg) = name.parse::<Algorithm>() {
            if defaults.contains(&alg) && !ordered.contains(&alg) {
                ordered.push(alg);
            }
        }
    }
    for alg in defaults {
        if !ordered.contains(alg) {
            ordered.push(alg.clone());
        }
    }
    Cow::Owned(ordered)
}

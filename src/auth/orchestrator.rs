//! Authentication cascade
//!
//! Drives the client side of SSH userauth against an already-connected
//! transport: a single `none` probe, then cycles of public-key,
//! keyboard-interactive and password in that order until the server accepts,
//! the retry budget runs out, or nothing usable remains. Servers that gate
//! methods behind partial success re-advertise between cycles, so the
//! advertised set is re-queried every time around.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::materializer::{KeyLoadError, KeyMaterializer, MaterializedKey};
use crate::credential::{Credential, CredentialStore};
use crate::error::{AuthExhaustedReason, ConnectError, TransportError};
use crate::host::{CredentialSelector, HostProfile};
use crate::prompt::{request_interactive, request_secret, InteractivePrompt, PromptHandler};
use crate::transport::{AdvertisedMethods, InteractiveResponder, Transport};

/// Maximum failed cycles before the attempt is abandoned
pub const AUTH_RETRY_BUDGET: u32 = 20;

/// Pause between failed cycles
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Drives a challenge round-trip on a hardware security token.
///
/// Resident keys never yield raw material, so the signing exchange has to be
/// performed by whatever owns the token (platform FIDO2 API, USB HID stack).
#[async_trait]
pub trait SecurityKeyAuthenticator: Send + Sync {
    async fn authenticate(
        &self,
        transport: &mut dyn Transport,
        user: &str,
        credential: &Credential,
    ) -> Result<bool, TransportError>;
}

/// What happened to one public-key candidate
enum CredentialOutcome {
    Accepted,
    Rejected,
    Unusable(KeyLoadError),
}

/// Per-attempt method availability.
///
/// Methods drop out of the rotation as they prove pointless: public keys
/// after one full pass over the candidates, keyboard-interactive once the
/// server stops engaging or the user cancels, password once cancelled.
#[derive(Default)]
struct AttemptState {
    pubkeys_exhausted: bool,
    interactive_attempted: bool,
    /// Whether the server sent at least one info request on the last exchange
    interactive_engaged: bool,
    interactive_cancelled: bool,
    password_cancelled: bool,
    /// The user backed out of some prompt at some point during the attempt
    user_cancelled: bool,
}

impl AttemptState {
    /// Keyboard-interactive is worth another round only while the server
    /// keeps engaging and the user has not backed out.
    fn interactive_usable(&self) -> bool {
        !self.interactive_cancelled && (!self.interactive_attempted || self.interactive_engaged)
    }

    fn any_usable(&self, advertised: &AdvertisedMethods) -> bool {
        (advertised.public_key && !self.pubkeys_exhausted)
            || (advertised.keyboard_interactive && self.interactive_usable())
            || (advertised.password && !self.password_cancelled)
    }

    fn exhausted(&self, reason: AuthExhaustedReason) -> ConnectError {
        if self.user_cancelled {
            ConnectError::UserCancelled
        } else {
            ConnectError::AuthExhausted(reason)
        }
    }
}

/// Relays keyboard-interactive rounds to the prompt capability and tracks
/// whether the server engaged and whether the user cancelled.
struct PromptRelay<'a> {
    prompts: &'a dyn PromptHandler,
    engaged: AtomicBool,
    cancelled: AtomicBool,
}

impl<'a> PromptRelay<'a> {
    fn new(prompts: &'a dyn PromptHandler) -> Self {
        Self {
            prompts,
            engaged: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    fn engaged(&self) -> bool {
        self.engaged.load(Ordering::Relaxed)
    }

    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl InteractiveResponder for PromptRelay<'_> {
    async fn respond(
        &self,
        name: &str,
        instruction: &str,
        prompts: &[InteractivePrompt],
    ) -> Option<Vec<String>> {
        self.engaged.store(true, Ordering::Relaxed);
        if self.cancelled.load(Ordering::Relaxed) {
            return None;
        }
        let answers = request_interactive(
            self.prompts,
            name.to_string(),
            instruction.to_string(),
            prompts.to_vec(),
        )
        .await;
        if answers.is_none() {
            self.cancelled.store(true, Ordering::Relaxed);
        }
        answers
    }
}

/// Runs the authentication cascade over an injected transport.
pub struct AuthenticationOrchestrator {
    credentials: Arc<dyn CredentialStore>,
    materializer: KeyMaterializer,
    security_keys: Option<Arc<dyn SecurityKeyAuthenticator>>,
    prompts: Arc<dyn PromptHandler>,
}

impl AuthenticationOrchestrator {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        materializer: KeyMaterializer,
        prompts: Arc<dyn PromptHandler>,
    ) -> Self {
        Self {
            credentials,
            materializer,
            security_keys: None,
            prompts,
        }
    }

    pub fn with_security_keys(mut self, authenticator: Arc<dyn SecurityKeyAuthenticator>) -> Self {
        self.security_keys = Some(authenticator);
        self
    }

    /// Authenticates `profile.username` over the transport.
    ///
    /// Returns `Ok(())` once the server accepts. A cancelled prompt anywhere
    /// in a failed attempt turns the result into `UserCancelled`.
    pub async fn authenticate(
        &self,
        transport: &mut dyn Transport,
        profile: &HostProfile,
    ) -> Result<(), ConnectError> {
        let attempt = Uuid::new_v4();
        let user = profile.username.as_str();
        info!(
            "Auth attempt {} for {}@{}",
            attempt,
            user,
            profile.identity.address()
        );

        let mut state = AttemptState::default();

        // Single best-effort probe; some servers want no authentication at all
        if transport.authenticate_none(user).await? {
            info!("Auth attempt {}: server requires no authentication", attempt);
            return Ok(());
        }

        for cycle in 1..=AUTH_RETRY_BUDGET {
            let advertised = transport.advertised_methods(user).await?;
            debug!(
                "Auth attempt {} cycle {}: advertised {:?}",
                attempt, cycle, advertised
            );

            if !state.any_usable(&advertised) {
                info!("Auth attempt {}: no usable methods remain", attempt);
                return Err(state.exhausted(AuthExhaustedReason::NoMethodsLeft));
            }

            if advertised.public_key && !state.pubkeys_exhausted {
                if self
                    .try_public_keys(transport, profile, &mut state, attempt)
                    .await?
                {
                    return Ok(());
                }
                // One full pass over the candidates is all the keys get
                state.pubkeys_exhausted = true;
            }

            if advertised.keyboard_interactive && state.interactive_usable() {
                if self
                    .try_keyboard_interactive(transport, user, &mut state, attempt)
                    .await?
                {
                    return Ok(());
                }
            }

            if advertised.password && !state.password_cancelled {
                if self
                    .try_password(transport, profile, &mut state, attempt)
                    .await?
                {
                    return Ok(());
                }
            }

            if cycle < AUTH_RETRY_BUDGET {
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }

        warn!(
            "Auth attempt {}: retry budget of {} cycles exhausted",
            attempt, AUTH_RETRY_BUDGET
        );
        Err(state.exhausted(AuthExhaustedReason::RetryBudgetExceeded))
    }

    /// One pass over the candidate keys named by the profile's selector.
    ///
    /// An unusable candidate (bad passphrase, vanished alias, denied
    /// biometric) is logged and skipped; only transport failures abort.
    async fn try_public_keys(
        &self,
        transport: &mut dyn Transport,
        profile: &HostProfile,
        state: &mut AttemptState,
        attempt: Uuid,
    ) -> Result<bool, TransportError> {
        let candidates: Vec<Credential> = match &profile.key_selection {
            CredentialSelector::Never => Vec::new(),
            CredentialSelector::Any => self.credentials.list(),
            CredentialSelector::Pinned { id } => {
                let found = self.credentials.get(*id);
                if found.is_none() {
                    warn!(
                        "Auth attempt {}: pinned credential {} not found",
                        attempt, id
                    );
                }
                found.into_iter().collect()
            }
        };
        debug!(
            "Auth attempt {}: {} public-key candidate(s)",
            attempt,
            candidates.len()
        );

        for credential in &candidates {
            match self
                .try_credential(transport, &profile.username, credential, attempt)
                .await?
            {
                CredentialOutcome::Accepted => {
                    info!(
                        "Auth attempt {}: server accepted key '{}'",
                        attempt, credential.name
                    );
                    return Ok(true);
                }
                CredentialOutcome::Rejected => {
                    debug!(
                        "Auth attempt {}: server rejected key '{}'",
                        attempt, credential.name
                    );
                }
                CredentialOutcome::Unusable(e) => {
                    if matches!(e, KeyLoadError::Cancelled | KeyLoadError::BiometricDenied) {
                        state.user_cancelled = true;
                    }
                    warn!(
                        "Auth attempt {}: key '{}' unusable: {}",
                        attempt, credential.name, e
                    );
                }
            }
        }
        Ok(false)
    }

    async fn try_credential(
        &self,
        transport: &mut dyn Transport,
        user: &str,
        credential: &Credential,
        attempt: Uuid,
    ) -> Result<CredentialOutcome, TransportError> {
        match self.materializer.materialize(credential).await {
            Ok(MaterializedKey::Loaded(key)) => {
                debug!(
                    "Auth attempt {}: offering key '{}' ({})",
                    attempt,
                    key.name(),
                    key.algorithm()
                );
                let accepted = transport.authenticate_public_key(user, &key).await?;
                Ok(if accepted {
                    CredentialOutcome::Accepted
                } else {
                    CredentialOutcome::Rejected
                })
            }
            Ok(MaterializedKey::SecurityKeyResident) => {
                self.try_security_key(transport, user, credential, attempt)
                    .await
            }
            Err(e) => Ok(CredentialOutcome::Unusable(e)),
        }
    }

    async fn try_security_key(
        &self,
        transport: &mut dyn Transport,
        user: &str,
        credential: &Credential,
        attempt: Uuid,
    ) -> Result<CredentialOutcome, TransportError> {
        let Some(authenticator) = &self.security_keys else {
            warn!(
                "Auth attempt {}: security key '{}' skipped, no authenticator configured",
                attempt, credential.name
            );
            return Ok(CredentialOutcome::Unusable(KeyLoadError::DecodeFailed(
                "no security key authenticator configured".to_string(),
            )));
        };
        info!(
            "Auth attempt {}: security key exchange for '{}'",
            attempt, credential.name
        );
        let accepted = authenticator.authenticate(transport, user, credential).await?;
        Ok(if accepted {
            CredentialOutcome::Accepted
        } else {
            CredentialOutcome::Rejected
        })
    }

    async fn try_keyboard_interactive(
        &self,
        transport: &mut dyn Transport,
        user: &str,
        state: &mut AttemptState,
        attempt: Uuid,
    ) -> Result<bool, TransportError> {
        debug!("Auth attempt {}: starting keyboard-interactive", attempt);
        state.interactive_attempted = true;

        let relay = PromptRelay::new(self.prompts.as_ref());
        let accepted = transport
            .authenticate_keyboard_interactive(user, &relay)
            .await?;

        // Engagement is judged per exchange; a server that answered the last
        // round with prompts may well do so again next cycle.
        state.interactive_engaged = relay.engaged();
        if relay.cancelled() {
            info!(
                "Auth attempt {}: keyboard-interactive cancelled by user",
                attempt
            );
            state.interactive_cancelled = true;
            state.user_cancelled = true;
        } else if !accepted && !state.interactive_engaged {
            debug!(
                "Auth attempt {}: server failed keyboard-interactive without prompting",
                attempt
            );
        }
        Ok(accepted)
    }

    async fn try_password(
        &self,
        transport: &mut dyn Transport,
        profile: &HostProfile,
        state: &mut AttemptState,
        attempt: Uuid,
    ) -> Result<bool, TransportError> {
        let label = format!(
            "Password for {}@{}",
            profile.username,
            profile.identity.address()
        );
        let Some(password) = request_secret(self.prompts.as_ref(), label).await else {
            info!("Auth attempt {}: password prompt cancelled", attempt);
            state.password_cancelled = true;
            state.user_cancelled = true;
            return Ok(false);
        };

        let accepted = transport
            .authenticate_password(&profile.username, &password)
            .await?;
        if !accepted {
            info!("Auth attempt {}: password rejected", attempt);
        }
        Ok(accepted)
    }
}

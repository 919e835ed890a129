//! User prompting capability
//!
//! Everything that may need the user's attention during a connection attempt
//! flows through one injected [`PromptHandler`]. Callers suspend on the
//! `prompt` future until the UI answers; there is no shared mutable prompt
//! state and no blocking hand-off.
//!
//! Every request variant carries a "user backed out" reply shape, and
//! callers must treat it as cancellation of the surrounding attempt.

use async_trait::async_trait;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::trust::KeyClassification;

/// One line of a keyboard-interactive challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InteractivePrompt {
    /// Prompt text from the server ("Password:", "Verification code:")
    pub text: String,

    /// Whether the user's answer may be echoed while typing
    pub echo: bool,
}

/// A question for the user.
///
/// Requests serialize so an embedding application can forward them to its
/// UI as-is; replies never serialize (they may hold secrets).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptRequest {
    /// Ask for a secret (password or key passphrase)
    Secret {
        /// What the secret unlocks ("Password for user@host", "Passphrase for key 'work'")
        label: String,
    },

    /// Ask the platform to confirm user presence before a keystore key is used
    Biometric {
        /// Shown by the platform dialog
        reason: String,
    },

    /// Present a host key for a trust decision
    HostKey {
        host: String,
        port: u16,
        /// Friendly algorithm name ("Ed25519", "RSA")
        algorithm: String,
        /// SHA-256 fingerprint of the presented key
        fingerprint: String,
        /// Fingerprint previously on record for this algorithm, when it differs
        previous_fingerprint: Option<String>,
        classification: KeyClassification,
    },

    /// Relay a keyboard-interactive challenge verbatim
    Interactive {
        name: String,
        instruction: String,
        prompts: Vec<InteractivePrompt>,
    },
}

/// The user's answer to a [`PromptRequest`]
#[derive(Debug)]
pub enum PromptReply {
    /// Answer to `Secret`; `None` means the user backed out
    Secret(Option<Zeroizing<String>>),

    /// Answer to `Biometric` (confirmed?) or `HostKey` (accepted?)
    Decision(bool),

    /// Answers to `Interactive`, one per prompt; `None` means the user backed out
    Interactive(Option<Vec<String>>),
}

/// Capability to put questions in front of the user.
///
/// Implementations decide how a request is rendered (dialog, TTY, test
/// script). The engine only awaits the reply.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn prompt(&self, request: PromptRequest) -> PromptReply;
}

/// Typed helpers over the single `prompt` entry point. A reply of the wrong
/// shape is treated as the user backing out, not as an error.
pub(crate) async fn request_secret(
    handler: &dyn PromptHandler,
    label: String,
) -> Option<Zeroizing<String>> {
    match handler.prompt(PromptRequest::Secret { label }).await {
        PromptReply::Secret(answer) => answer,
        other => {
            tracing::warn!("Prompt handler returned mismatched reply {:?} to secret request", other);
            None
        }
    }
}

pub(crate) async fn request_decision(handler: &dyn PromptHandler, request: PromptRequest) -> bool {
    match handler.prompt(request).await {
        PromptReply::Decision(accepted) => accepted,
        other => {
            tracing::warn!("Prompt handler returned mismatched reply {:?} to decision request", other);
            false
        }
    }
}

pub(crate) async fn request_interactive(
    handler: &dyn PromptHandler,
    name: String,
    instruction: String,
    prompts: Vec<InteractivePrompt>,
) -> Option<Vec<String>> {
    let request = PromptRequest::Interactive {
        name,
        instruction,
        prompts,
    };
    match handler.prompt(request).await {
        PromptReply::Interactive(answers) => answers,
        other => {
            tracing::warn!("Prompt handler returned mismatched reply {:?} to interactive request", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_tagged() {
        let request = PromptRequest::HostKey {
            host: "db.internal".to_string(),
            port: 22,
            algorithm: "Ed25519".to_string(),
            fingerprint: "SHA256:abc".to_string(),
            previous_fingerprint: None,
            classification: KeyClassification::NewKey,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "host_key");
        assert_eq!(json["classification"], "new_key");
        assert_eq!(json["port"], 22);
    }

    struct WrongShape;

    #[async_trait]
    impl PromptHandler for WrongShape {
        async fn prompt(&self, _request: PromptRequest) -> PromptReply {
            PromptReply::Decision(true)
        }
    }

    #[tokio::test]
    async fn test_mismatched_reply_is_cancellation() {
        let handler = WrongShape;
        let secret = request_secret(&handler, "Passphrase".to_string()).await;
        assert!(secret.is_none());

        let answers = request_interactive(&handler, String::new(), String::new(), Vec::new()).await;
        assert!(answers.is_none());
    }

    struct WrongDecision;

    #[async_trait]
    impl PromptHandler for WrongDecision {
        async fn prompt(&self, _request: PromptRequest) -> PromptReply {
            PromptReply::Secret(None)
        }
    }

    #[tokio::test]
    async fn test_mismatched_decision_is_false() {
        let handler = WrongDecision;
        let accepted = request_decision(
            &handler,
            PromptRequest::Biometric {
                reason: "Unlock key".to_string(),
            },
        )
        .await;
        assert!(!accepted);
    }
}

//! Identity provider adapter.
//!
//! [`IdentityProvider`] abstracts the external authentication service. The
//! coordinator only depends on this trait; exactly one concrete adapter is
//! selected at deployment time by [`build_provider`], so two step-up paths
//! can never write to the same session record.
//!
//! Failure semantics:
//!
//! - [`ProviderError::Rejected`] is terminal for the attempt.
//! - [`ProviderError::Unavailable`] and [`ProviderError::Protocol`] are
//!   retryable and are never interpreted as success.

pub mod http;
pub mod replay;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::AuthResult;
use crate::config::{ProviderConfig, ProviderKind, TimeoutConfig};
use crate::types::StepUpMethod;

pub use http::HttpIdentityProvider;
pub use replay::ReplayGuard;

/// External authentication service.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Provider name used in logs and errors.
    fn name(&self) -> &str;

    /// Verifies a primary (single-factor) credential.
    async fn verify_primary(
        &self,
        credential: &PrimaryCredential,
    ) -> Result<VerifiedPrincipal, ProviderError>;

    /// Lists the second factors the principal has enrolled.
    async fn enrolled_methods(
        &self,
        principal_id: &str,
    ) -> Result<BTreeSet<StepUpMethod>, ProviderError>;

    /// Issues a step-up challenge for `method`.
    async fn begin_step_up(
        &self,
        principal_id: &str,
        method: StepUpMethod,
    ) -> Result<Challenge, ProviderError>;

    /// Submits the principal's response to a challenge.
    ///
    /// Must be safe to retry: a duplicate call with the same challenge id and
    /// response returns the same result without repeating side effects on
    /// the provider. Wrap adapters in [`ReplayGuard`] to get this guarantee.
    async fn complete_step_up(
        &self,
        challenge_id: &str,
        response: &StepUpResponse,
    ) -> Result<StepUpResult, ProviderError>;
}

/// Primary credential presented by the principal.
#[derive(Clone, Serialize)]
pub struct PrimaryCredential {
    /// Login identifier (e.g. email or username).
    pub identifier: String,
    secret: String,
}

impl PrimaryCredential {
    /// Creates a credential.
    #[must_use]
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
        }
    }

    /// Returns the secret part of the credential.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for PrimaryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryCredential")
            .field("identifier", &self.identifier)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Response to a step-up challenge (one-time code, signed assertion, ...).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepUpResponse(String);

impl StepUpResponse {
    /// Wraps a response.
    #[must_use]
    pub fn new(response: impl Into<String>) -> Self {
        Self(response.into())
    }

    /// Returns the raw response.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-256 of the response.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        Sha256::digest(self.0.as_bytes()).into()
    }

    /// The fingerprint, base64url-encoded. Safe to persist.
    #[must_use]
    pub fn digest(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.fingerprint())
    }
}

impl fmt::Debug for StepUpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StepUpResponse([REDACTED])")
    }
}

/// Principal returned by a successful primary verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedPrincipal {
    /// Stable principal identifier.
    pub principal_id: String,
    /// Best-effort human identifier (e.g. email).
    #[serde(default)]
    pub principal_hint: Option<String>,
    /// Second factors the principal has enrolled.
    #[serde(default)]
    pub enrolled_methods: BTreeSet<StepUpMethod>,
}

/// Step-up challenge issued by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Provider-issued challenge identifier.
    pub challenge_id: String,
    /// Method the challenge is for.
    pub method: StepUpMethod,
    /// Provider-side expiry of the challenge.
    pub expires_at: OffsetDateTime,
}

/// Result of completing a step-up challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepUpResult {
    /// Whether the provider verified the response.
    pub verified: bool,
    /// Method that was used.
    pub method: StepUpMethod,
}

/// Errors returned by identity provider adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The provider explicitly refused the credential or challenge.
    #[error("Rejected by identity provider: {reason}")]
    Rejected {
        /// Why the provider refused.
        reason: String,
    },

    /// The provider could not be reached, timed out or failed.
    #[error("Identity provider unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// The principal cannot use this method.
    #[error("Unsupported step-up method: {method}")]
    UnsupportedMethod {
        /// The requested method.
        method: StepUpMethod,
    },

    /// The provider answered with something this adapter cannot interpret.
    #[error("Unexpected identity provider response: {message}")]
    Protocol {
        /// Description of the problem.
        message: String,
    },
}

impl ProviderError {
    /// Creates a new `Rejected` error.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Protocol` error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns `true` if the call may be retried with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Protocol { .. })
    }
}

/// Builds the deployment's identity provider adapter.
///
/// The adapter is always wrapped in a [`ReplayGuard`] so step-up completion
/// is idempotent regardless of the provider's own behaviour.
///
/// # Errors
///
/// Returns a configuration error if the adapter cannot be constructed.
pub fn build_provider(
    config: &ProviderConfig,
    timeouts: &TimeoutConfig,
) -> AuthResult<Arc<dyn IdentityProvider>> {
    match config.kind {
        ProviderKind::Http => {
            let adapter = HttpIdentityProvider::new(config, timeouts.provider)?;
            tracing::info!(
                provider = adapter.name(),
                base_url = %config.base_url,
                "Identity provider adapter configured"
            );
            Ok(Arc::new(ReplayGuard::new(adapter, config.replay_retention)))
        }
    }
}

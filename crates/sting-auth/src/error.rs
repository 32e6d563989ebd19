//! Error types for session assurance coordination.
//!
//! Storage and identity-provider failures are classified into [`AuthError`]
//! at the [`SessionCoordinator`](crate::coordinator::SessionCoordinator)
//! boundary. Nothing below that boundary leaks transport errors upward, and
//! a compare-and-swap conflict is never surfaced as such: it is reconciled
//! by re-reading, or reported as [`AuthError::Contention`] once the bounded
//! write attempts are exhausted.

use std::fmt;

use crate::provider::ProviderError;
use crate::storage::StoreError;
use crate::types::StepUpMethod;

/// Errors returned by the coordinator and the route gate.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The credential or step-up response was explicitly refused.
    ///
    /// Terminal for this attempt and safe to show to the user.
    #[error("Rejected: {reason}")]
    Rejected {
        /// Why the attempt was refused.
        reason: String,
    },

    /// The identity provider could not be reached or timed out.
    #[error("Identity provider unavailable: {provider} - {message}")]
    ProviderUnavailable {
        /// The identity provider name.
        provider: String,
        /// Description of the failure.
        message: String,
    },

    /// The assurance store could not be reached or timed out.
    #[error("Assurance store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the failure.
        message: String,
    },

    /// Concurrent writers kept winning the compare-and-swap race.
    #[error("Session {session} is under write contention")]
    Contention {
        /// Shortened session id, safe for logs.
        session: String,
    },

    /// The principal has no usable enrollment for the requested method.
    #[error("Unsupported step-up method: {method}")]
    UnsupportedMethod {
        /// The requested method.
        method: StepUpMethod,
    },

    /// No live session exists for the presented identifier.
    #[error("Session not found")]
    SessionNotFound,

    /// The assurance configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `Rejected` error.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Creates a new `ProviderUnavailable` error.
    #[must_use]
    pub fn provider_unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates a new `StoreUnavailable` error.
    #[must_use]
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Contention` error.
    #[must_use]
    pub fn contention(session: impl Into<String>) -> Self {
        Self::Contention {
            session: session.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if the caller should back off and retry.
    ///
    /// A retryable error never means the attempted transition happened.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. } | Self::StoreUnavailable { .. } | Self::Contention { .. }
        )
    }

    /// Returns `true` if the attempt was refused and must not be retried as-is.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::UnsupportedMethod { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Rejected { .. } => ErrorCategory::Verification,
            Self::UnsupportedMethod { .. } => ErrorCategory::Verification,
            Self::ProviderUnavailable { .. } => ErrorCategory::Federation,
            Self::StoreUnavailable { .. } => ErrorCategory::Infrastructure,
            Self::Contention { .. } => ErrorCategory::Infrastructure,
            Self::SessionNotFound => ErrorCategory::Authentication,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the wording a user-facing layer should render for this error.
    ///
    /// Retryable failures ask the user to wait, a missing session asks them
    /// to sign in, and refused verifications ask them to try again. None of
    /// them should be turned into a redirect loop.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable { .. }
            | Self::StoreUnavailable { .. }
            | Self::Contention { .. } => "Please wait a moment and retry.",
            Self::SessionNotFound => "Please sign in.",
            Self::Rejected { .. } => "Verification failed, please try again.",
            Self::UnsupportedMethod { .. } => {
                "This verification method is not available for your account."
            }
            Self::Configuration { .. } | Self::Internal { .. } => {
                "Something went wrong, please try again later."
            }
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { message } => Self::store_unavailable(message),
            StoreError::Conflict { .. } | StoreError::AlreadyExists { .. } => {
                // Conflicts are reconciled by the coordinator's write loops.
                Self::internal(format!("unreconciled store conflict: {err}"))
            }
            StoreError::Serialization { message } => Self::internal(message),
        }
    }
}

impl AuthError {
    /// Classifies an adapter failure for the named provider.
    #[must_use]
    pub fn from_provider(provider: &str, err: ProviderError) -> Self {
        match err {
            ProviderError::Rejected { reason } => Self::rejected(reason),
            ProviderError::UnsupportedMethod { method } => Self::UnsupportedMethod { method },
            ProviderError::Unavailable { message } => Self::provider_unavailable(provider, message),
            ProviderError::Protocol { message } => {
                Self::provider_unavailable(provider, format!("unexpected response: {message}"))
            }
        }
    }
}

/// Categories of assurance errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// No usable session.
    Authentication,
    /// Credential or step-up verification refused.
    Verification,
    /// Identity provider failures.
    Federation,
    /// Store failures and write contention.
    Infrastructure,
    /// Configuration errors.
    Configuration,
    /// Internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::Verification => write!(f, "verification"),
            Self::Federation => write!(f, "federation"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

//! Route gate.
//!
//! Maps a request's session and the resource class it targets to an
//! access decision. The gate keeps no state: every call asks the
//! [`SessionCoordinator`] again, so a revoked session is denied on the
//! very next request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::AuthResult;
use crate::coordinator::{Assessment, SessionCoordinator};
use crate::types::{MarkerToken, ResourceClass, SessionId};

/// Access decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Serve the request.
    Allow,
    /// The session is valid but needs a step-up first.
    RequireStepUp,
    /// No usable session; the principal must authenticate.
    Deny,
    /// Authentication just completed and is not visible yet; retry shortly.
    Pending,
}

impl GateDecision {
    /// Returns the decision as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::RequireStepUp => "require_step_up",
            Self::Deny => "deny",
            Self::Pending => "pending",
        }
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision plus the retry hint that accompanies [`GateDecision::Pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authorization {
    /// What to do with the request.
    pub decision: GateDecision,
    /// Set only for [`GateDecision::Pending`].
    pub retry_after: Option<Duration>,
}

impl Authorization {
    fn decided(decision: GateDecision) -> Self {
        Self {
            decision,
            retry_after: None,
        }
    }

    /// Retry hint in whole milliseconds.
    #[must_use]
    pub fn retry_after_ms(&self) -> Option<u64> {
        self.retry_after
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    /// Returns `true` if the request may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.decision == GateDecision::Allow
    }
}

/// Stateless access gate over a [`SessionCoordinator`].
#[derive(Debug, Clone)]
pub struct RouteGate {
    coordinator: Arc<SessionCoordinator>,
}

impl RouteGate {
    /// Creates a gate that consults `coordinator` on every request.
    #[must_use]
    pub fn new(coordinator: Arc<SessionCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Authorizes a request without bridging evidence.
    ///
    /// # Errors
    ///
    /// Returns a retryable error if the store cannot be read; never a
    /// decision the caller could mistake for a denial.
    pub async fn authorize(
        &self,
        session: Option<&SessionId>,
        resource: ResourceClass,
    ) -> AuthResult<Authorization> {
        self.authorize_with_marker(session, None, resource).await
    }

    /// Authorizes a request that may carry a transition marker.
    ///
    /// The marker can turn a denial into [`GateDecision::Pending`] but never
    /// into [`GateDecision::Allow`].
    ///
    /// # Errors
    ///
    /// Returns a retryable error if the store cannot be read.
    pub async fn authorize_with_marker(
        &self,
        session: Option<&SessionId>,
        marker: Option<&MarkerToken>,
        resource: ResourceClass,
    ) -> AuthResult<Authorization> {
        if resource == ResourceClass::Public {
            return Ok(Authorization::decided(GateDecision::Allow));
        }

        let assessment = self
            .coordinator
            .assess(session, marker, resource.required_level())
            .await?;

        let state = assessment.state();
        let authorization = match assessment {
            Assessment::Satisfied(_) => Authorization::decided(GateDecision::Allow),
            Assessment::Insufficient(_) => Authorization::decided(GateDecision::RequireStepUp),
            Assessment::Unauthenticated => Authorization::decided(GateDecision::Deny),
            Assessment::Bridging { retry_after } => Authorization {
                decision: GateDecision::Pending,
                retry_after: Some(retry_after),
            },
        };
        tracing::debug!(
            session = session.map(SessionId::short),
            %resource,
            %state,
            decision = %authorization.decision,
            "Route authorized"
        );
        Ok(authorization)
    }
}

//! Session record and coordinator states.
//!
//! A [`Session`] is the single durable record per session id. Its
//! `assurance_level` only reaches [`AssuranceLevel::Aal2`] through a verified
//! step-up completion tied to the same session id (recorded in
//! [`Session::elevation`]); enrolled methods never imply it.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::assurance::{AssuranceLevel, StepUpMethod};

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps an identifier issued elsewhere (e.g. read from a cookie).
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new random identifier (256 bits, base64url).
    #[must_use]
    pub fn generate() -> Self {
        Self(super::generate_token())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short prefix that is safe to put in logs.
    #[must_use]
    pub fn short(&self) -> &str {
        super::short_token(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A step-up challenge that has been issued but not yet completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingStepUp {
    /// Provider-issued challenge identifier.
    pub challenge_id: String,
    /// Method the challenge was issued for.
    pub method: StepUpMethod,
    /// When the challenge was issued.
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    /// After this instant a verified completion is still rejected.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl PendingStepUp {
    /// Returns `true` if the challenge can no longer elevate the session.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

/// The verified step-up that raised a session to AAL2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Elevation {
    /// Challenge whose verified completion elevated the session.
    pub challenge_id: String,
    /// Method used for the step-up.
    pub method: StepUpMethod,
    /// When the elevation was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub elevated_at: OffsetDateTime,
    /// Base64url SHA-256 of the verified response.
    pub response_digest: String,
}

/// Durable assurance record for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,

    /// Stable identifier of the authenticated principal.
    pub principal_id: String,

    /// Best-effort human identifier (e.g. email) reported by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_hint: Option<String>,

    /// Current assurance level.
    pub assurance_level: AssuranceLevel,

    /// When the session was created.
    #[serde(with = "time::serde::rfc3339")]
    pub established_at: OffsetDateTime,

    /// When the session expires. Only moves forward, via renewal.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,

    /// Second factors the principal has registered.
    #[serde(default)]
    pub step_up_methods_enrolled: BTreeSet<StepUpMethod>,

    /// Outstanding step-up challenge, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_step_up: Option<PendingStepUp>,

    /// The step-up that produced AAL2, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<Elevation>,

    /// Store version used for compare-and-swap writes.
    ///
    /// Assigned by the store on every successful write; not part of the
    /// persisted document.
    #[serde(skip)]
    pub version: u64,
}

impl Session {
    /// Creates a fresh AAL1 session for a verified principal.
    #[must_use]
    pub fn established(
        principal_id: impl Into<String>,
        principal_hint: Option<String>,
        enrolled: BTreeSet<StepUpMethod>,
        now: OffsetDateTime,
        lifetime: time::Duration,
    ) -> Self {
        Self {
            id: SessionId::generate(),
            principal_id: principal_id.into(),
            principal_hint,
            assurance_level: AssuranceLevel::Aal1,
            established_at: now,
            expires_at: now + lifetime,
            step_up_methods_enrolled: enrolled,
            pending_step_up: None,
            elevation: None,
            version: 0,
        }
    }

    /// Returns `true` if the session has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Returns `true` if the session has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// Returns `true` if the principal has enrolled `method`.
    #[must_use]
    pub fn has_enrolled(&self, method: StepUpMethod) -> bool {
        self.step_up_methods_enrolled.contains(&method)
    }

    /// Returns `true` if `hint` names this session's principal.
    #[must_use]
    pub fn matches_hint(&self, hint: &str) -> bool {
        self.principal_id == hint
            || self
                .principal_hint
                .as_deref()
                .is_some_and(|h| h.eq_ignore_ascii_case(hint))
    }

    /// Returns `true` if the session was elevated by `challenge_id`.
    #[must_use]
    pub fn elevated_by(&self, challenge_id: &str) -> bool {
        self.assurance_level == AssuranceLevel::Aal2
            && self
                .elevation
                .as_ref()
                .is_some_and(|e| e.challenge_id == challenge_id)
    }

    /// Returns the pending challenge if it is `challenge_id`.
    #[must_use]
    pub fn pending_challenge(&self, challenge_id: &str) -> Option<&PendingStepUp> {
        self.pending_step_up
            .as_ref()
            .filter(|p| p.challenge_id == challenge_id)
    }

    /// Extends the expiry to `candidate` if that is later. Never shortens it.
    pub fn extend_expiry(&mut self, candidate: OffsetDateTime) {
        if candidate > self.expires_at {
            self.expires_at = candidate;
        }
    }

    /// Returns the coordinator state this record represents.
    #[must_use]
    pub fn state(&self) -> SessionState {
        match self.assurance_level {
            AssuranceLevel::None => SessionState::Unauthenticated,
            AssuranceLevel::Aal1 if self.pending_step_up.is_some() => SessionState::StepUpPending,
            AssuranceLevel::Aal1 => SessionState::Aal1Established,
            AssuranceLevel::Aal2 => SessionState::Aal2Established,
        }
    }
}

/// States of the session assurance state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session.
    Unauthenticated,
    /// Recent authentication is being confirmed (bridging window).
    Aal1Pending,
    /// Single-factor session.
    Aal1Established,
    /// Step-up challenge issued, awaiting completion.
    StepUpPending,
    /// Multi-factor session.
    Aal2Established,
    /// Session lifetime ran out.
    Expired,
    /// Session was explicitly ended.
    Revoked,
}

impl SessionState {
    /// Returns `true` for the terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Revoked)
    }

    /// Returns the state as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Aal1Pending => "aal1_pending",
            Self::Aal1Established => "aal1_established",
            Self::StepUpPending => "stepup_pending",
            Self::Aal2Established => "aal2_established",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    /// The principal signed out.
    Logout,
    /// An assurance downgrade was detected and the session ended explicitly.
    Downgrade,
    /// A different principal authenticated on the same session.
    PrincipalChanged,
    /// An operator ended the session.
    Administrative,
}

impl RevocationReason {
    /// Returns the reason as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::Downgrade => "downgrade",
            Self::PrincipalChanged => "principal_changed",
            Self::Administrative => "administrative",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Audit events for durable assurance transitions.
//!
//! Every transition that changes a stored session (establishment, retention
//! of a higher level on re-verification, elevation, renewal, revocation) is
//! recorded as an [`AuditEvent`] on the `sting_auth::audit` tracing target,
//! so a subscriber can route them to a separate sink.
//!
//! Session ids appear only as short prefixes; credentials never appear.

use serde::Serialize;
use time::OffsetDateTime;

use crate::types::{AssuranceLevel, SessionId, StepUpMethod};

/// Tracing target all audit events are emitted on.
pub const AUDIT_TARGET: &str = "sting_auth::audit";

/// Audited transition kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A new AAL1 session was created.
    SessionEstablished,
    /// A primary re-verification kept an existing higher level.
    AssuranceRetained,
    /// A step-up challenge was issued.
    StepUpStarted,
    /// A verified step-up raised the session to AAL2.
    StepUpElevated,
    /// A step-up completion was refused.
    StepUpFailed,
    /// The session expiry was extended.
    SessionRenewed,
    /// The session was explicitly ended.
    SessionRevoked,
}

impl AuditAction {
    /// Returns the dotted event code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionEstablished => "session.established",
            Self::AssuranceRetained => "session.assurance_retained",
            Self::StepUpStarted => "step_up.started",
            Self::StepUpElevated => "step_up.elevated",
            Self::StepUpFailed => "step_up.failed",
            Self::SessionRenewed => "session.renewed",
            Self::SessionRevoked => "session.revoked",
        }
    }
}

/// Whether the audited attempt succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The transition was applied.
    Success,
    /// The attempt was refused; nothing durable changed.
    Failure,
}

/// One audited transition.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// What happened.
    pub action: AuditAction,
    /// Whether it was applied or refused.
    pub outcome: AuditOutcome,
    /// Short session id prefix.
    pub session: String,
    /// Principal the session belongs to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    /// Assurance level after the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<AssuranceLevel>,
    /// Step-up method involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<StepUpMethod>,
    /// Revocation reason or refusal cause.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the event was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl AuditEvent {
    /// Starts a successful event for `session`.
    #[must_use]
    pub fn new(action: AuditAction, session: &SessionId) -> Self {
        Self {
            action,
            outcome: AuditOutcome::Success,
            session: session.short().to_string(),
            principal_id: None,
            level: None,
            method: None,
            reason: None,
            at: OffsetDateTime::now_utc(),
        }
    }

    /// Sets the principal.
    #[must_use]
    pub fn principal(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    /// Sets the resulting assurance level.
    #[must_use]
    pub fn level(mut self, level: AssuranceLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Sets the step-up method.
    #[must_use]
    pub fn method(mut self, method: StepUpMethod) -> Self {
        self.method = Some(method);
        self
    }

    /// Sets the reason. Must not contain credentials.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Marks the event as a refused attempt.
    #[must_use]
    pub fn failure(mut self) -> Self {
        self.outcome = AuditOutcome::Failure;
        self
    }

    /// Emits the event on [`AUDIT_TARGET`].
    pub fn emit(&self) {
        let level = self.level.map(|l| l.as_str());
        let method = self.method.map(|m| m.as_str());
        match self.outcome {
            AuditOutcome::Success => tracing::info!(
                target: "sting_auth::audit",
                action = self.action.code(),
                session = %self.session,
                principal_id = ?self.principal_id,
                level = ?level,
                method = ?method,
                reason = ?self.reason,
                "{}",
                self.action.code()
            ),
            AuditOutcome::Failure => tracing::warn!(
                target: "sting_auth::audit",
                action = self.action.code(),
                session = %self.session,
                principal_id = ?self.principal_id,
                method = ?method,
                reason = ?self.reason,
                "{} refused",
                self.action.code()
            ),
        }
    }
}

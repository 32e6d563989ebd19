//! Session assurance state machine.
//!
//! [`SessionCoordinator`] is the only component that mutates session
//! records. Every mutation is one compare-and-swap against the
//! [`AssuranceStore`]; on a version conflict the coordinator re-reads the
//! record and re-evaluates the transition on the fresh copy instead of
//! replaying the write.
//!
//! ```text
//! UNAUTHENTICATED --verify_primary--> AAL1_ESTABLISHED
//! AAL1_ESTABLISHED --begin_step_up--> STEPUP_PENDING
//! STEPUP_PENDING --complete_step_up(verified)--> AAL2_ESTABLISHED
//! STEPUP_PENDING --complete_step_up(refused)--> AAL1_ESTABLISHED
//! any --expiry / revoke--> EXPIRED / REVOKED
//! ```
//!
//! Store and provider calls are bounded by the configured timeouts. A
//! timeout leaves the record in its last durable state and surfaces as a
//! retryable error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::audit::{AuditAction, AuditEvent};
use crate::config::AssuranceConfig;
use crate::marker::TransitionMarkers;
use crate::provider::{IdentityProvider, PrimaryCredential, ProviderError, StepUpResponse};
use crate::storage::{AssuranceStore, MarkerStorage, StoreError};
use crate::types::{
    AssuranceLevel, Elevation, MarkerConsumption, MarkerToken, PendingStepUp, RevocationReason,
    Session, SessionId, SessionState, StepUpMethod,
};
use crate::{AuthError, AuthResult};

/// Result of a successful primary verification.
#[derive(Debug, Clone)]
pub struct EstablishedSession {
    /// The durable session record.
    pub session: Session,
    /// Marker bridging the window until the write is visible everywhere.
    pub marker: Option<MarkerToken>,
    /// `true` if an existing AAL2 level was kept instead of reset.
    pub retained_elevation: bool,
}

/// Result of starting a step-up.
#[derive(Debug, Clone)]
pub enum StepUpStart {
    /// A challenge is outstanding; present it to the principal.
    Challenge(PendingStepUp),
    /// The session is already at AAL2; nothing to do.
    AlreadyElevated(Session),
}

/// Result of a verified step-up completion.
#[derive(Debug, Clone)]
pub struct StepUpOutcome {
    /// The elevated session.
    pub session: Session,
    /// Marker for the write that just happened.
    pub marker: Option<MarkerToken>,
    /// `true` if another call had already applied this elevation.
    pub converged: bool,
}

/// How a request's session relates to a required level.
#[derive(Debug, Clone)]
pub enum Assessment {
    /// The session meets the requirement.
    Satisfied(Session),
    /// A session exists but its level is too low.
    Insufficient(Session),
    /// A just-completed authentication is not visible yet.
    Bridging {
        /// Suggested delay before the caller retries.
        retry_after: Duration,
    },
    /// No session and no evidence of recent authentication.
    Unauthenticated,
}

impl Assessment {
    /// The session state this assessment observed.
    #[must_use]
    pub fn state(&self) -> SessionState {
        match self {
            Self::Satisfied(session) | Self::Insufficient(session) => session.state(),
            Self::Bridging { .. } => SessionState::Aal1Pending,
            Self::Unauthenticated => SessionState::Unauthenticated,
        }
    }
}

/// Counts returned by [`SessionCoordinator::cleanup_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Session records removed.
    pub sessions: u64,
    /// Transition markers removed.
    pub markers: u64,
}

enum Update {
    Write,
    Skip,
}

/// The session assurance coordinator.
pub struct SessionCoordinator {
    config: AssuranceConfig,
    lifetime: time::Duration,
    store: Arc<dyn AssuranceStore>,
    provider: Arc<dyn IdentityProvider>,
    markers: TransitionMarkers,
}

impl SessionCoordinator {
    /// Creates a coordinator.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` does not validate.
    pub fn new(
        config: AssuranceConfig,
        store: Arc<dyn AssuranceStore>,
        provider: Arc<dyn IdentityProvider>,
        marker_storage: Arc<dyn MarkerStorage>,
    ) -> AuthResult<Self> {
        config
            .validate()
            .map_err(|e| AuthError::configuration(e.to_string()))?;
        let lifetime = time::Duration::try_from(config.session.lifetime)
            .map_err(|e| AuthError::configuration(format!("session.lifetime: {e}")))?;
        let markers =
            TransitionMarkers::new(marker_storage, config.marker.ttl, config.timeouts.store);

        Ok(Self {
            config,
            lifetime,
            store,
            provider,
            markers,
        })
    }

    /// Returns the configuration in use.
    #[must_use]
    pub fn config(&self) -> &AssuranceConfig {
        &self.config
    }

    /// Returns the transition marker service.
    #[must_use]
    pub fn markers(&self) -> &TransitionMarkers {
        &self.markers
    }

    /// Verifies a primary credential and establishes an AAL1 session.
    ///
    /// With `current` naming a live session of the same principal, that
    /// session is refreshed instead: enrolled methods and expiry are
    /// updated and an AAL2 level is kept. A live session of a different
    /// principal is revoked first.
    ///
    /// # Errors
    ///
    /// - `Rejected` if the provider refused the credential
    /// - `ProviderUnavailable` / `StoreUnavailable` / `Contention` (retryable)
    pub async fn verify_primary(
        &self,
        credential: &PrimaryCredential,
        current: Option<&SessionId>,
    ) -> AuthResult<EstablishedSession> {
        let principal = self
            .call_provider(self.provider.verify_primary(credential))
            .await?;

        let mut refreshed = None;
        if let Some(id) = current
            && let Some(existing) = self.load(id).await?
        {
            if existing.principal_id == principal.principal_id {
                let lifetime = self.lifetime;
                let result = self
                    .update_session(id, Some(existing), |s| {
                        s.step_up_methods_enrolled = principal.enrolled_methods.clone();
                        if principal.principal_hint.is_some() {
                            s.principal_hint = principal.principal_hint.clone();
                        }
                        s.extend_expiry(OffsetDateTime::now_utc() + lifetime);
                        Ok(Update::Write)
                    })
                    .await;
                match result {
                    Ok((session, _)) => refreshed = Some(session),
                    // Expired between the read and the write; start over.
                    Err(AuthError::SessionNotFound) => {}
                    Err(e) => return Err(e),
                }
            } else {
                tracing::info!(
                    session = id.short(),
                    "Different principal authenticated on an existing session"
                );
                self.revoke(id, RevocationReason::PrincipalChanged).await?;
            }
        }

        let (session, retained_elevation) = match refreshed {
            Some(session) => {
                let retained = session.assurance_level == AssuranceLevel::Aal2;
                if retained {
                    AuditEvent::new(AuditAction::AssuranceRetained, &session.id)
                        .principal(&session.principal_id)
                        .level(session.assurance_level)
                        .reason("primary re-verification")
                        .emit();
                } else {
                    AuditEvent::new(AuditAction::SessionRenewed, &session.id)
                        .principal(&session.principal_id)
                        .level(session.assurance_level)
                        .emit();
                }
                (session, retained)
            }
            None => {
                let session = self
                    .create_session(
                        &principal.principal_id,
                        principal.principal_hint.clone(),
                        principal.enrolled_methods.clone(),
                    )
                    .await?;
                AuditEvent::new(AuditAction::SessionEstablished, &session.id)
                    .principal(&session.principal_id)
                    .level(session.assurance_level)
                    .emit();
                (session, false)
            }
        };

        let marker = self.issue_marker(&session).await;
        Ok(EstablishedSession {
            session,
            marker,
            retained_elevation,
        })
    }

    /// Starts a step-up for `method`.
    ///
    /// The assurance level is not touched; only the pending challenge is
    /// recorded. An unexpired pending challenge for the same method is
    /// returned instead of asking the provider for another one.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound` if the session does not exist or has expired
    /// - `UnsupportedMethod` if the principal has not enrolled `method`
    /// - `ProviderUnavailable` / `StoreUnavailable` / `Contention` (retryable)
    pub async fn begin_step_up(
        &self,
        id: &SessionId,
        method: StepUpMethod,
    ) -> AuthResult<StepUpStart> {
        let session = self.load(id).await?.ok_or(AuthError::SessionNotFound)?;
        if session.assurance_level == AssuranceLevel::Aal2 {
            return Ok(StepUpStart::AlreadyElevated(session));
        }

        let now = OffsetDateTime::now_utc();
        if let Some(pending) = &session.pending_step_up
            && pending.method == method
            && !pending.is_expired_at(now)
        {
            tracing::debug!(session = id.short(), %method, "Reusing pending challenge");
            return Ok(StepUpStart::Challenge(pending.clone()));
        }

        // Enrollment may have changed since the session was established.
        let enrolled = if session.has_enrolled(method) {
            None
        } else {
            let refreshed = self
                .call_provider(self.provider.enrolled_methods(&session.principal_id))
                .await?;
            if !refreshed.contains(&method) {
                return Err(AuthError::UnsupportedMethod { method });
            }
            Some(refreshed)
        };

        let challenge = self
            .call_provider(self.provider.begin_step_up(&session.principal_id, method))
            .await?;
        let ceiling = now + self.config.step_up.challenge_ttl;
        let pending = PendingStepUp {
            challenge_id: challenge.challenge_id,
            method,
            issued_at: now,
            expires_at: challenge.expires_at.min(ceiling),
        };

        let (session, written) = self
            .update_session(id, Some(session), |s| {
                if s.assurance_level == AssuranceLevel::Aal2 {
                    return Ok(Update::Skip);
                }
                if let Some(enrolled) = &enrolled {
                    s.step_up_methods_enrolled = enrolled.clone();
                }
                s.pending_step_up = Some(pending.clone());
                Ok(Update::Write)
            })
            .await?;

        if !written {
            return Ok(StepUpStart::AlreadyElevated(session));
        }

        AuditEvent::new(AuditAction::StepUpStarted, &session.id)
            .principal(&session.principal_id)
            .method(method)
            .emit();
        Ok(StepUpStart::Challenge(pending))
    }

    /// Completes a step-up challenge.
    ///
    /// On a verified response the session moves to AAL2 with one
    /// compare-and-swap. A caller that loses the race finds the session
    /// already elevated by the same challenge and gets the same success
    /// back (`converged = true`). A repeat with the same response is
    /// answered from the stored elevation without reaching the provider.
    ///
    /// # Errors
    ///
    /// - `Rejected` if the response was refused, or the challenge is
    ///   unknown, expired, already used or for another method
    /// - `SessionNotFound` if the session does not exist or has expired
    /// - `ProviderUnavailable` / `StoreUnavailable` / `Contention` (retryable)
    pub async fn complete_step_up(
        &self,
        id: &SessionId,
        challenge_id: &str,
        response: &StepUpResponse,
    ) -> AuthResult<StepUpOutcome> {
        let session = self.load(id).await?.ok_or(AuthError::SessionNotFound)?;

        if let Some(elevation) = session.elevation.as_ref()
            && elevation.challenge_id == challenge_id
        {
            let method = Some(elevation.method);
            if elevation.response_digest != response.digest() {
                return Err(Self::refuse(&session, method, "challenge already completed"));
            }
            tracing::debug!(session = id.short(), challenge_id, "Step-up already applied");
            return Ok(StepUpOutcome {
                session,
                marker: None,
                converged: true,
            });
        }

        let Some(pending) = session.pending_challenge(challenge_id) else {
            return Err(Self::refuse(&session, None, "challenge is not pending"));
        };
        let expected_method = pending.method;
        if pending.is_expired_at(OffsetDateTime::now_utc()) {
            self.clear_pending(id, challenge_id).await;
            return Err(Self::refuse(&session, Some(expected_method), "challenge expired"));
        }

        let result = match self
            .call_provider(self.provider.complete_step_up(challenge_id, response))
            .await
        {
            Ok(result) => result,
            Err(AuthError::Rejected { reason }) => {
                self.clear_pending(id, challenge_id).await;
                return Err(Self::refuse(&session, Some(expected_method), &reason));
            }
            Err(e) => return Err(e),
        };

        if !result.verified || result.method != expected_method {
            self.clear_pending(id, challenge_id).await;
            let reason = if result.verified {
                "challenge completed with a different method"
            } else {
                "verification failed"
            };
            return Err(Self::refuse(&session, Some(expected_method), reason));
        }

        let method = result.method;
        let elevated = self
            .update_session(id, Some(session), |s| {
                if s.elevated_by(challenge_id) {
                    return Ok(Update::Skip);
                }
                let now = OffsetDateTime::now_utc();
                match s.pending_challenge(challenge_id) {
                    None => return Err(AuthError::rejected("challenge is not pending")),
                    Some(p) if p.is_expired_at(now) => {
                        return Err(AuthError::rejected("challenge expired"));
                    }
                    Some(_) => {}
                }
                s.assurance_level = AssuranceLevel::Aal2;
                s.pending_step_up = None;
                s.elevation = Some(Elevation {
                    challenge_id: challenge_id.to_string(),
                    method,
                    elevated_at: now,
                    response_digest: response.digest(),
                });
                Ok(Update::Write)
            })
            .await;

        let (session, written) = match elevated {
            Ok(done) => done,
            Err(AuthError::Rejected { reason }) => {
                return Err(Self::refuse_id(id, None, Some(method), &reason));
            }
            Err(e) => return Err(e),
        };

        if !written {
            tracing::debug!(session = id.short(), challenge_id, "Converged on concurrent step-up");
            return Ok(StepUpOutcome {
                session,
                marker: None,
                converged: true,
            });
        }

        AuditEvent::new(AuditAction::StepUpElevated, &session.id)
            .principal(&session.principal_id)
            .level(AssuranceLevel::Aal2)
            .method(method)
            .emit();
        let marker = self.issue_marker(&session).await;
        Ok(StepUpOutcome {
            session,
            marker,
            converged: false,
        })
    }

    /// Classifies a request against `required`.
    ///
    /// Read-then-bridge-then-confirm: if the first read does not satisfy
    /// `required` but a valid marker for this principal attesting a level
    /// that would satisfy it is presented, the store is read once more
    /// after `bridge.retry_delay`. If that read
    /// still falls short the result is [`Assessment::Bridging`]. A marker
    /// alone never produces [`Assessment::Satisfied`].
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store cannot be read in time.
    pub async fn assess(
        &self,
        session_id: Option<&SessionId>,
        marker: Option<&MarkerToken>,
        required: AssuranceLevel,
    ) -> AuthResult<Assessment> {
        let mut first = match session_id {
            Some(id) => self.load(id).await?,
            None => None,
        };
        if let Some(session) = first.take_if(|s| s.assurance_level.satisfies(required)) {
            return Ok(Assessment::Satisfied(session));
        }

        let Some(token) = marker else {
            return Ok(Self::settle(first));
        };
        let hint = match self.markers.consume(token).await? {
            MarkerConsumption {
                valid: true,
                principal_hint: Some(hint),
                level: Some(level),
                ..
            } if level.satisfies(required) => hint,
            _ => return Ok(Self::settle(first)),
        };
        if let Some(session) = &first
            && !session.matches_hint(&hint)
        {
            tracing::debug!(
                marker = token.short(),
                "Marker does not belong to the session principal; ignoring"
            );
            return Ok(Self::settle(first));
        }

        let retry_after = self.config.bridge.retry_after;
        let Some(id) = session_id else {
            return Ok(Assessment::Bridging { retry_after });
        };

        tracing::debug!(session = id.short(), "Bridging: re-reading once after delay");
        tokio::time::sleep(self.config.bridge.retry_delay).await;
        match self.load(id).await? {
            Some(session) if session.assurance_level.satisfies(required) => {
                Ok(Assessment::Satisfied(session))
            }
            _ => Ok(Assessment::Bridging { retry_after }),
        }
    }

    /// Extends the session expiry to `now + session.lifetime`.
    ///
    /// The expiry never moves backwards.
    ///
    /// # Errors
    ///
    /// `SessionNotFound`, or a retryable store error.
    pub async fn renew(&self, id: &SessionId) -> AuthResult<Session> {
        let lifetime = self.lifetime;
        let (session, _) = self
            .update_session(id, None, |s| {
                s.extend_expiry(OffsetDateTime::now_utc() + lifetime);
                Ok(Update::Write)
            })
            .await?;

        AuditEvent::new(AuditAction::SessionRenewed, &session.id)
            .principal(&session.principal_id)
            .level(session.assurance_level)
            .emit();
        Ok(session)
    }

    /// Ends a session. Revoking a missing session succeeds.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store cannot be reached in time.
    pub async fn revoke(&self, id: &SessionId, reason: RevocationReason) -> AuthResult<SessionState> {
        let existing = self.load(id).await?;
        self.store_call(self.store.revoke(id)).await?;

        match existing {
            Some(session) => {
                AuditEvent::new(AuditAction::SessionRevoked, &session.id)
                    .principal(&session.principal_id)
                    .level(session.assurance_level)
                    .reason(reason.as_str())
                    .emit();
            }
            None => tracing::debug!(session = id.short(), %reason, "Revoke of absent session"),
        }
        Ok(SessionState::Revoked)
    }

    /// Returns the state of a session.
    ///
    /// A session that ran out or was revoked reports `Expired` or `Revoked`
    /// until housekeeping removes it; an unknown one is unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store cannot be read in time.
    pub async fn state(&self, id: &SessionId) -> AuthResult<SessionState> {
        if let Some(session) = self.load(id).await? {
            return Ok(session.state());
        }
        let lapsed = self.store_call(self.store.lapsed(id)).await?;
        Ok(lapsed.unwrap_or(SessionState::Unauthenticated))
    }

    /// Reads a live session.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store cannot be read in time.
    pub async fn session(&self, id: &SessionId) -> AuthResult<Option<Session>> {
        self.load(id).await
    }

    /// Removes expired sessions and markers.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if a store cannot be reached in time.
    pub async fn cleanup_expired(&self) -> AuthResult<CleanupStats> {
        let sessions = self.store_call(self.store.cleanup_expired()).await?;
        let markers = self.markers.cleanup_expired().await?;
        if sessions + markers > 0 {
            tracing::info!(sessions, markers, "Removed expired assurance records");
        }
        Ok(CleanupStats { sessions, markers })
    }

    fn settle(session: Option<Session>) -> Assessment {
        match session {
            Some(session) => Assessment::Insufficient(session),
            None => Assessment::Unauthenticated,
        }
    }

    async fn create_session(
        &self,
        principal_id: &str,
        principal_hint: Option<String>,
        enrolled: std::collections::BTreeSet<StepUpMethod>,
    ) -> AuthResult<Session> {
        for _ in 0..self.config.step_up.max_write_attempts {
            let mut session = Session::established(
                principal_id,
                principal_hint.clone(),
                enrolled.clone(),
                OffsetDateTime::now_utc(),
                self.lifetime,
            );
            match self.store_call(self.store.put(&session, None)).await {
                Ok(version) => {
                    session.version = version;
                    return Ok(session);
                }
                Err(StoreError::AlreadyExists { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AuthError::internal("could not allocate a unique session id"))
    }

    /// Applies `apply` to the stored record with compare-and-swap.
    ///
    /// `apply` runs against a fresh copy on every round, so a conflict
    /// re-evaluates the transition instead of replaying it. Returns the
    /// resulting record and whether this call wrote it.
    async fn update_session<F>(
        &self,
        id: &SessionId,
        mut current: Option<Session>,
        mut apply: F,
    ) -> AuthResult<(Session, bool)>
    where
        F: FnMut(&mut Session) -> AuthResult<Update>,
    {
        for attempt in 1..=self.config.step_up.max_write_attempts {
            let mut session = match current.take() {
                Some(session) => session,
                None => self.load(id).await?.ok_or(AuthError::SessionNotFound)?,
            };
            if let Update::Skip = apply(&mut session)? {
                return Ok((session, false));
            }

            match self
                .store_call(self.store.put(&session, Some(session.version)))
                .await
            {
                Ok(version) => {
                    session.version = version;
                    return Ok((session, true));
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(session = id.short(), attempt, error = %e, "Write conflict, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(session = id.short(), "Gave up after repeated write conflicts");
        Err(AuthError::contention(id.short()))
    }

    /// Drops a pending challenge; failures only affect cleanliness.
    async fn clear_pending(&self, id: &SessionId, challenge_id: &str) {
        let result = self
            .update_session(id, None, |s| {
                if s.pending_challenge(challenge_id).is_none() {
                    return Ok(Update::Skip);
                }
                s.pending_step_up = None;
                Ok(Update::Write)
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(session = id.short(), error = %e, "Failed to clear pending challenge");
        }
    }

    fn refuse(session: &Session, method: Option<StepUpMethod>, reason: &str) -> AuthError {
        Self::refuse_id(&session.id, Some(session.principal_id.as_str()), method, reason)
    }

    fn refuse_id(
        id: &SessionId,
        principal_id: Option<&str>,
        method: Option<StepUpMethod>,
        reason: &str,
    ) -> AuthError {
        let mut event = AuditEvent::new(AuditAction::StepUpFailed, id)
            .reason(reason)
            .failure();
        if let Some(principal_id) = principal_id {
            event = event.principal(principal_id);
        }
        if let Some(method) = method {
            event = event.method(method);
        }
        event.emit();
        AuthError::rejected(reason)
    }

    async fn issue_marker(&self, session: &Session) -> Option<MarkerToken> {
        let hint = session
            .principal_hint
            .as_deref()
            .unwrap_or(&session.principal_id);
        match self.markers.issue(hint, session.assurance_level).await {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(session = session.id.short(), error = %e, "Transition marker not issued");
                None
            }
        }
    }

    async fn load(&self, id: &SessionId) -> AuthResult<Option<Session>> {
        Ok(self.store_call(self.store.get(id)).await?)
    }

    async fn store_call<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.config.timeouts.store, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?self.config.timeouts.store, "Assurance store call timed out");
                Err(StoreError::unavailable("store call timed out"))
            }
        }
    }

    async fn call_provider<T>(
        &self,
        fut: impl Future<Output = Result<T, ProviderError>>,
    ) -> AuthResult<T> {
        let provider = self.provider.name();
        let result = match tokio::time::timeout(self.config.timeouts.provider, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::unavailable("request timed out")),
        };
        result.map_err(|e| {
            if e.is_retryable() {
                tracing::warn!(provider, error = %e, "Identity provider unavailable");
            }
            AuthError::from_provider(provider, e)
        })
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("provider", &self.provider.name())
            .field("markers", &self.markers)
            .finish_non_exhaustive()
    }
}

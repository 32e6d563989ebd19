//! Idempotent step-up completion.
//!
//! [`ReplayGuard`] wraps any [`IdentityProvider`] and serialises
//! `complete_step_up` per challenge id. The first terminal outcome is kept
//! together with a SHA-256 fingerprint of the response:
//!
//! - the same challenge and response get the stored outcome back without
//!   reaching the provider again;
//! - a different response for a completed challenge is rejected;
//! - retryable failures are not stored, so the next attempt goes through.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{
    Challenge, IdentityProvider, PrimaryCredential, ProviderError, StepUpResponse, StepUpResult,
    VerifiedPrincipal,
};
use crate::types::StepUpMethod;

type Slot = Arc<Mutex<Option<Completed>>>;

#[derive(Debug, Clone)]
struct Completed {
    fingerprint: [u8; 32],
    outcome: Result<StepUpResult, ProviderError>,
    at: Instant,
}

/// Provider wrapper that makes step-up completion safe to retry.
pub struct ReplayGuard<P> {
    inner: P,
    retention: Duration,
    completions: DashMap<String, Slot>,
}

impl<P: IdentityProvider> ReplayGuard<P> {
    /// Wraps `inner`, remembering completed challenges for `retention`.
    pub fn new(inner: P, retention: Duration) -> Self {
        Self {
            inner,
            retention,
            completions: DashMap::new(),
        }
    }

    /// Returns the wrapped provider.
    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Number of challenges currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.completions.len()
    }

    /// Drops completed outcomes older than the retention period.
    ///
    /// Slots with a completion in flight are kept.
    pub fn prune(&self) {
        let retention = self.retention;
        self.completions.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(done) => done.at.elapsed() < retention,
                None => Arc::strong_count(slot) > 1,
            },
            Err(_) => true,
        });
    }

    fn slot(&self, challenge_id: &str) -> Slot {
        // Clone the Arc out so no map guard is held across an await.
        self.completions
            .entry(challenge_id.to_string())
            .or_default()
            .value()
            .clone()
    }
}

#[async_trait]
impl<P: IdentityProvider> IdentityProvider for ReplayGuard<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn verify_primary(
        &self,
        credential: &PrimaryCredential,
    ) -> Result<VerifiedPrincipal, ProviderError> {
        self.inner.verify_primary(credential).await
    }

    async fn enrolled_methods(
        &self,
        principal_id: &str,
    ) -> Result<BTreeSet<StepUpMethod>, ProviderError> {
        self.inner.enrolled_methods(principal_id).await
    }

    async fn begin_step_up(
        &self,
        principal_id: &str,
        method: StepUpMethod,
    ) -> Result<Challenge, ProviderError> {
        self.inner.begin_step_up(principal_id, method).await
    }

    async fn complete_step_up(
        &self,
        challenge_id: &str,
        response: &StepUpResponse,
    ) -> Result<StepUpResult, ProviderError> {
        self.prune();

        let slot = self.slot(challenge_id);
        let mut guard = slot.lock().await;
        let fingerprint = response.fingerprint();

        if let Some(done) = guard.as_ref() {
            if done.fingerprint == fingerprint {
                tracing::debug!(challenge_id, "Replaying stored step-up outcome");
                return done.outcome.clone();
            }
            tracing::warn!(challenge_id, "Different response for a completed challenge");
            return Err(ProviderError::rejected("challenge already completed"));
        }

        let outcome = self.inner.complete_step_up(challenge_id, response).await;
        if let Err(e) = &outcome
            && e.is_retryable()
        {
            return outcome;
        }

        *guard = Some(Completed {
            fingerprint,
            outcome: outcome.clone(),
            at: Instant::now(),
        });
        outcome
    }
}

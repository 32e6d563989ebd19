//! Transition marker service.
//!
//! Issues and consumes the short-lived markers that bridge the gap between a
//! completed authentication event and its durable write becoming visible.
//! TTL is checked when a marker is read; nothing sweeps markers in the
//! background, [`TransitionMarkers::cleanup_expired`] is housekeeping only.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::storage::{MarkerClaim, MarkerStorage, StoreError};
use crate::types::{AssuranceLevel, MarkerConsumption, MarkerToken, TransitionMarker};
use crate::{AuthError, AuthResult};

/// Token collisions are retried this many times before giving up.
const MAX_ISSUE_ATTEMPTS: usize = 3;

/// Issues and consumes transition markers.
#[derive(Clone)]
pub struct TransitionMarkers {
    storage: Arc<dyn MarkerStorage>,
    ttl: Duration,
    store_timeout: Duration,
}

impl TransitionMarkers {
    /// Creates the service.
    #[must_use]
    pub fn new(storage: Arc<dyn MarkerStorage>, ttl: Duration, store_timeout: Duration) -> Self {
        Self {
            storage,
            ttl,
            store_timeout,
        }
    }

    /// TTL given to newly issued markers.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a marker for `principal_hint` attesting `level`.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the marker could not be stored in time.
    pub async fn issue(
        &self,
        principal_hint: &str,
        level: AssuranceLevel,
    ) -> AuthResult<MarkerToken> {
        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let now = OffsetDateTime::now_utc();
            let marker = TransitionMarker::new(principal_hint, level, now, self.ttl);
            match self.with_timeout(self.storage.insert(&marker)).await {
                Ok(()) => {
                    tracing::debug!(
                        marker = marker.token.short(),
                        %level,
                        ttl = ?self.ttl,
                        "Transition marker issued"
                    );
                    return Ok(marker.token);
                }
                Err(StoreError::AlreadyExists { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AuthError::internal("could not allocate a unique marker token"))
    }

    /// Consumes a marker.
    ///
    /// Repeated calls with the same token inside its TTL keep returning
    /// `valid = true`, with `already_consumed = true` after the first one.
    /// Unknown and expired tokens read as invalid.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store could not be reached in time.
    pub async fn consume(&self, token: &MarkerToken) -> AuthResult<MarkerConsumption> {
        let now = OffsetDateTime::now_utc();

        // Never consume an expired marker, only report it.
        let Some(existing) = self.with_timeout(self.storage.find(token)).await? else {
            return Ok(MarkerConsumption::invalid());
        };
        if existing.is_expired_at(now) {
            tracing::debug!(marker = token.short(), "Transition marker expired");
            return Ok(MarkerConsumption::invalid());
        }

        let claim = self.with_timeout(self.storage.claim(token, now)).await?;
        Ok(match claim {
            Some(MarkerClaim::First(marker)) => MarkerConsumption {
                valid: true,
                already_consumed: false,
                principal_hint: Some(marker.principal_hint),
                level: Some(marker.level),
            },
            Some(MarkerClaim::Repeat(marker)) => MarkerConsumption {
                valid: true,
                already_consumed: true,
                principal_hint: Some(marker.principal_hint),
                level: Some(marker.level),
            },
            None => MarkerConsumption::invalid(),
        })
    }

    /// Removes markers past their TTL. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store could not be reached in time.
    pub async fn cleanup_expired(&self) -> AuthResult<u64> {
        Ok(self.with_timeout(self.storage.cleanup_expired()).await?)
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.store_timeout, fut)
            .await
            .unwrap_or_else(|_| Err(StoreError::unavailable("marker store timed out")))
    }
}

impl std::fmt::Debug for TransitionMarkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionMarkers")
            .field("ttl", &self.ttl)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

//! Transition markers.
//!
//! A marker is short-lived evidence that a principal has *just* completed an
//! authentication event whose durable write may not be visible yet. It only
//! changes how a missing or insufficient session is classified (pending
//! instead of denied); it never grants assurance on its own.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::assurance::AssuranceLevel;

/// Opaque marker token handed to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerToken(String);

impl MarkerToken {
    /// Wraps a token presented by a client.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Generates a new random token (256 bits, base64url).
    #[must_use]
    pub fn generate() -> Self {
        Self(super::generate_token())
    }

    /// Returns the token as a string slice.
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

impl fmt::Display for MarkerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored transition marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionMarker {
    /// Token presented by the client.
    pub token: MarkerToken,

    /// Best-effort principal identifier (e.g. email).
    pub principal_hint: String,

    /// Level the just-completed authentication event produced.
    pub level: AssuranceLevel,

    /// When the marker was issued.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    /// How long the marker stays valid after `created_at`.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// When the marker was first consumed. Set exactly once.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub consumed_at: Option<OffsetDateTime>,
}

impl TransitionMarker {
    /// Creates an unconsumed marker.
    #[must_use]
    pub fn new(
        principal_hint: impl Into<String>,
        level: AssuranceLevel,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Self {
        Self {
            token: MarkerToken::generate(),
            principal_hint: principal_hint.into(),
            level,
            created_at: now,
            ttl,
            consumed_at: None,
        }
    }

    /// Returns the instant after which the marker reads as invalid.
    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        self.created_at + self.ttl
    }

    /// Returns `true` if the marker is past its TTL at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at()
    }

    /// Returns `true` once the marker has been consumed.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }
}

/// Result of consuming a marker.
///
/// Consuming the same token repeatedly within its TTL keeps returning
/// `valid = true`; only `already_consumed` changes after the first call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerConsumption {
    /// The marker exists and is within its TTL.
    pub valid: bool,
    /// A previous call already consumed the marker.
    pub already_consumed: bool,
    /// Principal hint carried by a valid marker.
    pub principal_hint: Option<String>,
    /// Level attested by a valid marker.
    pub level: Option<AssuranceLevel>,
}

impl MarkerConsumption {
    /// Consumption result for an unknown or expired token.
    #[must_use]
    pub fn invalid() -> Self {
        Self {
            valid: false,
            already_consumed: false,
            principal_hint: None,
            level: None,
        }
    }
}

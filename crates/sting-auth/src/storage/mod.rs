//! Storage traits for assurance state.
//!
//! This module defines storage interfaces for:
//!
//! - Session assurance records ([`AssuranceStore`])
//! - Transition markers ([`MarkerStorage`])
//!
//! # Implementations
//!
//! - [`memory`] - in-process stores (tests, single-node deployments)
//! - `sting-auth-postgres` - PostgreSQL storage backend
//!
//! # Atomicity
//!
//! The assurance store is the only shared mutable resource of the system.
//! Every write is one compare-and-swap on the record version; there are no
//! multi-step writes, so a cancelled caller can never leave a record
//! half-written.

pub mod memory;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::types::{MarkerToken, Session, SessionId, SessionState, TransitionMarker};

pub use memory::{InMemoryAssuranceStore, InMemoryMarkerStorage};

/// Storage trait for session assurance records.
#[async_trait]
pub trait AssuranceStore: Send + Sync {
    /// Reads a session by id.
    ///
    /// Returns `None` if the session does not exist **or has expired**: an
    /// expired record must never be returned (lazy expiry).
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Writes a session if the stored version still equals `expected_version`.
    ///
    /// `expected_version = None` creates the record and fails with
    /// [`StoreError::AlreadyExists`] if a live record exists. On success
    /// returns the new version, which is strictly greater than the old one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if another writer got there first.
    ///
    /// # Atomicity
    ///
    /// Implementations must perform the version check and the write as one
    /// atomic step, e.g.:
    ///
    /// ```sql
    /// UPDATE assurance_session
    /// SET resource = $2, txid = txid + 1
    /// WHERE id = $1 AND txid = $3
    /// RETURNING txid
    /// ```
    async fn put(&self, session: &Session, expected_version: Option<u64>)
    -> Result<u64, StoreError>;

    /// Deletes a session. Deleting a missing session succeeds.
    ///
    /// Unlike [`revoke`](Self::revoke) nothing is remembered afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn delete(&self, id: &SessionId) -> Result<(), StoreError>;

    /// Ends a live session.
    ///
    /// The record stops being returned by [`get`](Self::get) and cannot be
    /// written any more; [`lapsed`](Self::lapsed) reports it as revoked
    /// until [`cleanup_expired`](Self::cleanup_expired) runs after its
    /// original expiry. Revoking a missing or expired session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn revoke(&self, id: &SessionId) -> Result<(), StoreError>;

    /// Reports why a session is no longer live.
    ///
    /// Returns [`SessionState::Revoked`] or [`SessionState::Expired`] while
    /// the store still holds the ended record, and `None` for a live or
    /// unknown session.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn lapsed(&self, id: &SessionId) -> Result<Option<SessionState>, StoreError>;

    /// Physically removes expired records. Returns how many were removed.
    ///
    /// Correctness never depends on this being called.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn cleanup_expired(&self) -> Result<u64, StoreError>;
}

/// Outcome of atomically claiming a marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerClaim {
    /// This call consumed the marker.
    First(TransitionMarker),
    /// The marker had already been consumed by an earlier call.
    Repeat(TransitionMarker),
}

impl MarkerClaim {
    /// Returns the claimed marker.
    #[must_use]
    pub fn marker(&self) -> &TransitionMarker {
        match self {
            Self::First(m) | Self::Repeat(m) => m,
        }
    }
}

/// Storage trait for transition markers.
#[async_trait]
pub trait MarkerStorage: Send + Sync {
    /// Stores a freshly issued marker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] on a token collision.
    async fn insert(&self, marker: &TransitionMarker) -> Result<(), StoreError>;

    /// Looks up a marker without consuming it.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn find(&self, token: &MarkerToken) -> Result<Option<TransitionMarker>, StoreError>;

    /// Marks a marker consumed if it is not already, in one atomic step.
    ///
    /// Returns `None` for an unknown token. TTL is not checked here; callers
    /// check it on the returned marker.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn claim(
        &self,
        token: &MarkerToken,
        at: OffsetDateTime,
    ) -> Result<Option<MarkerClaim>, StoreError>;

    /// Removes markers past their TTL. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn cleanup_expired(&self) -> Result<u64, StoreError>;
}

/// Error type for storage operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The stored version differs from the expected one.
    #[error("Version conflict: expected {expected:?}, found {actual:?}")]
    Conflict {
        /// Version the writer read.
        expected: Option<u64>,
        /// Version currently stored (`None` if the record is gone).
        actual: Option<u64>,
    },

    /// A create found a live record with the same key.
    #[error("Record already exists: {key}")]
    AlreadyExists {
        /// Shortened key of the existing record.
        key: String,
    },

    /// The backend could not be reached or failed.
    #[error("Store unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// A stored record could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },
}

impl StoreError {
    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict(expected: Option<u64>, actual: Option<u64>) -> Self {
        Self::Conflict { expected, actual }
    }

    /// Creates a new `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a version conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

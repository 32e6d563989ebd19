//! Arc-owning storage adapters for the coordinator.
//!
//! These adapters wrap the lifetime-based storage types and own an
//! `Arc<PgPool>`, allowing them to be used as `Arc<dyn AssuranceStore>` and
//! `Arc<dyn MarkerStorage>`.

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use sting_auth::storage::{
    AssuranceStore, MarkerClaim, MarkerStorage as MarkerStorageTrait, StoreError,
};
use sting_auth::types::{MarkerToken, Session, SessionId, SessionState, TransitionMarker};

use crate::marker::{MarkerRow, MarkerStorage};
use crate::session::{SessionRow, SessionStorage};
use crate::{PgPool, StorageError};

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::unavailable(err.to_string())
    }
}

fn to_version(txid: i64) -> Result<u64, StoreError> {
    u64::try_from(txid).map_err(|_| StoreError::serialization(format!("negative txid {txid}")))
}

fn to_txid(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version)
        .map_err(|_| StoreError::serialization(format!("version {version} out of range")))
}

fn session_from_row(row: SessionRow) -> Result<Session, StoreError> {
    let mut session: Session = serde_json::from_value(row.resource).map_err(|e| {
        StoreError::serialization(format!("Failed to deserialize session {}: {e}", row.id))
    })?;
    session.version = to_version(row.txid)?;
    Ok(session)
}

fn marker_from_row(row: MarkerRow) -> Result<TransitionMarker, StoreError> {
    let mut marker: TransitionMarker = serde_json::from_value(row.resource)
        .map_err(|e| StoreError::serialization(format!("Failed to deserialize marker: {e}")))?;
    marker.consumed_at = row.consumed_at;
    Ok(marker)
}

fn lapsed_state(revoked: bool, expired: bool) -> Option<SessionState> {
    if revoked {
        Some(SessionState::Revoked)
    } else if expired {
        Some(SessionState::Expired)
    } else {
        None
    }
}

fn to_resource<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::serialization(e.to_string()))
}

// =============================================================================
// Arc-Owning Assurance Store
// =============================================================================

/// Arc-owning PostgreSQL assurance store.
#[derive(Clone)]
pub struct ArcAssuranceStore {
    pool: Arc<PgPool>,
}

impl ArcAssuranceStore {
    /// Create a new Arc-owning assurance store.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssuranceStore for ArcAssuranceStore {
    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let storage = SessionStorage::new(&self.pool);
        match storage.find_live(id.as_str()).await? {
            Some(row) => Ok(Some(session_from_row(row)?)),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        session: &Session,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let storage = SessionStorage::new(&self.pool);
        let resource = to_resource(session)?;
        let id = session.id.as_str();

        match expected_version {
            None => {
                let txid = storage
                    .create(id, &session.principal_id, session.expires_at, &resource)
                    .await?;
                match txid {
                    Some(txid) => to_version(txid),
                    None => Err(StoreError::already_exists(session.id.short())),
                }
            }
            Some(expected) => {
                let swapped = storage
                    .compare_and_swap(id, to_txid(expected)?, session.expires_at, &resource)
                    .await?;
                if let Some(txid) = swapped {
                    return to_version(txid);
                }
                let actual = storage
                    .current_txid(id)
                    .await?
                    .map(to_version)
                    .transpose()?;
                Err(StoreError::conflict(Some(expected), actual))
            }
        }
    }

    async fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        let storage = SessionStorage::new(&self.pool);
        storage.delete(id.as_str()).await?;
        Ok(())
    }

    async fn revoke(&self, id: &SessionId) -> Result<(), StoreError> {
        let storage = SessionStorage::new(&self.pool);
        if !storage.revoke(id.as_str()).await? {
            tracing::debug!(session = id.short(), "No live session to revoke");
        }
        Ok(())
    }

    async fn lapsed(&self, id: &SessionId) -> Result<Option<SessionState>, StoreError> {
        let storage = SessionStorage::new(&self.pool);
        Ok(storage
            .end_status(id.as_str())
            .await?
            .and_then(|(revoked, expired)| lapsed_state(revoked, expired)))
    }

    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        let storage = SessionStorage::new(&self.pool);
        Ok(storage.delete_expired().await?)
    }
}

// =============================================================================
// Arc-Owning Marker Storage
// =============================================================================

/// Arc-owning PostgreSQL transition marker storage.
#[derive(Clone)]
pub struct ArcMarkerStorage {
    pool: Arc<PgPool>,
}

impl ArcMarkerStorage {
    /// Create a new Arc-owning marker storage.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MarkerStorageTrait for ArcMarkerStorage {
    async fn insert(&self, marker: &TransitionMarker) -> Result<(), StoreError> {
        let storage = MarkerStorage::new(&self.pool);
        let resource = to_resource(marker)?;
        let inserted = storage
            .insert(marker.token.as_str(), marker.expires_at(), &resource)
            .await?;
        if !inserted {
            return Err(StoreError::already_exists(marker.token.short()));
        }
        Ok(())
    }

    async fn find(&self, token: &MarkerToken) -> Result<Option<TransitionMarker>, StoreError> {
        let storage = MarkerStorage::new(&self.pool);
        match storage.find(token.as_str()).await? {
            Some(row) => Ok(Some(marker_from_row(row)?)),
            None => Ok(None),
        }
    }

    async fn claim(
        &self,
        token: &MarkerToken,
        at: OffsetDateTime,
    ) -> Result<Option<MarkerClaim>, StoreError> {
        let storage = MarkerStorage::new(&self.pool);
        let Some((row, first)) = storage.claim(token.as_str(), at).await? else {
            return Ok(None);
        };
        let marker = marker_from_row(row)?;
        Ok(Some(if first {
            MarkerClaim::First(marker)
        } else {
            MarkerClaim::Repeat(marker)
        }))
    }

    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        let storage = MarkerStorage::new(&self.pool);
        Ok(storage.delete_expired().await?)
    }
}

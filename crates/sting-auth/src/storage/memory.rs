//! In-memory stores backed by `DashMap`.
//!
//! `DashMap`'s entry API holds the shard lock for the duration of the
//! version check and the write, which gives per-session compare-and-swap
//! without a global lock.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;

use super::{AssuranceStore, MarkerClaim, MarkerStorage, StoreError};
use crate::types::{MarkerToken, Session, SessionId, SessionState, TransitionMarker};

/// In-memory [`AssuranceStore`].
#[derive(Debug, Default)]
pub struct InMemoryAssuranceStore {
    sessions: DashMap<SessionId, Session>,
    /// Revoked sessions and the expiry they had.
    revoked: DashMap<SessionId, OffsetDateTime>,
}

impl InMemoryAssuranceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held, including expired ones not yet cleaned up.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl AssuranceStore for InMemoryAssuranceStore {
    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let now = OffsetDateTime::now_utc();
        let found = self.sessions.get(id).map(|entry| entry.value().clone());
        Ok(found.filter(|session| !session.is_expired_at(now)))
    }

    async fn put(
        &self,
        session: &Session,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let now = OffsetDateTime::now_utc();
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let live = !current.is_expired_at(now);
                let current_version = current.version;
                match expected_version {
                    None if live => Err(StoreError::already_exists(session.id.short())),
                    Some(expected) if !live => Err(StoreError::conflict(Some(expected), None)),
                    Some(expected) if expected != current_version => Err(StoreError::conflict(
                        Some(expected),
                        Some(current_version),
                    )),
                    _ => {
                        let next = current_version + 1;
                        let mut stored = session.clone();
                        stored.version = next;
                        occupied.insert(stored);
                        Ok(next)
                    }
                }
            }
            Entry::Vacant(vacant) => match expected_version {
                None => {
                    let mut stored = session.clone();
                    stored.version = 1;
                    vacant.insert(stored);
                    self.revoked.remove(&session.id);
                    Ok(1)
                }
                Some(expected) => Err(StoreError::conflict(Some(expected), None)),
            },
        }
    }

    async fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.sessions.remove(id);
        self.revoked.remove(id);
        Ok(())
    }

    async fn revoke(&self, id: &SessionId) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        if let Some((id, session)) = self.sessions.remove_if(id, |_, s| !s.is_expired_at(now)) {
            self.revoked.insert(id, session.expires_at);
        }
        Ok(())
    }

    async fn lapsed(&self, id: &SessionId) -> Result<Option<SessionState>, StoreError> {
        if self.revoked.contains_key(id) {
            return Ok(Some(SessionState::Revoked));
        }
        let now = OffsetDateTime::now_utc();
        let expired = self
            .sessions
            .get(id)
            .is_some_and(|entry| entry.value().is_expired_at(now));
        Ok(expired.then_some(SessionState::Expired))
    }

    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        let now = OffsetDateTime::now_utc();
        let before = self.sessions.len() + self.revoked.len();
        self.sessions.retain(|_, s| !s.is_expired_at(now));
        self.revoked.retain(|_, expires_at| *expires_at > now);
        let after = self.sessions.len() + self.revoked.len();
        Ok(before.saturating_sub(after) as u64)
    }
}

/// In-memory [`MarkerStorage`].
#[derive(Debug, Default)]
pub struct InMemoryMarkerStorage {
    markers: DashMap<MarkerToken, TransitionMarker>,
}

impl InMemoryMarkerStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of markers held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    /// Returns `true` if no markers are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

#[async_trait]
impl MarkerStorage for InMemoryMarkerStorage {
    async fn insert(&self, marker: &TransitionMarker) -> Result<(), StoreError> {
        match self.markers.entry(marker.token.clone()) {
            Entry::Occupied(_) => Err(StoreError::already_exists(marker.token.short())),
            Entry::Vacant(vacant) => {
                vacant.insert(marker.clone());
                Ok(())
            }
        }
    }

    async fn find(&self, token: &MarkerToken) -> Result<Option<TransitionMarker>, StoreError> {
        Ok(self.markers.get(token).map(|m| m.value().clone()))
    }

    async fn claim(
        &self,
        token: &MarkerToken,
        at: OffsetDateTime,
    ) -> Result<Option<MarkerClaim>, StoreError> {
        let Some(mut entry) = self.markers.get_mut(token) else {
            return Ok(None);
        };
        let marker = entry.value_mut();
        if marker.consumed_at.is_some() {
            return Ok(Some(MarkerClaim::Repeat(marker.clone())));
        }
        marker.consumed_at = Some(at);
        Ok(Some(MarkerClaim::First(marker.clone())))
    }

    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        let now = OffsetDateTime::now_utc();
        let before = self.markers.len();
        self.markers.retain(|_, m| !m.is_expired_at(now));
        Ok(before.saturating_sub(self.markers.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;
    use crate::types::{AssuranceLevel, StepUpMethod};

    fn session(lifetime: time::Duration) -> Session {
        Session::established(
            "user-1",
            None,
            BTreeSet::from([StepUpMethod::Totp]),
            OffsetDateTime::now_utc(),
            lifetime,
        )
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let store = InMemoryAssuranceStore::new();
        let s = session(time::Duration::hours(1));

        let version = store.put(&s, None).await.unwrap();
        assert_eq!(version, 1);

        let loaded = store.get(&s.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.principal_id, "user-1");
    }

    #[tokio::test]
    async fn test_create_twice_is_rejected() {
        let store = InMemoryAssuranceStore::new();
        let s = session(time::Duration::hours(1));
        store.put(&s, None).await.unwrap();

        let err = store.put(&s, None).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = InMemoryAssuranceStore::new();
        let s = session(time::Duration::hours(1));
        store.put(&s, None).await.unwrap();

        let mut first = store.get(&s.id).await.unwrap().unwrap();
        let mut second = first.clone();

        first.assurance_level = AssuranceLevel::Aal2;
        assert_eq!(store.put(&first, Some(1)).await.unwrap(), 2);

        second.step_up_methods_enrolled.insert(StepUpMethod::Passkey);
        let err = store.put(&second, Some(1)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: Some(1),
                actual: Some(2)
            }
        ));

        let stored = store.get(&s.id).await.unwrap().unwrap();
        assert_eq!(stored.assurance_level, AssuranceLevel::Aal2);
        assert!(!stored.has_enrolled(StepUpMethod::Passkey));
    }

    #[tokio::test]
    async fn test_update_of_missing_record_conflicts() {
        let store = InMemoryAssuranceStore::new();
        let s = session(time::Duration::hours(1));
        let err = store.put(&s, Some(3)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: Some(3),
                actual: None
            }
        ));
    }

    #[tokio::test]
    async fn test_expired_record_reads_as_missing() {
        let store = InMemoryAssuranceStore::new();
        let mut s = session(time::Duration::hours(1));
        s.expires_at = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        store.put(&s, None).await.unwrap();

        assert!(store.get(&s.id).await.unwrap().is_none());
        assert_eq!(store.lapsed(&s.id).await.unwrap(), Some(SessionState::Expired));

        // An expired record may be replaced by a fresh create.
        s.expires_at = OffsetDateTime::now_utc() + time::Duration::hours(1);
        store.put(&s, None).await.unwrap();
        assert!(store.get(&s.id).await.unwrap().is_some());
        assert_eq!(store.lapsed(&s.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_revoked_record_is_remembered_until_cleanup() {
        let store = InMemoryAssuranceStore::new();
        let mut s = session(time::Duration::hours(1));
        let version = store.put(&s, None).await.unwrap();

        store.revoke(&s.id).await.unwrap();
        store.revoke(&s.id).await.unwrap();
        assert!(store.get(&s.id).await.unwrap().is_none());
        assert_eq!(store.lapsed(&s.id).await.unwrap(), Some(SessionState::Revoked));

        let err = store.put(&s, Some(version)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { actual: None, .. }));

        // Kept while the session would still have been live.
        assert_eq!(store.cleanup_expired().await.unwrap(), 0);
        assert_eq!(store.lapsed(&s.id).await.unwrap(), Some(SessionState::Revoked));

        let unknown = SessionId::new("never-issued");
        store.revoke(&unknown).await.unwrap();
        assert_eq!(store.lapsed(&unknown).await.unwrap(), None);

        s.id = SessionId::generate();
        s.expires_at = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        store.put(&s, None).await.unwrap();
        store.revoke(&s.id).await.unwrap();
        assert_eq!(store.lapsed(&s.id).await.unwrap(), Some(SessionState::Expired));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryAssuranceStore::new();
        let s = session(time::Duration::hours(1));
        store.put(&s, None).await.unwrap();

        store.delete(&s.id).await.unwrap();
        store.delete(&s.id).await.unwrap();
        assert!(store.get(&s.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let store = InMemoryAssuranceStore::new();
        let live = session(time::Duration::hours(1));
        let mut dead = session(time::Duration::hours(1));
        dead.expires_at = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        store.put(&live, None).await.unwrap();
        store.put(&dead, None).await.unwrap();

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_marker_claim_sets_consumed_once() {
        let storage = InMemoryMarkerStorage::new();
        let marker = TransitionMarker::new(
            "ada@example.com",
            AssuranceLevel::Aal2,
            OffsetDateTime::now_utc(),
            Duration::from_secs(15),
        );
        storage.insert(&marker).await.unwrap();
        let found = storage.find(&marker.token).await.unwrap().unwrap();
        assert!(!found.is_consumed());

        let first_at = OffsetDateTime::now_utc();
        let first = storage.claim(&marker.token, first_at).await.unwrap();
        assert!(matches!(first, Some(MarkerClaim::First(_))));

        let later = first_at + time::Duration::seconds(1);
        let second = storage.claim(&marker.token, later).await.unwrap().unwrap();
        assert!(matches!(second, MarkerClaim::Repeat(_)));
        assert_eq!(second.marker().consumed_at, Some(first_at));

        let unknown = storage
            .claim(&MarkerToken::new("nope"), later)
            .await
            .unwrap();
        assert!(unknown.is_none());
    }
}

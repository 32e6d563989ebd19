//! Session assurance record storage.
//!
//! Each row holds the full session document as JSONB plus the columns the
//! queries filter on. Reads never return a row whose `expires_at` has
//! passed or whose `revoked_at` is set, and writes compare `txid` and bump
//! it in the same statement.

use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use time::OffsetDateTime;

use crate::{PgPool, StorageResult};

// =============================================================================
// Types
// =============================================================================

/// Session record from database.
#[derive(Debug, Clone)]
pub struct SessionRow {
    /// Session identifier
    pub id: String,
    /// Transaction ID (version)
    pub txid: i64,
    /// Expiry of the session
    pub expires_at: OffsetDateTime,
    /// Full session document as JSONB
    pub resource: serde_json::Value,
}

impl SessionRow {
    fn from_tuple(row: (String, i64, OffsetDateTime, serde_json::Value)) -> Self {
        Self {
            id: row.0,
            txid: row.1,
            expires_at: row.2,
            resource: row.3,
        }
    }
}

// =============================================================================
// Session Storage
// =============================================================================

/// Session record operations.
pub struct SessionStorage<'a> {
    pool: &'a PgPool,
}

impl<'a> SessionStorage<'a> {
    /// Create a new session storage with a connection pool reference.
    #[must_use]
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Find a live session by its ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_live(&self, id: &str) -> StorageResult<Option<SessionRow>> {
        let row: Option<(String, i64, OffsetDateTime, serde_json::Value)> = query_as(
            r#"
            SELECT id, txid, expires_at, resource
            FROM assurance_session
            WHERE id = $1
              AND expires_at > NOW()
              AND revoked_at IS NULL
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(SessionRow::from_tuple))
    }

    /// Current `txid` of a live session, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn current_txid(&self, id: &str) -> StorageResult<Option<i64>> {
        let row: Option<(i64,)> = query_as(
            r#"
            SELECT txid
            FROM assurance_session
            WHERE id = $1
              AND expires_at > NOW()
              AND revoked_at IS NULL
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(|(txid,)| txid))
    }

    /// Create a session.
    ///
    /// An expired or revoked row with the same id is overwritten. Returns
    /// `None` if a live row already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database insert fails.
    pub async fn create(
        &self,
        id: &str,
        principal_id: &str,
        expires_at: OffsetDateTime,
        resource: &serde_json::Value,
    ) -> StorageResult<Option<i64>> {
        let row: Option<(i64,)> = query_as(
            r#"
            INSERT INTO assurance_session (id, txid, ts, expires_at, principal_id, resource)
            VALUES ($1, 1, NOW(), $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
               SET txid = assurance_session.txid + 1,
                   ts = NOW(),
                   expires_at = EXCLUDED.expires_at,
                   revoked_at = NULL,
                   principal_id = EXCLUDED.principal_id,
                   resource = EXCLUDED.resource
             WHERE assurance_session.expires_at <= NOW()
                OR assurance_session.revoked_at IS NOT NULL
            RETURNING txid
            "#,
        )
        .bind(id)
        .bind(expires_at)
        .bind(principal_id)
        .bind(resource)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(|(txid,)| txid))
    }

    /// Replace a live session if its `txid` still equals `expected_txid`.
    ///
    /// Returns the new `txid`, or `None` if the row moved on, expired, was
    /// revoked or disappeared.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub async fn compare_and_swap(
        &self,
        id: &str,
        expected_txid: i64,
        expires_at: OffsetDateTime,
        resource: &serde_json::Value,
    ) -> StorageResult<Option<i64>> {
        let row: Option<(i64,)> = query_as(
            r#"
            UPDATE assurance_session
            SET txid = txid + 1,
                ts = NOW(),
                expires_at = $3,
                resource = $4
            WHERE id = $1
              AND txid = $2
              AND expires_at > NOW()
              AND revoked_at IS NULL
            RETURNING txid
            "#,
        )
        .bind(id)
        .bind(expected_txid)
        .bind(expires_at)
        .bind(resource)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(|(txid,)| txid))
    }

    /// Delete a session. Deleting a missing session is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the database delete fails.
    pub async fn delete(&self, id: &str) -> StorageResult<u64> {
        let result = query("DELETE FROM assurance_session WHERE id = $1")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Mark a live session revoked. Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub async fn revoke(&self, id: &str) -> StorageResult<bool> {
        let result = query(
            r#"
            UPDATE assurance_session
            SET txid = txid + 1,
                ts = NOW(),
                revoked_at = NOW()
            WHERE id = $1
              AND expires_at > NOW()
              AND revoked_at IS NULL
            "#,
        )
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Whether a stored session is revoked and whether it is expired.
    ///
    /// Returns `None` if no row exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn end_status(&self, id: &str) -> StorageResult<Option<(bool, bool)>> {
        let row: Option<(bool, bool)> = query_as(
            r#"
            SELECT revoked_at IS NOT NULL, expires_at <= NOW()
            FROM assurance_session
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row)
    }

    /// Delete expired sessions, revoked ones included.
    ///
    /// # Errors
    ///
    /// Returns an error if the database delete fails.
    pub async fn delete_expired(&self) -> StorageResult<u64> {
        let result = query("DELETE FROM assurance_session WHERE expires_at <= NOW()")
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

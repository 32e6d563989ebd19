//! Transition marker storage.
//!
//! `consumed_at` lives in its own column so claiming a marker is a single
//! conditional update; the copy inside `resource` is never updated.

use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use time::OffsetDateTime;

use crate::{PgPool, StorageResult};

/// Marker record from database.
#[derive(Debug, Clone)]
pub struct MarkerRow {
    /// Marker token
    pub token: String,
    /// Expiry of the marker
    pub expires_at: OffsetDateTime,
    /// First consumption, if any
    pub consumed_at: Option<OffsetDateTime>,
    /// Marker document as JSONB
    pub resource: serde_json::Value,
}

type MarkerTuple = (
    String,
    OffsetDateTime,
    Option<OffsetDateTime>,
    serde_json::Value,
);

impl MarkerRow {
    fn from_tuple(row: MarkerTuple) -> Self {
        Self {
            token: row.0,
            expires_at: row.1,
            consumed_at: row.2,
            resource: row.3,
        }
    }
}

/// Marker record operations.
pub struct MarkerStorage<'a> {
    pool: &'a PgPool,
}

impl<'a> MarkerStorage<'a> {
    /// Create a new marker storage with a connection pool reference.
    #[must_use]
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert a marker. Returns `false` if the token is already taken.
    ///
    /// # Errors
    ///
    /// Returns an error if the database insert fails.
    pub async fn insert(
        &self,
        token: &str,
        expires_at: OffsetDateTime,
        resource: &serde_json::Value,
    ) -> StorageResult<bool> {
        let result = query(
            r#"
            INSERT INTO transition_marker (token, expires_at, consumed_at, resource)
            VALUES ($1, $2, NULL, $3)
            ON CONFLICT (token) DO NOTHING
            "#,
        )
        .bind(token)
        .bind(expires_at)
        .bind(resource)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Find a marker by token, expired or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find(&self, token: &str) -> StorageResult<Option<MarkerRow>> {
        let row: Option<MarkerTuple> = query_as(
            r#"
            SELECT token, expires_at, consumed_at, resource
            FROM transition_marker
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(MarkerRow::from_tuple))
    }

    /// Set `consumed_at` unless it is already set.
    ///
    /// Returns the row and whether this call was the first to consume it,
    /// or `None` for an unknown token. Concurrent claims serialise on the
    /// row lock, so exactly one of them sees `true`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub async fn claim(
        &self,
        token: &str,
        at: OffsetDateTime,
    ) -> StorageResult<Option<(MarkerRow, bool)>> {
        let row: Option<(
            String,
            OffsetDateTime,
            Option<OffsetDateTime>,
            serde_json::Value,
            bool,
        )> = query_as(
            r#"
            WITH prior AS (
                SELECT token, consumed_at
                FROM transition_marker
                WHERE token = $1
                FOR UPDATE
            )
            UPDATE transition_marker m
            SET consumed_at = COALESCE(m.consumed_at, $2)
            FROM prior
            WHERE m.token = prior.token
            RETURNING m.token, m.expires_at, m.consumed_at, m.resource,
                      prior.consumed_at IS NULL AS first_claim
            "#,
        )
        .bind(token)
        .bind(at)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(|(token, expires_at, consumed_at, resource, first)| {
            (
                MarkerRow::from_tuple((token, expires_at, consumed_at, resource)),
                first,
            )
        }))
    }

    /// Delete expired markers.
    ///
    /// # Errors
    ///
    /// Returns an error if the database delete fails.
    pub async fn delete_expired(&self) -> StorageResult<u64> {
        let result = query("DELETE FROM transition_marker WHERE expires_at <= NOW()")
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

//! PostgreSQL storage backend for sting-auth
//!
//! Provides persistent storage for:
//!
//! - Session assurance records (`assurance_session` table)
//! - Transition markers (`transition_marker` table)
//!
//! Records are stored as JSONB documents next to the columns the queries
//! filter on. The `txid` column of `assurance_session` is the
//! compare-and-swap version; every write checks and bumps it in a single
//! statement.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sting_auth_postgres::{ArcAssuranceStore, ArcMarkerStorage, PostgresAssuranceStorage};
//!
//! let storage = PostgresAssuranceStorage::connect("postgres://localhost/sting").await?;
//! storage.run_migrations().await?;
//!
//! let store = Arc::new(ArcAssuranceStore::new(storage.pool_arc()));
//! let markers = Arc::new(ArcMarkerStorage::new(storage.pool_arc()));
//! let coordinator = SessionCoordinator::new(config, store, provider, markers)?;
//! ```

pub mod marker;
pub mod migrations;
pub mod session;
pub mod storage_adapters;

use std::sync::Arc;

use sqlx_core::pool::Pool;
use sqlx_postgres::Postgres;

/// PostgreSQL connection pool type alias.
pub type PgPool = Pool<Postgres>;

pub use marker::MarkerStorage;
pub use session::SessionStorage;
pub use storage_adapters::{ArcAssuranceStore, ArcMarkerStorage};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during assurance storage operations.
///
/// Decoding stored documents is the adapters' concern and surfaces as
/// `StoreError::Serialization` there.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx_core::Error),

    /// Migration failed.
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// PostgreSQL Assurance Storage
// =============================================================================

/// PostgreSQL storage backend for assurance state.
///
/// Holds the connection pool and hands out the table-specific storage types.
#[derive(Debug, Clone)]
pub struct PostgresAssuranceStorage {
    pool: Arc<PgPool>,
}

impl PostgresAssuranceStorage {
    /// Create new storage with an existing connection pool.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create new storage by connecting to the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        use sqlx_core::pool::PoolOptions;
        let pool = PoolOptions::<Postgres>::new().connect(database_url).await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Applies the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn run_migrations(&self) -> StorageResult<()> {
        migrations::run(&self.pool).await
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get a reference to the Arc-wrapped pool.
    #[must_use]
    pub fn pool_arc(&self) -> Arc<PgPool> {
        Arc::clone(&self.pool)
    }

    /// Get session record operations.
    #[must_use]
    pub fn sessions(&self) -> SessionStorage<'_> {
        SessionStorage::new(&self.pool)
    }

    /// Get transition marker operations.
    #[must_use]
    pub fn markers(&self) -> MarkerStorage<'_> {
        MarkerStorage::new(&self.pool)
    }
}

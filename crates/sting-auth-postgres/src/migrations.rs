//! Embedded schema migrations.
//!
//! Migrations are compiled into the binary with `include_str!` and tracked
//! in the `_sqlx_migrations` table.

use std::borrow::Cow;

use sqlx_core::migrate::{Migration, MigrationType, Migrator};
use tracing::{info, instrument};

use crate::{PgPool, StorageError, StorageResult};

/// Add new migrations here in chronological order:
/// `(version, description, sql)`.
macro_rules! embedded_migrations {
    () => {
        &[(
            20261018000001i64,
            "assurance_schema",
            include_str!("../migrations/20261018000001_assurance_schema.sql"),
        )]
    };
}

fn build_migrations() -> Vec<Migration> {
    embedded_migrations!()
        .iter()
        .map(|(version, description, sql)| Migration {
            version: *version,
            description: Cow::Borrowed(description),
            migration_type: MigrationType::Simple,
            sql: Cow::Borrowed(sql),
            checksum: Cow::Borrowed(&[]),
            no_tx: false,
        })
        .collect()
}

/// Runs all pending migrations.
///
/// # Errors
///
/// Returns [`StorageError::Migration`] if a migration fails to apply.
#[instrument(skip(pool))]
pub async fn run(pool: &PgPool) -> StorageResult<()> {
    let migrations = build_migrations();
    info!("Applying {} assurance schema migration(s)", migrations.len());

    let migrator = Migrator {
        migrations: Cow::Owned(migrations),
        ignore_missing: false,
        locking: true,
        no_tx: false,
    };

    migrator
        .run(pool)
        .await
        .map_err(|e| StorageError::Migration(format!("Migration failed: {e}")))?;

    info!("Assurance schema is up to date");
    Ok(())
}

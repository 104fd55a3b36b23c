//! Versioned schema migrations for the job store.
//!
//! Applied versions are recorded in `ingestion_schema_versions`; a version
//! is applied at most once and never partially.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use super::schema::{Migration, MIGRATIONS};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        version: i32,
        name: String,
        reason: String,
    },

    /// The database was migrated by a newer build.
    #[error("Schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i32, supported: i32 },
}

/// Row of `ingestion_schema_versions`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub version: i32,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every migration above the current version.
    /// Returns the versions applied by this call.
    pub async fn run_migrations(&self) -> Result<Vec<i32>, MigrationError> {
        self.ensure_versions_table().await?;

        let current = self.current_version().await?;
        let supported = super::schema::latest_version();
        if current > supported {
            return Err(MigrationError::SchemaTooNew {
                found: current,
                supported,
            });
        }

        let mut applied = Vec::new();
        for migration in pending_after(current) {
            self.apply(migration).await?;
            info!(
                version = migration.version,
                name = migration.name,
                "Applied job store migration"
            );
            applied.push(migration.version);
        }
        Ok(applied)
    }

    /// Highest applied version, 0 for a fresh database.
    pub async fn current_version(&self) -> Result<i32, MigrationError> {
        let (version,): (Option<i32>,) =
            sqlx::query_as("SELECT MAX(version) FROM ingestion_schema_versions")
                .fetch_one(&self.pool)
                .await?;
        Ok(version.unwrap_or(0))
    }

    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_versions_table().await?;
        let rows = sqlx::query_as(
            "SELECT version, name, applied_at FROM ingestion_schema_versions ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn ensure_versions_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingestion_schema_versions (
                version INTEGER PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrationError> {
        let failed = |e: sqlx::Error| MigrationError::MigrationFailed {
            version: migration.version,
            name: migration.name.to_string(),
            reason: e.to_string(),
        };

        let mut tx = self.pool.begin().await?;
        for statement in migration.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(failed)?;
        }

        // A concurrent runner that got here first wins; this one rolls back.
        sqlx::query("INSERT INTO ingestion_schema_versions (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await
            .map_err(failed)?;

        tx.commit().await?;
        Ok(())
    }
}

fn pending_after(current: i32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > current)
}

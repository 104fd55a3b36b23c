//! Job store schema, as an ordered list of versioned migrations.

/// Table names in the schema.
pub mod tables {
    pub const INGESTION_JOBS: &str = "ingestion_jobs";
    pub const SCHEMA_VERSIONS: &str = "ingestion_schema_versions";
}

/// One schema version. All statements of a version apply in one transaction.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i32,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

const CREATE_INGESTION_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ingestion_jobs (
    job_id VARCHAR(255) PRIMARY KEY,
    job_type VARCHAR(100) NOT NULL,
    status VARCHAR(32) NOT NULL,
    tasks_total BIGINT NOT NULL DEFAULT 0,
    tasks_processed BIGINT NOT NULL DEFAULT 0,
    error_message TEXT,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CHECK (tasks_processed <= tasks_total OR tasks_total = 0)
)
"#;

const CREATE_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_ingestion_jobs_status ON ingestion_jobs(status, created_at DESC)";

const CREATE_CREATED_AT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_ingestion_jobs_created_at ON ingestion_jobs(created_at DESC)";

/// Migrations in ascending version order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_ingestion_jobs",
        statements: &[CREATE_INGESTION_JOBS_TABLE],
    },
    Migration {
        version: 2,
        name: "index_ingestion_jobs_listing",
        statements: &[CREATE_STATUS_INDEX, CREATE_CREATED_AT_INDEX],
    },
];

/// Highest version defined in [`MIGRATIONS`].
pub fn latest_version() -> i32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered() {
        assert!(MIGRATIONS.windows(2).all(|w| w[0].version < w[1].version));
        assert_eq!(latest_version(), 2);
        assert!(MIGRATIONS[0].statements[0].contains(tables::INGESTION_JOBS));
    }

    #[test]
    fn test_statements_are_single() {
        // sqlx runs each statement as one prepared query.
        for migration in MIGRATIONS {
            assert!(!migration.statements.is_empty());
            assert!(migration
                .statements
                .iter()
                .all(|s| !s.trim_end().ends_with(';')));
        }
    }
}

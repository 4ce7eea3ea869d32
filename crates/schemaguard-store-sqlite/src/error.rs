use schemaguard_core::{CoreError, PreflightCheck};

/// Fatal outcomes of a migration run. Backup failures and checksum drift are
/// logged instead and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("pre-flight validation failed: {}", .failures.join("; "))]
    PreflightFailed { failures: Vec<String>, checks: Vec<PreflightCheck> },

    #[error("migration lock is held by {holder} (acquired {age_secs}s ago)")]
    LockHeld { holder: String, age_secs: u64 },

    #[error("migration lock is already held by this instance")]
    LockReentry,

    #[error("migration {version} ({description}) failed")]
    MigrationFailed {
        version: i64,
        description: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("database schema version {current} is newer than the latest known migration {latest}")]
    DatabaseAhead { current: i64, latest: i64 },

    #[error("invalid migration registry: {0}")]
    InvalidRegistry(#[source] CoreError),

    #[error("invalid migrator configuration: {0}")]
    InvalidConfig(#[source] CoreError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl MigrationError {
    /// Stable machine-readable code for host output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PreflightFailed { .. } => "PRE_CHECK_FAILED",
            Self::LockHeld { .. } => "MIGRATION_LOCKED",
            Self::LockReentry => "LOCK_REENTRY",
            Self::MigrationFailed { .. } => "MIGRATION_FAILED",
            Self::DatabaseAhead { .. } => "DATABASE_AHEAD",
            Self::InvalidRegistry(_) => "INVALID_REGISTRY",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}

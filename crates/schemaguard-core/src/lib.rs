//! Storage-agnostic building blocks for the schemaguard migration engine.
//!
//! Everything in this crate is pure: registry ordering and validation,
//! configuration, version-store shapes and the legacy translation table,
//! lock staleness, pre-flight bookkeeping, backup naming and retention.
//! The `SQLite` implementation lives in `schemaguard-store-sqlite`.

mod backup;
mod config;
mod lock;
mod migration;
mod preflight;
mod report;
mod shape;

pub use backup::{backup_file_name, is_backup_file_name, select_for_pruning};
pub use config::{
    MigratorConfig, DEFAULT_BACKUP_DIR_NAME, DEFAULT_BACKUP_EXTENSION, DEFAULT_BACKUP_PREFIX,
    DEFAULT_BACKUP_RETENTION, DEFAULT_LOCK_STALE_AFTER_SECS, DEFAULT_MIN_FREE_SPACE_BYTES,
};
pub use lock::{is_stale, LockHolder, LockState};
pub use migration::{Migration, MigrationFn, Registry};
pub use preflight::{
    failure_messages, required_free_space, CheckStatus, PreflightCheck, CHECK_BACKUP_PRESENCE,
    CHECK_DISK_SPACE, CHECK_OPEN_TRANSACTIONS, CHECK_WRITE_ACCESS,
};
pub use report::{
    AppliedMigration, HistoryEntry, MigrationStatus, PendingMigration, RunMode, RunReport,
};
pub use shape::{
    ConversionOutcome, LegacyMapping, LegacyProfile, ProbeTarget, StructureProbe,
    VersionStoreShape,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("migration version must be positive, got {version} (`{description}`)")]
    InvalidVersion { version: i64, description: String },
    #[error("duplicate migration version {version}: `{first}` and `{second}`")]
    DuplicateVersion { version: i64, first: String, second: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
}

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ConversionOutcome, LockState, PreflightCheck, VersionStoreShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Apply,
    /// Execute every pending migration, then roll everything back.
    DryRun,
}

impl RunMode {
    #[must_use]
    pub fn is_dry_run(self) -> bool {
        matches!(self, Self::DryRun)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMigration {
    pub version: i64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub current_version: i64,
    pub latest_version: i64,
    pub pending_count: usize,
    pub pending: Vec<PendingMigration>,
    pub shape: Option<VersionStoreShape>,
    pub lock: LockState,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub version: i64,
    pub description: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub dry_run: bool,
    pub from_version: i64,
    pub to_version: i64,
    pub applied: Vec<AppliedMigration>,
    pub backup: Option<PathBuf>,
    pub checksum: Option<String>,
    pub preflight: Vec<PreflightCheck>,
    /// Set when this run converted legacy bookkeeping (inside the rollback for dry runs).
    pub conversion: Option<ConversionOutcome>,
}

impl RunReport {
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: i64,
    pub name: String,
    pub applied_at: String,
}

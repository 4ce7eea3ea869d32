use serde::{Deserialize, Serialize};

pub const CHECK_DISK_SPACE: &str = "disk_space";
pub const CHECK_BACKUP_PRESENCE: &str = "backup_presence";
pub const CHECK_WRITE_ACCESS: &str = "write_access";
pub const CHECK_OPEN_TRANSACTIONS: &str = "open_transactions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

impl PreflightCheck {
    pub fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self { name: name.to_string(), status, message: message.into() }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status == CheckStatus::Failed
    }
}

/// `name: message` for every failed check, in check order.
#[must_use]
pub fn failure_messages(checks: &[PreflightCheck]) -> Vec<String> {
    checks
        .iter()
        .filter(|check| check.is_failure())
        .map(|check| format!("{}: {}", check.name, check.message))
        .collect()
}

/// Free space needed before migrating: room for a backup plus the rewrite, never below the floor.
#[must_use]
pub fn required_free_space(db_size: u64, floor: u64) -> u64 {
    floor.max(db_size.saturating_mul(3))
}

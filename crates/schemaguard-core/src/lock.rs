use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity written into the lock row by the process that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub hostname: String,
    pub process_id: u32,
}

impl LockHolder {
    #[must_use]
    pub fn new(hostname: impl Into<String>, process_id: u32) -> Self {
        Self { hostname: hostname.into(), process_id }
    }

    /// Stable `host:pid` form stored in the `holder` column.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}:{}", self.hostname, self.process_id)
    }
}

impl Display for LockHolder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.process_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Held {
        holder: String,
        hostname: String,
        process_id: i64,
        acquired_at: String,
        age_secs: u64,
        stale: bool,
    },
}

impl LockState {
    #[must_use]
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held { .. })
    }
}

/// A lock is stale once its age strictly exceeds the threshold.
#[must_use]
pub fn is_stale(age: Duration, threshold: Duration) -> bool {
    age > threshold
}

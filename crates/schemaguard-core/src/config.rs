use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CoreError;

pub const DEFAULT_LOCK_STALE_AFTER_SECS: u64 = 30 * 60;
pub const DEFAULT_BACKUP_RETENTION: usize = 10;
pub const DEFAULT_MIN_FREE_SPACE_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_BACKUP_DIR_NAME: &str = "backups";
pub const DEFAULT_BACKUP_PREFIX: &str = "backup_";
pub const DEFAULT_BACKUP_EXTENSION: &str = ".db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    pub lock_stale_after_secs: u64,
    pub backup_retention: usize,
    pub min_free_space_bytes: u64,
    /// Directory receiving snapshots. `None` means a `backups/` sibling of the database file.
    pub backup_dir: Option<PathBuf>,
    pub backup_prefix: String,
    pub backup_extension: String,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            lock_stale_after_secs: DEFAULT_LOCK_STALE_AFTER_SECS,
            backup_retention: DEFAULT_BACKUP_RETENTION,
            min_free_space_bytes: DEFAULT_MIN_FREE_SPACE_BYTES,
            backup_dir: None,
            backup_prefix: DEFAULT_BACKUP_PREFIX.to_string(),
            backup_extension: DEFAULT_BACKUP_EXTENSION.to_string(),
        }
    }
}

impl MigratorConfig {
    #[must_use]
    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after_secs)
    }

    /// Resolve where snapshots of `db_path` are written.
    #[must_use]
    pub fn backup_dir_for(&self, db_path: &Path) -> PathBuf {
        if let Some(dir) = &self.backup_dir {
            return dir.clone();
        }
        match db_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(DEFAULT_BACKUP_DIR_NAME),
            _ => PathBuf::from(DEFAULT_BACKUP_DIR_NAME),
        }
    }

    /// # Errors
    /// Returns an error when retention is zero or the backup naming pieces are unusable.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.backup_retention == 0 {
            return Err(CoreError::Config("backup_retention must be at least 1".to_string()));
        }
        if self.backup_prefix.trim().is_empty() {
            return Err(CoreError::Config("backup_prefix must be non-empty".to_string()));
        }
        if !self.backup_extension.starts_with('.') || self.backup_extension.len() < 2 {
            return Err(CoreError::Config(format!(
                "backup_extension must start with '.', got `{}`",
                self.backup_extension
            )));
        }
        if self.backup_prefix.contains(['/', '\\']) || self.backup_extension.contains(['/', '\\'])
        {
            return Err(CoreError::Config(
                "backup_prefix and backup_extension must not contain path separators".to_string(),
            ));
        }
        Ok(())
    }
}

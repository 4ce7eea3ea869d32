use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use schemaguard_core::{LegacyProfile, MigratorConfig};
use serde::Deserialize;

/// JSON configuration file: migrator settings at the top level plus an optional legacy profile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub migrator: MigratorConfig,
    #[serde(default)]
    pub legacy: LegacyProfile,
}

/// Flag values that take precedence over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backup_dir: Option<PathBuf>,
    pub backup_retention: Option<usize>,
    pub lock_stale_after_secs: Option<u64>,
    pub min_free_space_bytes: Option<u64>,
}

impl CliConfig {
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&body)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(dir) = overrides.backup_dir {
            self.migrator.backup_dir = Some(dir);
        }
        if let Some(retention) = overrides.backup_retention {
            self.migrator.backup_retention = retention;
        }
        if let Some(secs) = overrides.lock_stale_after_secs {
            self.migrator.lock_stale_after_secs = secs;
        }
        if let Some(bytes) = overrides.min_free_space_bytes {
            self.migrator.min_free_space_bytes = bytes;
        }
        self
    }
}

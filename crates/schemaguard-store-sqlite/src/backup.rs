//! Timestamped file snapshots taken before a migration run, with retention.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::backup::Backup;
use rusqlite::{Connection, DatabaseName};
use schemaguard_core::{backup_file_name, is_backup_file_name, select_for_pruning, MigratorConfig};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::ddl::table_exists;
use crate::lock::LOCK_TABLE;

const NAME_COLLISION_RETRIES: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupFile {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Snapshot the database into the backup directory, then prune old backups.
///
/// The snapshot goes through SQLite's online backup API, so committed pages
/// still sitting in the WAL are included even while other connections hold
/// read transactions. The `_migration_lock` row is removed from the copy and
/// the copy is switched to a rollback journal so it is a single file.
///
/// Returns `None` when there is nothing to protect: the file does not exist or is empty.
///
/// # Errors
/// Returns an error when directory creation or the snapshot fails; a partial
/// file is removed then. Pruning failures are only logged.
pub fn create_backup(
    conn: &Connection,
    db_path: &Path,
    config: &MigratorConfig,
) -> Result<Option<PathBuf>> {
    let size = match fs::metadata(db_path) {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == ErrorKind::NotFound => 0,
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to inspect database file {}", db_path.display()))
        }
    };
    if size == 0 {
        info!(path = %db_path.display(), "backup skipped: database file is missing or empty");
        return Ok(None);
    }

    let dir = config.backup_dir_for(db_path);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create backup directory {}", dir.display()))?;

    let backup_path = reserve_backup_path(&dir, config)?;
    if let Err(err) = write_snapshot(conn, &backup_path) {
        if let Err(remove_err) = fs::remove_file(&backup_path) {
            warn!(
                path = %backup_path.display(),
                error = %remove_err,
                "failed to remove incomplete backup"
            );
        }
        return Err(err);
    }
    restrict_permissions(&backup_path);

    let bytes = fs::metadata(&backup_path).map_or(0, |metadata| metadata.len());
    info!(path = %backup_path.display(), bytes, "database backup created");

    match prune_backups(&dir, config) {
        Ok(removed) if !removed.is_empty() => {
            info!(
                removed = removed.len(),
                retention = config.backup_retention,
                "old backups pruned"
            );
        }
        Ok(_) => {}
        Err(err) => warn!(error = %format!("{err:#}"), "failed to prune old backups"),
    }

    Ok(Some(backup_path))
}

/// Claim a fresh file name with `create_new`; existing backups are never overwritten.
fn reserve_backup_path(dir: &Path, config: &MigratorConfig) -> Result<PathBuf> {
    for _ in 0..NAME_COLLISION_RETRIES {
        let name = backup_file_name(
            &config.backup_prefix,
            &config.backup_extension,
            OffsetDateTime::now_utc(),
        )
        .map_err(|err| anyhow!(err))?;
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(path),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                thread::sleep(Duration::from_millis(1));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create backup file {}", path.display()))
            }
        }
    }
    Err(anyhow!("could not find a free backup file name in {}", dir.display()))
}

fn write_snapshot(conn: &Connection, backup_path: &Path) -> Result<()> {
    let mut target = Connection::open(backup_path)
        .with_context(|| format!("failed to open backup file {}", backup_path.display()))?;
    {
        let backup = Backup::new(conn, &mut target).context("failed to start online backup")?;
        backup
            .run_to_completion(std::os::raw::c_int::MAX, Duration::ZERO, None)
            .with_context(|| format!("failed to copy database into {}", backup_path.display()))?;
    }

    // A restored snapshot must not come back locked by the run that took it.
    if table_exists(&target, LOCK_TABLE)? {
        target
            .execute(&format!("DELETE FROM {LOCK_TABLE}"), [])
            .context("failed to clear migration lock in backup")?;
    }
    let mode: String = target
        .query_row("PRAGMA journal_mode = DELETE", [], |row| row.get(0))
        .context("failed to switch backup to rollback journal")?;
    if !mode.eq_ignore_ascii_case("delete") {
        warn!(
            path = %backup_path.display(),
            mode = %mode,
            "backup kept a non-rollback journal mode"
        );
    }
    target
        .close()
        .map_err(|(_, err)| err)
        .with_context(|| format!("failed to close backup file {}", backup_path.display()))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!(path = %path.display(), error = %err, "failed to restrict backup permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

/// Backups in `dir` matching the configured prefix and extension, oldest first.
///
/// # Errors
/// Returns an error when the directory exists but cannot be read.
pub fn list_backups_in(dir: &Path, config: &MigratorConfig) -> Result<Vec<BackupFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read backup directory {}", dir.display()))
        }
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !is_backup_file_name(&name, &config.backup_prefix, &config.backup_extension) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        backups.push(BackupFile { name, path: entry.path(), size_bytes: metadata.len() });
    }
    backups.sort_by(|left, right| left.name.cmp(&right.name));
    Ok(backups)
}

/// Backups of `db_path`, oldest first.
///
/// # Errors
/// Returns an error when the backup directory cannot be read.
pub fn list_backups(db_path: &Path, config: &MigratorConfig) -> Result<Vec<BackupFile>> {
    list_backups_in(&config.backup_dir_for(db_path), config)
}

/// Delete all but the newest `backup_retention` backups. Returns the removed paths.
///
/// # Errors
/// Returns an error when listing or deleting fails.
pub fn prune_backups(dir: &Path, config: &MigratorConfig) -> Result<Vec<PathBuf>> {
    let names =
        list_backups_in(dir, config)?.into_iter().map(|backup| backup.name).collect::<Vec<_>>();
    let mut removed = Vec::new();
    for name in select_for_pruning(&names, config.backup_retention) {
        let path = dir.join(&name);
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove old backup {}", path.display()))?;
        removed.push(path);
    }
    Ok(removed)
}

/// Replace the connected database with the contents of a backup file.
///
/// # Errors
/// Returns an error when the backup file is missing or the restore fails.
pub fn restore_backup(conn: &mut Connection, backup_path: &Path) -> Result<()> {
    if !backup_path.exists() {
        return Err(anyhow!("backup file does not exist: {}", backup_path.display()));
    }
    conn.restore(DatabaseName::Main, backup_path, None::<fn(rusqlite::backup::Progress)>)
        .with_context(|| {
            format!("failed to restore sqlite backup from {}", backup_path.display())
        })?;
    info!(path = %backup_path.display(), "database restored from backup");
    Ok(())
}

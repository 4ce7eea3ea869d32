//! Checks that must pass before the migration lock is taken.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use rusqlite::{Connection, ErrorCode};
use schemaguard_core::{
    failure_messages, required_free_space, CheckStatus, MigratorConfig, PreflightCheck,
    CHECK_BACKUP_PRESENCE, CHECK_DISK_SPACE, CHECK_OPEN_TRANSACTIONS, CHECK_WRITE_ACCESS,
};
use tracing::warn;

use crate::backup::list_backups;
use crate::MigrationError;

pub const WRITE_PROBE_TABLE: &str = "_migration_write_probe";

/// Run every check and fail when any of them failed hard.
///
/// `db_path` is `None` for in-memory databases; file-based checks are skipped then.
///
/// # Errors
/// Returns [`MigrationError::PreflightFailed`] listing every failed check.
pub fn validate(
    conn: &Connection,
    db_path: Option<&Path>,
    config: &MigratorConfig,
) -> Result<Vec<PreflightCheck>, MigrationError> {
    let checks = run_checks(conn, db_path, config);
    for check in checks.iter().filter(|check| check.status == CheckStatus::Warning) {
        warn!(check = %check.name, message = %check.message, "pre-flight warning");
    }

    let failures = failure_messages(&checks);
    if failures.is_empty() {
        Ok(checks)
    } else {
        Err(MigrationError::PreflightFailed { failures, checks })
    }
}

/// Evaluate all checks without turning failures into an error.
#[must_use]
pub fn run_checks(
    conn: &Connection,
    db_path: Option<&Path>,
    config: &MigratorConfig,
) -> Vec<PreflightCheck> {
    vec![
        check_disk_space(db_path, config),
        check_backup_presence(db_path, config),
        check_write_access(conn),
        check_open_transactions(conn),
    ]
}

fn check_disk_space(db_path: Option<&Path>, config: &MigratorConfig) -> PreflightCheck {
    let Some(db_path) = db_path else {
        return PreflightCheck::new(CHECK_DISK_SPACE, CheckStatus::Skipped, "in-memory database");
    };

    let db_size = match fs::metadata(db_path) {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == ErrorKind::NotFound => 0,
        Err(err) => {
            return PreflightCheck::new(
                CHECK_DISK_SPACE,
                CheckStatus::Warning,
                format!("could not read database size: {err}"),
            )
        }
    };
    let required = required_free_space(db_size, config.min_free_space_bytes);

    let volume = match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match fs2::available_space(volume) {
        Ok(available) if available >= required => PreflightCheck::new(
            CHECK_DISK_SPACE,
            CheckStatus::Passed,
            format!("{} MiB free, {} MiB required", mib(available), mib(required)),
        ),
        Ok(available) => PreflightCheck::new(
            CHECK_DISK_SPACE,
            CheckStatus::Failed,
            format!(
                "insufficient disk space: {} MiB free, {} MiB required",
                mib(available),
                mib(required)
            ),
        ),
        Err(err) => PreflightCheck::new(
            CHECK_DISK_SPACE,
            CheckStatus::Warning,
            format!("could not determine free space of {}: {err}", volume.display()),
        ),
    }
}

fn mib(bytes: u64) -> u64 {
    bytes / (1024 * 1024)
}

fn check_backup_presence(db_path: Option<&Path>, config: &MigratorConfig) -> PreflightCheck {
    let Some(db_path) = db_path else {
        return PreflightCheck::new(
            CHECK_BACKUP_PRESENCE,
            CheckStatus::Skipped,
            "in-memory database",
        );
    };

    match list_backups(db_path, config) {
        Ok(backups) if backups.is_empty() => PreflightCheck::new(
            CHECK_BACKUP_PRESENCE,
            CheckStatus::Warning,
            "no backup exists yet",
        ),
        Ok(backups) => PreflightCheck::new(
            CHECK_BACKUP_PRESENCE,
            CheckStatus::Passed,
            format!("{} backup(s) available", backups.len()),
        ),
        Err(err) => PreflightCheck::new(
            CHECK_BACKUP_PRESENCE,
            CheckStatus::Warning,
            format!("could not list backups: {err:#}"),
        ),
    }
}

fn check_write_access(conn: &Connection) -> PreflightCheck {
    match probe_write_access(conn) {
        Ok(()) => {
            PreflightCheck::new(CHECK_WRITE_ACCESS, CheckStatus::Passed, "database is writable")
        }
        Err(err) if is_read_only_error(&err) => PreflightCheck::new(
            CHECK_WRITE_ACCESS,
            CheckStatus::Failed,
            format!("database is not writable: {err}"),
        ),
        Err(err) => PreflightCheck::new(
            CHECK_WRITE_ACCESS,
            CheckStatus::Warning,
            format!("write probe inconclusive: {err}"),
        ),
    }
}

/// Create and drop a scratch table inside a transaction that is always rolled back.
fn probe_write_access(conn: &Connection) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {WRITE_PROBE_TABLE} (id INTEGER);
         DROP TABLE {WRITE_PROBE_TABLE};"
    ))?;
    tx.rollback()
}

fn is_read_only_error(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::ReadOnly | ErrorCode::PermissionDenied | ErrorCode::CannotOpen)
    )
}

fn check_open_transactions(conn: &Connection) -> PreflightCheck {
    if !conn.is_autocommit() {
        return PreflightCheck::new(
            CHECK_OPEN_TRANSACTIONS,
            CheckStatus::Failed,
            "this connection already has an open transaction",
        );
    }
    PreflightCheck::new(
        CHECK_OPEN_TRANSACTIONS,
        CheckStatus::Skipped,
        "transactions of other connections cannot be inspected",
    )
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use rusqlite::OpenFlags;

    use super::*;

    fn find<'a>(checks: &'a [PreflightCheck], name: &str) -> Result<&'a PreflightCheck> {
        checks
            .iter()
            .find(|check| check.name == name)
            .ok_or_else(|| anyhow!("missing check {name}"))
    }

    #[test]
    fn in_memory_database_skips_file_checks() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        let checks = validate(&conn, None, &MigratorConfig::default())?;
        assert_eq!(find(&checks, CHECK_DISK_SPACE)?.status, CheckStatus::Skipped);
        assert_eq!(find(&checks, CHECK_BACKUP_PRESENCE)?.status, CheckStatus::Skipped);
        assert_eq!(find(&checks, CHECK_WRITE_ACCESS)?.status, CheckStatus::Passed);
        assert_eq!(find(&checks, CHECK_OPEN_TRANSACTIONS)?.status, CheckStatus::Skipped);
        Ok(())
    }

    #[test]
    fn write_probe_leaves_no_trace() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        validate(&conn, None, &MigratorConfig::default())?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1",
            [WRITE_PROBE_TABLE],
            |row| row.get(0),
        )?;
        assert_eq!(count, 0);
        Ok(())
    }

    #[test]
    fn missing_backup_is_only_a_warning() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("app.db");
        let conn = Connection::open(&db_path)?;
        let config = MigratorConfig { min_free_space_bytes: 0, ..MigratorConfig::default() };

        let checks = validate(&conn, Some(&db_path), &config)?;
        assert_eq!(find(&checks, CHECK_BACKUP_PRESENCE)?.status, CheckStatus::Warning);
        Ok(())
    }

    #[test]
    fn impossible_free_space_requirement_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("app.db");
        let conn = Connection::open(&db_path)?;
        let config = MigratorConfig { min_free_space_bytes: u64::MAX, ..MigratorConfig::default() };

        let Err(MigrationError::PreflightFailed { failures, .. }) =
            validate(&conn, Some(&db_path), &config)
        else {
            return Err(anyhow!("expected pre-flight failure"));
        };
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("disk_space:"));
        Ok(())
    }

    #[test]
    fn read_only_connection_fails_write_access() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("app.db");
        Connection::open(&db_path)?.execute_batch("CREATE TABLE customers (id INTEGER)")?;
        let conn = Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let config = MigratorConfig { min_free_space_bytes: 0, ..MigratorConfig::default() };

        let Err(MigrationError::PreflightFailed { failures, checks }) =
            validate(&conn, Some(&db_path), &config)
        else {
            return Err(anyhow!("expected pre-flight failure"));
        };
        assert_eq!(find(&checks, CHECK_WRITE_ACCESS)?.status, CheckStatus::Failed);
        assert!(failures.iter().any(|failure| failure.starts_with("write_access:")));
        Ok(())
    }

    #[test]
    fn open_transaction_on_connection_fails() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("BEGIN")?;
        let checks = run_checks(&conn, None, &MigratorConfig::default());
        assert_eq!(find(&checks, CHECK_OPEN_TRANSACTIONS)?.status, CheckStatus::Failed);
        Ok(())
    }
}

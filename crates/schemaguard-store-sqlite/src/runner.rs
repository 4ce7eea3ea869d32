use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use rusqlite::Connection;
use schemaguard_core::{
    AppliedMigration, ConversionOutcome, HistoryEntry, LegacyProfile, LockState, MigrationStatus,
    MigratorConfig, PendingMigration, RunMode, RunReport,
};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::backup::{self, BackupFile};
use crate::lock::{self, MigrationLock};
use crate::{
    checksum, ddl, is_bookkeeping, preflight, version_store, MigrationError, SqliteMigration,
    SqliteRegistry,
};

/// Orchestrates a migration run against one database.
///
/// Order of a run: legacy conversion, pending computation, pre-flight, lock,
/// backup, one transaction per migration, checksum, lock release.
#[derive(Debug)]
pub struct Migrator {
    registry: SqliteRegistry,
    config: MigratorConfig,
    profile: LegacyProfile,
    database_path: Option<PathBuf>,
    lock: MigrationLock,
}

impl Migrator {
    /// # Errors
    /// Returns [`MigrationError::InvalidConfig`] when the configuration is unusable.
    pub fn new(registry: SqliteRegistry, config: MigratorConfig) -> Result<Self, MigrationError> {
        config.validate().map_err(MigrationError::InvalidConfig)?;
        let lock = MigrationLock::for_current_process(config.lock_stale_after());
        Ok(Self { registry, config, profile: LegacyProfile::default(), database_path: None, lock })
    }

    /// Validate and sort `migrations`, then build a migrator.
    ///
    /// # Errors
    /// Returns [`MigrationError::InvalidRegistry`] for duplicate or non-positive versions.
    pub fn from_migrations(
        migrations: Vec<SqliteMigration>,
        config: MigratorConfig,
    ) -> Result<Self, MigrationError> {
        let registry = SqliteRegistry::new(migrations).map_err(MigrationError::InvalidRegistry)?;
        Self::new(registry, config)
    }

    /// Database file used for backups and the disk check. Defaults to the
    /// connection's own path; in-memory databases have none.
    #[must_use]
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_legacy_profile(mut self, profile: LegacyProfile) -> Self {
        self.profile = profile;
        self
    }

    #[must_use]
    pub fn lock(&self) -> &MigrationLock {
        &self.lock
    }

    fn resolve_db_path(&self, conn: &Connection) -> Option<PathBuf> {
        self.database_path.clone().or_else(|| {
            conn.path().filter(|path| !path.is_empty()).map(PathBuf::from)
        })
    }

    fn pending_of(&self, current: i64) -> Result<Vec<&SqliteMigration>, MigrationError> {
        let latest = self.registry.latest_version();
        if current > latest {
            return Err(MigrationError::DatabaseAhead { current, latest });
        }
        Ok(self.registry.pending(current))
    }

    /// Read-only summary of versions, pending work, lock and stored checksum.
    ///
    /// # Errors
    /// Returns a storage error when bookkeeping tables cannot be read.
    pub fn status(&self, conn: &Connection) -> Result<MigrationStatus, MigrationError> {
        let shape = version_store::detect_shape(conn)?;
        let current_version = version_store::peek_version(conn, &self.profile)?;
        let pending = self
            .registry
            .pending(current_version)
            .into_iter()
            .map(|migration| PendingMigration {
                version: migration.version(),
                description: migration.description().to_string(),
            })
            .collect::<Vec<_>>();

        Ok(MigrationStatus {
            current_version,
            latest_version: self.registry.latest_version(),
            pending_count: pending.len(),
            pending,
            shape,
            lock: lock::lock_state(conn, self.config.lock_stale_after())?,
            checksum: checksum::stored_checksum(conn)?,
        })
    }

    /// Bring the database up to the latest registered version.
    ///
    /// In [`RunMode::DryRun`] legacy conversion and every pending migration run
    /// inside one outer transaction that is always rolled back. No backup is
    /// taken and neither version nor checksum change.
    ///
    /// # Errors
    /// Returns the first fatal error; migrations before the failing one stay committed.
    pub fn run(&self, conn: &mut Connection, mode: RunMode) -> Result<RunReport, MigrationError> {
        let run_id = Ulid::new().to_string();
        let dry_run = mode.is_dry_run();
        let had_schema = has_user_schema(conn)?;

        // Dry runs convert legacy bookkeeping only inside their own transaction.
        let (from_version, conversion) = if dry_run {
            (version_store::peek_version(conn, &self.profile)?, None)
        } else {
            let (version, outcome) = version_store::current_version(conn, &self.profile)?;
            (version, Some(outcome).filter(ConversionOutcome::is_converted))
        };

        let mut report = RunReport {
            run_id,
            dry_run,
            from_version,
            to_version: from_version,
            applied: Vec::new(),
            backup: None,
            checksum: None,
            preflight: Vec::new(),
            conversion,
        };

        if self.pending_of(from_version)?.is_empty() {
            report.checksum = checksum::stored_checksum(conn)?;
            info!(run_id = %report.run_id, version = from_version, "schema is up to date");
            return Ok(report);
        }

        let db_path = self.resolve_db_path(conn);
        report.preflight = preflight::validate(conn, db_path.as_deref(), &self.config)?;

        self.lock.acquire(conn)?;
        let outcome = self.run_locked(conn, mode, db_path.as_deref(), had_schema, &mut report);
        let released = self.lock.release(conn);

        match (outcome, released) {
            (Ok(()), Ok(())) => Ok(report),
            (Ok(()), Err(release_err)) => Err(release_err),
            (Err(run_err), Ok(())) => Err(run_err),
            (Err(run_err), Err(release_err)) => {
                error!(
                    run_id = %report.run_id,
                    error = %release_err,
                    "failed to release migration lock after failed run"
                );
                Err(run_err)
            }
        }
    }

    fn run_locked(
        &self,
        conn: &mut Connection,
        mode: RunMode,
        db_path: Option<&Path>,
        had_schema: bool,
        report: &mut RunReport,
    ) -> Result<(), MigrationError> {
        if mode.is_dry_run() {
            return with_foreign_keys_off(conn, |conn, check_foreign_keys| {
                self.dry_run_locked(conn, check_foreign_keys, report)
            });
        }

        // Another process may have migrated while we waited for the lock.
        let (current, _) = version_store::current_version(conn, &self.profile)?;
        let Some(pending) = self.refresh_pending(conn, current, report)? else {
            return Ok(());
        };

        report.backup = match db_path {
            Some(path) if had_schema => match backup::create_backup(conn, path, &self.config) {
                Ok(created) => created,
                Err(err) => {
                    warn!(
                        run_id = %report.run_id,
                        error = %format!("{err:#}"),
                        "backup failed; continuing without backup"
                    );
                    None
                }
            },
            _ => None,
        };

        for migration in pending {
            let applied = with_foreign_keys_off(conn, |conn, check_foreign_keys| {
                apply_one(conn, migration, check_foreign_keys)
            })?;
            report.to_version = applied.version;
            report.applied.push(applied);
        }

        match checksum::store_checksum(conn) {
            Ok(value) => report.checksum = Some(value),
            Err(err) => {
                warn!(
                    run_id = %report.run_id,
                    error = %format!("{err:#}"),
                    "failed to store schema checksum"
                );
            }
        }

        info!(
            run_id = %report.run_id,
            to_version = report.to_version,
            applied = report.applied.len(),
            "migration run completed"
        );
        Ok(())
    }

    /// Recompute pending work under the lock. `None` means nothing is left to do.
    fn refresh_pending(
        &self,
        conn: &Connection,
        current: i64,
        report: &mut RunReport,
    ) -> Result<Option<Vec<&SqliteMigration>>, MigrationError> {
        report.from_version = current;
        report.to_version = current;
        let pending = self.pending_of(current)?;
        if pending.is_empty() {
            info!(run_id = %report.run_id, version = current, "schema migrated by another process");
            report.checksum = checksum::stored_checksum(conn)?;
            return Ok(None);
        }

        info!(
            run_id = %report.run_id,
            from_version = current,
            target_version = self.registry.latest_version(),
            pending = pending.len(),
            dry_run = report.dry_run,
            "migration run started"
        );
        Ok(Some(pending))
    }

    /// Convert and migrate inside one outer transaction, one savepoint per
    /// migration, then roll everything back.
    fn dry_run_locked(
        &self,
        conn: &mut Connection,
        check_foreign_keys: bool,
        report: &mut RunReport,
    ) -> Result<(), MigrationError> {
        let mut outer = conn.transaction().context("failed to start dry-run transaction")?;
        let (current, outcome) = version_store::current_version(&outer, &self.profile)?;
        if outcome.is_converted() {
            report.conversion = Some(outcome);
        }
        let Some(pending) = self.refresh_pending(&outer, current, report)? else {
            outer.rollback().context("failed to roll back dry-run transaction")?;
            return Ok(());
        };

        for migration in pending {
            let started = Instant::now();
            let savepoint = outer.savepoint().context("failed to create dry-run savepoint")?;
            let applied = migration
                .apply(&savepoint)
                .and_then(|()| ensure_no_orphans(&savepoint, check_foreign_keys));
            if let Err(err) = applied {
                warn!(
                    version = migration.version(),
                    error = %format!("{err:#}"),
                    "dry-run migration failed"
                );
                return Err(MigrationError::MigrationFailed {
                    version: migration.version(),
                    description: migration.description().to_string(),
                    source: err.into(),
                });
            }
            version_store::record_version(
                &savepoint,
                migration.version(),
                migration.description(),
            )?;
            savepoint.commit().context("failed to release dry-run savepoint")?;

            report.to_version = migration.version();
            report.applied.push(AppliedMigration {
                version: migration.version(),
                description: migration.description().to_string(),
                duration_ms: elapsed_ms(started),
            });
        }

        outer.rollback().context("failed to roll back dry-run transaction")?;
        info!(
            run_id = %report.run_id,
            would_apply = report.applied.len(),
            "dry run completed; all changes rolled back"
        );
        Ok(())
    }

    /// Compare the live schema with the stored checksum; drift is logged, never fatal.
    ///
    /// # Errors
    /// Returns a storage error when the schema or metadata cannot be accessed.
    pub fn verify_schema_integrity(&self, conn: &Connection) -> Result<bool, MigrationError> {
        Ok(checksum::verify(conn)?)
    }

    /// # Errors
    /// Returns a storage error when the history table cannot be read.
    pub fn history(&self, conn: &Connection) -> Result<Vec<HistoryEntry>, MigrationError> {
        Ok(version_store::history(conn)?)
    }

    /// # Errors
    /// Returns a storage error when the lock table cannot be read.
    pub fn lock_state(&self, conn: &Connection) -> Result<LockState, MigrationError> {
        Ok(lock::lock_state(conn, self.config.lock_stale_after())?)
    }

    /// # Errors
    /// Returns a storage error when the lock table cannot be written.
    pub fn force_release_lock(&self, conn: &Connection) -> Result<bool, MigrationError> {
        Ok(lock::force_release(conn)?)
    }

    /// Snapshot the database outside a migration run.
    ///
    /// # Errors
    /// Returns a storage error when the database has no file path or the copy fails.
    pub fn create_backup(&self, conn: &Connection) -> Result<Option<PathBuf>, MigrationError> {
        let path = self.require_db_path(conn)?;
        Ok(backup::create_backup(conn, &path, &self.config)?)
    }

    /// # Errors
    /// Returns a storage error when the database has no file path or the directory is unreadable.
    pub fn list_backups(&self, conn: &Connection) -> Result<Vec<BackupFile>, MigrationError> {
        let path = self.require_db_path(conn)?;
        Ok(backup::list_backups(&path, &self.config)?)
    }

    /// # Errors
    /// Returns a storage error when the backup is missing or the restore fails.
    pub fn restore_backup(
        &self,
        conn: &mut Connection,
        backup_path: &Path,
    ) -> Result<(), MigrationError> {
        Ok(backup::restore_backup(conn, backup_path)?)
    }

    fn require_db_path(&self, conn: &Connection) -> Result<PathBuf, MigrationError> {
        self.resolve_db_path(conn)
            .context("in-memory databases have no file to back up")
            .map_err(MigrationError::Storage)
    }
}

/// Whether the database holds anything besides the engine's own tables.
fn has_user_schema(conn: &Connection) -> Result<bool, MigrationError> {
    let mut stmt = conn
        .prepare(
            "SELECT name, tbl_name FROM sqlite_master
             WHERE name NOT LIKE 'sqlite\\_%' ESCAPE '\\'",
        )
        .context("failed to inspect sqlite_master")?;
    let objects = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .context("failed to list schema objects")?;
    Ok(objects.iter().any(|(name, table)| !is_bookkeeping(name) && !is_bookkeeping(table)))
}

/// Run `body` with foreign key enforcement switched off, restoring it afterwards.
///
/// `SQLite` ignores the pragma inside a transaction, so this wraps the whole
/// transaction. `body` learns whether enforcement was on, in which case it must
/// check for orphaned rows before committing.
fn with_foreign_keys_off<T>(
    conn: &mut Connection,
    body: impl FnOnce(&mut Connection, bool) -> Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    let enforced = ddl::foreign_keys_enabled(conn)?;
    if !enforced {
        return body(conn, false);
    }

    conn.execute_batch("PRAGMA foreign_keys = OFF")
        .context("failed to disable foreign key enforcement")?;
    let result = body(conn, true);
    let restored = conn.execute_batch("PRAGMA foreign_keys = ON");
    match (result, restored) {
        (result, Ok(())) => result,
        (Ok(_), Err(err)) => Err(MigrationError::Storage(
            anyhow::Error::new(err).context("failed to re-enable foreign key enforcement"),
        )),
        (Err(run_err), Err(err)) => {
            error!(error = %err, "failed to re-enable foreign key enforcement");
            Err(run_err)
        }
    }
}

fn ensure_no_orphans(conn: &Connection, check_foreign_keys: bool) -> anyhow::Result<()> {
    if !check_foreign_keys {
        return Ok(());
    }
    let violations = ddl::foreign_key_violations(conn)?;
    if violations.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("foreign key violations: {}", violations.join(", ")))
    }
}

fn apply_one(
    conn: &mut Connection,
    migration: &SqliteMigration,
    check_foreign_keys: bool,
) -> Result<AppliedMigration, MigrationError> {
    let started = Instant::now();
    let tx = conn.transaction().context("failed to start migration transaction")?;

    let applied = migration.apply(&tx).and_then(|()| ensure_no_orphans(&tx, check_foreign_keys));
    if let Err(err) = applied {
        error!(
            version = migration.version(),
            description = migration.description(),
            error = %format!("{err:#}"),
            "migration failed; rolled back"
        );
        return Err(MigrationError::MigrationFailed {
            version: migration.version(),
            description: migration.description().to_string(),
            source: err.into(),
        });
    }
    version_store::record_version(&tx, migration.version(), migration.description())?;
    tx.commit()
        .with_context(|| format!("failed to commit migration {}", migration.version()))?;

    let applied = AppliedMigration {
        version: migration.version(),
        description: migration.description().to_string(),
        duration_ms: elapsed_ms(started),
    };
    info!(
        version = applied.version,
        description = %applied.description,
        duration_ms = applied.duration_ms,
        "migration applied"
    );
    Ok(applied)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

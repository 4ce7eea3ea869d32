//! Cross-process migration lock persisted as a single row.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use schemaguard_core::{is_stale, LockHolder, LockState};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::ddl::table_exists;
use crate::{now_rfc3339, parse_rfc3339, MigrationError};

pub const LOCK_TABLE: &str = "_migration_lock";

const CREATE_LOCK_SQL: &str = r"
CREATE TABLE IF NOT EXISTS _migration_lock (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  holder TEXT NOT NULL,
  hostname TEXT NOT NULL,
  process_id INTEGER NOT NULL,
  acquired_at TEXT NOT NULL
);
";

struct LockRow {
    holder: String,
    hostname: String,
    process_id: i64,
    acquired_at: String,
}

/// Lock handle owned by one migrator. The in-memory flag guards against
/// acquiring twice from the same instance.
#[derive(Debug)]
pub struct MigrationLock {
    holder: LockHolder,
    stale_after: Duration,
    held: AtomicBool,
}

impl MigrationLock {
    #[must_use]
    pub fn new(holder: LockHolder, stale_after: Duration) -> Self {
        Self { holder, stale_after, held: AtomicBool::new(false) }
    }

    /// Lock identified by this machine's hostname and the current process id.
    #[must_use]
    pub fn for_current_process(stale_after: Duration) -> Self {
        Self::new(current_holder(), stale_after)
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Take the lock, reclaiming it when the existing row is stale.
    ///
    /// # Errors
    /// Returns [`MigrationError::LockReentry`] when this instance already holds
    /// the lock, [`MigrationError::LockHeld`] when another holder has a fresh
    /// row, or a storage error.
    pub fn acquire(&self, conn: &Connection) -> Result<(), MigrationError> {
        if self.is_held() {
            return Err(MigrationError::LockReentry);
        }

        conn.execute_batch(CREATE_LOCK_SQL).context("failed to create _migration_lock table")?;
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .context("failed to start lock transaction")?;

        if let Some(row) = read_row(&tx)? {
            let age = lock_age(&row.acquired_at);
            if !age.is_stale(self.stale_after) {
                return Err(MigrationError::LockHeld {
                    holder: row.holder,
                    age_secs: age.secs(),
                });
            }

            let deleted = tx
                .execute(
                    "DELETE FROM _migration_lock WHERE id = 1 AND acquired_at = ?1",
                    params![row.acquired_at],
                )
                .context("failed to delete stale migration lock")?;
            if deleted == 1 {
                warn!(
                    previous_holder = %row.holder,
                    previous_hostname = %row.hostname,
                    previous_process_id = row.process_id,
                    acquired_at = %row.acquired_at,
                    age_secs = age.secs(),
                    "stale lock reclaimed"
                );
            }
        }

        let now = now_rfc3339()?;
        tx.execute(
            "INSERT INTO _migration_lock(id, holder, hostname, process_id, acquired_at)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![self.holder.id(), self.holder.hostname, i64::from(self.holder.process_id), now],
        )
        .context("failed to insert migration lock")?;
        tx.commit().context("failed to commit migration lock")?;

        self.held.store(true, Ordering::SeqCst);
        info!(holder = %self.holder, "migration lock acquired");
        Ok(())
    }

    /// Delete this holder's row. A no-op when the lock is not held by this instance.
    ///
    /// # Errors
    /// Returns an error when the row cannot be deleted; the in-memory flag stays set then.
    pub fn release(&self, conn: &Connection) -> Result<(), MigrationError> {
        if !self.is_held() {
            return Ok(());
        }

        let deleted = conn
            .execute(
                "DELETE FROM _migration_lock WHERE id = 1 AND holder = ?1",
                params![self.holder.id()],
            )
            .context("failed to release migration lock")?;
        self.held.store(false, Ordering::SeqCst);

        if deleted == 0 {
            warn!(holder = %self.holder, "migration lock row was already gone at release");
        } else {
            info!(holder = %self.holder, "migration lock released");
        }
        Ok(())
    }
}

/// Host identity of the running process. Falls back to `unknown-host` when
/// the hostname cannot be read.
#[must_use]
pub fn current_holder() -> LockHolder {
    let hostname = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(err) => {
            warn!(error = %err, "failed to read hostname for migration lock");
            "unknown-host".to_string()
        }
    };
    LockHolder::new(hostname, std::process::id())
}

/// Persisted lock state as seen by an operator.
///
/// # Errors
/// Returns an error when the lock table cannot be read.
pub fn lock_state(conn: &Connection, stale_after: Duration) -> Result<LockState> {
    if !table_exists(conn, LOCK_TABLE)? {
        return Ok(LockState::Unlocked);
    }
    let Some(row) = read_row(conn)? else {
        return Ok(LockState::Unlocked);
    };
    let age = lock_age(&row.acquired_at);
    Ok(LockState::Held {
        holder: row.holder,
        hostname: row.hostname,
        process_id: row.process_id,
        acquired_at: row.acquired_at,
        age_secs: age.secs(),
        stale: age.is_stale(stale_after),
    })
}

/// Delete the lock row regardless of holder. Returns `true` when a row was removed.
///
/// # Errors
/// Returns an error when the lock table cannot be written.
pub fn force_release(conn: &Connection) -> Result<bool> {
    if !table_exists(conn, LOCK_TABLE)? {
        return Ok(false);
    }
    let deleted = conn
        .execute("DELETE FROM _migration_lock WHERE id = 1", [])
        .context("failed to force-release migration lock")?;
    if deleted > 0 {
        warn!("migration lock force-released");
    }
    Ok(deleted > 0)
}

fn read_row(conn: &Connection) -> Result<Option<LockRow>> {
    conn.query_row(
        "SELECT holder, hostname, process_id, acquired_at FROM _migration_lock WHERE id = 1",
        [],
        |row| {
            Ok(LockRow {
                holder: row.get(0)?,
                hostname: row.get(1)?,
                process_id: row.get(2)?,
                acquired_at: row.get(3)?,
            })
        },
    )
    .optional()
    .context("failed to read migration lock")
}

/// Age of a lock row; `None` when its timestamp cannot be parsed.
struct LockAge(Option<Duration>);

impl LockAge {
    fn secs(&self) -> u64 {
        self.0.map_or(0, |age| age.as_secs())
    }

    fn is_stale(&self, stale_after: Duration) -> bool {
        match self.0 {
            Some(age) => is_stale(age, stale_after),
            None => true,
        }
    }
}

fn lock_age(acquired_at: &str) -> LockAge {
    match parse_rfc3339(acquired_at) {
        Ok(acquired) => {
            let elapsed = OffsetDateTime::now_utc() - acquired;
            // A timestamp from the future counts as freshly acquired.
            LockAge(Some(Duration::try_from(elapsed).unwrap_or(Duration::ZERO)))
        }
        Err(err) => {
            warn!(
                acquired_at,
                error = %format!("{err:#}"),
                "unparseable lock timestamp treated as stale"
            );
            LockAge(None)
        }
    }
}

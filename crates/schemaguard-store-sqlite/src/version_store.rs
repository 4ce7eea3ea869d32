//! Shape-agnostic access to the persisted schema version.
//!
//! Reads understand all three bookkeeping generations; writes only ever go
//! to the `History` table.

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use schemaguard_core::{ConversionOutcome, HistoryEntry, LegacyProfile, VersionStoreShape};

use crate::ddl::{column_exists, table_exists};
use crate::{compat, now_rfc3339};

pub const HISTORY_TABLE: &str = "schema_migrations";
pub const LEGACY_TABLE: &str = "_schema_meta";
pub const META_TABLE: &str = "_migration_meta";

const LEGACY_VERSION_KEY: &str = "schema_version";

const CREATE_HISTORY_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  applied_at TEXT NOT NULL
);
";

const CREATE_META_SQL: &str = r"
CREATE TABLE IF NOT EXISTS _migration_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Which bookkeeping generation is active, or `None` for a database that has
/// never been versioned.
///
/// # Errors
/// Returns an error when `_schema_meta` exists with an unrecognised layout.
pub fn detect_shape(conn: &Connection) -> Result<Option<VersionStoreShape>> {
    if table_exists(conn, HISTORY_TABLE)? {
        return Ok(Some(VersionStoreShape::History));
    }
    if !table_exists(conn, LEGACY_TABLE)? {
        return Ok(None);
    }
    if column_exists(conn, LEGACY_TABLE, "key")? {
        return Ok(Some(VersionStoreShape::LegacyKv));
    }
    if column_exists(conn, LEGACY_TABLE, "version")? {
        return Ok(Some(VersionStoreShape::SingleRow));
    }
    Err(anyhow!("unrecognised {LEGACY_TABLE} layout: expected a `key` or `version` column"))
}

/// Current schema version, converting legacy bookkeeping first when `History`
/// is absent. Also returns what the conversion did.
///
/// # Errors
/// Returns an error when conversion fails or the version cannot be read.
pub fn current_version(
    conn: &Connection,
    profile: &LegacyProfile,
) -> Result<(i64, ConversionOutcome)> {
    let outcome = if table_exists(conn, HISTORY_TABLE)? {
        ConversionOutcome::AlreadyCurrent
    } else {
        let outcome = compat::ensure_compatibility(conn, profile)?;
        ensure_history_table(conn)?;
        outcome
    };
    Ok((history_version(conn)?, outcome))
}

/// Current schema version without writing anything.
///
/// Legacy databases report the version they would have after conversion.
///
/// # Errors
/// Returns an error when the bookkeeping tables cannot be read.
pub fn peek_version(conn: &Connection, profile: &LegacyProfile) -> Result<i64> {
    match detect_shape(conn)? {
        None => Ok(0),
        Some(VersionStoreShape::History) => history_version(conn),
        Some(shape) => {
            let legacy = read_legacy_version(conn, shape)?;
            Ok(compat::converted_version(profile, legacy))
        }
    }
}

/// # Errors
/// Returns an error when the table cannot be created.
pub fn ensure_history_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_HISTORY_SQL).context("failed to create schema_migrations table")
}

fn history_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

/// Append a history row; returns `false` when the version was already recorded.
///
/// # Errors
/// Returns an error when the history table is missing or the insert fails.
pub fn record_version(conn: &Connection, version: i64, name: &str) -> Result<bool> {
    let now = now_rfc3339()?;
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at)
             VALUES (?1, ?2, ?3)",
            params![version, name, now],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(inserted == 1)
}

/// Every recorded migration, ascending. Empty when the history table does not exist yet.
///
/// # Errors
/// Returns an error when the history table cannot be read.
pub fn history(conn: &Connection) -> Result<Vec<HistoryEntry>> {
    if !table_exists(conn, HISTORY_TABLE)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare("SELECT version, name, applied_at FROM schema_migrations ORDER BY version ASC")
        .context("failed to prepare history query")?;
    let entries = stmt
        .query_map([], |row| {
            Ok(HistoryEntry { version: row.get(0)?, name: row.get(1)?, applied_at: row.get(2)? })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to read migration history")?;
    Ok(entries)
}

/// Version recorded in a legacy `_schema_meta` table.
///
/// A missing `schema_version` row or an empty table reads as 0.
///
/// # Errors
/// Returns an error when the stored value is not a non-negative integer.
pub fn read_legacy_version(conn: &Connection, shape: VersionStoreShape) -> Result<i64> {
    let version = match shape {
        VersionStoreShape::History => return history_version(conn),
        VersionStoreShape::LegacyKv => {
            let value = conn
                .query_row(
                    "SELECT value FROM _schema_meta WHERE key = ?1",
                    params![LEGACY_VERSION_KEY],
                    |row| row.get::<_, Value>(0),
                )
                .optional()
                .context("failed to read legacy schema_version")?;
            match value {
                None | Some(Value::Null) => 0,
                Some(Value::Integer(version)) => version,
                Some(Value::Text(raw)) => raw.trim().parse::<i64>().with_context(|| {
                    format!("legacy schema_version is not an integer: `{raw}`")
                })?,
                Some(other) => {
                    return Err(anyhow!("legacy schema_version has unexpected type: {other:?}"))
                }
            }
        }
        VersionStoreShape::SingleRow => conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM _schema_meta", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to read legacy single-row version")?,
    };

    if version < 0 {
        return Err(anyhow!("legacy schema version is negative: {version}"));
    }
    Ok(version)
}

/// # Errors
/// Returns an error when the metadata table cannot be read.
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    if !table_exists(conn, META_TABLE)? {
        return Ok(None);
    }
    conn.query_row("SELECT value FROM _migration_meta WHERE key = ?1", params![key], |row| {
        row.get::<_, String>(0)
    })
    .optional()
    .with_context(|| format!("failed to read migration meta key {key}"))
}

/// # Errors
/// Returns an error when the metadata table cannot be created or written.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute_batch(CREATE_META_SQL).context("failed to create _migration_meta table")?;
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT INTO _migration_meta(key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now],
    )
    .with_context(|| format!("failed to write migration meta key {key}"))?;
    Ok(())
}

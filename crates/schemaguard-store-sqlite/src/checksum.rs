//! Schema integrity checksum over table, index and view definitions.

use anyhow::{Context, Result};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::version_store::{get_meta, set_meta};
use crate::is_bookkeeping;

pub const CHECKSUM_KEY: &str = "schema_checksum";

/// Canonical `name:definition` lines of every user schema object, sorted by name.
///
/// # Errors
/// Returns an error when `sqlite_master` cannot be read.
pub fn canonical_schema(conn: &Connection) -> Result<String> {
    let mut stmt = conn
        .prepare(
            "SELECT name, tbl_name, sql FROM sqlite_master
             WHERE type IN ('table', 'index', 'view')
               AND sql IS NOT NULL
               AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
             ORDER BY name ASC",
        )
        .context("failed to prepare schema listing")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to list schema definitions")?;

    let lines = rows
        .into_iter()
        .filter(|(name, table, _)| {
            !is_bookkeeping(name) && !is_bookkeeping(table)
        })
        .map(|(name, _, sql)| format!("{name}:{sql}"))
        .collect::<Vec<_>>();
    Ok(lines.join("\n"))
}

/// Lowercase hex SHA-256 of [`canonical_schema`].
///
/// # Errors
/// Returns an error when `sqlite_master` cannot be read.
pub fn compute_checksum(conn: &Connection) -> Result<String> {
    let canonical = canonical_schema(conn)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// # Errors
/// Returns an error when the metadata table cannot be read.
pub fn stored_checksum(conn: &Connection) -> Result<Option<String>> {
    get_meta(conn, CHECKSUM_KEY)
}

/// Compute and persist the current checksum.
///
/// # Errors
/// Returns an error when the checksum cannot be computed or written.
pub fn store_checksum(conn: &Connection) -> Result<String> {
    let checksum = compute_checksum(conn)?;
    set_meta(conn, CHECKSUM_KEY, &checksum)?;
    Ok(checksum)
}

/// Compare the stored checksum with the live schema.
///
/// The first call stores a baseline. Drift is logged and the new value is
/// stored; it never blocks startup.
///
/// # Errors
/// Returns an error only when the schema or metadata cannot be accessed.
pub fn verify(conn: &Connection) -> Result<bool> {
    let current = compute_checksum(conn)?;
    match stored_checksum(conn)? {
        None => {
            set_meta(conn, CHECKSUM_KEY, &current)?;
            info!(checksum = %current, "schema checksum baseline stored");
            Ok(true)
        }
        Some(stored) if stored == current => Ok(true),
        Some(stored) => {
            warn!(
                stored = %stored,
                current = %current,
                "schema drift detected: definitions changed outside of migrations"
            );
            set_meta(conn, CHECKSUM_KEY, &current)?;
            Ok(false)
        }
    }
}

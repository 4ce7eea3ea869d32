use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use schemaguard_core::Migration;
use schemaguard_store_sqlite::SqliteMigration;

/// Line separating the forward half of a migration file from its inverse.
pub const DOWN_MARKER: &str = "-- schemaguard:down";

/// Parsed `NNNN_description.sql` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlMigrationFile {
    pub version: i64,
    pub description: String,
    pub up: String,
    pub down: Option<String>,
}

impl SqlMigrationFile {
    pub fn into_migration(self) -> SqliteMigration {
        let up = self.up;
        let migration = Migration::new(self.version, self.description, move |conn: &Connection| {
            conn.execute_batch(&up)?;
            Ok(())
        });
        match self.down {
            Some(down) => migration.with_down(move |conn: &Connection| {
                conn.execute_batch(&down)?;
                Ok(())
            }),
            None => migration,
        }
    }
}

/// `0012_add_phone.sql` -> `(12, "add_phone")`.
pub fn parse_file_name(name: &str) -> Option<(i64, String)> {
    let stem = name.strip_suffix(".sql")?;
    let (version, description) = stem.split_once('_')?;
    if version.is_empty() || !version.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    let version = version.parse::<i64>().ok()?;
    if description.is_empty() {
        return None;
    }
    Some((version, description.to_string()))
}

pub fn split_up_down(body: &str) -> (String, Option<String>) {
    let mut up = Vec::new();
    let mut down: Option<Vec<&str>> = None;
    for line in body.lines() {
        if line.trim() == DOWN_MARKER {
            down = Some(Vec::new());
            continue;
        }
        match down.as_mut() {
            Some(lines) => lines.push(line),
            None => up.push(line),
        }
    }
    let down = down.map(|lines| lines.join("\n")).filter(|sql| !sql.trim().is_empty());
    (up.join("\n"), down)
}

/// Read every migration file in `dir`, ascending by file name. Files that do
/// not follow the naming scheme are ignored.
///
/// # Errors
/// Returns an error when the directory or a file cannot be read, or a file has an empty `up` half.
pub fn read_dir(dir: &Path) -> Result<Vec<SqlMigrationFile>> {
    let mut names = fs::read_dir(dir)
        .with_context(|| format!("failed to read migrations directory {}", dir.display()))?
        .map(|entry| entry.map(|entry| entry.file_name()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to list migrations directory {}", dir.display()))?;
    names.sort();

    let mut files = Vec::new();
    for name in names {
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some((version, description)) = parse_file_name(name) else {
            continue;
        };
        let path = dir.join(name);
        let body = fs::read_to_string(&path)
            .with_context(|| format!("failed to read migration file {}", path.display()))?;
        let (up, down) = split_up_down(&body);
        if up.trim().is_empty() {
            return Err(anyhow!("migration file {} has no forward statements", path.display()));
        }
        files.push(SqlMigrationFile { version, description, up, down });
    }
    Ok(files)
}

/// # Errors
/// Returns an error when the directory cannot be read.
pub fn load_migrations(dir: &Path) -> Result<Vec<SqliteMigration>> {
    Ok(read_dir(dir)?.into_iter().map(SqlMigrationFile::into_migration).collect())
}

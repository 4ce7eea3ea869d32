//! `SQLite` implementation of the schemaguard migration engine.
//!
//! Every component receives an explicit `&Connection`; nothing here keeps a
//! global handle. [`Migrator`] ties the pieces together for host startup.

pub mod backup;
pub mod checksum;
pub mod compat;
pub mod ddl;
mod error;
pub mod lock;
pub mod preflight;
mod runner;
pub mod version_store;

use anyhow::{Context, Result};
use rusqlite::Connection;
use time::OffsetDateTime;

pub use backup::BackupFile;
pub use error::MigrationError;
pub use lock::MigrationLock;
pub use runner::Migrator;

/// Migration whose procedures receive the live `rusqlite` connection (or transaction).
pub type SqliteMigration = schemaguard_core::Migration<Connection>;
pub type SqliteRegistry = schemaguard_core::Registry<Connection>;

/// Tables owned by the engine itself; excluded from the schema checksum.
pub const BOOKKEEPING_TABLES: [&str; 5] = [
    lock::LOCK_TABLE,
    version_store::HISTORY_TABLE,
    version_store::LEGACY_TABLE,
    version_store::META_TABLE,
    preflight::WRITE_PROBE_TABLE,
];

/// Whether a schema object name belongs to the engine rather than the host application.
#[must_use]
pub fn is_bookkeeping(name: &str) -> bool {
    BOOKKEEPING_TABLES.contains(&name)
}

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

/// Double-quote an identifier for interpolation into DDL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

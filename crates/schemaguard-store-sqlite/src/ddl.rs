//! Idempotent DDL wrappers for migration authors.
//!
//! Re-running a partially applied migration must not fail on structures the
//! earlier attempt already created, so "already exists" style errors are
//! swallowed here while every other error propagates.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use tracing::debug;

use crate::quote_ident;

const DUPLICATE_COLUMN: &str = "duplicate column name";
const ALREADY_EXISTS: &str = "already exists";

/// `ALTER TABLE {table} ADD COLUMN {definition}`.
///
/// Returns `false` when the column was already present.
///
/// # Errors
/// Returns an error for any failure other than a duplicate column.
pub fn add_column(conn: &Connection, table: &str, definition: &str) -> Result<bool> {
    let sql = format!("ALTER TABLE {} ADD COLUMN {definition}", quote_ident(table));
    tolerate(conn, &sql, DUPLICATE_COLUMN)
        .with_context(|| format!("failed to add column `{definition}` to {table}"))
}

/// Execute a `CREATE TABLE` statement, tolerating an existing table.
///
/// # Errors
/// Returns an error for any failure other than "table already exists".
pub fn create_table(conn: &Connection, create_sql: &str) -> Result<bool> {
    tolerate(conn, create_sql, ALREADY_EXISTS).context("failed to create table")
}

/// Execute a `CREATE INDEX` statement, tolerating an existing index.
///
/// # Errors
/// Returns an error for any failure other than "index already exists",
/// including a missing target table or column.
pub fn create_index(conn: &Connection, create_sql: &str) -> Result<bool> {
    tolerate(conn, create_sql, ALREADY_EXISTS).context("failed to create index")
}

fn tolerate(conn: &Connection, sql: &str, needle: &str) -> Result<bool> {
    match conn.execute_batch(sql) {
        Ok(()) => Ok(true),
        Err(err) if err.to_string().contains(needle) => {
            debug!(error = %err, "ddl statement already applied");
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

/// # Errors
/// Returns an error when `sqlite_master` cannot be queried.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table}"))?;
    Ok(exists == 1)
}

/// # Errors
/// Returns an error when the table definition cannot be inspected.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    Ok(table_columns(conn, table)?.iter().any(|name| name == column))
}

/// Column names of `table` in declaration order; empty when the table does not exist.
///
/// # Errors
/// Returns an error when `PRAGMA table_info` fails.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    if !table_exists(conn, table)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to read columns of {table}"))?;
    Ok(columns)
}

/// # Errors
/// Returns an error when the pragma cannot be read.
pub fn foreign_keys_enabled(conn: &Connection) -> Result<bool> {
    let enabled = conn
        .query_row("PRAGMA foreign_keys", [], |row| row.get::<_, i64>(0))
        .context("failed to read foreign_keys pragma")?;
    Ok(enabled == 1)
}

/// Rows that violate a foreign key, as `table row N references missing parent` lines.
///
/// # Errors
/// Returns an error when `PRAGMA foreign_key_check` fails.
pub fn foreign_key_violations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("PRAGMA foreign_key_check").context("failed to check foreign keys")?;
    let violations = stmt
        .query_map([], |row| {
            let table: String = row.get(0)?;
            let rowid: Option<i64> = row.get(1)?;
            let parent: String = row.get(2)?;
            Ok(match rowid {
                Some(rowid) => format!("{table} row {rowid} references missing {parent}"),
                None => format!("{table} references missing {parent}"),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to read foreign key violations")?;
    Ok(violations)
}

/// Replace `table` with a new definition while keeping its rows.
///
/// `columns_sql` is the parenthesised column and constraint list of the new
/// table, e.g. `(id INTEGER PRIMARY KEY, phone TEXT NULL)`. Rows are copied for
/// every column present in both definitions, then the old table is dropped,
/// the shadow table renamed and the old explicit indexes recreated. Triggers
/// and views on the table are not carried over.
///
/// Foreign key enforcement must be off, otherwise dropping a parent table
/// would cascade into or orphan its children. `PRAGMA foreign_keys` cannot
/// change inside a transaction, so the migrator switches it off around each
/// migration; callers outside a migration do the same before `BEGIN`. The
/// whole database is checked with `PRAGMA foreign_key_check` after the swap.
///
/// Returns the number of copied rows.
///
/// # Errors
/// Returns an error when foreign keys are enforced, the table is missing, the
/// new definition is invalid, the copy violates a constraint, an old index no
/// longer fits, or the rebuilt table leaves foreign key violations behind.
pub fn rebuild_table(conn: &Connection, table: &str, columns_sql: &str) -> Result<usize> {
    if foreign_keys_enabled(conn)? {
        return Err(anyhow!(
            "cannot rebuild {table} while foreign keys are enforced; \
             disable them before the transaction"
        ));
    }
    let old_columns = table_columns(conn, table)?;
    if old_columns.is_empty() {
        return Err(anyhow!("cannot rebuild missing table {table}"));
    }

    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master
         WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL
         ORDER BY name",
    )?;
    let indexes = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to read indexes of {table}"))?;
    drop(stmt);

    let shadow = format!("{table}__rebuild");
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {shadow_q};
         CREATE TABLE {shadow_q} {columns_sql};",
        shadow_q = quote_ident(&shadow),
    ))
    .with_context(|| format!("failed to create shadow table for {table}"))?;

    let new_columns = table_columns(conn, &shadow)?;
    let shared = new_columns
        .iter()
        .filter(|column| old_columns.contains(column))
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");

    let copied = if shared.is_empty() {
        0
    } else {
        conn.execute(
            &format!(
                "INSERT INTO {} ({shared}) SELECT {shared} FROM {}",
                quote_ident(&shadow),
                quote_ident(table)
            ),
            [],
        )
        .with_context(|| format!("failed to copy rows of {table} into shadow table"))?
    };

    conn.execute_batch(&format!(
        "DROP TABLE {table_q}; ALTER TABLE {shadow_q} RENAME TO {table_q};",
        table_q = quote_ident(table),
        shadow_q = quote_ident(&shadow),
    ))
    .with_context(|| format!("failed to swap rebuilt table {table}"))?;

    for index_sql in &indexes {
        conn.execute_batch(index_sql)
            .with_context(|| format!("failed to recreate index on {table}: {index_sql}"))?;
    }

    let violations = foreign_key_violations(conn)?;
    if !violations.is_empty() {
        return Err(anyhow!(
            "rebuilding {table} left foreign key violations: {}",
            violations.join("; ")
        ));
    }

    debug!(table, copied, indexes = indexes.len(), "table rebuilt");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    fn memory_conn() -> Result<Connection> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);")?;
        Ok(conn)
    }

    #[test]
    fn add_column_is_idempotent() -> Result<()> {
        let conn = memory_conn()?;
        assert!(add_column(&conn, "customers", "phone TEXT NULL")?);
        assert!(!add_column(&conn, "customers", "phone TEXT NULL")?);
        assert!(column_exists(&conn, "customers", "phone")?);
        Ok(())
    }

    #[test]
    fn add_column_propagates_missing_table() -> Result<()> {
        let conn = memory_conn()?;
        let err = add_column(&conn, "vehicles", "plate TEXT").err();
        assert!(err.is_some());
        Ok(())
    }

    #[test]
    fn create_table_and_index_tolerate_existing() -> Result<()> {
        let conn = memory_conn()?;
        let table_sql = "CREATE TABLE vehicles (id INTEGER PRIMARY KEY, plate TEXT)";
        assert!(create_table(&conn, table_sql)?);
        assert!(!create_table(&conn, table_sql)?);

        let index_sql = "CREATE INDEX idx_vehicles_plate ON vehicles(plate)";
        assert!(create_index(&conn, index_sql)?);
        assert!(!create_index(&conn, index_sql)?);
        Ok(())
    }

    #[test]
    fn create_index_propagates_missing_column() -> Result<()> {
        let conn = memory_conn()?;
        let result = create_index(&conn, "CREATE INDEX idx_missing ON customers(missing_column)");
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn rebuild_table_makes_column_nullable_and_keeps_rows() -> Result<()> {
        let conn = memory_conn()?;
        conn.execute_batch(
            "CREATE INDEX idx_customers_name ON customers(name);
             INSERT INTO customers (id, name) VALUES (1, 'Ada'), (2, 'Grace');",
        )?;

        let copied = rebuild_table(
            &conn,
            "customers",
            "(id INTEGER PRIMARY KEY, name TEXT NULL, phone TEXT)",
        )?;
        assert_eq!(copied, 2);

        conn.execute("INSERT INTO customers (id, name) VALUES (3, NULL)", [])?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM customers", [], |row| row.get(0))?;
        assert_eq!(count, 3);
        assert!(column_exists(&conn, "customers", "phone")?);
        assert!(!table_exists(&conn, "customers__rebuild")?);

        let index_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_customers_name'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(index_count, 1);
        Ok(())
    }

    #[test]
    fn rebuild_table_keeps_children_of_a_parent_table() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut conn = Connection::open(dir.path().join("app.db"))?;
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE vehicles (
               id INTEGER PRIMARY KEY,
               customer_id INTEGER NOT NULL REFERENCES customers(id)
             );
             INSERT INTO customers (id, name) VALUES (1, 'Ada');
             INSERT INTO vehicles (id, customer_id) VALUES (10, 1);
             PRAGMA foreign_keys = OFF;",
        )?;

        let tx = conn.transaction()?;
        rebuild_table(&tx, "customers", "(id INTEGER PRIMARY KEY, name TEXT NULL)")?;
        tx.commit()?;

        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        assert!(foreign_key_violations(&conn)?.is_empty());
        let children: i64 =
            conn.query_row("SELECT COUNT(*) FROM vehicles WHERE customer_id = 1", [], |row| {
                row.get(0)
            })?;
        assert_eq!(children, 1);
        assert!(conn
            .execute("INSERT INTO vehicles (id, customer_id) VALUES (11, 99)", [])
            .is_err());
        Ok(())
    }

    #[test]
    fn rebuild_table_refuses_enforced_foreign_keys() -> Result<()> {
        let conn = memory_conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        assert!(rebuild_table(&conn, "customers", "(id INTEGER PRIMARY KEY)").is_err());
        assert!(table_exists(&conn, "customers")?);
        Ok(())
    }

    #[test]
    fn rebuild_table_reports_orphaned_children() -> Result<()> {
        let conn = memory_conn()?;
        conn.execute_batch(
            "CREATE TABLE vehicles (
               id INTEGER PRIMARY KEY,
               customer_id INTEGER REFERENCES customers(id)
             );
             INSERT INTO customers (id, name) VALUES (1, 'Ada');
             INSERT INTO vehicles (id, customer_id) VALUES (10, 1);",
        )?;
        // vehicles references customers(id), which the new definition no longer has.
        let result =
            rebuild_table(&conn, "customers", "(customer_key INTEGER PRIMARY KEY, name TEXT)");
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn rebuild_table_rejects_missing_table() -> Result<()> {
        let conn = memory_conn()?;
        assert!(rebuild_table(&conn, "vehicles", "(id INTEGER)").is_err());
        Ok(())
    }
}

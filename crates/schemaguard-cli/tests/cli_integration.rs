use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    _dir: TempDir,
    db: PathBuf,
    migrations: PathBuf,
    backups: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
        let migrations = dir.path().join("migrations");
        fs::create_dir_all(&migrations)
            .unwrap_or_else(|err| panic!("failed to create migrations dir: {err}"));
        Self {
            db: dir.path().join("app.db"),
            backups: dir.path().join("backups"),
            migrations,
            _dir: dir,
        }
    }

    fn write_migration(&self, name: &str, body: &str) {
        let path = self.migrations.join(name);
        fs::write(&path, body)
            .unwrap_or_else(|err| panic!("failed to write migration {}: {err}", path.display()));
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "--db".to_string(),
            path_str(&self.db).to_string(),
            "--migrations".to_string(),
            path_str(&self.migrations).to_string(),
            "--backup-dir".to_string(),
            path_str(&self.backups).to_string(),
            "--min-free-space-bytes".to_string(),
            "0".to_string(),
        ]
    }

    fn run(&self, command: &[&str]) -> Output {
        let mut args = self.base_args();
        args.extend(command.iter().map(ToString::to_string));
        run_schemaguard(args)
    }

    fn run_json(&self, command: &[&str]) -> Value {
        let output = self.run(command);
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            panic!(
                "schemaguard command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
                output.status, stdout, stderr
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        serde_json::from_str(&stdout)
            .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
    }
}

fn run_schemaguard<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_schemaguard"))
        .args(args)
        .env("SCHEMAGUARD_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute schemaguard binary: {err}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing bool field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn seed_three_migrations(workspace: &Workspace) {
    workspace.write_migration(
        "0001_create_customers.sql",
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);\n-- schemaguard:down\nDROP TABLE customers;\n",
    );
    workspace.write_migration(
        "0002_create_vehicles.sql",
        "CREATE TABLE vehicles (id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customers(id));",
    );
    workspace.write_migration(
        "0003_index_vehicles.sql",
        "CREATE INDEX idx_vehicles_customer ON vehicles(customer_id);",
    );
}

#[test]
fn status_reports_pending_migrations_on_fresh_database() {
    let workspace = Workspace::new();
    seed_three_migrations(&workspace);

    let status = workspace.run_json(&["status"]);
    assert_eq!(as_str(&status, "contract_version"), "cli.v1");
    assert_eq!(as_i64(&status, "current_version"), 0);
    assert_eq!(as_i64(&status, "latest_version"), 3);
    assert_eq!(as_i64(&status, "pending_count"), 3);
    assert!(!as_bool(&status, "up_to_date"));
    assert_eq!(as_str(&status["lock"], "state"), "unlocked");
}

#[test]
fn migrate_applies_once_then_reports_nothing_pending() {
    let workspace = Workspace::new();
    seed_three_migrations(&workspace);

    let first = workspace.run_json(&["migrate"]);
    assert_eq!(as_i64(&first, "applied_count"), 3);
    assert_eq!(as_i64(&first, "to_version"), 3);
    assert!(first["backup"].is_null());
    assert_eq!(as_str(&first, "checksum").len(), 64);

    let second = workspace.run_json(&["migrate"]);
    assert_eq!(as_i64(&second, "applied_count"), 0);

    let history = workspace.run_json(&["history"]);
    assert_eq!(as_i64(&history, "count"), 3);

    let verify = workspace.run_json(&["verify"]);
    assert!(as_bool(&verify, "intact"));

    let checksum = workspace.run_json(&["checksum"]);
    assert!(as_bool(&checksum, "matches_stored"));
}

#[test]
fn dry_run_leaves_version_untouched() {
    let workspace = Workspace::new();
    seed_three_migrations(&workspace);

    let report = workspace.run_json(&["migrate", "--dry-run"]);
    assert!(as_bool(&report, "dry_run"));
    assert_eq!(as_i64(&report, "applied_count"), 3);

    let status = workspace.run_json(&["status"]);
    assert_eq!(as_i64(&status, "current_version"), 0);
    assert_eq!(as_i64(&status, "pending_count"), 3);
}

#[test]
fn failing_migration_exits_non_zero_and_keeps_earlier_versions() {
    let workspace = Workspace::new();
    workspace.write_migration("0001_create_customers.sql", "CREATE TABLE customers (id INTEGER);");
    workspace.write_migration("0002_broken.sql", "ALTER TABLE missing_table ADD COLUMN x TEXT;");
    workspace.write_migration("0003_create_vehicles.sql", "CREATE TABLE vehicles (id INTEGER);");

    let output = workspace.run(&["migrate"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("MIGRATION_FAILED"), "unexpected stderr: {stderr}");

    let status = workspace.run_json(&["status"]);
    assert_eq!(as_i64(&status, "current_version"), 1);
    assert_eq!(as_str(&status["lock"], "state"), "unlocked");
}

#[test]
fn duplicate_versions_are_rejected() {
    let workspace = Workspace::new();
    workspace.write_migration("0001_create_customers.sql", "CREATE TABLE customers (id INTEGER);");
    workspace.write_migration("001_create_vehicles.sql", "CREATE TABLE vehicles (id INTEGER);");

    let output = workspace.run(&["status"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("INVALID_REGISTRY"), "unexpected stderr: {stderr}");
}

#[test]
fn backups_are_created_listed_and_pruned() {
    let workspace = Workspace::new();
    seed_three_migrations(&workspace);
    workspace.run_json(&["migrate"]);

    for _ in 0..4 {
        let created = workspace.run_json(&["--backup-retention", "2", "backup", "create"]);
        assert!(as_bool(&created, "created"));
    }

    let listed = workspace.run_json(&["--backup-retention", "2", "backup", "list"]);
    assert_eq!(as_i64(&listed, "count"), 2);

    let newest = listed["backups"][1]["path"]
        .as_str()
        .unwrap_or_else(|| panic!("missing backup path in payload: {listed}"))
        .to_string();
    let restored = workspace.run_json(&["backup", "restore", "--in", &newest]);
    assert_eq!(as_i64(&restored, "current_version"), 3);
}

#[test]
fn lock_status_and_release() {
    let workspace = Workspace::new();
    seed_three_migrations(&workspace);
    workspace.run_json(&["migrate"]);

    let state = workspace.run_json(&["lock", "status"]);
    assert_eq!(as_str(&state, "state"), "unlocked");

    let released = workspace.run_json(&["lock", "release"]);
    assert!(!as_bool(&released, "released"));
}

#[test]
fn legacy_database_is_converted_on_migrate() {
    let workspace = Workspace::new();
    seed_three_migrations(&workspace);
    {
        let conn = rusqlite::Connection::open(&workspace.db)
            .unwrap_or_else(|err| panic!("failed to open legacy db: {err}"));
        conn.execute_batch(
            "CREATE TABLE _schema_meta (key TEXT PRIMARY KEY, value TEXT);
             INSERT INTO _schema_meta VALUES ('schema_version', '2');
             CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE vehicles (id INTEGER PRIMARY KEY, customer_id INTEGER);",
        )
        .unwrap_or_else(|err| panic!("failed to seed legacy db: {err}"));
    }

    let status = workspace.run_json(&["status"]);
    assert_eq!(as_str(&status, "shape"), "legacy_kv");
    assert_eq!(as_i64(&status, "current_version"), 2);

    let preview = workspace.run_json(&["migrate", "--dry-run"]);
    assert_eq!(as_i64(&preview, "applied_count"), 1);
    assert_eq!(as_str(&preview["conversion"], "outcome"), "converted");
    let status = workspace.run_json(&["status"]);
    assert_eq!(as_str(&status, "shape"), "legacy_kv");

    let report = workspace.run_json(&["migrate"]);
    assert_eq!(as_i64(&report, "from_version"), 2);
    assert_eq!(as_i64(&report, "applied_count"), 1);
    assert!(report["backup"].is_string());
    assert_eq!(as_str(&report["conversion"], "outcome"), "converted");
    assert_eq!(as_i64(&report["conversion"], "legacy_version"), 2);

    let status = workspace.run_json(&["status"]);
    assert_eq!(as_str(&status, "shape"), "history");
    assert!(as_bool(&status, "up_to_date"));
}

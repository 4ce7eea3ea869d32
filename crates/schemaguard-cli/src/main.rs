mod config;
mod sql_dir;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use rusqlite::Connection;
use schemaguard_core::RunMode;
use schemaguard_store_sqlite::{checksum, MigrationError, Migrator, SqliteRegistry};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::config::{CliConfig, Overrides};

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "SCHEMAGUARD_LOG";

#[derive(Debug, Parser)]
#[command(name = "schemaguard")]
#[command(about = "Versioned schema migrations for SQLite databases")]
struct Cli {
    #[arg(long, default_value = "./app.db")]
    db: PathBuf,

    /// Directory of `NNNN_description.sql` migration files.
    #[arg(long)]
    migrations: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    backup_dir: Option<PathBuf>,

    #[arg(long)]
    backup_retention: Option<usize>,

    #[arg(long)]
    lock_stale_after_secs: Option<u64>,

    #[arg(long)]
    min_free_space_bytes: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Status,
    Migrate(MigrateArgs),
    Verify,
    Checksum,
    History,
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    Create,
    List,
    Restore(RestoreArgs),
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum LockCommand {
    Status,
    Release,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

/// Keep the typed error code visible in the CLI's error output.
fn fatal(err: MigrationError) -> anyhow::Error {
    let code = err.code();
    anyhow::Error::new(err).context(format!("schemaguard error {code}"))
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;
    Ok(conn)
}

fn build_migrator(cli: &Cli) -> Result<Migrator> {
    let config = CliConfig::load(cli.config.as_deref())?.with_overrides(Overrides {
        backup_dir: cli.backup_dir.clone(),
        backup_retention: cli.backup_retention,
        lock_stale_after_secs: cli.lock_stale_after_secs,
        min_free_space_bytes: cli.min_free_space_bytes,
    });

    let migrator = match cli.migrations.as_deref() {
        Some(dir) => Migrator::from_migrations(sql_dir::load_migrations(dir)?, config.migrator),
        None => Migrator::new(SqliteRegistry::empty(), config.migrator),
    }
    .map_err(fatal)?;

    Ok(migrator.with_database_path(&cli.db).with_legacy_profile(config.legacy))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let migrator = build_migrator(&cli)?;
    let mut conn = open_database(&cli.db)?;

    match &cli.command {
        Command::Status => run_status(&migrator, &conn),
        Command::Migrate(args) => run_migrate(args, &migrator, &mut conn),
        Command::Verify => run_verify(&migrator, &conn),
        Command::Checksum => run_checksum(&conn),
        Command::History => run_history(&migrator, &conn),
        Command::Backup { command } => run_backup(command, &migrator, &mut conn),
        Command::Lock { command } => run_lock(command, &migrator, &conn),
    }
}

fn run_status(migrator: &Migrator, conn: &Connection) -> Result<()> {
    let status = migrator.status(conn).map_err(fatal)?;
    let mut value = serde_json::to_value(&status).context("failed to serialize status")?;
    if let Value::Object(object) = &mut value {
        object.insert("up_to_date".to_string(), Value::Bool(status.pending.is_empty()));
    }
    emit_json(value)
}

fn run_migrate(args: &MigrateArgs, migrator: &Migrator, conn: &mut Connection) -> Result<()> {
    let mode = if args.dry_run { RunMode::DryRun } else { RunMode::Apply };
    let report = migrator.run(conn, mode).map_err(fatal)?;
    let mut value = serde_json::to_value(&report).context("failed to serialize run report")?;
    if let Value::Object(object) = &mut value {
        object.insert("applied_count".to_string(), Value::from(report.applied_count()));
    }
    emit_json(value)
}

fn run_verify(migrator: &Migrator, conn: &Connection) -> Result<()> {
    let intact = migrator.verify_schema_integrity(conn).map_err(fatal)?;
    let stored = checksum::stored_checksum(conn)?;
    emit_json(serde_json::json!({
        "intact": intact,
        "checksum": stored
    }))
}

fn run_checksum(conn: &Connection) -> Result<()> {
    let current = checksum::compute_checksum(conn)?;
    let stored = checksum::stored_checksum(conn)?;
    emit_json(serde_json::json!({
        "checksum": current,
        "stored": stored,
        "matches_stored": stored.as_deref() == Some(current.as_str())
    }))
}

fn run_history(migrator: &Migrator, conn: &Connection) -> Result<()> {
    let entries = migrator.history(conn).map_err(fatal)?;
    emit_json(serde_json::json!({
        "count": entries.len(),
        "entries": entries
    }))
}

fn run_backup(command: &BackupCommand, migrator: &Migrator, conn: &mut Connection) -> Result<()> {
    match command {
        BackupCommand::Create => {
            let created = migrator.create_backup(conn).map_err(fatal)?;
            emit_json(serde_json::json!({
                "created": created.is_some(),
                "backup_path": created
            }))
        }
        BackupCommand::List => {
            let backups = migrator.list_backups(conn).map_err(fatal)?;
            emit_json(serde_json::json!({
                "count": backups.len(),
                "backups": backups
            }))
        }
        BackupCommand::Restore(args) => {
            if !args.input.is_file() {
                return Err(anyhow!("backup file does not exist: {}", args.input.display()));
            }
            migrator.restore_backup(conn, &args.input).map_err(fatal)?;
            let status = migrator.status(conn).map_err(fatal)?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "latest_version": status.latest_version,
                "pending_count": status.pending_count
            }))
        }
    }
}

fn run_lock(command: &LockCommand, migrator: &Migrator, conn: &Connection) -> Result<()> {
    match command {
        LockCommand::Status => {
            let state = migrator.lock_state(conn).map_err(fatal)?;
            emit_json(serde_json::to_value(&state).context("failed to serialize lock state")?)
        }
        LockCommand::Release => {
            let released = migrator.force_release_lock(conn).map_err(fatal)?;
            emit_json(serde_json::json!({ "released": released }))
        }
    }
}

//! One-shot conversion of legacy `_schema_meta` bookkeeping into `schema_migrations`.

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use schemaguard_core::{
    ConversionOutcome, LegacyProfile, ProbeTarget, StructureProbe, VersionStoreShape,
};
use tracing::{info, warn};

use crate::ddl::{add_column, column_exists, table_exists};
use crate::version_store::{
    detect_shape, ensure_history_table, read_legacy_version, record_version,
};

const SAVEPOINT: &str = "legacy_conversion";

/// Version a legacy database reports once converted with `profile`.
#[must_use]
pub fn converted_version(profile: &LegacyProfile, legacy_version: i64) -> i64 {
    let backfilled = profile.backfill(legacy_version).last().map_or(0, |(version, _)| *version);
    let probed =
        profile.active_probes(legacy_version).map(|probe| probe.version).max().unwrap_or(0);
    backfilled.max(probed)
}

/// Normalise the version store to the `History` shape.
///
/// Idempotent. The legacy table is never dropped so it stays available for
/// audit. All writes happen under one savepoint, so the conversion is atomic
/// on its own and also nests inside a caller's transaction (dry runs).
///
/// # Errors
/// Returns an error when the legacy version is unreadable, a structure probe
/// cannot be repaired, or any write fails (nothing is committed in that case).
pub fn ensure_compatibility(
    conn: &Connection,
    profile: &LegacyProfile,
) -> Result<ConversionOutcome> {
    let Some(shape) = detect_shape(conn)? else {
        return Ok(ConversionOutcome::FreshDatabase);
    };
    if shape == VersionStoreShape::History {
        return Ok(ConversionOutcome::AlreadyCurrent);
    }

    let legacy_version = read_legacy_version(conn, shape)?;
    info!(shape = shape.as_str(), legacy_version, "converting legacy schema bookkeeping");

    conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT}"))
        .context("failed to start conversion savepoint")?;
    let (backfilled, repaired) = match convert(conn, profile, legacy_version) {
        Ok(done) => done,
        Err(err) => {
            if let Err(rollback_err) = conn
                .execute_batch(&format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT};"))
            {
                warn!(error = %rollback_err, "failed to roll back legacy conversion");
            }
            return Err(err);
        }
    };
    conn.execute_batch(&format!("RELEASE {SAVEPOINT}"))
        .context("failed to commit legacy conversion")?;

    let current_version = converted_version(profile, legacy_version);
    info!(
        legacy_version,
        current_version,
        backfilled,
        repaired = repaired.len(),
        "legacy schema bookkeeping converted"
    );

    Ok(ConversionOutcome::Converted {
        shape,
        legacy_version,
        current_version,
        backfilled,
        repaired,
    })
}

/// Backfill history rows and run the active probes. Returns the backfilled
/// row count and the names of the probes that created something.
fn convert(
    conn: &Connection,
    profile: &LegacyProfile,
    legacy_version: i64,
) -> Result<(usize, Vec<String>)> {
    ensure_history_table(conn)?;

    let rows = profile.backfill(legacy_version);
    for (version, name) in &rows {
        record_version(conn, *version, name)?;
    }

    let mut repaired = Vec::new();
    for probe in profile.active_probes(legacy_version) {
        if apply_probe(conn, probe)? {
            repaired.push(probe.name.clone());
        }
        record_version(conn, probe.version, &probe.name)?;
    }
    Ok((rows.len(), repaired))
}

/// Create the probed structure when it is absent. Returns `true` when something was created.
fn apply_probe(conn: &Connection, probe: &StructureProbe) -> Result<bool> {
    match &probe.target {
        ProbeTarget::Column { table, column, definition } => {
            if !table_exists(conn, table)? {
                return Err(anyhow!(
                    "legacy probe `{}` expects table {table}, which does not exist",
                    probe.name
                ));
            }
            if column_exists(conn, table, column)? {
                return Ok(false);
            }
            add_column(conn, table, definition)
        }
        ProbeTarget::Table { name, create_sql } => {
            if table_exists(conn, name)? {
                return Ok(false);
            }
            conn.execute_batch(create_sql).with_context(|| {
                format!("failed to create table {name} for probe `{}`", probe.name)
            })?;
            Ok(true)
        }
    }
}

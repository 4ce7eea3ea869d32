use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Generation of the version bookkeeping found in a database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStoreShape {
    /// `_schema_meta(key, value)` with the version stored as text under `schema_version`.
    LegacyKv,
    /// `_schema_meta(version INTEGER, applied_at)`, a single row replaced wholesale.
    SingleRow,
    /// `schema_migrations(version, name, applied_at)`, append-only.
    History,
}

impl VersionStoreShape {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LegacyKv => "legacy_kv",
            Self::SingleRow => "single_row",
            Self::History => "history",
        }
    }
}

/// Result of normalising the version store to the `History` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConversionOutcome {
    /// `schema_migrations` already exists.
    AlreadyCurrent,
    /// No bookkeeping at all: a brand-new database.
    FreshDatabase,
    Converted {
        shape: VersionStoreShape,
        legacy_version: i64,
        current_version: i64,
        backfilled: usize,
        repaired: Vec<String>,
    },
}

impl ConversionOutcome {
    #[must_use]
    pub fn is_converted(&self) -> bool {
        matches!(self, Self::Converted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyMapping {
    pub legacy_version: i64,
    pub version: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeTarget {
    /// A column added by a migration the legacy bookkeeping never recorded.
    /// `definition` is the `ADD COLUMN` clause, e.g. `moved_from TEXT NULL`.
    Column { table: String, column: String, definition: String },
    /// A table that must exist; `create_sql` may hold several statements (seed rows included).
    Table { name: String, create_sql: String },
}

/// Structure known to be introduced by a migration between two legacy releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureProbe {
    pub version: i64,
    pub name: String,
    pub target: ProbeTarget,
    /// Probe only runs when the legacy version is at least this value.
    #[serde(default)]
    pub min_legacy_version: i64,
}

/// Translation table from legacy version numbers to `History` rows.
///
/// Versions without an explicit mapping translate 1:1 with the name `legacy_v{n}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyProfile {
    pub mappings: Vec<LegacyMapping>,
    pub probes: Vec<StructureProbe>,
}

impl LegacyProfile {
    #[must_use]
    pub fn with_mapping(
        mut self,
        legacy_version: i64,
        version: i64,
        name: impl Into<String>,
    ) -> Self {
        self.mappings.push(LegacyMapping { legacy_version, version, name: name.into() });
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: StructureProbe) -> Self {
        self.probes.push(probe);
        self
    }

    /// Translate one legacy version number. The last mapping wins when a number is listed twice.
    #[must_use]
    pub fn translate(&self, legacy_version: i64) -> (i64, String) {
        self.mappings
            .iter()
            .rev()
            .find(|mapping| mapping.legacy_version == legacy_version)
            .map_or_else(
                || (legacy_version, format!("legacy_v{legacy_version}")),
                |mapping| (mapping.version, mapping.name.clone()),
            )
    }

    /// Synthetic history rows for every legacy version `1..=legacy_version`, ascending.
    #[must_use]
    pub fn backfill(&self, legacy_version: i64) -> Vec<(i64, String)> {
        let mut rows = BTreeMap::new();
        for legacy in 1..=legacy_version {
            let (version, name) = self.translate(legacy);
            rows.entry(version).or_insert(name);
        }
        rows.into_iter().collect()
    }

    /// Probes whose activation threshold is reached by `legacy_version`.
    pub fn active_probes(&self, legacy_version: i64) -> impl Iterator<Item = &StructureProbe> {
        self.probes.iter().filter(move |probe| probe.min_legacy_version <= legacy_version)
    }
}

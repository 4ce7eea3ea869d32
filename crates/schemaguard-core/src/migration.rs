use std::fmt::{Debug, Formatter};

use crate::CoreError;

/// Forward or inverse procedure of a migration, executed against a database handle.
pub type MigrationFn<C> = Box<dyn Fn(&C) -> anyhow::Result<()> + Send + Sync>;

/// One versioned, immutable unit of schema change.
///
/// The engine treats `up` as opaque: it only sequences it and wraps it in a
/// transaction. `down` is carried for hosts that ship a manual rollback tool.
pub struct Migration<C> {
    version: i64,
    description: String,
    up: MigrationFn<C>,
    down: Option<MigrationFn<C>>,
}

impl<C> Migration<C> {
    pub fn new<F>(version: i64, description: impl Into<String>, up: F) -> Self
    where
        F: Fn(&C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self { version, description: description.into(), up: Box::new(up), down: None }
    }

    #[must_use]
    pub fn with_down<F>(mut self, down: F) -> Self
    where
        F: Fn(&C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.down = Some(Box::new(down));
        self
    }

    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn has_down(&self) -> bool {
        self.down.is_some()
    }

    /// Run the forward procedure.
    ///
    /// # Errors
    /// Returns whatever error the migration author's `up` procedure reports.
    pub fn apply(&self, handle: &C) -> anyhow::Result<()> {
        (self.up)(handle)
    }

    /// Run the inverse procedure, if the migration has one.
    pub fn revert(&self, handle: &C) -> Option<anyhow::Result<()>> {
        self.down.as_ref().map(|down| down(handle))
    }
}

impl<C> Debug for Migration<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("has_down", &self.down.is_some())
            .finish_non_exhaustive()
    }
}

/// Host-supplied migrations, validated and sorted by version.
///
/// Versions must be positive and unique; a collision is a startup error
/// rather than something the engine resolves by picking one.
pub struct Registry<C> {
    migrations: Vec<Migration<C>>,
}

impl<C> Registry<C> {
    /// Validate and sort a set of migrations.
    ///
    /// # Errors
    /// Returns an error for non-positive versions or when two migrations share a version.
    pub fn new(mut migrations: Vec<Migration<C>>) -> Result<Self, CoreError> {
        if let Some(invalid) = migrations.iter().find(|migration| migration.version <= 0) {
            return Err(CoreError::InvalidVersion {
                version: invalid.version,
                description: invalid.description.clone(),
            });
        }

        migrations.sort_by_key(|migration| migration.version);

        for pair in migrations.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(CoreError::DuplicateVersion {
                    version: pair[0].version,
                    first: pair[0].description.clone(),
                    second: pair[1].description.clone(),
                });
            }
        }

        Ok(Self { migrations })
    }

    #[must_use]
    pub fn empty() -> Self {
        Self { migrations: Vec::new() }
    }

    #[must_use]
    pub fn latest_version(&self) -> i64 {
        self.migrations.last().map_or(0, |migration| migration.version)
    }

    /// Migrations with a version above `current`, ascending.
    #[must_use]
    pub fn pending(&self, current: i64) -> Vec<&Migration<C>> {
        self.migrations.iter().filter(|migration| migration.version > current).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration<C>> {
        self.migrations.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl<C> Debug for Registry<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.migrations.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use proptest::prelude::*;

    use super::*;

    fn noop(version: i64, description: &str) -> Migration<()> {
        Migration::new(version, description, |_: &()| Ok(()))
    }

    #[test]
    fn registry_sorts_out_of_order_input() -> Result<(), CoreError> {
        let registry = Registry::new(vec![noop(3, "c"), noop(1, "a"), noop(2, "b")])?;
        let versions = registry.iter().map(Migration::version).collect::<Vec<_>>();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(registry.latest_version(), 3);
        Ok(())
    }

    #[test]
    fn registry_rejects_duplicate_versions() {
        let result = Registry::new(vec![
            noop(12, "weekly hours"),
            noop(11, "external url"),
            noop(12, "computed durations"),
        ]);
        assert_eq!(
            result.err(),
            Some(CoreError::DuplicateVersion {
                version: 12,
                first: "weekly hours".to_string(),
                second: "computed durations".to_string(),
            })
        );
    }

    #[test]
    fn registry_rejects_non_positive_versions() {
        let result = Registry::new(vec![noop(0, "zero")]);
        assert!(matches!(result, Err(CoreError::InvalidVersion { version: 0, .. })));
    }

    #[test]
    fn pending_returns_versions_above_current() -> Result<(), CoreError> {
        let registry = Registry::new(vec![noop(1, "a"), noop(2, "b"), noop(5, "e")])?;
        let pending = registry.pending(1).iter().map(|m| m.version()).collect::<Vec<_>>();
        assert_eq!(pending, vec![2, 5]);
        assert!(registry.pending(5).is_empty());
        let descriptions =
            registry.pending(0).into_iter().map(Migration::description).collect::<Vec<_>>();
        assert_eq!(descriptions, vec!["a", "b", "e"]);
        Ok(())
    }

    #[test]
    fn empty_registry_has_latest_version_zero() {
        let registry: Registry<()> = Registry::empty();
        assert_eq!(registry.latest_version(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn apply_and_revert_invoke_procedures() -> anyhow::Result<()> {
        let calls = RefCell::new(Vec::new());
        let migration = Migration::new(1, "log", |log: &RefCell<Vec<&'static str>>| {
            log.borrow_mut().push("up");
            Ok(())
        })
        .with_down(|log: &RefCell<Vec<&'static str>>| {
            log.borrow_mut().push("down");
            Ok(())
        });

        migration.apply(&calls)?;
        migration.revert(&calls).transpose()?;
        assert!(migration.has_down());
        assert_eq!(*calls.borrow(), vec!["up", "down"]);
        Ok(())
    }

    proptest! {
        #[test]
        fn property_registry_order_is_strictly_increasing(versions in proptest::collection::hash_set(1_i64..10_000, 0..40)) {
            let migrations = versions.iter().map(|version| noop(*version, "generated")).collect::<Vec<_>>();
            let registry = Registry::new(migrations).map_err(|err| TestCaseError::fail(err.to_string()))?;
            let ordered = registry.iter().map(Migration::version).collect::<Vec<_>>();
            prop_assert!(ordered.windows(2).all(|pair| pair[0] < pair[1]));
            prop_assert_eq!(ordered.len(), versions.len());
        }
    }
}

use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::CoreError;

/// `prefix + YYYYMMDDTHHMMSS-ffffffZ + extension`, always in UTC.
///
/// Fixed-width digits on a single clock keep lexical order equal to
/// chronological order, also across DST changes and hosts with different offsets.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn backup_file_name(
    prefix: &str,
    extension: &str,
    at: OffsetDateTime,
) -> Result<String, CoreError> {
    let stamp = at
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year][month][day]T[hour][minute][second]-[subsecond digits:6]Z"
        ))
        .map_err(|err| CoreError::Timestamp(err.to_string()))?;
    Ok(format!("{prefix}{stamp}{extension}"))
}

#[must_use]
pub fn is_backup_file_name(name: &str, prefix: &str, extension: &str) -> bool {
    name.len() > prefix.len() + extension.len()
        && name.starts_with(prefix)
        && name.ends_with(extension)
}

/// Names to delete so that only the newest `retain` backups remain, oldest first.
#[must_use]
pub fn select_for_pruning(names: &[String], retain: usize) -> Vec<String> {
    let mut sorted = names.to_vec();
    sorted.sort();
    sorted.dedup();
    let excess = sorted.len().saturating_sub(retain);
    sorted.truncate(excess);
    sorted
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn name_is_zero_padded_and_locale_independent() -> Result<(), CoreError> {
        let name = backup_file_name("backup_", ".db", datetime!(2026-02-04 10:02:03.000045 UTC))?;
        assert_eq!(name, "backup_20260204T100203-000045Z.db");
        assert!(is_backup_file_name(&name, "backup_", ".db"));
        Ok(())
    }

    #[test]
    fn lexical_order_follows_time() -> Result<(), CoreError> {
        let earlier = backup_file_name("b_", ".db", datetime!(2026-09-30 23:59:59.999999 UTC))?;
        let later = backup_file_name("b_", ".db", datetime!(2026-10-01 00:00:00 UTC))?;
        assert!(earlier < later);
        Ok(())
    }

    #[test]
    fn offsets_are_normalised_to_utc() -> Result<(), CoreError> {
        let local = backup_file_name("b_", ".db", datetime!(2026-10-25 01:30:00 +02:00))?;
        let utc = backup_file_name("b_", ".db", datetime!(2026-10-24 23:30:00 UTC))?;
        assert_eq!(local, utc);
        assert_eq!(local, "b_20261024T233000-000000Z.db");

        // Wall-clock order and instant order disagree here; the names follow the instant.
        let first = backup_file_name("b_", ".db", datetime!(2026-10-25 02:45:00 +02:00))?;
        let second = backup_file_name("b_", ".db", datetime!(2026-10-25 02:15:00 +01:00))?;
        assert!(first < second);
        Ok(())
    }

    #[test]
    fn foreign_files_are_not_backups() {
        assert!(!is_backup_file_name("notes.txt", "backup_", ".db"));
        assert!(!is_backup_file_name("backup_.db", "backup_", ".db"));
        assert!(!is_backup_file_name("backup_20260204T100203-000045Z.db-wal", "backup_", ".db"));
    }

    #[test]
    fn pruning_removes_oldest() {
        let names = ["backup_3.db", "backup_1.db", "backup_2.db", "backup_4.db"]
            .map(str::to_string)
            .to_vec();
        assert_eq!(select_for_pruning(&names, 2), vec!["backup_1.db", "backup_2.db"]);
        assert!(select_for_pruning(&names, 10).is_empty());
    }

    proptest! {
        #[test]
        fn property_pruning_keeps_newest_n(stamps in proptest::collection::btree_set(0_u32..1_000_000, 0..30), retain in 1_usize..12) {
            let names = stamps.iter().map(|stamp| format!("backup_{stamp:08}.db")).collect::<Vec<_>>();
            let pruned = select_for_pruning(&names, retain);
            let kept = names.iter().filter(|name| !pruned.contains(name)).cloned().collect::<Vec<_>>();
            prop_assert_eq!(kept.len(), names.len().min(retain));
            let newest = names.iter().rev().take(retain).cloned().collect::<Vec<_>>();
            prop_assert!(kept.iter().all(|name| newest.contains(name)));
        }
    }
}

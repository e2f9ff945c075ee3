//! Namespaced key-value settings.
//!
//! Settings are stored as strings in the `settings` table, one row per
//! `(namespace, key)`. The store itself keeps its bookkeeping under the
//! [`DB_SETTINGS_NAMESPACE`] namespace.

use crate::error::{CoreError, CoreResult};
use crate::transaction::TransactionCoordinator;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::sync::Arc;
use talkvault_storage::Connection;

/// Namespace holding the store's own bookkeeping.
pub const DB_SETTINGS_NAMESPACE: &str = "db";

/// Key of the stored schema version.
pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";

/// Key of the last compaction time in epoch millis.
pub const LAST_COMPACTED_KEY: &str = "lastCompacted";

/// An ordered map of string settings with typed accessors.
///
/// Typed getters fall back to the supplied default when a key is missing or
/// its value does not parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    entries: BTreeMap<String, String>,
}

impl Settings {
    /// Creates an empty settings map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the raw value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Sets the raw value for `key`.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Returns `key` as an `i32`.
    #[must_use]
    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Sets `key` to an `i32`.
    pub fn put_int(&mut self, key: impl Into<String>, value: i32) {
        self.put(key, value.to_string());
    }

    /// Returns `key` as an `i64`.
    #[must_use]
    pub fn get_long(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Sets `key` to an `i64`.
    pub fn put_long(&mut self, key: impl Into<String>, value: i64) {
        self.put(key, value.to_string());
    }

    /// Returns `key` as a `bool`.
    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Sets `key` to a `bool`.
    pub fn put_bool(&mut self, key: impl Into<String>, value: bool) {
        self.put(key, value.to_string());
    }

    /// Copies every entry of `other` into `self`, overwriting existing keys.
    pub fn merge(&mut self, other: &Settings) {
        for (k, v) in &other.entries {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.entries.iter()
    }
}

impl From<BTreeMap<String, String>> for Settings {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }
}

impl<'a> IntoIterator for &'a Settings {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Reads every setting under `namespace`.
pub(crate) fn read_settings(conn: &mut dyn Connection, namespace: &str) -> CoreResult<Settings> {
    Ok(conn.get_settings(namespace)?.into())
}

/// Writes `settings` under `namespace`, updating existing keys and inserting
/// new ones.
///
/// Each update must touch at most one row and each insert exactly one;
/// anything else means the table is inconsistent.
pub(crate) fn write_settings(
    conn: &mut dyn Connection,
    settings: &Settings,
    namespace: &str,
) -> CoreResult<()> {
    let mut missing = Vec::new();
    for (key, value) in settings {
        match conn.update_setting(namespace, key, value)? {
            0 => missing.push((key, value)),
            1 => {}
            n => {
                return Err(CoreError::db_state(format!(
                    "update of {namespace}/{key} affected {n} rows"
                )))
            }
        }
    }
    for (key, value) in missing {
        let n = conn.insert_setting(namespace, key, value)?;
        if n != 1 {
            return Err(CoreError::db_state(format!(
                "insert of {namespace}/{key} affected {n} rows"
            )));
        }
    }
    Ok(())
}

/// Broadcast after a transaction that changed a settings namespace commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsUpdatedEvent {
    /// The namespace that changed.
    pub namespace: String,
    /// Every setting in the namespace after the change.
    pub settings: Settings,
}

/// Settings access for code that is not already inside a transaction.
///
/// Each call runs in its own transaction.
#[derive(Debug, Clone)]
pub struct SettingsManager {
    coordinator: Arc<TransactionCoordinator>,
}

impl SettingsManager {
    /// Creates a manager over `coordinator`.
    #[must_use]
    pub fn new(coordinator: Arc<TransactionCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Reads every setting under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn get_settings(&self, namespace: &str) -> CoreResult<Settings> {
        self.coordinator
            .transaction_with_result(true, |txn| txn.get_settings(namespace))
    }

    /// Merges `settings` into `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn merge_settings(&self, settings: &Settings, namespace: &str) -> CoreResult<()> {
        self.coordinator
            .transaction(false, |txn| txn.merge_settings(settings, namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use talkvault_storage::{Backend, InMemoryBackend};

    #[test]
    fn typed_accessors_fall_back_on_garbage() {
        let mut s = Settings::new();
        s.put_int("version", 3);
        s.put_long("ts", 1_700_000_000_000);
        s.put_bool("flag", true);
        s.put("broken", "not a number");

        assert_eq!(s.get_int("version", -1), 3);
        assert_eq!(s.get_long("ts", 0), 1_700_000_000_000);
        assert!(s.get_bool("flag", false));
        assert_eq!(s.get_int("broken", -1), -1);
        assert_eq!(s.get_long("missing", 7), 7);
    }

    #[test]
    fn write_settings_updates_then_inserts() {
        let backend = InMemoryBackend::new();
        backend.put_setting("ns", "a", "old");
        let mut conn = backend.connect(&[0; 32]).unwrap();
        conn.begin().unwrap();

        let mut s = Settings::new();
        s.put("a", "new");
        s.put("b", "fresh");
        write_settings(conn.as_mut(), &s, "ns").unwrap();
        conn.commit().unwrap();

        assert_eq!(backend.setting("ns", "a").as_deref(), Some("new"));
        assert_eq!(backend.setting("ns", "b").as_deref(), Some("fresh"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn merge_matches_stored_result(
            old in prop::collection::btree_map("[a-d]{1,2}", "[0-9]{1,3}", 0..6),
            new in prop::collection::btree_map("[a-d]{1,2}", "[0-9]{1,3}", 0..6),
        ) {
            let backend = InMemoryBackend::new();
            for (k, v) in &old {
                backend.put_setting("ns", k, v);
            }
            let mut conn = backend.connect(&[0; 32]).unwrap();
            conn.begin().unwrap();
            write_settings(conn.as_mut(), &Settings::from(new.clone()), "ns").unwrap();
            let stored = read_settings(conn.as_mut(), "ns").unwrap();
            conn.commit().unwrap();

            let mut expected = Settings::from(old);
            expected.merge(&Settings::from(new));
            prop_assert_eq!(stored, expected);
        }
    }
}

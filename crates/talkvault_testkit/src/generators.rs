//! Property-based test generators using proptest.

use proptest::prelude::*;
use talkvault_core::settings::Settings;

/// Strategy for settings namespaces.
pub fn namespace_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for settings with up to `max_len` entries drawn from a small
/// key space, so that generated maps overlap.
pub fn settings_strategy(max_len: usize) -> impl Strategy<Value = Settings> {
    prop::collection::btree_map("k[0-7]", "[ -~]{0,12}", 0..=max_len).prop_map(Settings::from)
}

/// Strategy for a sequence of merges into random namespaces.
pub fn merge_sequence_strategy() -> impl Strategy<Value = Vec<(String, Settings)>> {
    prop::collection::vec(
        (prop::sample::select(vec!["a", "b", "c"]).prop_map(String::from), settings_strategy(4)),
        1..8,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestStore;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use talkvault_core::settings::SettingsUpdatedEvent;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn stored_settings_follow_merges(merges in merge_sequence_strategy()) {
            let store = TestStore::memory();
            store.open().unwrap();
            let mut expected: BTreeMap<String, Settings> = BTreeMap::new();

            for (namespace, update) in &merges {
                let entry = expected.entry(namespace.clone()).or_default();
                let before = entry.clone();
                entry.merge(update);
                let changed = *entry != before;

                store
                    .coordinator
                    .transaction(false, |txn| txn.merge_settings(update, namespace))
                    .unwrap();

                if changed {
                    let event = store.next_event();
                    let update_event = event.downcast_ref::<SettingsUpdatedEvent>().unwrap();
                    prop_assert_eq!(&update_event.namespace, namespace);
                    prop_assert_eq!(&update_event.settings, &*entry);
                } else {
                    prop_assert!(store.no_event_within(Duration::from_millis(20)));
                }
            }

            for (namespace, settings) in &expected {
                let stored = store
                    .coordinator
                    .transaction_with_result(true, |txn| txn.get_settings(namespace))
                    .unwrap();
                prop_assert_eq!(&stored, settings);
            }
        }
    }
}

//! Property-based tests for local stores

use std::collections::{BTreeMap, HashSet};

use proptest::prelude::*;
use serde_json::json;
use virtool_sync::client::{CollectionDefinition, LocalStore};

use crate::common::doc;

fn upserts() -> impl Strategy<Value = Vec<(u8, u64)>> {
    prop::collection::vec((0u8..8, 0u64..20), 0..60)
}

proptest! {
    #[test]
    fn test_stored_version_is_the_highest_seen(ops in upserts()) {
        let mut store = LocalStore::new(CollectionDefinition::new("jobs"));
        let mut highest: BTreeMap<String, u64> = BTreeMap::new();

        for (id, version) in &ops {
            let id = format!("j{}", id);
            store.insert(doc(json!({"_id": id, "_version": version})));
            let entry = highest.entry(id).or_insert(*version);
            *entry = (*entry).max(*version);
        }

        prop_assert_eq!(store.manifest(), highest);
    }

    #[test]
    fn test_unique_field_never_repeats(names in prop::collection::vec(0u8..5, 0..40)) {
        let mut store = LocalStore::new(CollectionDefinition::new("viruses").unique(&["name"]));
        for (i, name) in names.iter().enumerate() {
            store.insert(doc(json!({"_id": format!("v{}", i), "name": format!("virus {}", name)})));
        }

        let mut seen = HashSet::new();
        for document in store.all().data() {
            let name = document.get("name").map(|value| value.to_string());
            prop_assert!(seen.insert(name), "duplicate name in {}", document.id());
        }
        let distinct: HashSet<u8> = names.iter().copied().collect();
        prop_assert_eq!(store.len(), distinct.len());

        // The last writer of each value holds it.
        let mut last_writer: BTreeMap<u8, usize> = BTreeMap::new();
        for (i, name) in names.iter().enumerate() {
            last_writer.insert(*name, i);
        }
        for (name, i) in last_writer {
            let owner = store.by("name", &json!(format!("virus {}", name))).map(|d| d.id().to_string());
            prop_assert_eq!(owner, Some(format!("v{}", i)));
        }
    }

    #[test]
    fn test_remove_is_idempotent(ids in prop::collection::vec(0u8..10, 0..20), gone in prop::collection::vec(0u8..10, 0..10)) {
        let mut store = LocalStore::new(CollectionDefinition::new("samples").indexed(&["host"]));
        for id in &ids {
            store.insert(doc(json!({"_id": format!("s{}", id), "host": "wheat"})));
        }
        let gone: Vec<String> = gone.iter().map(|id| format!("s{}", id)).collect();

        store.remove(&gone);
        let after_first = store.manifest();
        prop_assert_eq!(store.remove(&gone), 0);
        prop_assert_eq!(store.manifest(), after_first);

        let hosted = store.find(&json!({"host": "wheat"})).map(|cursor| cursor.count());
        prop_assert_eq!(hosted.ok(), Some(store.len()));
    }
}

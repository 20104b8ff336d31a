//! Property-based tests for the transaction registry

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use proptest::prelude::*;
use serde_json::json;
use virtool_sync::client::transaction::{Outcome, Responder, TransactionRegistry};

/// Counts how many times each request was answered
struct Recorder {
    index: usize,
    calls: Arc<Mutex<Vec<usize>>>,
}

impl Responder for Recorder {
    fn respond(self, _outcome: Outcome) {
        self.calls.lock().unwrap()[self.index] += 1;
    }
}

proptest! {
    #[test]
    fn test_pending_ids_are_unique(seed in any::<u64>(), count in 1usize..200) {
        let mut registry = TransactionRegistry::with_seed(Duration::from_secs(30), seed);
        let now = Instant::now();
        let tids: HashSet<_> = (0..count).map(|_| registry.register((), now)).collect();

        prop_assert_eq!(tids.len(), count);
        prop_assert!(!tids.contains(&0));
        prop_assert_eq!(registry.len(), count);
    }

    #[test]
    fn test_each_request_resolves_once(seed in any::<u64>(), count in 1usize..30, replies in prop::collection::vec(any::<prop::sample::Index>(), 0..60)) {
        let calls = Arc::new(Mutex::new(vec![0usize; count]));
        let mut registry = TransactionRegistry::with_seed(Duration::from_secs(30), seed);
        let now = Instant::now();
        let tids: Vec<_> = (0..count)
            .map(|index| registry.register(Recorder { index, calls: calls.clone() }, now))
            .collect();

        // Duplicate replies are ignored.
        for reply in &replies {
            registry.resolve(tids[reply.index(count)], true, json!(null));
        }
        for (_, responder) in registry.expire(now + Duration::from_secs(30)) {
            responder.respond(Err(virtool_sync::shared::TransactionError::Timeout));
        }

        prop_assert!(registry.is_empty());
        prop_assert!(calls.lock().unwrap().iter().all(|&n| n == 1));
    }
}

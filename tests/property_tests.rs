//! Property-based tests for rabia-consensus
//!
//! Invariants of the pure building blocks: quorum arithmetic, backoff
//! schedules, batch identity and ordering, vote tallies and the bounded
//! bookkeeping maps.

use proptest::collection::vec;
use proptest::prelude::*;
use rabia_consensus::batch::{Batch, BatchId};
use rabia_consensus::bounded::BoundedMap;
use rabia_consensus::engine::coin;
use rabia_consensus::engine::pending::{Admission, PendingQueue};
use rabia_consensus::engine::phase::{ProposalTally, VoteTally};
use rabia_consensus::messages::StateValue;
use rabia_consensus::topology::backoff::BackoffStrategy;
use rabia_consensus::topology::quorum::Quorum;
use rabia_consensus::types::{NodeId, Phase};
use std::collections::HashSet;
use std::time::Duration;

fn state_value() -> impl Strategy<Value = StateValue> {
    prop_oneof![
        Just(StateValue::V0),
        Just(StateValue::V1),
        Just(StateValue::VQuestion),
    ]
}

fn commands() -> impl Strategy<Value = Vec<String>> {
    vec("[a-z]{1,8}", 1..5)
}

mod quorum_tests {
    use super::*;

    proptest! {
        #[test]
        fn any_two_quorums_intersect(n in 1usize..200) {
            let quorum = Quorum::new(n);
            prop_assert!(2 * quorum.quorum_size() > n);
            prop_assert!(quorum.quorum_size() <= n);
        }

        #[test]
        fn tolerated_failures_leave_a_quorum(n in 1usize..200) {
            let quorum = Quorum::new(n);
            prop_assert!(quorum.is_quorum(n - quorum.max_failures()));
            prop_assert!(!quorum.is_quorum(n - quorum.max_failures() - 1));
            prop_assert_eq!(quorum.super_majority_size(), n - quorum.max_failures());
        }

        #[test]
        fn f_plus_one_is_seen_by_every_quorum(n in 1usize..200) {
            let quorum = Quorum::new(n);
            // A value held by f+1 nodes cannot be missed by any quorum
            prop_assert!(quorum.f_plus_one() + quorum.quorum_size() > n);
            prop_assert!(quorum.f_plus_one() >= 1);
        }
    }
}

mod backoff_tests {
    use super::*;

    fn strategy() -> impl Strategy<Value = BackoffStrategy> {
        (1u64..1_000, 1u64..100, 1.0f64..4.0, 0.0f64..=1.0).prop_map(
            |(initial_ms, spread, factor, jitter)| BackoffStrategy {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(initial_ms * spread),
                factor,
                jitter,
            },
        )
    }

    proptest! {
        #[test]
        fn base_delay_is_monotone_and_capped(strategy in strategy(), attempts in 1u32..80) {
            let current = strategy.base_delay(attempts);
            let next = strategy.base_delay(attempts + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= strategy.max_delay);
        }

        #[test]
        fn jitter_stays_within_bounds(strategy in strategy(), attempts in 1u32..40) {
            let base = strategy.base_delay(attempts);
            let timeout = strategy.next_timeout(attempts);
            prop_assert!(timeout >= base);
            prop_assert!(timeout <= strategy.max_delay);
        }
    }
}

mod batch_tests {
    use super::*;

    proptest! {
        #[test]
        fn id_depends_only_on_commands(cmds in commands(), t1 in 0u64..1000, t2 in 0u64..1000) {
            let a = Batch::new(cmds.clone(), t1).unwrap();
            let b = Batch::new(cmds.clone(), t2).unwrap();
            prop_assert_eq!(a.id(), b.id());
            prop_assert_eq!(a.id(), BatchId::for_commands(&cmds).unwrap());
            prop_assert!(!a.id().is_empty_sentinel());
        }

        #[test]
        fn merge_keeps_earliest_stamp_and_all_correlations(
            cmds in commands(),
            t1 in 0u64..1000,
            t2 in 0u64..1000,
        ) {
            let a = Batch::new(cmds.clone(), t1).unwrap();
            let b = Batch::new(cmds, t2).unwrap();
            let merged = a.merge_with(&b).unwrap();
            prop_assert_eq!(merged.timestamp(), t1.min(t2));
            prop_assert_eq!(merged.correlation_ids().len(), 2);
            prop_assert_eq!(merged.commands(), a.commands());
        }

        #[test]
        fn pending_queue_yields_in_order(
            batches in vec((commands(), 0u64..50), 1..30),
        ) {
            let mut queue = PendingQueue::new(1_000);
            let mut distinct = HashSet::new();
            for (cmds, ts) in &batches {
                let batch = Batch::new(cmds.clone(), *ts).unwrap();
                let admission = queue.insert(batch.clone());
                if distinct.insert(batch.id()) {
                    prop_assert_eq!(admission, Admission::Added);
                } else {
                    prop_assert_eq!(admission, Admission::Merged);
                }
            }
            prop_assert_eq!(queue.len(), distinct.len());

            let mut previous = None;
            while let Some(batch) = queue.peek_min().cloned() {
                let key = batch.order_key();
                if let Some(previous) = previous {
                    prop_assert!(previous < key);
                }
                previous = Some(key);
                queue.remove(&batch.id());
            }
            prop_assert!(queue.is_empty());
        }
    }

    #[test]
    fn merge_rejects_different_ids() {
        let a = Batch::new(vec!["a".to_string()], 1).unwrap();
        let b = Batch::new(vec!["b".to_string()], 1).unwrap();
        assert!(a.merge_with(&b).is_none());
    }
}

mod tally_tests {
    use super::*;

    proptest! {
        #[test]
        fn first_vote_per_sender_counts(votes in vec((1u64..8, state_value()), 0..40)) {
            let mut tally: VoteTally<String> = VoteTally::new();
            let mut seen = HashSet::new();
            let mut expected = [0usize; 3];
            for (sender, value) in &votes {
                let fresh = seen.insert(*sender);
                prop_assert_eq!(tally.record(NodeId::new(*sender), *value, None), fresh);
                if fresh {
                    match value {
                        StateValue::V0 => expected[0] += 1,
                        StateValue::V1 => expected[1] += 1,
                        StateValue::VQuestion => expected[2] += 1,
                    }
                }
            }
            prop_assert_eq!(tally.total(), seen.len());
            prop_assert_eq!(tally.count(StateValue::V0), expected[0]);
            prop_assert_eq!(tally.count(StateValue::V1), expected[1]);
            prop_assert_eq!(tally.count(StateValue::VQuestion), expected[2]);
        }

        #[test]
        fn proposal_majority_needs_threshold(
            proposals in vec((1u64..8, 0usize..3), 0..20),
            threshold in 1usize..6,
        ) {
            let candidates: Vec<Batch<String>> = (0..3)
                .map(|i| Batch::new(vec![format!("candidate-{i}")], 1).unwrap())
                .collect();
            let mut tally = ProposalTally::new();
            for (sender, choice) in &proposals {
                tally.record(NodeId::new(*sender), candidates[*choice].clone());
            }
            match tally.majority(threshold) {
                Some(batch) => prop_assert!(tally.count(&batch.id()) >= threshold),
                None => {
                    for candidate in &candidates {
                        prop_assert!(tally.count(&candidate.id()) < threshold);
                    }
                }
            }
        }

        #[test]
        fn coin_is_binary_and_deterministic(phase in 0u64..10_000, iteration in 0u32..64) {
            let first = coin(Phase::new(phase), iteration);
            prop_assert_eq!(first, coin(Phase::new(phase), iteration));
            prop_assert!(first != StateValue::VQuestion);
        }
    }
}

mod bounded_tests {
    use super::*;

    proptest! {
        #[test]
        fn never_exceeds_capacity(capacity in 1usize..16, keys in vec(0u32..64, 0..200)) {
            let mut map = BoundedMap::new(capacity);
            for key in keys {
                map.insert(key, key * 2);
                prop_assert!(map.len() <= capacity);
                prop_assert_eq!(map.peek(&key), Some(&(key * 2)));
            }
        }

        #[test]
        fn evicts_least_recently_inserted(capacity in 1usize..16) {
            let mut map = BoundedMap::new(capacity);
            for key in 0..capacity {
                prop_assert!(map.insert(key, ()).is_none());
            }
            let evicted = map.insert(capacity, ());
            prop_assert_eq!(evicted.map(|(k, _)| k), Some(0));
            prop_assert!(!map.contains_key(&0));
        }
    }
}

//! Whole-cluster scenarios on the seeded simulator
//!
//! Every scenario runs several engines over a lossy simulated network and
//! checks that all honest nodes apply the same gap-free command sequence.

use rabia_consensus::engine::EngineMode;
use rabia_consensus::test_helpers::{LogMachine, SimCluster, SimConfig};
use std::collections::HashSet;

fn all_active(cluster: &SimCluster<LogMachine>) -> bool {
    cluster.statuses().iter().all(|s| s.mode == EngineMode::Active)
}

fn entries(cluster: &SimCluster<LogMachine>, index: usize) -> Vec<String> {
    cluster
        .state(index)
        .map(|log| log.entries.clone())
        .unwrap_or_default()
}

/// Whether every pair of running nodes applied the same log up to the shorter one
fn logs_are_prefixes(cluster: &SimCluster<LogMachine>) -> bool {
    let logs: Vec<Vec<String>> = (0..cluster.size())
        .filter(|index| cluster.engine(*index).is_some())
        .map(|index| entries(cluster, index))
        .collect();
    logs.iter().all(|a| {
        logs.iter().all(|b| {
            let common = a.len().min(b.len());
            a[..common] == b[..common]
        })
    })
}

fn step_checked(cluster: &mut SimCluster<LogMachine>, ticks: u64) {
    for _ in 0..ticks {
        cluster.step();
        assert!(
            logs_are_prefixes(cluster),
            "logs forked at tick {}: {:?}",
            cluster.ticks(),
            (0..cluster.size()).map(|i| entries(cluster, i)).collect::<Vec<_>>()
        );
    }
}

#[test]
fn thousand_batches_under_loss_and_duplication() {
    let config = SimConfig::default()
        .with_seed(2024)
        .with_loss(0.05)
        .with_duplication(0.01);
    let mut cluster = SimCluster::<LogMachine>::with_config(5, config).unwrap();
    assert!(cluster.run_until(2_000, all_active));

    for i in 0..1000 {
        cluster.submit(i % 5, vec![format!("cmd-{i}")]).unwrap();
        cluster.run_ticks(2);
    }
    assert!(
        cluster.run_until_converged(200_000),
        "cluster did not converge: {:#?}",
        cluster.statuses()
    );
    cluster.assert_all_nodes_agree();

    let log = entries(&cluster, 0);
    assert_eq!(log.len(), 1000);
    let distinct: HashSet<&String> = log.iter().collect();
    assert_eq!(distinct.len(), 1000, "a command was applied twice");
    for index in 1..5 {
        assert_eq!(entries(&cluster, index), log);
    }

    let stats = cluster.stats();
    assert!(stats.lost > 0);
    assert!(stats.duplicated > 0);
}

#[test]
fn minority_partition_catches_up_after_heal() {
    let config = SimConfig::default().with_seed(7).with_loss(0.02);
    let mut cluster = SimCluster::<LogMachine>::with_config(5, config).unwrap();
    assert!(cluster.run_until(2_000, all_active));

    cluster.create_network_partition(&[0, 1]);
    assert!(cluster.run_until(100, |c| {
        c.engine(0).map(|e| e.mode()) == Some(EngineMode::Suspended)
            && c.engine(1).map(|e| e.mode()) == Some(EngineMode::Suspended)
    }));
    assert_eq!(cluster.leader(0), None);
    assert_eq!(cluster.leader(3), Some(cluster.node_id(2)));

    for i in 0..20 {
        cluster.submit(2 + i % 3, vec![format!("majority-{i}")]).unwrap();
        cluster.run_ticks(2);
    }
    // Queued while suspended, committed after the heal
    cluster.submit(0, vec!["minority-0".to_string()]).unwrap();

    assert!(cluster.run_until(20_000, |c| (2..5).all(|i| entries(c, i).len() == 20)));
    assert!(entries(&cluster, 0).is_empty());
    assert!(entries(&cluster, 1).is_empty());

    cluster.heal_network_partition();
    assert!(cluster.run_until_converged(50_000));
    cluster.assert_all_nodes_agree();

    let log = entries(&cluster, 0);
    assert_eq!(log.len(), 21);
    assert!(log.contains(&"minority-0".to_string()));
    assert_eq!(cluster.leader(0), Some(cluster.node_id(0)));
}

#[test]
fn byzantine_node_is_ignored() {
    let mut cluster = SimCluster::<LogMachine>::new(5).unwrap();
    assert!(cluster.run_until(2_000, all_active));

    cluster.set_byzantine(4, true);
    cluster.submit(4, vec!["forged".to_string()]).unwrap();
    for i in 0..10 {
        cluster.submit(i % 4, vec![format!("honest-{i}")]).unwrap();
        cluster.run_ticks(3);
    }
    assert!(cluster.run_until_converged(20_000));

    let log = entries(&cluster, 0);
    assert_eq!(log.len(), 10);
    assert!(!log.contains(&"forged".to_string()));
    assert!(cluster.stats().byzantine_dropped > 0);
}

#[test]
fn crashed_node_recovers_from_checkpoint() {
    let mut cluster = SimCluster::<LogMachine>::new(5).unwrap();
    assert!(cluster.run_until(2_000, all_active));

    for i in 0..5 {
        cluster.submit(0, vec![format!("before-{i}")]).unwrap();
    }
    assert!(cluster.run_until_converged(5_000));

    cluster.stop_node(4);
    assert!(cluster.engine(4).is_none());
    for i in 0..5 {
        cluster.submit(1, vec![format!("during-{i}")]).unwrap();
    }
    assert!(cluster.run_until_converged(5_000));
    assert_eq!(entries(&cluster, 0).len(), 10);

    cluster.restart_node(4).unwrap();
    assert_eq!(entries(&cluster, 4).len(), 5);
    assert!(cluster.run_until_converged(5_000));
    assert_eq!(entries(&cluster, 4), entries(&cluster, 0));
}

#[test]
fn restarts_during_contention_never_fork_the_log() {
    for seed in [46, 3, 17, 29, 58, 91] {
        let config = SimConfig::default().with_seed(seed).with_loss(0.1);
        let mut cluster = SimCluster::<LogMachine>::with_config(3, config).unwrap();
        assert!(cluster.run_until(2_000, all_active));

        for round in 0..30 {
            for index in 0..3 {
                cluster
                    .submit(index, vec![format!("r{round}-n{index}")])
                    .unwrap();
            }
            // Crash one node while the phase it proposed in is still open
            let victim = round % 3;
            step_checked(&mut cluster, 2);
            cluster.stop_node(victim);
            step_checked(&mut cluster, 5);
            cluster.restart_node(victim).unwrap();
            step_checked(&mut cluster, 20);
        }

        assert!(
            cluster.run_until(100_000, |c| {
                assert!(logs_are_prefixes(c), "logs forked with seed {seed}");
                c.check_consensus()
            }),
            "seed {seed} did not converge: {:#?}",
            cluster.statuses()
        );
        let log = entries(&cluster, 0);
        let distinct: HashSet<&String> = log.iter().collect();
        assert_eq!(distinct.len(), log.len(), "a command was applied twice");
        assert!(!log.is_empty());
    }
}

#[test]
fn identical_submissions_commit_once() {
    let mut cluster = SimCluster::<LogMachine>::new(3).unwrap();
    assert!(cluster.run_until(2_000, all_active));

    let mut first = cluster.submit_tracked(0, vec!["same".to_string()]).unwrap();
    let mut second = cluster.submit_tracked(1, vec!["same".to_string()]).unwrap();
    assert!(cluster.run_until_converged(5_000));

    assert_eq!(entries(&cluster, 2), vec!["same".to_string()]);
    assert_eq!(first.try_recv().unwrap().unwrap(), vec![0]);
    assert_eq!(second.try_recv().unwrap().unwrap(), vec![0]);
}

#[test]
fn single_node_cluster_commits_alone() {
    let mut cluster = SimCluster::<LogMachine>::new(1).unwrap();
    assert!(all_active(&cluster));
    for i in 0..3 {
        cluster.submit(0, vec![format!("solo-{i}")]).unwrap();
    }
    assert!(cluster.run_until_converged(100));
    assert_eq!(entries(&cluster, 0), vec!["solo-0", "solo-1", "solo-2"]);
    assert_eq!(cluster.leader(0), Some(cluster.node_id(0)));
}

//! Async node runtime over the in-process transport

use rabia_consensus::config::{Config, ConfigBuilder, StorageBackend};
use rabia_consensus::engine::EngineMode;
use rabia_consensus::prelude::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(10);

fn node_config(id: u64, size: u64) -> Config {
    let mut builder = ConfigBuilder::new()
        .node_id(id)
        .storage_backend(StorageBackend::Memory)
        .reconciliation_interval(Duration::from_millis(50))
        .protocol(ProtocolConfig::default().with_tick_interval(Duration::from_millis(5)));
    for member in 1..=size {
        builder = builder.add_member(member, format!("mem://{member}"));
    }
    builder.build().unwrap()
}

async fn start_cluster(
    size: u64,
) -> (Arc<MemoryHub<KvCommand>>, Vec<RabiaNode<KeyValueStore>>) {
    let hub = MemoryHub::new();
    let nodes = (1..=size)
        .map(|id| {
            RabiaNode::start_in_memory(
                &node_config(id, size),
                KeyValueStore::new(),
                MemoryStore::new(),
                &hub,
            )
            .unwrap()
        })
        .collect();
    (hub, nodes)
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(WAIT, async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

async fn all_active(nodes: &[RabiaNode<KeyValueStore>]) -> bool {
    for node in nodes {
        match node.status().await {
            Ok(status) if status.mode == EngineMode::Active => {}
            _ => return false,
        }
    }
    true
}

#[tokio::test]
async fn three_nodes_replicate_proposals() {
    let (_hub, nodes) = start_cluster(3).await;
    assert!(eventually(|| all_active(&nodes)).await);

    let responses = timeout(WAIT, nodes[1].propose(vec![KvCommand::set("color", "blue")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(responses, vec![KvResponse::Value(None)]);

    let responses = timeout(WAIT, nodes[2].propose(vec![KvCommand::set("color", "red")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(responses, vec![KvResponse::Value(Some("blue".to_string()))]);

    assert!(
        eventually(|| async {
            let mut phases = Vec::new();
            for node in &nodes {
                phases.push(node.status().await.map(|s| s.phase).ok());
            }
            phases.iter().all(|p| *p == phases[0])
        })
        .await
    );

    for node in &nodes {
        assert_eq!(node.leader(), Some(NodeId::new(1)));
    }
    for node in &nodes {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn membership_changes_reach_the_engine() {
    let (_hub, nodes) = start_cluster(3).await;
    assert!(eventually(|| all_active(&nodes)).await);

    // Node 4 never joins the hub; three of four members still form a quorum
    for node in &nodes {
        node.add_member(NodeInfo::new(4, "mem://4"));
    }
    assert!(
        eventually(|| async {
            matches!(nodes[0].status().await, Ok(s) if s.cluster_size == 4 && s.quorum_size == 3)
        })
        .await
    );
    timeout(WAIT, nodes[0].propose(vec![KvCommand::set("k", "v")]))
        .await
        .unwrap()
        .unwrap();

    for node in &nodes {
        node.remove_member(NodeId::new(4));
    }
    assert!(
        eventually(|| async { matches!(nodes[0].status().await, Ok(s) if s.cluster_size == 3) })
            .await
    );
    assert_eq!(nodes[0].topology().cluster_size(), 3);

    for node in &nodes {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn quorum_loss_suspends_and_recovery_resumes() {
    let (hub, nodes) = start_cluster(3).await;
    assert!(eventually(|| all_active(&nodes)).await);

    hub.isolate(NodeId::new(3));
    assert!(
        eventually(|| async {
            matches!(nodes[2].status().await, Ok(s) if s.mode == EngineMode::Suspended)
        })
        .await
    );
    assert_eq!(nodes[2].leader(), None);

    // The isolated node queues the proposal until quorum returns
    let pending = nodes[2].propose(vec![KvCommand::set("late", "1")]);
    tokio::pin!(pending);
    assert!(timeout(Duration::from_millis(200), &mut pending).await.is_err());

    hub.heal();
    let responses = timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(responses, vec![KvResponse::Value(None)]);

    for node in &nodes {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn shutdown_stops_accepting_proposals() {
    let (_hub, nodes) = start_cluster(3).await;
    assert!(eventually(|| all_active(&nodes)).await);

    nodes[0].shutdown().await.unwrap();
    assert!(nodes[0].propose(vec![KvCommand::Clear]).await.is_err());
    assert!(nodes[0].status().await.is_err());

    // The remaining two still form a quorum
    let responses = timeout(WAIT, nodes[1].propose(vec![KvCommand::set("a", "b")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(responses, vec![KvResponse::Value(None)]);
    assert!(eventually(|| async { nodes[2].leader() == Some(NodeId::new(2)) }).await);

    for node in &nodes[1..] {
        node.shutdown().await.unwrap();
    }
}

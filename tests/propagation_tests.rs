//! Propagation barriers over running nodes.
//!
//! Each node polls the shared store into its own replica and reports the
//! applied version on its introspection endpoint. The barrier probes those
//! endpoints over HTTP.

use std::sync::Arc;
use std::time::Duration;

use membrane::cluster::propagation::{
    HttpParticipant, ParticipantStatus, ReplicaParticipant, StaticParticipant, StoreParticipant,
};
use membrane::cluster::store::MemoryStore;
use membrane::cluster::{
    ConfigStore, LocalReplica, MembershipConfig, MembershipError, MembershipNode,
    MembershipProfile, NodesConfigurationManager, Participant, PropagationOptions, RoleSet,
    StorageState, Update, await_version,
};
use membrane::types::NodeIndex;

fn node_config(name: &str, port: u16) -> MembershipConfig {
    let mut config = MembershipConfig::from_profile(MembershipProfile::Test);
    config.poll_interval = Duration::from_millis(10);
    config.self_registration.enabled = true;
    config.self_registration.name = Some(name.to_string());
    config.self_registration.address = Some(format!("127.0.0.1:{}", port));
    config.self_registration.roles = RoleSet::STORAGE;
    config
}

fn options(timeout_ms: u64) -> PropagationOptions {
    PropagationOptions {
        timeout: Some(Duration::from_millis(timeout_ms)),
        poll_interval: Duration::from_millis(5),
    }
}

async fn start_nodes(store: &Arc<dyn ConfigStore>, count: u16) -> Vec<MembershipNode> {
    let mut nodes = Vec::new();
    for i in 0..count {
        let node = MembershipNode::start_with(
            node_config(&format!("node-{}", i), 9000 + i),
            store.clone(),
            None,
        )
        .await
        .unwrap();
        nodes.push(node);
    }
    nodes
}

fn http_participants(nodes: &[MembershipNode]) -> Vec<Arc<dyn Participant>> {
    nodes
        .iter()
        .map(|n| {
            Arc::new(HttpParticipant::new(
                n.index().to_string(),
                n.introspection_addr().to_string(),
            )) as Arc<dyn Participant>
        })
        .collect()
}

#[tokio::test]
async fn test_barrier_converges_over_http() {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let nodes = start_nodes(&store, 3).await;

    let admin = NodesConfigurationManager::new(store.clone(), Arc::new(LocalReplica::new()));
    let published = admin
        .propose(|_| Ok(Update::new().set_storage_state(NodeIndex(1), StorageState::ReadOnly)))
        .await
        .unwrap();

    let mut participants = http_participants(&nodes);
    participants.push(Arc::new(StoreParticipant::new(store.clone())));
    let report = await_version(published.version(), &participants, options(3000)).await;
    assert!(report.converged(), "lagging: {:?}", report.lagging());
    assert!(!report.timed_out);
    for node in &nodes {
        assert!(node.current().version() >= published.version());
    }

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_stopped_node_is_excluded_and_dead_node_times_out() {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let mut nodes = start_nodes(&store, 2).await;
    let target = store.read().await.unwrap().unwrap().version;

    // Node 1 goes away without being marked stopped: the probe fails.
    let dead = nodes.pop().unwrap();
    let dead_addr = dead.introspection_addr().to_string();
    dead.stop().await;

    let stopped = Arc::new(StaticParticipant::new("stopped"));
    stopped.set_stopped(true);
    let mut participants = http_participants(&nodes);
    participants.push(stopped);
    participants.push(Arc::new(
        HttpParticipant::new("dead", dead_addr).with_request_timeout(Duration::from_millis(50)),
    ));

    let report = await_version(target, &participants, options(200)).await;
    assert!(report.timed_out);
    assert_eq!(report.status_of("stopped"), Some(&ParticipantStatus::Stopped));
    assert!(matches!(
        report.status_of("dead"),
        Some(ParticipantStatus::Unreachable(_))
    ));
    let lagging = report.lagging();
    assert_eq!(lagging.len(), 1);
    assert!(lagging[0].starts_with("dead"));

    match report.into_result() {
        Err(MembershipError::PropagationTimeout { target: t, .. }) => assert_eq!(t, target),
        other => panic!("expected timeout, got {:?}", other.map(|r| r.target)),
    }

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_replica_poller_catches_up_after_many_versions() {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let nodes = start_nodes(&store, 1).await;
    let admin = NodesConfigurationManager::new(store.clone(), Arc::new(LocalReplica::new()));

    let mut published = Vec::new();
    for state in [
        StorageState::ReadOnly,
        StorageState::ReadWrite,
        StorageState::ReadOnly,
        StorageState::None,
    ] {
        let cfg = admin
            .propose(|_| Ok(Update::new().set_storage_state(NodeIndex(0), state)))
            .await
            .unwrap();
        published.push(cfg.version());
    }
    assert!(published.windows(2).all(|w| w[1] == w[0].next()));
    let last = published[published.len() - 1];

    let replica: Arc<dyn Participant> = Arc::new(ReplicaParticipant::new(
        "node-0",
        nodes[0].replica().clone(),
    ));
    let report = await_version(last, &[replica], options(2000)).await;
    assert!(report.converged());
    assert_eq!(
        report.status_of("node-0"),
        Some(&ParticipantStatus::Converged(last))
    );

    for node in nodes {
        node.stop().await;
    }
}

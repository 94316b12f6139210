//! End-to-end membership scenario against the in-memory store.
//!
//! Walks one cluster through expand, a rejected remove, drain + remove and
//! a replace, checking versions, entries, generations and session fencing
//! at every step.

use std::sync::Arc;

use membrane::cluster::orchestrator::SequentialEndpointAllocator;
use membrane::cluster::orchestrator::testing::{InMemoryLauncher, LaunchEvent, fast_config};
use membrane::cluster::{
    ConfigStore, LocalReplica, NewNodeSpec, NodeAddress, NodeAttributesChange, NodeEndpoints,
    NodesConfiguration, NodesConfigurationManager, Orchestrator, RoleSet, ServiceDiscoveryEntry,
    SessionTag, StorageAttributes, StorageState, Update, ViolationKind, apply,
    store::MemoryStore,
};
use membrane::types::{ConfigVersion, NodeGeneration, NodeIndex, ShardIndex};

struct Cluster {
    orchestrator: Orchestrator,
    launcher: Arc<InMemoryLauncher>,
    store: Arc<dyn ConfigStore>,
}

/// Three storage+sequencer nodes, all shards READ_WRITE, at version 1.
fn initial_config() -> NodesConfiguration {
    let mut update = Update::new();
    for i in 0..3u16 {
        let entry = ServiceDiscoveryEntry::new(
            format!("node-{}", i),
            NodeEndpoints::new(NodeAddress::tcp("10.0.0.1", 4440 + i)),
            RoleSet::BOTH,
        );
        update = update
            .add(NodeIndex(i), entry, Some(StorageAttributes::new(2)))
            .set_storage_state(NodeIndex(i), StorageState::ReadWrite);
    }
    apply(&NodesConfiguration::empty(), &update).unwrap()
}

async fn cluster() -> Cluster {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let replica = Arc::new(LocalReplica::new());
    let manager = Arc::new(NodesConfigurationManager::new(store.clone(), replica.clone()));
    manager.bootstrap(Some(initial_config())).await.unwrap();

    let launcher =
        Arc::new(InMemoryLauncher::new(replica).with_running([NodeIndex(0), NodeIndex(1), NodeIndex(2)]));
    let orchestrator = Orchestrator::new(
        manager,
        launcher.clone(),
        Arc::new(SequentialEndpointAllocator::new("127.0.0.1", 30000)),
        launcher.clone(),
        fast_config(),
    );
    Cluster {
        orchestrator,
        launcher,
        store,
    }
}

#[tokio::test]
async fn test_full_membership_scenario() {
    let c = cluster().await;
    let cfg = c.orchestrator.manager().current();
    assert_eq!(cfg.version(), ConfigVersion(1));
    assert_eq!(cfg.len(), 3);

    // Expand by two: indices 3 and 4, shards start out NONE.
    let expanded = c
        .orchestrator
        .expand(vec![
            NewNodeSpec::new("node-3", RoleSet::BOTH),
            NewNodeSpec::new("node-4", RoleSet::BOTH),
        ])
        .await
        .unwrap();
    assert_eq!(expanded.added, vec![NodeIndex(3), NodeIndex(4)]);
    assert_eq!(expanded.version, ConfigVersion(2));
    let cfg = c.orchestrator.manager().current();
    assert_eq!(cfg.len(), 5);
    for index in [NodeIndex(3), NodeIndex(4)] {
        let shards = cfg.shard_states(index).unwrap();
        assert!(shards.iter().all(|s| s.state == StorageState::None));
    }

    // Removing a node that still serves data is rejected and changes nothing.
    let err = c.orchestrator.remove(vec![NodeIndex(1)]).await.unwrap_err();
    assert_eq!(err.violation_kind(), Some(ViolationKind::NodeOwnsData));
    assert_eq!(c.orchestrator.manager().current().version(), ConfigVersion(2));

    // Zero its storage, then remove.
    let version = c
        .orchestrator
        .update_attributes(vec![(
            NodeIndex(1),
            NodeAttributesChange {
                storage_state: Some(StorageState::None),
                ..Default::default()
            },
        )])
        .await
        .unwrap();
    assert_eq!(version, ConfigVersion(3));

    let version = c.orchestrator.remove(vec![NodeIndex(1)]).await.unwrap();
    assert_eq!(version, ConfigVersion(4));
    let cfg = c.orchestrator.manager().current();
    assert_eq!(cfg.len(), 4);
    assert!(!cfg.contains(NodeIndex(1)));

    // A session opened now belongs to generation 1 of node 0.
    let session = SessionTag::open(&cfg, NodeIndex(0)).unwrap();
    assert_eq!(session.generation, NodeGeneration::INITIAL);
    assert_eq!(session.opened_at_version, ConfigVersion(4));
    let old_data = cfg.node(NodeIndex(0)).unwrap().endpoints.data.clone();

    // Replace node 0: bump at 5, new addresses at 6.
    let replaced = c.orchestrator.replace(NodeIndex(0)).await.unwrap();
    assert_eq!(replaced.index, NodeIndex(0));
    assert_eq!(replaced.generation, NodeGeneration(2));
    assert_eq!(replaced.version, ConfigVersion(6));

    let cfg = c.orchestrator.manager().current();
    assert_eq!(cfg.version(), ConfigVersion(6));
    assert_eq!(cfg.generation(NodeIndex(0)), Some(NodeGeneration(2)));
    assert_ne!(cfg.node(NodeIndex(0)).unwrap().endpoints.data, old_data);
    assert!(session.is_stale(&cfg));

    let fresh = SessionTag::open(&cfg, NodeIndex(0)).unwrap();
    assert!(!fresh.is_stale(&cfg));
    assert_eq!(c.launcher.running_generation(NodeIndex(0)), Some(NodeGeneration(2)));
    assert!(c.launcher.events().contains(&LaunchEvent::Stop(NodeIndex(0))));

    // The store holds exactly what the manager reports.
    let stored = c.store.read().await.unwrap().unwrap();
    assert_eq!(stored.version, ConfigVersion(6));
}

#[tokio::test]
async fn test_rejected_update_leaves_store_untouched() {
    let c = cluster().await;
    let before = c.store.read().await.unwrap().unwrap();

    let err = c
        .orchestrator
        .manager()
        .propose(|_| {
            Ok(Update::new()
                .set_storage_state(NodeIndex(2), StorageState::None)
                .remove(NodeIndex(0)))
        })
        .await
        .unwrap_err();
    assert!(err.is_invariant_violation());

    let after = c.store.read().await.unwrap().unwrap();
    assert_eq!(before, after);
    let cfg = c.orchestrator.manager().current();
    assert_eq!(
        cfg.shard_state(NodeIndex(2), ShardIndex(0)).unwrap().state,
        StorageState::ReadWrite
    );
}

#[tokio::test]
async fn test_shrink_drains_live_node() {
    let c = cluster().await;
    let version = c.orchestrator.shrink(vec![NodeIndex(2)]).await.unwrap();
    let cfg = c.orchestrator.manager().current();
    assert!(version > ConfigVersion(1));
    assert!(!cfg.contains(NodeIndex(2)));
    assert!(c.launcher.events().contains(&LaunchEvent::Kill(NodeIndex(2))));
    assert_eq!(c.launcher.running_generation(NodeIndex(2)), None);
}

#[tokio::test]
async fn test_versions_strictly_increase_across_sagas() {
    let c = cluster().await;
    let mut seen = vec![c.orchestrator.manager().current().version()];

    c.orchestrator
        .expand(vec![NewNodeSpec::new("extra", RoleSet::SEQUENCER)])
        .await
        .unwrap();
    seen.push(c.orchestrator.manager().current().version());
    c.orchestrator
        .bump_generation(vec![NodeIndex(0), NodeIndex(2)])
        .await
        .unwrap();
    seen.push(c.orchestrator.manager().current().version());
    c.orchestrator.replace(NodeIndex(1)).await.unwrap();
    seen.push(c.orchestrator.manager().current().version());

    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{:?}", seen);
}

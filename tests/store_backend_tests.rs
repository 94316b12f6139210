//! Behaviour shared by every configuration store backend.

use std::sync::Arc;
use std::time::Duration;

use membrane::cluster::config::StoreBackend;
use membrane::cluster::store::{self, FileStore, MemoryStore, ObjectConfigStore};
use membrane::cluster::{
    ConfigStore, LocalReplica, MembershipConfig, MembershipError, MembershipProfile, NodeAddress,
    NodeEndpoints, NodesConfiguration, NodesConfigurationManager, ReadOutcome, RoleSet,
    ServiceDiscoveryEntry, Update, WriteCondition, codec,
};
use membrane::types::{ConfigVersion, NodeIndex};
use object_store::memory::InMemory;
use tempfile::TempDir;
use tokio::sync::broadcast;

fn add_node(index: u16) -> Update {
    let entry = ServiceDiscoveryEntry::new(
        format!("n{}", index),
        NodeEndpoints::new(NodeAddress::tcp("10.2.0.1", 4000 + index)),
        RoleSet::SEQUENCER,
    );
    Update::new().add(NodeIndex(index), entry, None)
}

/// Bootstrap, two proposals, a stale CAS and a conditional read.
async fn exercise(store: Arc<dyn ConfigStore>) {
    assert!(store.read().await.unwrap().is_none());
    assert_eq!(
        store.read_if_newer(ConfigVersion::EMPTY).await.unwrap(),
        ReadOutcome::NotFound
    );

    let manager = NodesConfigurationManager::new(store.clone(), Arc::new(LocalReplica::new()));
    manager.bootstrap(None).await.unwrap();
    manager.propose(|_| Ok(add_node(0))).await.unwrap();
    let latest = manager.propose(|_| Ok(add_node(1))).await.unwrap();
    assert_eq!(latest.version(), ConfigVersion(2));

    // A writer still holding version 1 loses.
    let stale = codec::encode(&NodesConfiguration::empty()).unwrap();
    let err = store
        .write(stale, WriteCondition::CompareVersionAndSwap(ConfigVersion(1)))
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "{:?}", err);

    match store.read_if_newer(ConfigVersion(1)).await.unwrap() {
        ReadOutcome::Value(value) => {
            assert_eq!(value.version, ConfigVersion(2));
            assert_eq!(codec::decode(&value.bytes).unwrap().len(), 2);
        }
        other => panic!("expected a newer value, got {:?}", other),
    }
    assert_eq!(
        store.read_if_newer(ConfigVersion(2)).await.unwrap(),
        ReadOutcome::UpToDate
    );

    store.shutdown();
    assert!(matches!(
        store.read().await.unwrap_err(),
        MembershipError::ShuttingDown
    ));
}

#[tokio::test]
async fn test_memory_store() {
    exercise(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_file_store() {
    let dir = TempDir::new().unwrap();
    exercise(Arc::new(FileStore::new(dir.path(), "backend"))).await;
}

#[tokio::test]
async fn test_object_store_over_in_memory_backend() {
    exercise(Arc::new(ObjectConfigStore::new(Arc::new(InMemory::new()), "backend"))).await;
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store: Arc<dyn ConfigStore> = Arc::new(FileStore::new(dir.path(), "persist"));
        let manager = NodesConfigurationManager::new(store, Arc::new(LocalReplica::new()));
        manager.bootstrap(None).await.unwrap();
        manager.propose(|_| Ok(add_node(3))).await.unwrap();
    }

    let reopened: Arc<dyn ConfigStore> = Arc::new(FileStore::new(dir.path(), "persist"));
    let replica = LocalReplica::new();
    assert!(replica.refresh(reopened.as_ref()).await.unwrap());
    assert_eq!(replica.version(), ConfigVersion(1));
    assert!(replica.current().contains(NodeIndex(3)));
}

#[tokio::test]
async fn test_clusters_are_isolated_in_one_root() {
    let dir = TempDir::new().unwrap();
    let a: Arc<dyn ConfigStore> = Arc::new(FileStore::new(dir.path(), "a"));
    let b: Arc<dyn ConfigStore> = Arc::new(FileStore::new(dir.path(), "b"));
    NodesConfigurationManager::new(a.clone(), Arc::new(LocalReplica::new()))
        .bootstrap(None)
        .await
        .unwrap();
    assert!(a.read().await.unwrap().is_some());
    assert!(b.read().await.unwrap().is_none());
}

#[tokio::test]
async fn test_poller_follows_external_writer() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn ConfigStore> = Arc::new(FileStore::new(dir.path(), "poll"));
    let writer = NodesConfigurationManager::new(store.clone(), Arc::new(LocalReplica::new()));
    writer.bootstrap(None).await.unwrap();

    let replica = Arc::new(LocalReplica::new());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let poller = replica
        .clone()
        .spawn_poller(store.clone(), Duration::from_millis(10), shutdown_rx);

    let published = writer.propose(|_| Ok(add_node(0))).await.unwrap();
    let seen = replica
        .wait_for_version(published.version(), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(seen.version(), published.version());

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), poller)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_open_builds_configured_backend() {
    let mut config = MembershipConfig::from_profile(MembershipProfile::Test);
    let memory = store::open(&config).await.unwrap();
    assert!(memory.describe().contains("memory"));

    let dir = TempDir::new().unwrap();
    config.store = StoreBackend::File {
        root: dir.path().to_path_buf(),
    };
    config.cluster_name = "opened".to_string();
    let file = store::open(&config).await.unwrap();
    assert!(file.describe().contains("opened"));

    config.store = StoreBackend::Rqlite {
        url: "http://127.0.0.1:4001".to_string(),
        table: "membrane".to_string(),
    };
    if cfg!(not(feature = "rqlite")) {
        assert!(matches!(
            store::open(&config).await.err(),
            Some(MembershipError::Config(_))
        ));
    }
}

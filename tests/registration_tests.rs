//! Self-registration of many nodes sharing one store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use membrane::cluster::config::SelfRegistrationSettings;
use membrane::cluster::store::{FileStore, MemoryStore};
use membrane::cluster::{
    ConfigStore, LocalReplica, MembershipError, NodeAddress, RegistrationOutcome, RoleSet,
    SelfRegistration, codec,
};
use membrane::types::NodeIndex;
use tempfile::TempDir;
use tokio::task::JoinSet;

fn settings(name: &str, port: u16) -> SelfRegistrationSettings {
    SelfRegistrationSettings {
        enabled: true,
        name: Some(name.to_string()),
        address: Some(format!("127.0.0.1:{}", port)),
        roles: RoleSet::STORAGE,
        num_shards: 2,
        ..Default::default()
    }
}

async fn register(
    store: &Arc<dyn ConfigStore>,
    settings: SelfRegistrationSettings,
) -> Result<RegistrationOutcome, MembershipError> {
    SelfRegistration::new(settings)
        .with_sleep_after(Duration::ZERO)
        .with_max_attempts(64)
        .register(store.clone(), Arc::new(LocalReplica::new()))
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_assigns_distinct_indices() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn ConfigStore> = Arc::new(FileStore::new(dir.path(), "reg"));

    let mut set = JoinSet::new();
    for i in 0..6u16 {
        let store = store.clone();
        set.spawn(async move { register(&store, settings(&format!("node-{}", i), 8000 + i)).await });
    }

    let mut indices = BTreeSet::new();
    while let Some(joined) = set.join_next().await {
        let outcome = joined.unwrap().unwrap();
        assert!(matches!(outcome, RegistrationOutcome::Registered { .. }));
        assert!(indices.insert(outcome.index()));
    }
    let expected: BTreeSet<_> = (0..6).map(NodeIndex).collect();
    assert_eq!(indices, expected);

    let stored = store.read().await.unwrap().unwrap();
    let cfg = codec::decode(&stored.bytes).unwrap();
    assert_eq!(cfg.len(), 6);
    assert_eq!(cfg.storage_nodes().count(), 6);
}

#[tokio::test]
async fn test_restart_with_new_address_updates_entry() {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let first = register(&store, settings("node-a", 8100)).await.unwrap();
    let again = register(&store, settings("node-a", 8100)).await.unwrap();
    assert_eq!(again, RegistrationOutcome::UpToDate { index: first.index() });

    let moved = register(&store, settings("node-a", 8101)).await.unwrap();
    assert_eq!(moved, RegistrationOutcome::Updated { index: first.index() });

    let stored = store.read().await.unwrap().unwrap();
    let cfg = codec::decode(&stored.bytes).unwrap();
    let (index, entry) = cfg.node_by_name("node-a").unwrap();
    assert_eq!(index, first.index());
    assert_eq!(entry.endpoints.data, NodeAddress::parse("127.0.0.1:8101").unwrap());
}

#[tokio::test]
async fn test_older_entry_version_is_refused() {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let mut newer = settings("node-a", 8200);
    newer.node_version = Some(4);
    register(&store, newer).await.unwrap();

    let mut older = settings("node-a", 8201);
    older.node_version = Some(3);
    let err = register(&store, older).await.unwrap_err();
    assert!(matches!(
        err,
        MembershipError::Downgrade {
            published: 4,
            desired: 3
        }
    ));
}

#[tokio::test]
async fn test_explicit_index_is_used_when_free() {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let mut pinned = settings("pinned", 8300);
    pinned.index = Some(NodeIndex(9));
    let outcome = register(&store, pinned).await.unwrap();
    assert_eq!(outcome.index(), NodeIndex(9));

    // Taken: the next node falls back to the smallest free index.
    let mut clash = settings("clash", 8301);
    clash.index = Some(NodeIndex(9));
    let outcome = register(&store, clash).await.unwrap();
    assert_eq!(outcome.index(), NodeIndex(0));
}

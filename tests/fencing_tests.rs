//! Self-consistency fencing of running nodes.
//!
//! A node registers itself, then an administrator or a second process
//! changes the published configuration underneath it. The node must notice
//! through its replica poller and step aside.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use membrane::cluster::fencing::FenceHandler;
use membrane::cluster::store::MemoryStore;
use membrane::cluster::{
    ConfigStore, LocalReplica, MembershipConfig, MembershipNode, MembershipProfile,
    NodesConfigurationManager, RoleSet, SelfRegistration, Update,
};
use membrane::types::{NodeGeneration, NodeIndex};

/// Counts shutdown requests instead of stopping anything.
#[derive(Default)]
struct CountingHandler {
    shutdowns: AtomicUsize,
}

impl FenceHandler for CountingHandler {
    fn on_graceful_shutdown(&self, _reason: &str) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    fn on_hard_exit(&self, _reason: &str) {
        panic!("hard exit is not configured in these tests");
    }
}

fn node_config(name: &str, port: u16) -> MembershipConfig {
    let mut config = MembershipConfig::from_profile(MembershipProfile::Test);
    config.poll_interval = Duration::from_millis(10);
    config.self_registration.enabled = true;
    config.self_registration.name = Some(name.to_string());
    config.self_registration.address = Some(format!("127.0.0.1:{}", port));
    config.self_registration.roles = RoleSet::BOTH;
    config
}

fn admin(store: &Arc<dyn ConfigStore>) -> NodesConfigurationManager {
    NodesConfigurationManager::new(store.clone(), Arc::new(LocalReplica::new()))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_generation_bump_fences_running_node() {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let handler = Arc::new(CountingHandler::default());
    let node = MembershipNode::start_with(node_config("a", 7000), store.clone(), Some(handler.clone()))
        .await
        .unwrap();
    let session = node.open_session().unwrap();
    assert_eq!(session.generation, NodeGeneration::INITIAL);

    admin(&store)
        .propose(|_| Ok(Update::new().bump_generation(NodeIndex(0))))
        .await
        .unwrap();

    wait_until(|| node.is_fenced()).await;
    assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 1);
    assert!(session.is_stale(&node.current()));
    let reason = node.fence().reason().unwrap();
    assert!(reason.contains("g2"), "{}", reason);
    node.stop().await;
}

#[tokio::test]
async fn test_unrelated_changes_do_not_fence() {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let handler = Arc::new(CountingHandler::default());
    let node = MembershipNode::start_with(node_config("a", 7010), store.clone(), Some(handler.clone()))
        .await
        .unwrap();

    // A second node joining bumps the version but leaves our entry alone.
    let other = node_config("b", 7011);
    SelfRegistration::from_config(&other)
        .register(store.clone(), Arc::new(LocalReplica::new()))
        .await
        .unwrap();

    let target = store.read().await.unwrap().unwrap().version;
    node.replica()
        .wait_for_version(target, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(!node.is_fenced());
    assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 0);
    node.stop().await;
}

#[tokio::test]
async fn test_superseded_entry_fences() {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let handler = Arc::new(CountingHandler::default());
    let node = MembershipNode::start_with(node_config("a", 7020), store.clone(), Some(handler.clone()))
        .await
        .unwrap();

    // Another process claims the same name with a newer entry version.
    let mut usurper = node_config("a", 7021);
    usurper.self_registration.node_version = Some(5);
    SelfRegistration::from_config(&usurper)
        .register(store.clone(), Arc::new(LocalReplica::new()))
        .await
        .unwrap();

    wait_until(|| node.is_fenced()).await;
    assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 1);
    node.stop().await;
}

#[tokio::test]
async fn test_log_only_policy_keeps_running() {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let handler = Arc::new(CountingHandler::default());
    let mut config = node_config("a", 7030);
    config.fencing.shutdown_on_mismatch = false;
    let node = MembershipNode::start_with(config, store.clone(), Some(handler.clone()))
        .await
        .unwrap();

    // The node owns no data yet, so removal is allowed.
    let target = admin(&store)
        .propose(|_| Ok(Update::new().remove(NodeIndex(0))))
        .await
        .unwrap()
        .version();
    node.replica()
        .wait_for_version(target, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!node.is_fenced());
    assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 0);
    node.stop().await;
}

#[tokio::test]
async fn test_default_handler_requests_shutdown_on_removal() {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
    let mut node = MembershipNode::start_with(node_config("a", 7040), store.clone(), None)
        .await
        .unwrap();

    admin(&store)
        .propose(|_| Ok(Update::new().remove(NodeIndex(0))))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(3), node.wait_for_shutdown())
        .await
        .unwrap();
    assert!(node.is_fenced());
    node.stop().await;
}

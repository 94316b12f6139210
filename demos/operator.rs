//! Cluster operator example.
//!
//! Drives the administrative surface against a configuration store:
//! bootstrap, add nodes, promote their shards, replace one node and list
//! the result. Node processes are simulated by a launcher that only logs
//! what a real deployment tool would do.
//!
//! ## Running
//!
//! In-memory store (nothing persists):
//! ```bash
//! MEMBRANE_PROFILE=dev cargo run --example operator
//! ```
//!
//! Against the file store shared with `cargo run --example node`:
//! ```bash
//! MEMBRANE_STORE=file MEMBRANE_STORE_ROOT=/tmp/membrane cargo run --example operator
//! ```
//!
//! Requests and responses are printed as JSON, the same shape an admin
//! client would send over the wire.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use membrane::cluster::admin::{
    AddNodesRequest, ListNodesRequest, NodeAttributesUpdate, ReplaceNodeRequest,
    UpdateNodeAttributesRequest,
};
use membrane::cluster::orchestrator::SequentialEndpointAllocator;
use membrane::cluster::propagation::{ReplicaParticipant, StoreParticipant};
use membrane::cluster::{
    AdminHandler, LocalReplica, MembershipConfig, NewNodeSpec, NodeAttributesChange,
    NodeLauncher, NodeSelector, NodesConfigurationManager, Orchestrator, OrchestratorConfig,
    Participant, Result, RoleSet, ServiceDiscoveryEntry, StorageState, store,
};
use membrane::telemetry::{LogFormat, init_logging};
use membrane::types::{NodeGeneration, NodeIndex};
use tracing::info;

/// Records which generation of each node would be running.
#[derive(Default)]
struct LoggingLauncher {
    running: DashMap<NodeIndex, NodeGeneration>,
}

#[async_trait]
impl NodeLauncher for LoggingLauncher {
    async fn start(
        &self,
        index: NodeIndex,
        generation: NodeGeneration,
        entry: &ServiceDiscoveryEntry,
    ) -> Result<()> {
        info!(%index, %generation, name = %entry.name, address = %entry.endpoints.data, "start node");
        self.running.insert(index, generation);
        Ok(())
    }

    async fn stop(&self, index: NodeIndex) -> Result<()> {
        info!(%index, "stop node");
        self.running.remove(&index);
        Ok(())
    }

    async fn kill(&self, index: NodeIndex) -> Result<()> {
        info!(%index, "kill node");
        self.running.remove(&index);
        Ok(())
    }

    async fn is_running(&self, index: NodeIndex) -> bool {
        self.running.contains_key(&index)
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let config = MembershipConfig::from_env()?;
    let store = store::open(&config).await?;
    info!(store = %store.describe(), "Opened configuration store");

    let replica = Arc::new(LocalReplica::new());
    let manager = Arc::new(
        NodesConfigurationManager::new(store.clone(), replica.clone())
            .with_cas_max_attempts(config.cas_max_attempts),
    );
    info!(outcome = ?manager.bootstrap(None).await?, "Bootstrapped");

    // Without node processes, the barrier waits for this process and the store.
    let participants: Vec<Arc<dyn Participant>> = vec![
        Arc::new(ReplicaParticipant::new("operator", replica.clone())),
        Arc::new(StoreParticipant::new(store.clone())),
    ];
    let orchestrator = Arc::new(Orchestrator::new(
        manager,
        Arc::new(LoggingLauncher::default()),
        Arc::new(SequentialEndpointAllocator::new("127.0.0.1", 20_000)),
        Arc::new(participants),
        OrchestratorConfig::from_config(&config),
    ));
    let admin = AdminHandler::new(orchestrator);

    let add = AddNodesRequest {
        nodes: (0..3)
            .map(|i| NewNodeSpec::new(format!("demo-storage-{}", i), RoleSet::BOTH).with_shards(4))
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&add)?);
    let added = admin.add_nodes(add).await?;
    println!("{}", serde_json::to_string_pretty(&added)?);

    let promote = UpdateNodeAttributesRequest {
        updates: added
            .added
            .iter()
            .map(|node| NodeAttributesUpdate {
                node: NodeSelector::by_index(node.index),
                change: NodeAttributesChange {
                    storage_state: Some(StorageState::ReadWrite),
                    ..Default::default()
                },
            })
            .collect(),
    };
    let promoted = admin.update_attributes(promote).await?;
    println!("{}", serde_json::to_string_pretty(&promoted)?);

    if let Some(first) = added.added.first() {
        let replaced = admin
            .replace_node(ReplaceNodeRequest {
                node: NodeSelector::by_name(first.name.clone()),
            })
            .await?;
        println!("{}", serde_json::to_string_pretty(&replaced)?);
    }

    let listing = admin.list_nodes(ListNodesRequest::default()).await?;
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

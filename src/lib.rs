//! # Membrane
//! Versioned cluster membership for a distributed log-storage cluster,
//! published through a compare-and-swap store.
//!
//! Every node and every administrative client shares one immutable
//! [`NodesConfiguration`](cluster::NodesConfiguration): who is in the cluster,
//! how to reach them, which shards they serve and which generation their
//! process is at. There is no consensus protocol. Writers race on a CAS
//! against the version embedded in the stored blob, readers poll the store
//! into a local replica, and nodes fence themselves when the published
//! configuration stops describing them.
//!
//! ## Getting started
//!
//! Bootstrap a cluster and add nodes through the orchestrator:
//!
//! ```rust,no_run
//! use membrane::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let config = MembershipConfig::from_env()?;
//!     let store = cluster::store::open(&config).await?;
//!     let replica = Arc::new(LocalReplica::new());
//!     let manager = Arc::new(NodesConfigurationManager::new(store, replica.clone()));
//!     manager.bootstrap(None).await?;
//!
//!     let updated = manager
//!         .propose(|cfg| {
//!             let index = cluster::identity::allocate_indices(cfg, 1, &Default::default())?[0];
//!             let entry = ServiceDiscoveryEntry::new(
//!                 "storage-0",
//!                 NodeEndpoints::new(NodeAddress::parse("10.0.0.1:4440")?),
//!                 RoleSet::STORAGE,
//!             );
//!             Ok(Update::new().add(index, entry, Some(StorageAttributes::new(4))))
//!         })
//!         .await?;
//!     println!("published {}", updated.version());
//!     Ok(())
//! }
//! ```
//!
//! A node joins with [`MembershipNode`](cluster::MembershipNode), which
//! self-registers, polls the store and serves its introspection endpoint.
//! See `demos/node.rs` and `demos/operator.rs`.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod constants;
pub mod server;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Types most callers need.
    pub use crate::cluster::{
        self, AdminHandler, ConfigStore, LocalReplica, MembershipConfig, MembershipError,
        MembershipNode, MembershipProfile, NodeAddress, NodeEndpoints, NodeIdentityFinder,
        NodeSelector, NodesConfiguration, NodesConfigurationManager, Orchestrator, Result,
        RoleSet, ServiceDiscoveryEntry, StorageAttributes, StorageState, Update,
    };
    pub use crate::types::{ConfigVersion, NodeGeneration, NodeIndex, ShardIndex};

    pub use bytes;
}

//! Cluster membership subsystem.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐   propose (CAS)   ┌──────────────┐
//!   │ Orchestrator │ ────────────────► │ ConfigStore  │ ← memory, file,
//!   │  (sagas)     │                   │ (one blob)   │   object store, rqlite
//!   └──────┬───────┘                   └──────┬───────┘
//!          │ barrier                          │ poll
//!          ▼                                  ▼
//!   ┌──────────────┐   /nodes_config   ┌──────────────┐
//!   │ Participants │ ◄──────────────── │ LocalReplica │ ──► SelfConsistencyMonitor
//!   └──────────────┘     /version      └──────────────┘        (fencing)
//! ```
//!
//! - [`configuration`] and [`update`]: the immutable configuration value and
//!   the all-or-nothing update algebra that derives version N+1 from N.
//! - [`store`]: the CAS store trait and its backends. [`codec`] is the
//!   stored blob format.
//! - [`replica`] and [`propagation`]: each process's view of the latest
//!   configuration, and waiting until a set of participants has seen one.
//! - [`identity`] and [`registration`]: how a node finds or creates its own
//!   entry.
//! - [`manager`], [`orchestrator`] and [`admin`]: read-modify-CAS proposals,
//!   multi-step sagas and the request surface on top of them.
//! - [`fencing`]: a node stepping aside once the configuration no longer
//!   describes it.
//! - [`node`]: everything above wired into one running node.
//!
//! # Usage
//!
//! ```rust,no_run
//! use membrane::cluster::{MembershipConfig, MembershipNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MembershipConfig::from_env()?;
//!     let mut node = MembershipNode::start(config).await?;
//!     node.wait_for_shutdown().await;
//!     node.stop().await;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod background_tasks;
pub mod codec;
pub mod config;
pub mod configuration;
pub mod error;
pub mod fencing;
pub mod identity;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod object_store;
pub mod orchestrator;
pub mod propagation;
pub mod registration;
pub mod replica;
pub mod retry;
pub mod store;
pub mod update;

pub use admin::AdminHandler;
pub use background_tasks::{BackgroundTaskRegistry, TaskStatus};
pub use config::{
    FencingSettings, MembershipConfig, MembershipProfile, ObjectStoreType,
    SelfRegistrationSettings, StoreBackend,
};
pub use configuration::{
    MetadataStorageState, NetworkPriority, NodeAddress, NodeEndpoints, NodesConfiguration,
    RoleSet, SequencerMembership, ServiceDiscoveryEntry, ShardMembership, StorageAttributes,
    StorageState,
};
pub use error::{MembershipError, Result, ViolationKind};
pub use fencing::{FenceState, FencingPolicy, IdentityCheck, RegisteredIdentity, SessionTag};
pub use identity::{NodeIdentityFinder, NodeSelector};
pub use manager::{BootstrapOutcome, NodesConfigurationManager, Proposal};
pub use node::MembershipNode;
pub use orchestrator::{
    EndpointAllocator, NewNodeSpec, NodeAttributesChange, NodeLauncher, Orchestrator,
    OrchestratorConfig, ParticipantSource,
};
pub use propagation::{Participant, PropagationOptions, PropagationReport, await_version};
pub use registration::{RegistrationOutcome, SelfRegistration};
pub use replica::LocalReplica;
pub use store::{ConfigStore, ReadOutcome, StoredValue, WriteCondition};
pub use update::{NodeUpdate, ShardSelector, Update, apply};

//! Multi-step membership changes (sagas).
//!
//! Each saga is a linear pipeline of proposals and propagation barriers:
//!
//! ```text
//! expand:   validate -> propose ADD* -> barrier -> start new processes
//! shrink:   validate -> kill -> propose (drain + REMOVE)* -> barrier
//! replace:  stop -> propose BUMP -> barrier -> allocate -> propose RESET -> barrier -> start
//! ```
//!
//! Sagas run inside [`run_saga`], which restarts the whole sequence on
//! retriable errors. Every step checks the latest configuration first and
//! skips work that an earlier attempt already made durable, so a restart
//! never applies a step twice.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use backon::BackoffBuilder;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::config::MembershipConfig;
use super::configuration::{
    MetadataStorageState, NodeAddress, NodeEndpoints, NodesConfiguration, RoleSet,
    SequencerMembership, ServiceDiscoveryEntry, StorageAttributes, StorageState,
};
use super::error::{MembershipError, Result, ViolationKind};
use super::identity::allocate_indices;
use super::manager::NodesConfigurationManager;
use super::metrics;
use super::propagation::{HttpParticipant, Participant, PropagationOptions, await_version};
use super::retry;
use super::update::{NodeUpdate, ShardSelector, Update};
use crate::constants::{DEFAULT_NUM_SHARDS, DEFAULT_SAGA_OUTER_TRIES};
use crate::types::{ConfigVersion, NodeGeneration, NodeIndex};

/// Starts and stops the processes behind node indices.
#[async_trait]
pub trait NodeLauncher: Send + Sync {
    async fn start(
        &self,
        index: NodeIndex,
        generation: NodeGeneration,
        entry: &ServiceDiscoveryEntry,
    ) -> Result<()>;

    /// Graceful stop.
    async fn stop(&self, index: NodeIndex) -> Result<()>;

    /// Immediate stop.
    async fn kill(&self, index: NodeIndex) -> Result<()>;

    async fn is_running(&self, index: NodeIndex) -> bool;
}

/// Hands out network endpoints for new or replaced nodes.
pub trait EndpointAllocator: Send + Sync {
    fn allocate(&self, index: NodeIndex) -> Result<NodeEndpoints>;
}

/// Who must observe a version before a saga moves on.
pub trait ParticipantSource: Send + Sync {
    fn participants(&self, config: &NodesConfiguration) -> Vec<Arc<dyn Participant>>;
}

/// Fixed participant list.
impl ParticipantSource for Vec<Arc<dyn Participant>> {
    fn participants(&self, _config: &NodesConfiguration) -> Vec<Arc<dyn Participant>> {
        self.clone()
    }
}

/// Every node with an admin endpoint, probed over HTTP.
pub struct IntrospectionParticipants;

impl ParticipantSource for IntrospectionParticipants {
    fn participants(&self, config: &NodesConfiguration) -> Vec<Arc<dyn Participant>> {
        config
            .service_discovery()
            .iter()
            .filter_map(|(index, entry)| {
                let admin = entry.endpoints.admin.as_ref()?;
                Some(Arc::new(HttpParticipant::new(
                    format!("{}:{}", index, entry.name),
                    admin.as_str(),
                )) as Arc<dyn Participant>)
            })
            .collect()
    }
}

/// Hands out `host:port` endpoints from a fixed block per node index.
///
/// Each node gets three ports (data, gossip, admin). Every further
/// allocation for the same index moves to a block `1000 * 3` ports higher,
/// so a replaced node never comes back on its old ports.
pub struct SequentialEndpointAllocator {
    host: String,
    base_port: u16,
    rounds: DashMap<NodeIndex, u32>,
}

impl SequentialEndpointAllocator {
    const PORTS_PER_NODE: u32 = 3;
    const ROUND_STRIDE: u32 = 1000 * Self::PORTS_PER_NODE;

    pub fn new(host: impl Into<String>, base_port: u16) -> Self {
        Self {
            host: host.into(),
            base_port,
            rounds: DashMap::new(),
        }
    }
}

impl EndpointAllocator for SequentialEndpointAllocator {
    fn allocate(&self, index: NodeIndex) -> Result<NodeEndpoints> {
        let round = {
            let mut round = self.rounds.entry(index).or_insert(0);
            let current = *round;
            *round += 1;
            current
        };
        let first = self.base_port as u32
            + index.value() as u32 * Self::PORTS_PER_NODE
            + round * Self::ROUND_STRIDE;
        let port = |k: u32| -> Result<u16> {
            u16::try_from(first + k).map_err(|_| {
                MembershipError::Config(format!("port range exhausted allocating {}", index))
            })
        };
        Ok(NodeEndpoints::new(NodeAddress::tcp(&self.host, port(0)?))
            .with_gossip(NodeAddress::tcp(&self.host, port(1)?))
            .with_admin(NodeAddress::tcp(&self.host, port(2)?)))
    }
}

/// Saga settings.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub outer_tries: usize,
    pub propagation: PropagationOptions,
    /// Treat a barrier timeout as success (logged) instead of a failure.
    pub proceed_on_propagation_timeout: bool,
    pub default_num_shards: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            outer_tries: DEFAULT_SAGA_OUTER_TRIES,
            propagation: PropagationOptions::default(),
            proceed_on_propagation_timeout: false,
            default_num_shards: DEFAULT_NUM_SHARDS,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &MembershipConfig) -> Self {
        Self {
            outer_tries: config.saga_outer_tries,
            propagation: PropagationOptions {
                timeout: Some(config.propagation_timeout),
                poll_interval: config.propagation_poll_interval,
            },
            proceed_on_propagation_timeout: config.proceed_on_propagation_timeout,
            default_num_shards: config.default_num_shards,
        }
    }
}

/// Description of a node to add.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNodeSpec {
    /// `None` takes the smallest free index.
    #[serde(default)]
    pub index: Option<NodeIndex>,
    pub name: String,
    pub roles: RoleSet,
    #[serde(default)]
    pub num_shards: Option<u16>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub sequencer_weight: Option<f64>,
    #[serde(default)]
    pub storage_capacity: Option<f64>,
}

impl NewNodeSpec {
    pub fn new(name: impl Into<String>, roles: RoleSet) -> Self {
        Self {
            index: None,
            name: name.into(),
            roles,
            num_shards: None,
            location: None,
            tags: BTreeMap::new(),
            sequencer_weight: None,
            storage_capacity: None,
        }
    }

    pub fn with_index(mut self, index: NodeIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_shards(mut self, num_shards: u16) -> Self {
        self.num_shards = Some(num_shards);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandResult {
    pub added: Vec<NodeIndex>,
    pub version: ConfigVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceResult {
    pub index: NodeIndex,
    pub generation: NodeGeneration,
    pub version: ConfigVersion,
}

/// Attribute changes for one node. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAttributesChange {
    #[serde(default)]
    pub storage_state: Option<StorageState>,
    #[serde(default)]
    pub metadata_state: Option<MetadataStorageState>,
    #[serde(default)]
    pub sequencer_enabled: Option<bool>,
    #[serde(default)]
    pub sequencer_weight: Option<f64>,
    #[serde(default)]
    pub exclude_from_placement: Option<bool>,
}

impl NodeAttributesChange {
    pub fn is_empty(&self) -> bool {
        self.storage_state.is_none()
            && self.metadata_state.is_none()
            && self.sequencer_enabled.is_none()
            && self.sequencer_weight.is_none()
            && self.exclude_from_placement.is_none()
    }

    fn ops(&self, index: NodeIndex) -> Vec<NodeUpdate> {
        let mut ops = Vec::new();
        if self.storage_state.is_some() || self.metadata_state.is_some() {
            ops.push(NodeUpdate::SetStorageState {
                index,
                shards: ShardSelector::All,
                state: self.storage_state,
                metadata: self.metadata_state,
            });
        }
        if self.sequencer_enabled.is_some() || self.sequencer_weight.is_some() {
            ops.push(NodeUpdate::SetSequencer {
                index,
                enabled: self.sequencer_enabled,
                weight: self.sequencer_weight,
            });
        }
        if let Some(exclude) = self.exclude_from_placement {
            ops.push(NodeUpdate::SetExcludeFromPlacement { index, exclude });
        }
        ops
    }
}

/// Run `attempt` until it succeeds, fails permanently, or `tries` runs.
pub async fn run_saga<T, F, Fut>(name: &str, tries: usize, mut attempt: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = retry::saga_policy_with_tries(tries.max(1)).build();
    let mut run = 0usize;
    loop {
        run += 1;
        match attempt(run).await {
            Ok(value) => {
                metrics::record_saga(name, "success");
                if run > 1 {
                    retry::record_retry_success("saga");
                }
                return Ok(value);
            }
            Err(e) if e.is_retriable() => match delays.next() {
                Some(delay) => {
                    retry::record_retry_attempt("saga", run);
                    warn!(saga = name, attempt = run, delay_ms = delay.as_millis() as u64, error = %e, "Saga attempt failed, restarting");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    retry::record_retry_exhausted("saga");
                    metrics::record_saga(name, "exhausted");
                    return Err(MembershipError::RetriesExhausted {
                        operation: name.to_string(),
                        attempts: run,
                        last: Box::new(e),
                    });
                }
            },
            Err(e) => {
                metrics::record_saga(name, "failed");
                warn!(saga = name, attempt = run, error = %e, "Saga failed permanently");
                return Err(e);
            }
        }
    }
}

fn check_distinct<T: Ord + Clone + std::fmt::Display>(
    items: impl IntoIterator<Item = T>,
    kind: ViolationKind,
    what: &str,
) -> Result<()> {
    let mut seen = BTreeSet::new();
    for item in items {
        if !seen.insert(item.clone()) {
            return Err(MembershipError::violation(
                kind,
                format!("{} {} given more than once", what, item),
            ));
        }
    }
    Ok(())
}

pub struct Orchestrator {
    manager: Arc<NodesConfigurationManager>,
    launcher: Arc<dyn NodeLauncher>,
    endpoints: Arc<dyn EndpointAllocator>,
    participants: Arc<dyn ParticipantSource>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        manager: Arc<NodesConfigurationManager>,
        launcher: Arc<dyn NodeLauncher>,
        endpoints: Arc<dyn EndpointAllocator>,
        participants: Arc<dyn ParticipantSource>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            manager,
            launcher,
            endpoints,
            participants,
            config,
        }
    }

    pub fn manager(&self) -> &Arc<NodesConfigurationManager> {
        &self.manager
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Wait for `target` to reach the current participant set.
    pub async fn barrier(&self, target: ConfigVersion) -> Result<()> {
        let participants = self.participants.participants(&self.manager.current());
        let report = await_version(target, &participants, self.config.propagation).await;
        if report.timed_out && self.config.proceed_on_propagation_timeout {
            warn!(
                target = %target,
                lagging = ?report.lagging(),
                "Proceeding despite propagation timeout"
            );
            return Ok(());
        }
        report.into_result().map(|_| ())
    }

    // =========================================================================
    // Expand
    // =========================================================================

    /// Add nodes, wait for propagation, then start them.
    pub async fn expand(&self, specs: Vec<NewNodeSpec>) -> Result<ExpandResult> {
        if specs.is_empty() {
            return Err(MembershipError::violation(
                ViolationKind::EmptyUpdate,
                "expand needs at least one node",
            ));
        }
        check_distinct(
            specs.iter().filter_map(|s| s.index),
            ViolationKind::DuplicateIndex,
            "index",
        )?;
        check_distinct(
            specs.iter().map(|s| s.name.clone()),
            ViolationKind::DuplicateName,
            "name",
        )?;

        let specs = &specs;
        run_saga("expand", self.config.outer_tries, |_| self.expand_once(specs)).await
    }

    async fn expand_once(&self, specs: &[NewNodeSpec]) -> Result<ExpandResult> {
        let mut placed: Vec<NodeIndex> = Vec::new();
        let proposal = self
            .manager
            .propose_if(|cfg| {
                placed.clear();
                let (update, indices) = self.expand_update(cfg, specs)?;
                placed = indices;
                Ok((!update.is_empty()).then_some(update))
            })
            .await?;

        let version = proposal.config.version();
        self.barrier(version).await?;

        let cfg = self.manager.current();
        for index in &placed {
            if self.launcher.is_running(*index).await {
                continue;
            }
            let entry = cfg.node(*index).ok_or_else(|| {
                MembershipError::NotFound(format!("{} vanished before start", index))
            })?;
            let generation = cfg.generation(*index).unwrap_or(NodeGeneration::INITIAL);
            self.launcher.start(*index, generation, entry).await?;
        }

        info!(added = ?placed, version = %version, "Expand complete");
        Ok(ExpandResult {
            added: placed,
            version,
        })
    }

    /// ADD ops for specs not yet present, plus the index of every spec.
    fn expand_update(
        &self,
        cfg: &NodesConfiguration,
        specs: &[NewNodeSpec],
    ) -> Result<(Update, Vec<NodeIndex>)> {
        let mut indices: Vec<Option<NodeIndex>> = Vec::with_capacity(specs.len());
        for spec in specs {
            let existing = cfg.node_by_name(&spec.name).map(|(i, _)| i);
            match (spec.index, existing) {
                (Some(wanted), Some(found)) if wanted == found => indices.push(Some(found)),
                (None, Some(found)) => indices.push(Some(found)),
                (_, Some(found)) => {
                    return Err(MembershipError::violation(
                        ViolationKind::DuplicateName,
                        format!("name '{}' already used by {}", spec.name, found),
                    ));
                }
                (Some(wanted), None) if cfg.contains(wanted) => {
                    return Err(MembershipError::violation(
                        ViolationKind::DuplicateIndex,
                        format!("{} already present", wanted),
                    ));
                }
                (wanted, None) => indices.push(wanted),
            }
        }

        let reserved: BTreeSet<NodeIndex> = indices.iter().flatten().copied().collect();
        let missing = indices.iter().filter(|i| i.is_none()).count();
        let mut fresh = allocate_indices(cfg, missing, &reserved)?.into_iter();

        let mut update = Update::new().with_maintenance("expand");
        let mut resolved = Vec::with_capacity(specs.len());
        for (spec, index) in specs.iter().zip(indices) {
            let index = match index {
                Some(index) => index,
                None => fresh.next().ok_or_else(|| {
                    MembershipError::violation(ViolationKind::InvalidField, "index allocation fell short")
                })?,
            };
            resolved.push(index);
            if cfg.contains(index) {
                continue;
            }

            let mut entry =
                ServiceDiscoveryEntry::new(&spec.name, self.endpoints.allocate(index)?, spec.roles);
            entry.location = spec.location.clone();
            entry.tags = spec.tags.clone();

            let attributes = spec.roles.storage.then(|| {
                let attrs =
                    StorageAttributes::new(spec.num_shards.unwrap_or(self.config.default_num_shards));
                match spec.storage_capacity {
                    Some(capacity) => attrs.with_capacity(capacity),
                    None => attrs,
                }
            });
            let sequencer = spec.roles.sequencer.then(|| SequencerMembership {
                enabled: true,
                weight: spec.sequencer_weight.unwrap_or(1.0),
            });
            update = update.push(NodeUpdate::Add {
                index,
                entry,
                attributes,
                sequencer,
            });
        }
        Ok((update, resolved))
    }

    // =========================================================================
    // Shrink / Remove
    // =========================================================================

    async fn validate_targets(&self, indices: &[NodeIndex]) -> Result<Arc<NodesConfiguration>> {
        if indices.is_empty() {
            return Err(MembershipError::violation(
                ViolationKind::EmptyUpdate,
                "no nodes given",
            ));
        }
        check_distinct(indices.iter().copied(), ViolationKind::DuplicateIndex, "index")?;
        let cfg = self.manager.refresh().await?;
        if let Some(missing) = indices.iter().find(|i| !cfg.contains(**i)) {
            return Err(MembershipError::violation(
                ViolationKind::UnknownNode,
                format!("{} is not in the configuration", missing),
            ));
        }
        Ok(cfg)
    }

    /// Kill, drain and remove nodes in one update.
    pub async fn shrink(&self, indices: Vec<NodeIndex>) -> Result<ConfigVersion> {
        self.validate_targets(&indices).await?;
        let indices = &indices;
        run_saga("shrink", self.config.outer_tries, |_| self.shrink_once(indices)).await
    }

    async fn shrink_once(&self, indices: &[NodeIndex]) -> Result<ConfigVersion> {
        for index in indices {
            if self.launcher.is_running(*index).await {
                self.launcher.kill(*index).await?;
            }
        }

        let proposal = self
            .manager
            .propose_if(|cfg| {
                let mut update = Update::new().with_maintenance("shrink");
                for index in indices.iter().filter(|i| cfg.contains(**i)) {
                    if cfg.storage_attributes(*index).is_some() {
                        update = update.drain(*index);
                    }
                    update = update.remove(*index);
                }
                Ok((!update.is_empty()).then_some(update))
            })
            .await?;

        let version = proposal.config.version();
        self.barrier(version).await?;
        info!(removed = ?indices, version = %version, "Shrink complete");
        Ok(version)
    }

    /// Plain REMOVE. Fails with `NodeOwnsData` if any target still holds data.
    pub async fn remove(&self, indices: Vec<NodeIndex>) -> Result<ConfigVersion> {
        self.validate_targets(&indices).await?;
        let indices = &indices;
        run_saga("remove", self.config.outer_tries, |_| async move {
            let proposal = self
                .manager
                .propose_if(|cfg| {
                    let update = indices
                        .iter()
                        .filter(|i| cfg.contains(**i))
                        .fold(Update::new().with_maintenance("remove"), |u, i| u.remove(*i));
                    Ok((!update.is_empty()).then_some(update))
                })
                .await?;
            let version = proposal.config.version();
            self.barrier(version).await?;
            Ok(version)
        })
        .await
    }

    // =========================================================================
    // Replace / Generation
    // =========================================================================

    /// Swap the process behind `index` for a new one with new endpoints.
    pub async fn replace(&self, index: NodeIndex) -> Result<ReplaceResult> {
        let cfg = self.validate_targets(&[index]).await?;
        let original = cfg
            .node(index)
            .map(|e| e.version)
            .ok_or_else(|| MembershipError::NotFound(format!("{}", index)))?;
        let storage = cfg.storage_attributes(index).is_some();
        let start_generation = cfg.generation(index).unwrap_or(NodeGeneration::INITIAL);

        // Progress reported by whichever attempt made each step durable.
        let bumped_to = &AtomicU32::new(0);
        let reset_to = &AtomicU64::new(0);

        run_saga("replace", self.config.outer_tries, |_| async move {
            if self.launcher.is_running(index).await {
                self.launcher.stop(index).await?;
            }

            if storage {
                let proposal = self
                    .manager
                    .propose_if(|cfg| {
                        let current = cfg.generation(index).ok_or_else(|| {
                            MembershipError::NotFound(format!("{} removed during replace", index))
                        })?;
                        if current > start_generation {
                            bumped_to.store(current.value(), Ordering::SeqCst);
                            return Ok(None);
                        }
                        Ok(Some(
                            Update::new()
                                .with_maintenance("replace:bump_generation")
                                .bump_generation(index),
                        ))
                    })
                    .await?;
                if proposal.changed {
                    bumped_to.store(
                        proposal
                            .config
                            .generation(index)
                            .map(NodeGeneration::value)
                            .unwrap_or(0),
                        Ordering::SeqCst,
                    );
                }
                self.barrier(proposal.config.version()).await?;
            }

            let proposal = self
                .manager
                .propose_if(|cfg| {
                    let entry = cfg.node(index).ok_or_else(|| {
                        MembershipError::NotFound(format!("{} removed during replace", index))
                    })?;
                    if entry.version > original {
                        reset_to.store(entry.version, Ordering::SeqCst);
                        return Ok(None);
                    }
                    let mut next = entry.clone();
                    next.endpoints = self.endpoints.allocate(index)?;
                    next.version = original + 1;
                    Ok(Some(
                        Update::new()
                            .with_maintenance("replace:reset")
                            .reset(index, next),
                    ))
                })
                .await?;
            if proposal.changed {
                reset_to.store(original + 1, Ordering::SeqCst);
            }
            let version = proposal.config.version();
            self.barrier(version).await?;

            let cfg = proposal.config;
            let entry = cfg
                .node(index)
                .ok_or_else(|| MembershipError::NotFound(format!("{}", index)))?;
            let generation = cfg.generation(index).unwrap_or(NodeGeneration::INITIAL);
            if !self.launcher.is_running(index).await {
                self.launcher.start(index, generation, entry).await?;
            }

            info!(
                index = %index,
                generation = %generation,
                bumped_to = bumped_to.load(Ordering::SeqCst),
                sd_version = reset_to.load(Ordering::SeqCst),
                version = %version,
                "Replace complete"
            );
            Ok(ReplaceResult {
                index,
                generation,
                version,
            })
        })
        .await
    }

    /// Increment the generation of every index in one update and wait for
    /// propagation.
    ///
    /// Generations are recorded before the first attempt; a restarted attempt
    /// only bumps indices that are still at or below their recorded value.
    pub async fn bump_generation(&self, indices: Vec<NodeIndex>) -> Result<ConfigVersion> {
        let cfg = self.validate_targets(&indices).await?;
        let start: BTreeMap<NodeIndex, NodeGeneration> = indices
            .iter()
            .map(|i| (*i, cfg.generation(*i).unwrap_or(NodeGeneration::INITIAL)))
            .collect();
        let start = &start;
        run_saga("bump_generation", self.config.outer_tries, |_| async move {
            let proposal = self
                .manager
                .propose_if(|cfg| {
                    let mut update = Update::new().with_maintenance("bump_generation");
                    for (index, recorded) in start {
                        let current = cfg.generation(*index).ok_or_else(|| {
                            MembershipError::NotFound(format!(
                                "{} removed during bump_generation",
                                index
                            ))
                        })?;
                        if current <= *recorded {
                            update = update.bump_generation(*index);
                        }
                    }
                    Ok((!update.is_empty()).then_some(update))
                })
                .await?;
            let version = proposal.config.version();
            self.barrier(version).await?;
            Ok(version)
        })
        .await
    }

    /// Apply attribute changes to several nodes in one update.
    pub async fn update_attributes(
        &self,
        changes: Vec<(NodeIndex, NodeAttributesChange)>,
    ) -> Result<ConfigVersion> {
        if changes.iter().all(|(_, c)| c.is_empty()) {
            return Err(MembershipError::violation(
                ViolationKind::EmptyUpdate,
                "no attribute changes given",
            ));
        }
        let seen: HashSet<NodeIndex> = changes.iter().map(|(i, _)| *i).collect();
        if seen.len() != changes.len() {
            return Err(MembershipError::violation(
                ViolationKind::DuplicateIndex,
                "a node appears more than once",
            ));
        }

        let changes = &changes;
        run_saga("update_attributes", self.config.outer_tries, |_| async move {
            let cfg = self
                .manager
                .propose(|_| {
                    let ops = changes.iter().flat_map(|(index, change)| change.ops(*index));
                    Ok(ops.fold(Update::new().with_maintenance("update_attributes"), Update::push))
                })
                .await?;
            self.barrier(cfg.version()).await?;
            Ok(cfg.version())
        })
        .await
    }
}

/// In-memory launcher for tests and demos.
///
/// Running nodes report whatever `replica` holds, so a started node
/// converges as soon as the proposer's replica does.
#[cfg(any(test, feature = "test-utilities"))]
pub mod testing {
    use super::*;
    use crate::cluster::propagation::{ReplicaParticipant, StaticParticipant};
    use crate::cluster::replica::LocalReplica;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum LaunchEvent {
        Start(NodeIndex, NodeGeneration),
        Stop(NodeIndex),
        Kill(NodeIndex),
    }

    pub struct InMemoryLauncher {
        replica: Arc<LocalReplica>,
        running: Mutex<BTreeMap<NodeIndex, NodeGeneration>>,
        events: Mutex<Vec<LaunchEvent>>,
        failing_starts: AtomicUsize,
    }

    impl InMemoryLauncher {
        pub fn new(replica: Arc<LocalReplica>) -> Self {
            Self {
                replica,
                running: Mutex::new(BTreeMap::new()),
                events: Mutex::new(Vec::new()),
                failing_starts: AtomicUsize::new(0),
            }
        }

        /// Mark nodes as already running at the initial generation.
        pub fn with_running(self, indices: impl IntoIterator<Item = NodeIndex>) -> Self {
            {
                let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
                for index in indices {
                    running.insert(index, NodeGeneration::INITIAL);
                }
            }
            self
        }

        /// Make the next `n` starts fail with a launcher error.
        pub fn fail_next_starts(&self, n: usize) {
            self.failing_starts.store(n, Ordering::SeqCst);
        }

        pub fn events(&self) -> Vec<LaunchEvent> {
            self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        pub fn running_generation(&self, index: NodeIndex) -> Option<NodeGeneration> {
            self.running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&index)
                .copied()
        }

        fn record(&self, event: LaunchEvent) {
            self.events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event);
        }
    }

    #[async_trait]
    impl NodeLauncher for InMemoryLauncher {
        async fn start(
            &self,
            index: NodeIndex,
            generation: NodeGeneration,
            _entry: &ServiceDiscoveryEntry,
        ) -> Result<()> {
            let remaining = self.failing_starts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_starts.store(remaining - 1, Ordering::SeqCst);
                return Err(MembershipError::Launcher(format!("injected start failure for {}", index)));
            }
            self.running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(index, generation);
            self.record(LaunchEvent::Start(index, generation));
            Ok(())
        }

        async fn stop(&self, index: NodeIndex) -> Result<()> {
            self.running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&index);
            self.record(LaunchEvent::Stop(index));
            Ok(())
        }

        async fn kill(&self, index: NodeIndex) -> Result<()> {
            self.running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&index);
            self.record(LaunchEvent::Kill(index));
            Ok(())
        }

        async fn is_running(&self, index: NodeIndex) -> bool {
            self.running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&index)
        }
    }

    impl ParticipantSource for InMemoryLauncher {
        fn participants(&self, config: &NodesConfiguration) -> Vec<Arc<dyn Participant>> {
            let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            config
                .indices()
                .map(|index| {
                    let name = index.to_string();
                    if running.contains_key(&index) {
                        Arc::new(ReplicaParticipant::new(name, self.replica.clone()))
                            as Arc<dyn Participant>
                    } else {
                        let stopped = StaticParticipant::new(name);
                        stopped.set_stopped(true);
                        Arc::new(stopped) as Arc<dyn Participant>
                    }
                })
                .collect()
        }
    }

    /// Test config: fast barriers, short saga backoff.
    pub fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            outer_tries: 3,
            propagation: PropagationOptions {
                timeout: Some(Duration::from_secs(2)),
                poll_interval: Duration::from_millis(5),
            },
            proceed_on_propagation_timeout: false,
            default_num_shards: 2,
        }
    }
}

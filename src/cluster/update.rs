//! Pure update algebra over [`NodesConfiguration`].
//!
//! [`apply`] takes a borrowed snapshot and an [`Update`] and either returns a
//! brand-new snapshot with `version = old.version + 1`, or an
//! [`MembershipError::InvariantViolation`]. The input is never modified, so
//! a rejected update has no observable effect.
//!
//! Operations inside one update run in list order against a private working
//! copy. The full invariant check runs once at the end, which allows an
//! update to pass through intermediate states (for example: zero a node's
//! shards, then remove it) as long as the final state is consistent.

use serde::{Deserialize, Serialize};

use super::configuration::{
    MetadataStorageState, NodesConfiguration, SequencerMembership, ServiceDiscoveryEntry,
    ShardMembership, StorageAttributes, StorageState, validate_weight,
};
use super::error::{MembershipError, Result, ViolationKind};
use crate::types::{NodeIndex, ShardIndex};

/// Which shards of a node an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardSelector {
    All,
    List(Vec<ShardIndex>),
}

/// A single node-scoped operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NodeUpdate {
    /// Add a new node. Storage nodes need `attributes`; sequencer nodes get
    /// `sequencer` or the default enabled/weight 1.0 membership.
    Add {
        index: NodeIndex,
        entry: ServiceDiscoveryEntry,
        attributes: Option<StorageAttributes>,
        sequencer: Option<SequencerMembership>,
    },
    /// Replace the service discovery entry of an existing node.
    ResetServiceDiscovery {
        index: NodeIndex,
        entry: ServiceDiscoveryEntry,
    },
    /// Remove a node that no longer holds any data.
    Remove { index: NodeIndex },
    /// Change data and/or metadata state of some shards.
    SetStorageState {
        index: NodeIndex,
        shards: ShardSelector,
        state: Option<StorageState>,
        metadata: Option<MetadataStorageState>,
    },
    /// Change sequencer enabled flag and/or weight.
    SetSequencer {
        index: NodeIndex,
        enabled: Option<bool>,
        weight: Option<f64>,
    },
    /// Increment the fencing generation.
    BumpGeneration { index: NodeIndex },
    /// Toggle placement exclusion of a storage node.
    SetExcludeFromPlacement { index: NodeIndex, exclude: bool },
}

impl NodeUpdate {
    /// Index this operation targets.
    pub fn index(&self) -> NodeIndex {
        match self {
            NodeUpdate::Add { index, .. }
            | NodeUpdate::ResetServiceDiscovery { index, .. }
            | NodeUpdate::Remove { index }
            | NodeUpdate::SetStorageState { index, .. }
            | NodeUpdate::SetSequencer { index, .. }
            | NodeUpdate::BumpGeneration { index }
            | NodeUpdate::SetExcludeFromPlacement { index, .. } => *index,
        }
    }

    /// Short name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            NodeUpdate::Add { .. } => "add",
            NodeUpdate::ResetServiceDiscovery { .. } => "reset_service_discovery",
            NodeUpdate::Remove { .. } => "remove",
            NodeUpdate::SetStorageState { .. } => "set_storage_state",
            NodeUpdate::SetSequencer { .. } => "set_sequencer",
            NodeUpdate::BumpGeneration { .. } => "bump_generation",
            NodeUpdate::SetExcludeFromPlacement { .. } => "set_exclude_from_placement",
        }
    }
}

/// An ordered batch of node operations applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<NodeUpdate>,
    /// Tag recorded as `last_maintenance` of the resulting snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<String>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_maintenance(mut self, tag: impl Into<String>) -> Self {
        self.maintenance = Some(tag.into());
        self
    }

    pub fn push(mut self, op: NodeUpdate) -> Self {
        self.ops.push(op);
        self
    }

    pub fn add(
        self,
        index: NodeIndex,
        entry: ServiceDiscoveryEntry,
        attributes: Option<StorageAttributes>,
    ) -> Self {
        self.push(NodeUpdate::Add {
            index,
            entry,
            attributes,
            sequencer: None,
        })
    }

    pub fn reset(self, index: NodeIndex, entry: ServiceDiscoveryEntry) -> Self {
        self.push(NodeUpdate::ResetServiceDiscovery { index, entry })
    }

    pub fn remove(self, index: NodeIndex) -> Self {
        self.push(NodeUpdate::Remove { index })
    }

    pub fn set_storage_state(self, index: NodeIndex, state: StorageState) -> Self {
        self.push(NodeUpdate::SetStorageState {
            index,
            shards: ShardSelector::All,
            state: Some(state),
            metadata: None,
        })
    }

    /// Zero both data and metadata state of every shard.
    pub fn drain(self, index: NodeIndex) -> Self {
        self.push(NodeUpdate::SetStorageState {
            index,
            shards: ShardSelector::All,
            state: Some(StorageState::None),
            metadata: Some(MetadataStorageState::None),
        })
    }

    pub fn set_sequencer(self, index: NodeIndex, enabled: Option<bool>, weight: Option<f64>) -> Self {
        self.push(NodeUpdate::SetSequencer {
            index,
            enabled,
            weight,
        })
    }

    pub fn bump_generation(self, index: NodeIndex) -> Self {
        self.push(NodeUpdate::BumpGeneration { index })
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Apply `update` to `old`, producing the next snapshot.
pub fn apply(old: &NodesConfiguration, update: &Update) -> Result<NodesConfiguration> {
    apply_at(old, update, now_millis())
}

/// Like [`apply`] with an explicit change timestamp.
pub fn apply_at(
    old: &NodesConfiguration,
    update: &Update,
    timestamp_ms: u64,
) -> Result<NodesConfiguration> {
    if update.is_empty() {
        return Err(MembershipError::violation(
            ViolationKind::EmptyUpdate,
            "update contains no operations",
        ));
    }

    let mut next = old.clone();
    for op in &update.ops {
        apply_op(&mut next, op)?;
    }
    next.validate()?;

    let version = old.version.next();
    if version <= old.version {
        return Err(MembershipError::violation(
            ViolationKind::NonMonotonicVersion,
            format!("version {} cannot advance", old.version),
        ));
    }
    next.version = version;
    next.last_change_timestamp_ms = timestamp_ms.max(old.last_change_timestamp_ms);
    next.last_maintenance = update.maintenance.clone();
    Ok(next)
}

fn apply_op(cfg: &mut NodesConfiguration, op: &NodeUpdate) -> Result<()> {
    match op {
        NodeUpdate::Add {
            index,
            entry,
            attributes,
            sequencer,
        } => add_node(cfg, *index, entry, attributes.as_ref(), sequencer.as_ref()),
        NodeUpdate::ResetServiceDiscovery { index, entry } => reset_node(cfg, *index, entry),
        NodeUpdate::Remove { index } => remove_node(cfg, *index),
        NodeUpdate::SetStorageState {
            index,
            shards,
            state,
            metadata,
        } => set_storage_state(cfg, *index, shards, *state, *metadata),
        NodeUpdate::SetSequencer {
            index,
            enabled,
            weight,
        } => set_sequencer(cfg, *index, *enabled, *weight),
        NodeUpdate::BumpGeneration { index } => bump_generation(cfg, *index),
        NodeUpdate::SetExcludeFromPlacement { index, exclude } => {
            let attrs = storage_attrs_mut(cfg, *index)?;
            attrs.exclude_from_placement = *exclude;
            Ok(())
        }
    }
}

fn add_node(
    cfg: &mut NodesConfiguration,
    index: NodeIndex,
    entry: &ServiceDiscoveryEntry,
    attributes: Option<&StorageAttributes>,
    sequencer: Option<&SequencerMembership>,
) -> Result<()> {
    if cfg.contains(index) {
        return Err(MembershipError::violation(
            ViolationKind::DuplicateIndex,
            format!("{} already exists", index),
        ));
    }
    if index > NodeIndex::MAX {
        return Err(MembershipError::violation(
            ViolationKind::InvalidField,
            format!("{} exceeds the maximum node index", index),
        ));
    }
    if let Some((other, _)) = cfg.node_by_name(&entry.name) {
        return Err(MembershipError::violation(
            ViolationKind::DuplicateName,
            format!("name '{}' already used by {}", entry.name, other),
        ));
    }

    match (entry.roles.storage, attributes) {
        (true, Some(attrs)) => {
            if attrs.num_shards == 0 {
                return Err(MembershipError::violation(
                    ViolationKind::StorageRoleMismatch,
                    format!("storage node {} needs at least one shard", index),
                ));
            }
            cfg.storage_attributes.insert(index, attrs.clone());
            cfg.storage_membership
                .insert(index, vec![ShardMembership::EMPTY; attrs.num_shards as usize]);
        }
        (true, None) => {
            return Err(MembershipError::violation(
                ViolationKind::StorageRoleMismatch,
                format!("storage node {} added without storage attributes", index),
            ));
        }
        (false, Some(_)) => {
            return Err(MembershipError::violation(
                ViolationKind::StorageRoleMismatch,
                format!("node {} has storage attributes but no storage role", index),
            ));
        }
        (false, None) => {}
    }

    match (entry.roles.sequencer, sequencer) {
        (true, seq) => {
            let seq = seq.copied().unwrap_or_default();
            validate_weight(seq.weight)?;
            cfg.sequencer_membership.insert(index, seq);
        }
        (false, Some(_)) => {
            return Err(MembershipError::violation(
                ViolationKind::SequencerRoleMismatch,
                format!("node {} has sequencer membership but no sequencer role", index),
            ));
        }
        (false, None) => {}
    }

    cfg.service_discovery.insert(index, entry.clone());
    // `cfg` still carries the base version; the update produces the next one.
    cfg.added_at.insert(index, cfg.version.next());
    Ok(())
}

fn reset_node(
    cfg: &mut NodesConfiguration,
    index: NodeIndex,
    entry: &ServiceDiscoveryEntry,
) -> Result<()> {
    let current = cfg.service_discovery.get(&index).ok_or_else(|| unknown(index))?;
    if current.roles != entry.roles {
        return Err(MembershipError::violation(
            ViolationKind::RoleChange,
            format!(
                "{} roles cannot change from {} to {}",
                index, current.roles, entry.roles
            ),
        ));
    }
    if let Some((other, _)) = cfg.node_by_name(&entry.name)
        && other != index
    {
        return Err(MembershipError::violation(
            ViolationKind::DuplicateName,
            format!("name '{}' already used by {}", entry.name, other),
        ));
    }
    cfg.service_discovery.insert(index, entry.clone());
    Ok(())
}

fn remove_node(cfg: &mut NodesConfiguration, index: NodeIndex) -> Result<()> {
    if !cfg.contains(index) {
        return Err(unknown(index));
    }
    if cfg.has_data(index) {
        return Err(MembershipError::violation(
            ViolationKind::NodeOwnsData,
            format!(
                "{} still has shards with data or metadata; set them to NONE first",
                index
            ),
        ));
    }
    cfg.service_discovery.remove(&index);
    cfg.storage_attributes.remove(&index);
    cfg.storage_membership.remove(&index);
    cfg.sequencer_membership.remove(&index);
    cfg.added_at.remove(&index);
    Ok(())
}

fn set_storage_state(
    cfg: &mut NodesConfiguration,
    index: NodeIndex,
    selector: &ShardSelector,
    state: Option<StorageState>,
    metadata: Option<MetadataStorageState>,
) -> Result<()> {
    if !cfg.contains(index) {
        return Err(unknown(index));
    }
    if state == Some(StorageState::Unknown) || metadata == Some(MetadataStorageState::Unknown) {
        return Err(MembershipError::violation(
            ViolationKind::InvalidField,
            format!("{}: cannot set an unknown storage state", index),
        ));
    }
    let shards = cfg.storage_membership.get_mut(&index).ok_or_else(|| {
        MembershipError::violation(
            ViolationKind::StorageRoleMismatch,
            format!("{} is not a storage node", index),
        )
    })?;

    let targets: Vec<usize> = match selector {
        ShardSelector::All => (0..shards.len()).collect(),
        ShardSelector::List(list) => {
            let mut targets = Vec::with_capacity(list.len());
            for shard in list {
                let pos = shard.value() as usize;
                if pos >= shards.len() {
                    return Err(MembershipError::violation(
                        ViolationKind::ShardOutOfRange,
                        format!("{} has no shard {}", index, shard),
                    ));
                }
                targets.push(pos);
            }
            targets
        }
    };

    for pos in targets {
        if let Some(state) = state {
            shards[pos].state = state;
        }
        if let Some(metadata) = metadata {
            shards[pos].metadata = metadata;
        }
    }
    Ok(())
}

fn set_sequencer(
    cfg: &mut NodesConfiguration,
    index: NodeIndex,
    enabled: Option<bool>,
    weight: Option<f64>,
) -> Result<()> {
    if !cfg.contains(index) {
        return Err(unknown(index));
    }
    let seq = cfg.sequencer_membership.get_mut(&index).ok_or_else(|| {
        MembershipError::violation(
            ViolationKind::SequencerRoleMismatch,
            format!("{} is not a sequencer node", index),
        )
    })?;
    if let Some(weight) = weight {
        validate_weight(weight)?;
        seq.weight = weight;
    }
    if let Some(enabled) = enabled {
        seq.enabled = enabled;
    }
    Ok(())
}

fn bump_generation(cfg: &mut NodesConfiguration, index: NodeIndex) -> Result<()> {
    let attrs = storage_attrs_mut(cfg, index)?;
    let current = attrs.generation;
    attrs.generation = current.next().ok_or_else(|| {
        MembershipError::violation(
            ViolationKind::GenerationOverflow,
            format!("{} generation {} cannot be incremented", index, current),
        )
    })?;
    Ok(())
}

fn storage_attrs_mut(
    cfg: &mut NodesConfiguration,
    index: NodeIndex,
) -> Result<&mut StorageAttributes> {
    if !cfg.contains(index) {
        return Err(unknown(index));
    }
    cfg.storage_attributes.get_mut(&index).ok_or_else(|| {
        MembershipError::violation(
            ViolationKind::StorageRoleMismatch,
            format!("{} has no storage attributes", index),
        )
    })
}

fn unknown(index: NodeIndex) -> MembershipError {
    MembershipError::violation(ViolationKind::UnknownNode, format!("{} does not exist", index))
}

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

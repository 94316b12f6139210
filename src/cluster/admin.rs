//! Administrative requests (add/remove/replace nodes, bump generations,
//! change attributes).
//!
//! Requests are plain serde structs. [`AdminHandler`] validates them,
//! resolves node filters against the latest configuration and hands the
//! work to the [`Orchestrator`]. Each response carries the configuration
//! version that made the change durable.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::configuration::{
    NodesConfiguration, SequencerMembership, ServiceDiscoveryEntry, StorageAttributes,
    validate_location, validate_tag_key,
};
use super::error::{MembershipError, Result, ViolationKind};
use super::identity::{NodeSelector, resolve_selectors};
use super::orchestrator::{NewNodeSpec, NodeAttributesChange, Orchestrator};
use crate::types::{ConfigVersion, NodeGeneration, NodeIndex};

/// Maximum length for node names.
pub const MAX_NODE_NAME_LENGTH: usize = 255;

/// Validate a node name.
///
/// Names must be non-empty, at most 255 characters, made of ASCII letters,
/// digits, `.`, `_` and `-`, must not be `.` or `..` and must not start with
/// a hyphen.
pub fn validate_node_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid("node name cannot be empty"));
    }
    if name.len() > MAX_NODE_NAME_LENGTH {
        return Err(invalid(format!(
            "node name is too long ({} chars, max {})",
            name.len(),
            MAX_NODE_NAME_LENGTH
        )));
    }
    if name == "." || name == ".." {
        return Err(invalid("node name cannot be '.' or '..'"));
    }
    if name.starts_with('-') {
        return Err(invalid(format!("node name '{}' cannot start with a hyphen", name)));
    }
    if let Some((i, c)) = name
        .chars()
        .enumerate()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(invalid(format!(
            "invalid character '{}' in node name at position {}",
            c.escape_default(),
            i
        )));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> MembershipError {
    MembershipError::violation(ViolationKind::InvalidField, message)
}

fn validate_weight(what: &str, weight: Option<f64>) -> Result<()> {
    match weight {
        Some(w) if !w.is_finite() || w < 0.0 => {
            Err(invalid(format!("{} must be a non-negative number, got {}", what, w)))
        }
        _ => Ok(()),
    }
}

fn validate_filters(filters: &[NodeSelector]) -> Result<()> {
    if filters.is_empty() {
        return Err(MembershipError::violation(
            ViolationKind::EmptyUpdate,
            "at least one node filter is required",
        ));
    }
    // An empty selector matches every node, which is never what a
    // destructive request means.
    if filters.iter().any(NodeSelector::is_empty) {
        return Err(invalid("node filter must set index, name or address"));
    }
    Ok(())
}

/// Resolve a selector that must name exactly one node.
fn resolve_one(config: &NodesConfiguration, selector: &NodeSelector) -> Result<NodeIndex> {
    if selector.is_empty() {
        return Err(invalid("node filter must set index, name or address"));
    }
    match selector.resolve(config).as_slice() {
        [index] => Ok(*index),
        [] => Err(MembershipError::NotFound(format!("no node matches {}", selector))),
        many => Err(invalid(format!(
            "{} matches {} nodes, expected exactly one",
            selector,
            many.len()
        ))),
    }
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddNodesRequest {
    pub nodes: Vec<NewNodeSpec>,
}

impl AddNodesRequest {
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(MembershipError::violation(
                ViolationKind::EmptyUpdate,
                "add request has no nodes",
            ));
        }
        for node in &self.nodes {
            validate_node_name(&node.name)?;
            if node.roles.is_empty() {
                return Err(invalid(format!("node '{}' has no roles", node.name)));
            }
            if node.num_shards == Some(0) {
                return Err(invalid(format!("node '{}' must have at least one shard", node.name)));
            }
            if !node.roles.storage && (node.num_shards.is_some() || node.storage_capacity.is_some()) {
                return Err(MembershipError::violation(
                    ViolationKind::StorageRoleMismatch,
                    format!("node '{}' sets storage fields without the storage role", node.name),
                ));
            }
            if !node.roles.sequencer && node.sequencer_weight.is_some() {
                return Err(MembershipError::violation(
                    ViolationKind::SequencerRoleMismatch,
                    format!("node '{}' sets a sequencer weight without the sequencer role", node.name),
                ));
            }
            validate_weight("sequencer weight", node.sequencer_weight)?;
            validate_weight("storage capacity", node.storage_capacity)?;
            if let Some(location) = &node.location {
                validate_location(location)?;
            }
            for key in node.tags.keys() {
                validate_tag_key(key)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveNodesRequest {
    pub filters: Vec<NodeSelector>,
    /// Zero out shard states before removing. Without it, nodes that still
    /// hold data are rejected.
    #[serde(default)]
    pub drain: bool,
}

impl RemoveNodesRequest {
    pub fn validate(&self) -> Result<()> {
        validate_filters(&self.filters)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceNodeRequest {
    pub node: NodeSelector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BumpGenerationRequest {
    pub filters: Vec<NodeSelector>,
}

impl BumpGenerationRequest {
    pub fn validate(&self) -> Result<()> {
        validate_filters(&self.filters)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttributesUpdate {
    pub node: NodeSelector,
    #[serde(flatten)]
    pub change: NodeAttributesChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateNodeAttributesRequest {
    pub updates: Vec<NodeAttributesUpdate>,
}

impl UpdateNodeAttributesRequest {
    pub fn validate(&self) -> Result<()> {
        if self.updates.is_empty() || self.updates.iter().all(|u| u.change.is_empty()) {
            return Err(MembershipError::violation(
                ViolationKind::EmptyUpdate,
                "attribute update changes nothing",
            ));
        }
        for update in &self.updates {
            validate_weight("sequencer weight", update.change.sequencer_weight)?;
        }
        Ok(())
    }
}

/// Read-only query. No filters lists every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListNodesRequest {
    #[serde(default)]
    pub filters: Vec<NodeSelector>,
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedNode {
    pub index: NodeIndex,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddNodesResponse {
    pub added: Vec<AddedNode>,
    pub version: ConfigVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveNodesResponse {
    pub removed: Vec<NodeIndex>,
    pub version: ConfigVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceNodeResponse {
    pub index: NodeIndex,
    pub generation: NodeGeneration,
    pub version: ConfigVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BumpedGeneration {
    pub index: NodeIndex,
    pub generation: NodeGeneration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BumpGenerationResponse {
    pub bumped: Vec<BumpedGeneration>,
    pub version: ConfigVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNodeAttributesResponse {
    pub updated: Vec<NodeIndex>,
    pub version: ConfigVersion,
}

/// One node as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub index: NodeIndex,
    #[serde(flatten)]
    pub entry: ServiceDiscoveryEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageAttributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequencer: Option<SequencerMembership>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListNodesResponse {
    pub version: ConfigVersion,
    pub nodes: Vec<NodeView>,
}

// =============================================================================
// Handler
// =============================================================================

/// Entry point for administrative requests.
pub struct AdminHandler {
    orchestrator: Arc<Orchestrator>,
}

impl AdminHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn latest(&self) -> Result<Arc<NodesConfiguration>> {
        self.orchestrator.manager().refresh().await
    }

    pub async fn list_nodes(&self, request: ListNodesRequest) -> Result<ListNodesResponse> {
        let cfg = self.latest().await?;
        let indices: BTreeSet<NodeIndex> = if request.filters.is_empty() {
            cfg.indices().collect()
        } else {
            resolve_selectors(&cfg, &request.filters)?
        };
        let nodes = indices
            .into_iter()
            .filter_map(|index| {
                let entry = cfg.node(index)?.clone();
                Some(NodeView {
                    index,
                    entry,
                    storage: cfg.storage_attributes(index).cloned(),
                    sequencer: cfg.sequencer(index).copied(),
                })
            })
            .collect();
        Ok(ListNodesResponse {
            version: cfg.version(),
            nodes,
        })
    }

    pub async fn add_nodes(&self, request: AddNodesRequest) -> Result<AddNodesResponse> {
        request.validate()?;
        debug!(count = request.nodes.len(), "Handling add nodes request");

        let result = self.orchestrator.expand(request.nodes.clone()).await?;
        let added = result
            .added
            .iter()
            .zip(&request.nodes)
            .map(|(index, spec)| AddedNode {
                index: *index,
                name: spec.name.clone(),
            })
            .collect();
        info!(version = %result.version, "Add nodes request complete");
        Ok(AddNodesResponse {
            added,
            version: result.version,
        })
    }

    pub async fn remove_nodes(&self, request: RemoveNodesRequest) -> Result<RemoveNodesResponse> {
        request.validate()?;
        let cfg = self.latest().await?;
        let removed: Vec<NodeIndex> = resolve_selectors(&cfg, &request.filters)?
            .into_iter()
            .collect();
        debug!(nodes = ?removed, drain = request.drain, "Handling remove nodes request");

        let version = if request.drain {
            self.orchestrator.shrink(removed.clone()).await?
        } else {
            self.orchestrator.remove(removed.clone()).await?
        };
        Ok(RemoveNodesResponse { removed, version })
    }

    pub async fn replace_node(&self, request: ReplaceNodeRequest) -> Result<ReplaceNodeResponse> {
        let index = resolve_one(&*self.latest().await?, &request.node)?;
        debug!(index = %index, "Handling replace node request");
        let result = self.orchestrator.replace(index).await?;
        Ok(ReplaceNodeResponse {
            index: result.index,
            generation: result.generation,
            version: result.version,
        })
    }

    pub async fn bump_generation(
        &self,
        request: BumpGenerationRequest,
    ) -> Result<BumpGenerationResponse> {
        request.validate()?;
        let cfg = self.latest().await?;
        let indices: Vec<NodeIndex> = resolve_selectors(&cfg, &request.filters)?
            .into_iter()
            .collect();
        if let Some(index) = indices
            .iter()
            .find(|i| cfg.storage_attributes(**i).is_none())
        {
            return Err(MembershipError::violation(
                ViolationKind::StorageRoleMismatch,
                format!("{} is not a storage node and has no generation", index),
            ));
        }

        let version = self.orchestrator.bump_generation(indices.clone()).await?;
        let cfg = self.orchestrator.manager().current();
        let bumped = indices
            .into_iter()
            .map(|index| BumpedGeneration {
                index,
                generation: cfg.generation(index).unwrap_or(NodeGeneration::UNKNOWN),
            })
            .collect();
        Ok(BumpGenerationResponse { bumped, version })
    }

    pub async fn update_attributes(
        &self,
        request: UpdateNodeAttributesRequest,
    ) -> Result<UpdateNodeAttributesResponse> {
        request.validate()?;
        let cfg = self.latest().await?;
        let changes = request
            .updates
            .into_iter()
            .map(|u| Ok((resolve_one(&cfg, &u.node)?, u.change)))
            .collect::<Result<Vec<_>>>()?;
        let updated = changes.iter().map(|(i, _)| *i).collect();

        let version = self.orchestrator.update_attributes(changes).await?;
        Ok(UpdateNodeAttributesResponse { updated, version })
    }
}

//! Resolving which configuration entry a node is.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::config::SelfRegistrationSettings;
use super::configuration::{NodeAddress, NodesConfiguration, ServiceDiscoveryEntry};
use super::error::{MembershipError, Result, ViolationKind};
use crate::types::NodeIndex;

/// Node filter used by admin requests. All set fields must match; an empty
/// selector matches every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<NodeIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<NodeAddress>,
}

impl NodeSelector {
    pub fn by_index(index: NodeIndex) -> Self {
        Self {
            index: Some(index),
            ..Default::default()
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn by_address(address: NodeAddress) -> Self {
        Self {
            address: Some(address),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_none() && self.name.is_none() && self.address.is_none()
    }

    pub fn matches(&self, index: NodeIndex, entry: &ServiceDiscoveryEntry) -> bool {
        self.index.is_none_or(|i| i == index)
            && self.name.as_deref().is_none_or(|n| n == entry.name)
            && self
                .address
                .as_ref()
                .is_none_or(|a| entry.endpoints.listens_on(a))
    }

    /// Indices of every node matching this selector, ascending.
    pub fn resolve(&self, config: &NodesConfiguration) -> Vec<NodeIndex> {
        config
            .service_discovery()
            .iter()
            .filter(|(index, entry)| self.matches(**index, entry))
            .map(|(index, _)| *index)
            .collect()
    }
}

/// Resolve a set of selectors to distinct indices. A selector that matches
/// nothing is an error.
pub fn resolve_selectors(
    config: &NodesConfiguration,
    selectors: &[NodeSelector],
) -> Result<BTreeSet<NodeIndex>> {
    let mut out = BTreeSet::new();
    for selector in selectors {
        let matched = selector.resolve(config);
        if matched.is_empty() {
            return Err(MembershipError::NotFound(format!(
                "no node matches {}",
                selector
            )));
        }
        out.extend(matched);
    }
    Ok(out)
}

impl fmt::Display for NodeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(index) = self.index {
            parts.push(format!("index={}", index));
        }
        if let Some(name) = &self.name {
            parts.push(format!("name={}", name));
        }
        if let Some(address) = &self.address {
            parts.push(format!("address={}", address));
        }
        if parts.is_empty() {
            write!(f, "{{*}}")
        } else {
            write!(f, "{{{}}}", parts.join(","))
        }
    }
}

/// How a running node finds its own entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeIdentityFinder {
    /// Self-registering nodes are keyed by their unique name.
    ByName(String),
    /// Operator-assigned index.
    ByIndex(NodeIndex),
    /// Fallback: the entry whose endpoints include our data address.
    ByAddress(NodeAddress),
}

impl NodeIdentityFinder {
    /// Pick the mode from settings: name when self-registering, then an
    /// explicit index, then the data address.
    pub fn from_settings(settings: &SelfRegistrationSettings) -> Result<Self> {
        if settings.enabled {
            return settings
                .name
                .clone()
                .map(NodeIdentityFinder::ByName)
                .ok_or_else(|| {
                    MembershipError::Config("self-registration requires a node name".to_string())
                });
        }
        if let Some(index) = settings.index {
            return Ok(NodeIdentityFinder::ByIndex(index));
        }
        match &settings.address {
            Some(address) => Ok(NodeIdentityFinder::ByAddress(NodeAddress::parse(address)?)),
            None => Err(MembershipError::Config(
                "cannot identify this node: no name, index or address configured".to_string(),
            )),
        }
    }

    pub fn find(&self, config: &NodesConfiguration) -> Option<NodeIndex> {
        match self {
            NodeIdentityFinder::ByName(name) => config.node_by_name(name).map(|(i, _)| i),
            NodeIdentityFinder::ByIndex(index) => config.contains(*index).then_some(*index),
            NodeIdentityFinder::ByAddress(address) => {
                config.node_by_address(address).map(|(i, _)| i)
            }
        }
    }
}

impl fmt::Display for NodeIdentityFinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeIdentityFinder::ByName(name) => write!(f, "name={}", name),
            NodeIdentityFinder::ByIndex(index) => write!(f, "index={}", index),
            NodeIdentityFinder::ByAddress(address) => write!(f, "address={}", address),
        }
    }
}

/// Smallest `count` indices that are neither in `config` nor `reserved`.
pub fn allocate_indices(
    config: &NodesConfiguration,
    count: usize,
    reserved: &BTreeSet<NodeIndex>,
) -> Result<Vec<NodeIndex>> {
    let allocated: Vec<NodeIndex> = (0..=NodeIndex::MAX.value())
        .map(NodeIndex)
        .filter(|i| !config.contains(*i) && !reserved.contains(i))
        .take(count)
        .collect();

    if allocated.len() < count {
        return Err(MembershipError::violation(
            ViolationKind::InvalidField,
            format!("only {} free node indices remain, {} requested", allocated.len(), count),
        ));
    }
    Ok(allocated)
}

//! Versioned membership snapshot.
//!
//! A [`NodesConfiguration`] is immutable once built. The only way to obtain
//! a new one is [`crate::cluster::update::apply`], which produces a fresh
//! value with a strictly greater version. Consumers share snapshots through
//! `Arc<NodesConfiguration>` and can hold and compare several versions at
//! once without locking.
//!
//! # Layout
//!
//! ```text
//! NodesConfiguration (version)
//! ├── service_discovery    NodeIndex -> ServiceDiscoveryEntry
//! ├── storage_attributes   NodeIndex -> StorageAttributes     (storage role only)
//! ├── storage_membership   NodeIndex -> [ShardMembership; num_shards]
//! └── sequencer_membership NodeIndex -> SequencerMembership   (sequencer role only)
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{MembershipError, Result, ViolationKind};
use crate::constants::{DEFAULT_STORAGE_CAPACITY, MAX_LOCATION_SCOPES};
use crate::types::{ConfigVersion, NodeGeneration, NodeIndex, ShardIndex};

// =============================================================================
// Addresses and Endpoints
// =============================================================================

/// A node network address: `host:port` or `unix:/path/to/socket`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress(String);

impl NodeAddress {
    const UNIX_PREFIX: &'static str = "unix:";

    /// Parse and validate an address string.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix(Self::UNIX_PREFIX) {
            if path.is_empty() {
                return Err(invalid(format!("unix address '{}' has an empty path", s)));
            }
            return Ok(NodeAddress(s.to_string()));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| invalid(format!("address '{}' is missing a port", s)))?;
        if host.is_empty() {
            return Err(invalid(format!("address '{}' has an empty host", s)));
        }
        port.parse::<u16>()
            .map_err(|_| invalid(format!("address '{}' has an invalid port", s)))?;
        Ok(NodeAddress(s.to_string()))
    }

    /// TCP address from host and port.
    pub fn tcp(host: &str, port: u16) -> Self {
        if host.contains(':') && !host.starts_with('[') {
            NodeAddress(format!("[{}]:{}", host, port))
        } else {
            NodeAddress(format!("{}:{}", host, port))
        }
    }

    /// Unix domain socket address.
    pub fn unix(path: &str) -> Self {
        NodeAddress(format!("{}{}", Self::UNIX_PREFIX, path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unix(&self) -> bool {
        self.0.starts_with(Self::UNIX_PREFIX)
    }

    /// TCP port, `None` for unix sockets.
    pub fn port(&self) -> Option<u16> {
        if self.is_unix() {
            return None;
        }
        self.0.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = MembershipError;

    fn try_from(value: String) -> Result<Self> {
        NodeAddress::parse(&value)
    }
}

impl From<NodeAddress> for String {
    fn from(addr: NodeAddress) -> Self {
        addr.0
    }
}

impl FromStr for NodeAddress {
    type Err = MembershipError;

    fn from_str(s: &str) -> Result<Self> {
        NodeAddress::parse(s)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Traffic class for per-priority data endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPriority {
    High,
    Medium,
    Low,
}

/// Named network endpoints of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoints {
    /// Plain data endpoint. Always present.
    pub data: NodeAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<NodeAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gossip: Option<NodeAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_to_server: Option<NodeAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<NodeAddress>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_priority: BTreeMap<NetworkPriority, NodeAddress>,
}

impl NodeEndpoints {
    pub fn new(data: NodeAddress) -> Self {
        Self {
            data,
            ssl: None,
            gossip: None,
            server_to_server: None,
            admin: None,
            per_priority: BTreeMap::new(),
        }
    }

    pub fn with_gossip(mut self, addr: NodeAddress) -> Self {
        self.gossip = Some(addr);
        self
    }

    pub fn with_ssl(mut self, addr: NodeAddress) -> Self {
        self.ssl = Some(addr);
        self
    }

    pub fn with_server_to_server(mut self, addr: NodeAddress) -> Self {
        self.server_to_server = Some(addr);
        self
    }

    pub fn with_admin(mut self, addr: NodeAddress) -> Self {
        self.admin = Some(addr);
        self
    }

    pub fn with_priority(mut self, priority: NetworkPriority, addr: NodeAddress) -> Self {
        self.per_priority.insert(priority, addr);
        self
    }

    /// Every address this node listens on.
    pub fn addresses(&self) -> impl Iterator<Item = &NodeAddress> {
        std::iter::once(&self.data)
            .chain(self.ssl.iter())
            .chain(self.gossip.iter())
            .chain(self.server_to_server.iter())
            .chain(self.admin.iter())
            .chain(self.per_priority.values())
    }

    /// Whether any endpoint equals `addr`.
    pub fn listens_on(&self, addr: &NodeAddress) -> bool {
        self.addresses().any(|a| a == addr)
    }
}

// =============================================================================
// Roles, Tags, Location
// =============================================================================

/// Role set of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RoleSet {
    #[serde(default)]
    pub sequencer: bool,
    #[serde(default)]
    pub storage: bool,
}

impl RoleSet {
    pub const SEQUENCER: Self = RoleSet {
        sequencer: true,
        storage: false,
    };
    pub const STORAGE: Self = RoleSet {
        sequencer: false,
        storage: true,
    };
    pub const BOTH: Self = RoleSet {
        sequencer: true,
        storage: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.sequencer && !self.storage
    }
}

impl FromStr for RoleSet {
    type Err = MembershipError;

    /// Parses a comma-separated list such as `sequencer,storage`.
    fn from_str(s: &str) -> Result<Self> {
        let mut roles = RoleSet::default();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.to_lowercase().as_str() {
                "sequencer" => roles.sequencer = true,
                "storage" => roles.storage = true,
                other => return Err(invalid(format!("unknown role '{}'", other))),
            }
        }
        if roles.is_empty() {
            return Err(invalid("at least one role is required"));
        }
        Ok(roles)
    }
}

impl fmt::Display for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.sequencer, self.storage) {
            (true, true) => f.write_str("sequencer,storage"),
            (true, false) => f.write_str("sequencer"),
            (false, true) => f.write_str("storage"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// Validate a tag key: non-empty, no `:` or `,`.
pub fn validate_tag_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(invalid("tag key must not be empty"));
    }
    if key.contains(':') || key.contains(',') {
        return Err(invalid(format!(
            "tag key '{}' must not contain ':' or ','",
            key
        )));
    }
    Ok(())
}

/// Validate a dotted location such as `us.east1.c1.row3.rack7`.
///
/// Up to five scopes. Trailing scopes may be omitted but no scope in the
/// middle may be empty.
pub fn validate_location(location: &str) -> Result<()> {
    let scopes: Vec<&str> = location.split('.').collect();
    if scopes.len() > MAX_LOCATION_SCOPES {
        return Err(invalid(format!(
            "location '{}' has {} scopes, at most {} allowed",
            location,
            scopes.len(),
            MAX_LOCATION_SCOPES
        )));
    }
    if scopes.iter().any(|s| s.is_empty()) {
        return Err(invalid(format!("location '{}' has an empty scope", location)));
    }
    Ok(())
}

// =============================================================================
// Service Discovery
// =============================================================================

/// Published identity of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDiscoveryEntry {
    pub name: String,
    pub endpoints: NodeEndpoints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub roles: RoleSet,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Version stamped by whoever last wrote this entry.
    #[serde(default)]
    pub version: u64,
}

impl ServiceDiscoveryEntry {
    pub fn new(name: impl Into<String>, endpoints: NodeEndpoints, roles: RoleSet) -> Self {
        Self {
            name: name.into(),
            endpoints,
            location: None,
            roles,
            tags: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Field-level checks that do not need the rest of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("node name must not be empty"));
        }
        if self.roles.is_empty() {
            return Err(invalid(format!("node '{}' has no roles", self.name)));
        }
        if let Some(location) = &self.location {
            validate_location(location)?;
        }
        for key in self.tags.keys() {
            validate_tag_key(key)?;
        }
        Ok(())
    }
}

// =============================================================================
// Storage and Sequencer Membership
// =============================================================================

fn default_capacity() -> f64 {
    DEFAULT_STORAGE_CAPACITY
}

/// Attributes of a storage-capable node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageAttributes {
    pub num_shards: u16,
    pub generation: NodeGeneration,
    #[serde(default)]
    pub exclude_from_placement: bool,
    #[serde(default = "default_capacity")]
    pub capacity: f64,
}

impl StorageAttributes {
    /// Attributes of a freshly provisioned node (generation 1).
    pub fn new(num_shards: u16) -> Self {
        Self {
            num_shards,
            generation: NodeGeneration::INITIAL,
            exclude_from_placement: false,
            capacity: DEFAULT_STORAGE_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Data-serving state of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageState {
    #[default]
    None,
    ReadOnly,
    ReadWrite,
    /// Written by a newer version. Treated as possibly holding data.
    #[serde(other)]
    Unknown,
}

impl FromStr for StorageState {
    type Err = MembershipError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "none" => Ok(StorageState::None),
            "read_only" => Ok(StorageState::ReadOnly),
            "read_write" => Ok(StorageState::ReadWrite),
            other => Err(invalid(format!("unknown storage state '{}'", other))),
        }
    }
}

impl fmt::Display for StorageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageState::None => f.write_str("NONE"),
            StorageState::ReadOnly => f.write_str("READ_ONLY"),
            StorageState::ReadWrite => f.write_str("READ_WRITE"),
            StorageState::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// Whether a shard stores metadata log replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataStorageState {
    #[default]
    None,
    Metadata,
    /// Written by a newer version. Treated as holding metadata.
    #[serde(other)]
    Unknown,
}

/// Membership state of a single shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ShardMembership {
    pub state: StorageState,
    #[serde(default)]
    pub metadata: MetadataStorageState,
}

impl ShardMembership {
    /// A shard that holds nothing.
    pub const EMPTY: Self = ShardMembership {
        state: StorageState::None,
        metadata: MetadataStorageState::None,
    };

    /// True if the shard holds neither data nor metadata replicas.
    ///
    /// An unrecognized state never counts as empty.
    pub fn is_empty(&self) -> bool {
        self.state == StorageState::None && self.metadata == MetadataStorageState::None
    }
}

/// Sequencing role state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequencerMembership {
    pub enabled: bool,
    pub weight: f64,
}

impl Default for SequencerMembership {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 1.0,
        }
    }
}

pub(crate) fn validate_weight(weight: f64) -> Result<()> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(invalid(format!(
            "sequencer weight {} must be finite and non-negative",
            weight
        )));
    }
    Ok(())
}

// =============================================================================
// NodesConfiguration
// =============================================================================

/// Immutable, versioned membership snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodesConfiguration {
    pub(crate) version: ConfigVersion,
    #[serde(default)]
    pub(crate) last_change_timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) last_maintenance: Option<String>,
    #[serde(default)]
    pub(crate) service_discovery: BTreeMap<NodeIndex, ServiceDiscoveryEntry>,
    #[serde(default)]
    pub(crate) storage_attributes: BTreeMap<NodeIndex, StorageAttributes>,
    #[serde(default)]
    pub(crate) storage_membership: BTreeMap<NodeIndex, Vec<ShardMembership>>,
    #[serde(default)]
    pub(crate) sequencer_membership: BTreeMap<NodeIndex, SequencerMembership>,
    /// Version in which each node was last added. Tells a re-added index
    /// apart from the node that held it before.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) added_at: BTreeMap<NodeIndex, ConfigVersion>,
}

impl NodesConfiguration {
    /// The empty configuration seeded at bootstrap.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn version(&self) -> ConfigVersion {
        self.version
    }

    /// Wall-clock millis at which this version was produced.
    pub fn last_change_timestamp_ms(&self) -> u64 {
        self.last_change_timestamp_ms
    }

    /// Free-form tag of the change that produced this version.
    pub fn last_maintenance(&self) -> Option<&str> {
        self.last_maintenance.as_deref()
    }

    pub fn service_discovery(&self) -> &BTreeMap<NodeIndex, ServiceDiscoveryEntry> {
        &self.service_discovery
    }

    pub fn node(&self, index: NodeIndex) -> Option<&ServiceDiscoveryEntry> {
        self.service_discovery.get(&index)
    }

    pub fn contains(&self, index: NodeIndex) -> bool {
        self.service_discovery.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.service_discovery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.service_discovery.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.service_discovery.keys().copied()
    }

    pub fn max_index(&self) -> Option<NodeIndex> {
        self.service_discovery.keys().next_back().copied()
    }

    pub fn node_by_name(&self, name: &str) -> Option<(NodeIndex, &ServiceDiscoveryEntry)> {
        self.service_discovery
            .iter()
            .find(|(_, e)| e.name == name)
            .map(|(i, e)| (*i, e))
    }

    pub fn node_by_address(
        &self,
        addr: &NodeAddress,
    ) -> Option<(NodeIndex, &ServiceDiscoveryEntry)> {
        self.service_discovery
            .iter()
            .find(|(_, e)| e.endpoints.listens_on(addr))
            .map(|(i, e)| (*i, e))
    }

    pub fn storage_attributes(&self, index: NodeIndex) -> Option<&StorageAttributes> {
        self.storage_attributes.get(&index)
    }

    pub fn shard_states(&self, index: NodeIndex) -> Option<&[ShardMembership]> {
        self.storage_membership.get(&index).map(Vec::as_slice)
    }

    pub fn shard_state(&self, index: NodeIndex, shard: ShardIndex) -> Option<ShardMembership> {
        self.storage_membership
            .get(&index)
            .and_then(|s| s.get(shard.value() as usize))
            .copied()
    }

    pub fn sequencer(&self, index: NodeIndex) -> Option<&SequencerMembership> {
        self.sequencer_membership.get(&index)
    }

    /// Generation of a node. Nodes without storage attributes stay at the
    /// initial generation.
    pub fn generation(&self, index: NodeIndex) -> Option<NodeGeneration> {
        if !self.contains(index) {
            return None;
        }
        Some(
            self.storage_attributes
                .get(&index)
                .map(|a| a.generation)
                .unwrap_or(NodeGeneration::INITIAL),
        )
    }

    pub fn storage_nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.storage_attributes.keys().copied()
    }

    pub fn sequencer_nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.sequencer_membership.keys().copied()
    }

    /// Version in which `index` was last added, if recorded.
    pub fn added_at(&self, index: NodeIndex) -> Option<ConfigVersion> {
        self.added_at.get(&index).copied()
    }

    /// True if any shard of the node still holds data or metadata replicas.
    pub fn has_data(&self, index: NodeIndex) -> bool {
        self.storage_membership
            .get(&index)
            .is_some_and(|shards| shards.iter().any(|s| !s.is_empty()))
    }

    /// Check every structural invariant of the snapshot.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::with_capacity(self.service_discovery.len());
        for (index, entry) in &self.service_discovery {
            entry.validate().map_err(|e| annotate(e, *index))?;
            if !names.insert(entry.name.as_str()) {
                return Err(MembershipError::violation(
                    ViolationKind::DuplicateName,
                    format!("name '{}' used by more than one node", entry.name),
                ));
            }
        }

        for index in self
            .storage_attributes
            .keys()
            .chain(self.storage_membership.keys())
            .chain(self.sequencer_membership.keys())
            .chain(self.added_at.keys())
        {
            if !self.contains(*index) {
                return Err(MembershipError::violation(
                    ViolationKind::UnknownNode,
                    format!("membership references {} missing from service discovery", index),
                ));
            }
        }

        for (index, entry) in &self.service_discovery {
            self.validate_storage_role(*index, entry)?;
            self.validate_sequencer_role(*index, entry)?;
        }
        Ok(())
    }

    fn validate_storage_role(&self, index: NodeIndex, entry: &ServiceDiscoveryEntry) -> Result<()> {
        let attrs = self.storage_attributes.get(&index);
        let shards = self.storage_membership.get(&index);
        match (entry.roles.storage, attrs, shards) {
            (true, Some(attrs), Some(shards)) => {
                if attrs.num_shards == 0 {
                    return Err(MembershipError::violation(
                        ViolationKind::StorageRoleMismatch,
                        format!("storage node {} has zero shards", index),
                    ));
                }
                if shards.len() != attrs.num_shards as usize {
                    return Err(MembershipError::violation(
                        ViolationKind::StorageRoleMismatch,
                        format!(
                            "storage node {} declares {} shards but membership lists {}",
                            index,
                            attrs.num_shards,
                            shards.len()
                        ),
                    ));
                }
                if !attrs.capacity.is_finite() || attrs.capacity < 0.0 {
                    return Err(invalid(format!(
                        "storage node {} has invalid capacity {}",
                        index, attrs.capacity
                    )));
                }
                Ok(())
            }
            (false, None, None) => Ok(()),
            (true, _, _) => Err(MembershipError::violation(
                ViolationKind::StorageRoleMismatch,
                format!("storage node {} is missing attributes or shard membership", index),
            )),
            (false, _, _) => Err(MembershipError::violation(
                ViolationKind::StorageRoleMismatch,
                format!("node {} has storage state but no storage role", index),
            )),
        }
    }

    fn validate_sequencer_role(
        &self,
        index: NodeIndex,
        entry: &ServiceDiscoveryEntry,
    ) -> Result<()> {
        match (entry.roles.sequencer, self.sequencer_membership.get(&index)) {
            (true, Some(seq)) => validate_weight(seq.weight),
            (false, None) => Ok(()),
            (true, None) => Err(MembershipError::violation(
                ViolationKind::SequencerRoleMismatch,
                format!("sequencer node {} has no sequencer membership", index),
            )),
            (false, Some(_)) => Err(MembershipError::violation(
                ViolationKind::SequencerRoleMismatch,
                format!("node {} has sequencer membership but no sequencer role", index),
            )),
        }
    }
}

fn invalid(message: impl Into<String>) -> MembershipError {
    MembershipError::violation(ViolationKind::InvalidField, message)
}

fn annotate(err: MembershipError, index: NodeIndex) -> MembershipError {
    match err {
        MembershipError::InvariantViolation { kind, message } => MembershipError::InvariantViolation {
            kind,
            message: format!("{}: {}", index, message),
        },
        other => other,
    }
}

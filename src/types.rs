//! Type-safe wrappers for membership primitives.
//!
//! These newtypes keep node indices, generations, shard numbers and
//! configuration versions from being mixed up even though they share
//! small integer representations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable identity of a cluster slot.
///
/// An index is never reused while a node logically occupies it. Freed
/// indices may be handed out again by the allocator once the node has been
/// removed from the configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeIndex(pub u16);

impl NodeIndex {
    /// Largest index the allocator will ever hand out.
    pub const MAX: Self = NodeIndex(u16::MAX - 1);

    /// Create a new index from a raw value.
    #[inline]
    pub const fn new(value: u16) -> Self {
        NodeIndex(value)
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl From<u16> for NodeIndex {
    fn from(value: u16) -> Self {
        NodeIndex(value)
    }
}

impl From<NodeIndex> for u16 {
    fn from(index: NodeIndex) -> Self {
        index.0
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl FromStr for NodeIndex {
    type Err = std::num::ParseIntError;

    /// Accepts both `3` and `N3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix('N').unwrap_or(s);
        raw.parse::<u16>().map(NodeIndex)
    }
}

/// Per-index fencing counter.
///
/// Incremented every time the process behind an index is fully replaced.
/// Any cached session tagged with an older generation is stale.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeGeneration(pub u32);

impl NodeGeneration {
    /// Reserved "unknown" generation.
    pub const UNKNOWN: Self = NodeGeneration(0);

    /// Generation of a freshly provisioned node.
    pub const INITIAL: Self = NodeGeneration(1);

    #[inline]
    pub const fn new(value: u32) -> Self {
        NodeGeneration(value)
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// The generation that follows this one, or `None` on overflow.
    #[inline]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(v) => Some(NodeGeneration(v)),
            None => None,
        }
    }
}

impl From<u32> for NodeGeneration {
    fn from(value: u32) -> Self {
        NodeGeneration(value)
    }
}

impl fmt::Display for NodeGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Monotonic version of a published `NodesConfiguration`.
///
/// Versions form a total order. A reader that observes version `V` has
/// observed the result of applying some valid update sequence starting from
/// [`ConfigVersion::EMPTY`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConfigVersion(pub u64);

impl ConfigVersion {
    /// Version of the empty configuration seeded at cluster bootstrap.
    pub const EMPTY: Self = ConfigVersion(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        ConfigVersion(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version an update applied on top of this one receives.
    #[inline]
    pub const fn next(self) -> Self {
        ConfigVersion(self.0.saturating_add(1))
    }
}

impl From<u64> for ConfigVersion {
    fn from(value: u64) -> Self {
        ConfigVersion(value)
    }
}

impl From<ConfigVersion> for u64 {
    fn from(version: ConfigVersion) -> Self {
        version.0
    }
}

impl fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Shard number within a storage node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ShardIndex(pub u16);

impl ShardIndex {
    #[inline]
    pub const fn new(value: u16) -> Self {
        ShardIndex(value)
    }

    #[inline]
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl From<u16> for ShardIndex {
    fn from(value: u16) -> Self {
        ShardIndex(value)
    }
}

impl fmt::Display for ShardIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_index_display_and_parse() {
        let idx = NodeIndex::new(7);
        assert_eq!(idx.to_string(), "N7");
        assert_eq!("N7".parse::<NodeIndex>().unwrap(), idx);
        assert_eq!("7".parse::<NodeIndex>().unwrap(), idx);
        assert!("N-1".parse::<NodeIndex>().is_err());
        assert!("node".parse::<NodeIndex>().is_err());
    }

    #[test]
    fn test_node_index_ordering() {
        assert!(NodeIndex(1) < NodeIndex(2));
        assert_eq!(u16::from(NodeIndex(9)), 9);
    }

    #[test]
    fn test_generation_next() {
        assert_eq!(NodeGeneration::INITIAL.next(), Some(NodeGeneration(2)));
        assert_eq!(NodeGeneration(u32::MAX).next(), None);
        assert_eq!(NodeGeneration::UNKNOWN.value(), 0);
    }

    #[test]
    fn test_config_version_next_saturates() {
        assert_eq!(ConfigVersion::EMPTY.next(), ConfigVersion(1));
        assert_eq!(ConfigVersion(u64::MAX).next(), ConfigVersion(u64::MAX));
        assert_eq!(ConfigVersion(5).to_string(), "v5");
    }

    #[test]
    fn test_serde_is_transparent() {
        let json = serde_json::to_string(&ConfigVersion(42)).unwrap();
        assert_eq!(json, "42");
        let idx: NodeIndex = serde_json::from_str("3").unwrap();
        assert_eq!(idx, NodeIndex(3));
    }

    #[test]
    fn test_shard_display() {
        assert_eq!(ShardIndex::new(2).to_string(), "S2");
    }
}

//! Error types for cluster membership.
//!
//! # Error Taxonomy
//!
//! Errors fall into two families that are handled very differently:
//!
//! ## Structural (never retried)
//!
//! - [`MembershipError::InvariantViolation`]: an update would produce an
//!   inconsistent snapshot. Rejected before anything touches the store.
//! - [`MembershipError::Downgrade`]: a node tried to publish an entry older
//!   than the one already in the cluster.
//! - [`MembershipError::Config`], [`MembershipError::Corrupt`]: fix the
//!   input, retrying will not help.
//!
//! ## Transient (retried with bounded backoff)
//!
//! - [`MembershipError::Conflict`]: another writer won the CAS race. The
//!   caller re-reads and recomputes its update.
//! - [`MembershipError::Backend`], [`MembershipError::Io`] and transient
//!   [`MembershipError::ObjectStore`] errors: the store is unreachable.
//!
//! Retry exhaustion is surfaced as a single
//! [`MembershipError::RetriesExhausted`] carrying the last underlying error.
//!
//! # Fencing
//!
//! [`MembershipError::IdentityLost`] and [`MembershipError::IdentitySuperseded`]
//! are produced by the self-consistency monitor. The configured fencing
//! policy decides whether they shut the node down.

use thiserror::Error;

use crate::types::{ConfigVersion, NodeIndex};

/// Result type for membership operations.
pub type Result<T> = std::result::Result<T, MembershipError>;

/// Which invariant an update would have broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// Update carried no operations.
    EmptyUpdate,
    /// ADD for an index that already exists.
    DuplicateIndex,
    /// Two nodes would share a name.
    DuplicateName,
    /// An operation or membership entry references an index not in service discovery.
    UnknownNode,
    /// REMOVE of a node that still holds data or metadata replicas.
    NodeOwnsData,
    /// Storage role and storage attributes disagree.
    StorageRoleMismatch,
    /// Sequencer role and sequencer membership disagree.
    SequencerRoleMismatch,
    /// Shard number outside the node's shard range.
    ShardOutOfRange,
    /// RESET tried to change a node's role set.
    RoleChange,
    /// A field failed validation (empty name, bad tag, negative weight...).
    InvalidField,
    /// Generation counter cannot advance further.
    GenerationOverflow,
    /// New version is not greater than the previous one.
    NonMonotonicVersion,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::EmptyUpdate => "empty_update",
            ViolationKind::DuplicateIndex => "duplicate_index",
            ViolationKind::DuplicateName => "duplicate_name",
            ViolationKind::UnknownNode => "unknown_node",
            ViolationKind::NodeOwnsData => "node_owns_data",
            ViolationKind::StorageRoleMismatch => "storage_role_mismatch",
            ViolationKind::SequencerRoleMismatch => "sequencer_role_mismatch",
            ViolationKind::ShardOutOfRange => "shard_out_of_range",
            ViolationKind::RoleChange => "role_change",
            ViolationKind::InvalidField => "invalid_field",
            ViolationKind::GenerationOverflow => "generation_overflow",
            ViolationKind::NonMonotonicVersion => "non_monotonic_version",
        };
        f.write_str(s)
    }
}

/// Errors produced by the membership subsystem.
#[derive(Error, Debug)]
pub enum MembershipError {
    /// An update would produce an inconsistent configuration.
    #[error("Invariant violation ({kind}): {message}")]
    InvariantViolation { kind: ViolationKind, message: String },

    /// CAS precondition failed because another writer updated the store first.
    #[error("CAS conflict: expected {expected:?}, store holds {actual:?}")]
    Conflict {
        expected: Option<ConfigVersion>,
        actual: Option<ConfigVersion>,
    },

    /// Store backend failed (unreachable, rejected the request, ...).
    #[error("Store backend error: {0}")]
    Backend(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from object store operations.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Stored blob decoded but is unusable (wrong format, broken invariants).
    #[error("Corrupt configuration blob: {0}")]
    Corrupt(String),

    /// This node can no longer be resolved in the published configuration.
    #[error("Node identity lost: {0}")]
    IdentityLost(String),

    /// This node's slot was re-published under a different identity.
    #[error(
        "Node identity superseded for {index}: registered sd version {registered}, published {published}"
    )]
    IdentitySuperseded {
        index: NodeIndex,
        registered: u64,
        published: u64,
    },

    /// Propagation barrier exceeded its deadline. The write itself succeeded.
    #[error("Propagation of {target} timed out; lagging participants: {lagging:?}")]
    PropagationTimeout {
        target: ConfigVersion,
        lagging: Vec<String>,
    },

    /// Locally desired entry is older than the published one.
    #[error("Refusing to downgrade node entry: published version {published}, desired {desired}")]
    Downgrade { published: u64, desired: u64 },

    /// Requested node or record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Process launcher failed to start or stop a node.
    #[error("Launcher error: {0}")]
    Launcher(String),

    /// The component is shutting down.
    #[error("Shutting down")]
    ShuttingDown,

    /// A bounded retry loop gave up.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        last: Box<MembershipError>,
    },
}

impl MembershipError {
    /// Build an invariant violation.
    pub fn violation(kind: ViolationKind, message: impl Into<String>) -> Self {
        MembershipError::InvariantViolation {
            kind,
            message: message.into(),
        }
    }

    /// Check if this error is transient and the operation can be retried.
    ///
    /// Invariant violations are never retriable: they indicate a caller bug
    /// and retrying would only repeat the same rejection.
    pub fn is_retriable(&self) -> bool {
        match self {
            MembershipError::Conflict { .. } => true,
            MembershipError::Backend(_) => true,
            MembershipError::Launcher(_) => true,
            MembershipError::PropagationTimeout { .. } => true,

            MembershipError::Io(e) => Self::is_io_error_retryable(e),
            MembershipError::ObjectStore(e) => Self::is_object_store_error_retryable(e),

            MembershipError::InvariantViolation { .. } => false,
            MembershipError::Serde(_) => false,
            MembershipError::Corrupt(_) => false,
            MembershipError::IdentityLost(_) => false,
            MembershipError::IdentitySuperseded { .. } => false,
            MembershipError::Downgrade { .. } => false,
            MembershipError::NotFound(_) => false,
            MembershipError::Config(_) => false,
            MembershipError::ShuttingDown => false,
            MembershipError::RetriesExhausted { .. } => false,
        }
    }

    /// True for a lost CAS race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, MembershipError::Conflict { .. })
    }

    /// True for a structural rejection of an update.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, MembershipError::InvariantViolation { .. })
    }

    /// Violation kind, if this is an invariant violation.
    pub fn violation_kind(&self) -> Option<ViolationKind> {
        match self {
            MembershipError::InvariantViolation { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Unwrap `RetriesExhausted` down to the error that caused it.
    pub fn root_cause(&self) -> &MembershipError {
        match self {
            MembershipError::RetriesExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            MembershipError::InvariantViolation { .. } => "invariant_violation",
            MembershipError::Conflict { .. } => "conflict",
            MembershipError::Backend(_) => "backend",
            MembershipError::Io(_) => "io",
            MembershipError::ObjectStore(_) => "object_store",
            MembershipError::Serde(_) => "serde",
            MembershipError::Corrupt(_) => "corrupt",
            MembershipError::IdentityLost(_) => "identity_lost",
            MembershipError::IdentitySuperseded { .. } => "identity_superseded",
            MembershipError::PropagationTimeout { .. } => "propagation_timeout",
            MembershipError::Downgrade { .. } => "downgrade",
            MembershipError::NotFound(_) => "not_found",
            MembershipError::Config(_) => "config",
            MembershipError::Launcher(_) => "launcher",
            MembershipError::ShuttingDown => "shutting_down",
            MembershipError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }

    /// Classify object_store errors as retryable or permanent.
    fn is_object_store_error_retryable(e: &object_store::Error) -> bool {
        use object_store::Error as ObjErr;

        match e {
            ObjErr::NotFound { .. } => false,
            ObjErr::AlreadyExists { .. } => false,
            ObjErr::Precondition { .. } => false,
            ObjErr::NotSupported { .. } => false,
            ObjErr::InvalidPath { .. } => false,
            ObjErr::JoinError { .. } => false,
            ObjErr::NotImplemented => false,
            ObjErr::PermissionDenied { .. } => false,
            ObjErr::Unauthenticated { .. } => false,
            ObjErr::UnknownConfigurationKey { .. } => false,

            ObjErr::NotModified { .. } => true,

            ObjErr::Generic { source, .. } => {
                let msg = source.to_string().to_lowercase();
                msg.contains("timeout")
                    || msg.contains("connection")
                    || msg.contains("throttl")
                    || msg.contains("unavailable")
                    || msg.contains("503")
                    || msg.contains("500")
                    || msg.contains("429")
            }

            #[allow(unreachable_patterns)]
            _ => true,
        }
    }

    /// Check if an IO error is retryable.
    fn is_io_error_retryable(e: &std::io::Error) -> bool {
        use std::io::ErrorKind;

        match e.kind() {
            ErrorKind::ConnectionRefused => true,
            ErrorKind::ConnectionReset => true,
            ErrorKind::ConnectionAborted => true,
            ErrorKind::NotConnected => true,
            ErrorKind::BrokenPipe => true,
            ErrorKind::TimedOut => true,
            ErrorKind::Interrupted => true,
            ErrorKind::WouldBlock => true,
            ErrorKind::UnexpectedEof => true,

            ErrorKind::NotFound => false,
            ErrorKind::PermissionDenied => false,
            ErrorKind::AlreadyExists => false,
            ErrorKind::InvalidInput => false,
            ErrorKind::InvalidData => false,

            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_violation_is_not_retriable() {
        let err = MembershipError::violation(ViolationKind::NodeOwnsData, "N1 holds shards");
        assert!(!err.is_retriable());
        assert!(err.is_invariant_violation());
        assert_eq!(err.violation_kind(), Some(ViolationKind::NodeOwnsData));
        assert!(err.to_string().contains("node_owns_data"));
    }

    #[test]
    fn test_conflict_is_retriable() {
        let err = MembershipError::Conflict {
            expected: Some(ConfigVersion(3)),
            actual: Some(ConfigVersion(4)),
        };
        assert!(err.is_retriable());
        assert!(err.is_conflict());
        assert_eq!(err.label(), "conflict");
    }

    #[test]
    fn test_io_classification() {
        let transient = MembershipError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "slow disk",
        ));
        assert!(transient.is_retriable());

        let permanent = MembershipError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only",
        ));
        assert!(!permanent.is_retriable());
    }

    #[test]
    fn test_object_store_classification() {
        let precondition = MembershipError::ObjectStore(object_store::Error::Precondition {
            path: "cluster/nodes_configuration".to_string(),
            source: "etag mismatch".into(),
        });
        assert!(!precondition.is_retriable());

        let generic = MembershipError::ObjectStore(object_store::Error::Generic {
            store: "S3",
            source: "connection reset by peer".into(),
        });
        assert!(generic.is_retriable());
    }

    #[test]
    fn test_root_cause_unwraps_nested_exhaustion() {
        let inner = MembershipError::Conflict {
            expected: None,
            actual: Some(ConfigVersion(1)),
        };
        let outer = MembershipError::RetriesExhausted {
            operation: "expand".to_string(),
            attempts: 3,
            last: Box::new(MembershipError::RetriesExhausted {
                operation: "propose".to_string(),
                attempts: 10,
                last: Box::new(inner),
            }),
        };
        assert!(outer.root_cause().is_conflict());
        assert!(!outer.is_retriable());
        assert!(outer.to_string().contains("expand failed after 3 attempts"));
    }

    #[test]
    fn test_display_formats() {
        let err = MembershipError::PropagationTimeout {
            target: ConfigVersion(5),
            lagging: vec!["N2".to_string()],
        };
        assert!(err.to_string().contains("v5"));
        assert!(err.to_string().contains("N2"));

        let err = MembershipError::Downgrade {
            published: 4,
            desired: 2,
        };
        assert!(err.to_string().contains("published version 4"));

        let err = MembershipError::IdentitySuperseded {
            index: NodeIndex(0),
            registered: 1,
            published: 2,
        };
        assert!(err.to_string().contains("N0"));
    }
}

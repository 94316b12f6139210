//! Centralized membership defaults.
//!
//! Every tunable that has a default lives here so that configuration
//! profiles, environment parsing and tests agree on the same numbers.

// =============================================================================
// Store Constants
// =============================================================================

/// File name of the serialized configuration inside a cluster directory.
pub const NODES_CONFIGURATION_FILE: &str = "nodes_configuration";

/// Suffix of the sidecar lock file used by the file backend.
pub const LOCK_FILE_SUFFIX: &str = ".lock";

/// A lock file older than this is considered abandoned by a crashed writer.
pub const DEFAULT_STALE_LOCK_SECS: u64 = 30;

/// How long a file-store writer waits for the lock before failing.
pub const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;

/// Default rqlite table holding the configuration row.
pub const DEFAULT_RQLITE_TABLE: &str = "nodes_configuration";

/// Current envelope format written by the codec.
pub const CODEC_FORMAT_VERSION: u32 = 1;

// =============================================================================
// Replica and Propagation Constants
// =============================================================================

/// Interval between store polls by the local replica.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Default deadline for a propagation barrier.
pub const DEFAULT_PROPAGATION_TIMEOUT_SECS: u64 = 60;

/// Interval between participant probes inside a propagation barrier.
pub const DEFAULT_PROPAGATION_POLL_MS: u64 = 100;

/// Timeout for a single introspection HTTP request.
pub const INTROSPECTION_REQUEST_TIMEOUT_MS: u64 = 2_000;

// =============================================================================
// Proposer and Saga Constants
// =============================================================================

/// Bounded number of read-modify-CAS attempts for one proposal.
pub const DEFAULT_CAS_MAX_ATTEMPTS: usize = 10;

/// Bounded number of whole-saga attempts.
pub const DEFAULT_SAGA_OUTER_TRIES: usize = 3;

/// Shard count used for storage nodes when a request does not specify one.
pub const DEFAULT_NUM_SHARDS: u16 = 1;

// =============================================================================
// Self-Registration Constants
// =============================================================================

/// Bounded number of registration attempts against a contended store.
pub const DEFAULT_REGISTRATION_MAX_ATTEMPTS: usize = 10;

/// Pause after publishing our own entry so peers can resolve it.
pub const DEFAULT_SLEEP_AFTER_REGISTRATION_SECS: u64 = 5;

/// Roles a self-registering node claims when none are configured.
pub const DEFAULT_ROLES: &str = "sequencer,storage";

/// Default sequencer weight of a self-registering node.
pub const DEFAULT_SEQUENCER_WEIGHT: f64 = 1.0;

/// Default storage capacity of a self-registering node.
pub const DEFAULT_STORAGE_CAPACITY: f64 = 1.0;

/// Maximum number of labels in a location string (region.dc.cluster.row.rack).
pub const MAX_LOCATION_SCOPES: usize = 5;

// =============================================================================
// Introspection Constants
// =============================================================================

/// Default port of the introspection HTTP endpoint.
pub const DEFAULT_INTROSPECTION_PORT: u16 = 6440;

//! Versioned configuration store with compare-and-swap writes.
//!
//! A store holds exactly one opaque blob per cluster. The store never
//! interprets the blob beyond recovering its version through a
//! [`VersionExtractor`]; every conditional write compares against that
//! recovered version, never against a backend-native revision.
//!
//! | Backend | Type | Conditional write mechanism |
//! |---------|------|-----------------------------|
//! | memory | [`MemoryStore`] | mutex |
//! | file | [`FileStore`] | sidecar lock file + atomic rename |
//! | object_store | [`ObjectConfigStore`] | `PutMode::Create` / `PutMode::Update(e_tag)` |
//! | rqlite | `RqliteStore` | row version in `update ... where` |

mod file;
mod memory;
mod object;
#[cfg(feature = "rqlite")]
mod rqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use object::ObjectConfigStore;
#[cfg(feature = "rqlite")]
pub use rqlite::RqliteStore;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use super::codec;
use super::config::{MembershipConfig, StoreBackend};
use super::error::{MembershipError, Result};
use super::metrics;
use crate::types::ConfigVersion;

/// Recovers the configuration version from a stored blob.
pub type VersionExtractor = Arc<dyn Fn(&[u8]) -> Option<ConfigVersion> + Send + Sync>;

/// Extractor that reads the codec envelope.
pub fn default_extractor() -> VersionExtractor {
    Arc::new(codec::extract_version)
}

/// A blob read from the store together with its extracted version.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub bytes: Bytes,
    pub version: ConfigVersion,
}

/// Result of [`ConfigStore::read_if_newer`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// The stored version is greater than the caller's base.
    Value(StoredValue),
    /// The caller already holds the stored version (or something newer).
    UpToDate,
    /// Nothing has been written yet.
    NotFound,
}

/// Precondition for [`ConfigStore::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Fails with a conflict if any record exists.
    CreateIfNotExists,
    /// Unconditional. Reserved for emergency admin paths.
    Overwrite,
    /// Succeeds only if the stored blob's version equals the given one.
    CompareVersionAndSwap(ConfigVersion),
}

impl WriteCondition {
    pub fn label(&self) -> &'static str {
        match self {
            WriteCondition::CreateIfNotExists => "create",
            WriteCondition::Overwrite => "overwrite",
            WriteCondition::CompareVersionAndSwap(_) => "cas",
        }
    }
}

/// Durable home of the serialized configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read the current blob, or `None` if nothing was ever written.
    async fn read(&self) -> Result<Option<StoredValue>>;

    /// Write `bytes` if `condition` holds against the current blob.
    async fn write(&self, bytes: Bytes, condition: WriteCondition) -> Result<()>;

    /// Read only if the stored version is greater than `base`.
    async fn read_if_newer(&self, base: ConfigVersion) -> Result<ReadOutcome> {
        match self.read().await? {
            None => Ok(ReadOutcome::NotFound),
            Some(value) if value.version > base => Ok(ReadOutcome::Value(value)),
            Some(_) => Ok(ReadOutcome::UpToDate),
        }
    }

    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Stop serving requests. Later calls fail with `ShuttingDown`.
    fn shutdown(&self) {}
}

/// Build the store selected by `config`.
pub async fn open(config: &MembershipConfig) -> Result<Arc<dyn ConfigStore>> {
    let store: Arc<dyn ConfigStore> = match &config.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File { root } => Arc::new(
            FileStore::new(root, &config.cluster_name)
                .with_stale_lock_timeout(config.stale_lock_timeout),
        ),
        StoreBackend::ObjectStore(store_type) => {
            let client = super::object_store::create_object_store(store_type)?;
            Arc::new(ObjectConfigStore::new(client, &config.cluster_name))
        }
        #[cfg(feature = "rqlite")]
        StoreBackend::Rqlite { url, table } => {
            Arc::new(RqliteStore::connect(url, table, &config.cluster_name).await?)
        }
        #[cfg(not(feature = "rqlite"))]
        StoreBackend::Rqlite { .. } => {
            return Err(MembershipError::Config(
                "rqlite store requested but the `rqlite` feature is disabled".to_string(),
            ));
        }
    };
    tracing::info!(
        backend = config.store.name(),
        location = %store.describe(),
        "Opened configuration store"
    );
    Ok(store)
}

/// Recover the version of a stored blob, treating failure as corruption.
pub(crate) fn stored_value(bytes: Bytes, extractor: &VersionExtractor) -> Result<StoredValue> {
    let version = extractor(&bytes).ok_or_else(|| {
        MembershipError::Corrupt("stored blob carries no readable version".to_string())
    })?;
    Ok(StoredValue { bytes, version })
}

/// Check `condition` against the current version and return the version
/// of the incoming blob.
///
/// `current` is `None` when no record exists.
pub(crate) fn check_condition(
    current: Option<ConfigVersion>,
    incoming: &[u8],
    condition: WriteCondition,
    extractor: &VersionExtractor,
) -> Result<ConfigVersion> {
    let new_version = extractor(incoming).ok_or_else(|| {
        MembershipError::Corrupt("refusing to write a blob without a readable version".to_string())
    })?;

    match condition {
        WriteCondition::CreateIfNotExists => {
            if current.is_some() {
                return Err(MembershipError::Conflict {
                    expected: None,
                    actual: current,
                });
            }
        }
        WriteCondition::CompareVersionAndSwap(expected) => {
            if current != Some(expected) {
                return Err(MembershipError::Conflict {
                    expected: Some(expected),
                    actual: current,
                });
            }
        }
        WriteCondition::Overwrite => {}
    }

    if let Some(current) = current
        && new_version <= current
    {
        warn!(
            current = %current,
            incoming = %new_version,
            condition = condition.label(),
            "Writing a configuration that is not newer than the stored one"
        );
    }
    Ok(new_version)
}

/// Record latency and CAS outcome for a store operation.
pub(crate) fn observe<T>(backend: &str, operation: &str, started: Instant, result: &Result<T>) {
    metrics::record_store_duration(backend, operation, started.elapsed().as_secs_f64());
    if operation == "write" {
        let outcome = match result {
            Ok(_) => "success",
            Err(e) if e.is_conflict() => "conflict",
            Err(_) => "error",
        };
        metrics::record_cas(outcome);
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, UpdateVersion};

use super::{
    ConfigStore, StoredValue, VersionExtractor, WriteCondition, check_condition,
    default_extractor, observe, stored_value,
};
use crate::cluster::error::{MembershipError, Result};
use crate::constants::NODES_CONFIGURATION_FILE;

/// Configuration store over any `object_store` backend.
///
/// Conditional writes rely on the backend's `PutMode::Create` and
/// `PutMode::Update` support. The e-tag only guards the write; the
/// comparison against the caller's expectation uses the embedded version.
pub struct ObjectConfigStore {
    client: Arc<dyn ObjectStore>,
    location: Path,
    extractor: VersionExtractor,
    shut_down: AtomicBool,
}

impl ObjectConfigStore {
    pub fn new(client: Arc<dyn ObjectStore>, cluster: &str) -> Self {
        Self {
            client,
            location: Path::from(format!("{}/{}", cluster, NODES_CONFIGURATION_FILE)),
            extractor: default_extractor(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_extractor(mut self, extractor: VersionExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(MembershipError::ShuttingDown);
        }
        Ok(())
    }

    /// Current blob plus the guard needed to replace exactly it.
    async fn read_versioned(&self) -> Result<Option<(StoredValue, UpdateVersion)>> {
        let result = match self.client.get(&self.location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let guard = UpdateVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let bytes = result.bytes().await?;
        Ok(Some((stored_value(bytes, &self.extractor)?, guard)))
    }

    async fn write_inner(&self, bytes: Bytes, condition: WriteCondition) -> Result<()> {
        let mode = match condition {
            WriteCondition::CreateIfNotExists => {
                check_condition(None, &bytes, condition, &self.extractor)?;
                PutMode::Create
            }
            WriteCondition::Overwrite => {
                let current = self.read_versioned().await?.map(|(v, _)| v.version);
                check_condition(current, &bytes, condition, &self.extractor)?;
                PutMode::Overwrite
            }
            WriteCondition::CompareVersionAndSwap(expected) => match self.read_versioned().await? {
                Some((value, guard)) => {
                    check_condition(Some(value.version), &bytes, condition, &self.extractor)?;
                    if guard.e_tag.is_none() && guard.version.is_none() {
                        return Err(MembershipError::Backend(format!(
                            "{} exposes no e-tag; conditional update unsupported",
                            self.client
                        )));
                    }
                    PutMode::Update(guard)
                }
                None => {
                    return Err(MembershipError::Conflict {
                        expected: Some(expected),
                        actual: None,
                    });
                }
            },
        };

        match self
            .client
            .put_opts(&self.location, bytes.into(), PutOptions::from(mode))
            .await
        {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => {
                let actual = self.read_versioned().await.ok().flatten().map(|(v, _)| v.version);
                Err(MembershipError::Conflict {
                    expected: match condition {
                        WriteCondition::CompareVersionAndSwap(v) => Some(v),
                        _ => None,
                    },
                    actual,
                })
            }
            Err(object_store::Error::NotImplemented) => Err(MembershipError::Backend(format!(
                "{} does not support conditional puts",
                self.client
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConfigStore for ObjectConfigStore {
    async fn read(&self) -> Result<Option<StoredValue>> {
        self.ensure_running()?;
        let started = Instant::now();
        let result = self.read_versioned().await.map(|v| v.map(|(value, _)| value));
        observe("object_store", "read", started, &result);
        result
    }

    async fn write(&self, bytes: Bytes, condition: WriteCondition) -> Result<()> {
        self.ensure_running()?;
        let started = Instant::now();
        let result = self.write_inner(bytes, condition).await;
        observe("object_store", "write", started, &result);
        result
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.client, self.location)
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

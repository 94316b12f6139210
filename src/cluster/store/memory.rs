use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    ConfigStore, StoredValue, VersionExtractor, WriteCondition, check_condition,
    default_extractor, observe, stored_value,
};
use crate::cluster::error::{MembershipError, Result};

/// Process-local configuration store.
pub struct MemoryStore {
    blob: Mutex<Option<Bytes>>,
    extractor: VersionExtractor,
    shut_down: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_extractor(default_extractor())
    }

    pub fn with_extractor(extractor: VersionExtractor) -> Self {
        Self {
            blob: Mutex::new(None),
            extractor,
            shut_down: AtomicBool::new(false),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(MembershipError::ShuttingDown);
        }
        Ok(())
    }

    fn write_locked(&self, bytes: Bytes, condition: WriteCondition) -> Result<()> {
        let mut guard = self.blob.lock().unwrap_or_else(|e| e.into_inner());
        let current = match guard.as_ref() {
            Some(existing) => Some(stored_value(existing.clone(), &self.extractor)?.version),
            None => None,
        };
        check_condition(current, &bytes, condition, &self.extractor)?;
        *guard = Some(bytes);
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn read(&self) -> Result<Option<StoredValue>> {
        self.ensure_running()?;
        let blob = self.blob.lock().unwrap_or_else(|e| e.into_inner()).clone();
        blob.map(|bytes| stored_value(bytes, &self.extractor))
            .transpose()
    }

    async fn write(&self, bytes: Bytes, condition: WriteCondition) -> Result<()> {
        self.ensure_running()?;
        let started = Instant::now();
        let result = self.write_locked(bytes, condition);
        observe("memory", "write", started, &result);
        result
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::codec;
    use crate::cluster::configuration::NodesConfiguration;
    use crate::cluster::store::ReadOutcome;
    use crate::types::ConfigVersion;

    fn blob(version: u64) -> Bytes {
        let mut cfg = NodesConfiguration::empty();
        cfg.version = ConfigVersion(version);
        codec::encode(&cfg).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_cas() {
        let store = MemoryStore::new();
        store
            .write(blob(0), WriteCondition::CreateIfNotExists)
            .await
            .unwrap();
        assert!(
            store
                .write(blob(0), WriteCondition::CreateIfNotExists)
                .await
                .unwrap_err()
                .is_conflict()
        );

        store
            .write(blob(1), WriteCondition::CompareVersionAndSwap(ConfigVersion(0)))
            .await
            .unwrap();
        let err = store
            .write(blob(2), WriteCondition::CompareVersionAndSwap(ConfigVersion(0)))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.read().await.unwrap().unwrap().version, ConfigVersion(1));
    }

    #[tokio::test]
    async fn test_read_if_newer() {
        let store = MemoryStore::new();
        assert_eq!(
            store.read_if_newer(ConfigVersion(0)).await.unwrap(),
            ReadOutcome::NotFound
        );
        store.write(blob(4), WriteCondition::Overwrite).await.unwrap();
        assert_eq!(
            store.read_if_newer(ConfigVersion(4)).await.unwrap(),
            ReadOutcome::UpToDate
        );
        assert!(matches!(
            store.read_if_newer(ConfigVersion(3)).await.unwrap(),
            ReadOutcome::Value(v) if v.version == ConfigVersion(4)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_calls() {
        let store = MemoryStore::new();
        store.shutdown();
        assert!(matches!(store.read().await, Err(MembershipError::ShuttingDown)));
        assert!(matches!(
            store.write(blob(0), WriteCondition::Overwrite).await,
            Err(MembershipError::ShuttingDown)
        ));
    }
}

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{
    ConfigStore, StoredValue, VersionExtractor, WriteCondition, check_condition,
    default_extractor, observe, stored_value,
};
use crate::cluster::error::{MembershipError, Result};
use crate::constants::{
    DEFAULT_LOCK_WAIT_MS, DEFAULT_STALE_LOCK_SECS, LOCK_FILE_SUFFIX, NODES_CONFIGURATION_FILE,
};

/// Configuration store backed by a single file per cluster.
///
/// Writers on the same filesystem serialize through a sidecar lock file
/// that is created exclusively; the blob itself is replaced by renaming a
/// fully written temp file over it, so readers never see a torn write.
///
/// A lock older than the stale timeout is presumed abandoned by a crashed
/// process. The timeout must exceed the longest write, or writers in
/// different processes may break a live lock.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    stale_lock_timeout: Duration,
    lock_wait: Duration,
    extractor: VersionExtractor,
    shut_down: AtomicBool,
}

impl FileStore {
    /// Store at `root/<cluster>/nodes_configuration`.
    pub fn new(root: impl AsRef<Path>, cluster: &str) -> Self {
        let path = root
            .as_ref()
            .join(cluster)
            .join(NODES_CONFIGURATION_FILE);
        let lock_path = path.with_file_name(format!("{}{}", NODES_CONFIGURATION_FILE, LOCK_FILE_SUFFIX));
        Self {
            path,
            lock_path,
            stale_lock_timeout: Duration::from_secs(DEFAULT_STALE_LOCK_SECS),
            lock_wait: Duration::from_millis(DEFAULT_LOCK_WAIT_MS),
            extractor: default_extractor(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_stale_lock_timeout(mut self, timeout: Duration) -> Self {
        self.stale_lock_timeout = timeout;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn with_extractor(mut self, extractor: VersionExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(MembershipError::ShuttingDown);
        }
        Ok(())
    }
}

/// Writers inside this process, keyed by lock path. The sidecar file only
/// arbitrates between processes; two writers of one process never race on
/// it, so a short stale timeout cannot let them break each other's lock.
static LOCAL_WRITERS: Lazy<DashMap<PathBuf, Arc<AtomicBool>>> = Lazy::new(DashMap::new);

static LOCK_NONCE: AtomicU64 = AtomicU64::new(0);

/// This process's claim on a lock path. Dropping frees it.
struct LocalSlot(Arc<AtomicBool>);

impl LocalSlot {
    fn acquire(path: &Path, deadline: Instant) -> Result<Self> {
        let flag = LOCAL_WRITERS
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        while flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if Instant::now() >= deadline {
                return Err(lock_timeout(path));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(Self(flag))
    }
}

impl Drop for LocalSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Held while a writer owns the sidecar lock. Dropping releases it.
///
/// The lock file carries an owner token. Breaking a stale lock or
/// releasing our own first renames the file to a private name and checks
/// the token there, so nobody deletes a lock they do not own.
struct LockGuard {
    path: PathBuf,
    token: String,
    _slot: LocalSlot,
}

impl LockGuard {
    fn acquire(path: &Path, stale_after: Duration, wait: Duration) -> Result<Self> {
        let deadline = Instant::now() + wait;
        let slot = LocalSlot::acquire(path, deadline)?;
        let token = format!(
            "{}-{}-{}",
            std::process::id(),
            LOCK_NONCE.fetch_add(1, Ordering::Relaxed),
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
        );

        // The token is written before the lock appears: the hard link is
        // exclusive like `create_new`, and nobody sees an empty lock.
        let staged = path.with_extension(format!("lock.{}.new", token));
        let mut file = OpenOptions::new().write(true).create_new(true).open(&staged)?;
        file.write_all(token.as_bytes())?;
        file.sync_all()?;
        drop(file);

        let result = loop {
            match fs::hard_link(&staged, path) {
                Ok(()) => {
                    // Age counts from taking the lock, not from staging it.
                    if let Err(e) = fs::File::options()
                        .write(true)
                        .open(path)
                        .and_then(|f| f.set_modified(SystemTime::now()))
                    {
                        debug!(lock = %path.display(), error = %e, "Failed to touch lock");
                    }
                    break Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(owner) = stale_owner(path, stale_after) {
                        warn!(lock = %path.display(), owner = %owner, "Breaking stale configuration lock");
                        if let Err(e) = remove_if_owned(path, &owner, &token) {
                            break Err(e);
                        }
                        continue;
                    }
                    if Instant::now() >= deadline {
                        break Err(lock_timeout(path));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => break Err(e.into()),
            }
        };
        if let Err(e) = fs::remove_file(&staged) {
            debug!(path = %staged.display(), error = %e, "Failed to remove staged lock");
        }
        result.map(|()| Self {
            path: path.to_path_buf(),
            token,
            _slot: slot,
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if fs::read_to_string(&self.path).ok().as_deref() != Some(self.token.as_str()) {
            warn!(lock = %self.path.display(), "Configuration lock was taken over before release");
            return;
        }
        if let Err(e) = remove_if_owned(&self.path, &self.token, &self.token) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release configuration lock");
        }
    }
}

/// Move the lock file aside under `tag` and delete it if it belongs to
/// `owner`. A lock that changed hands in between is put back.
fn remove_if_owned(path: &Path, owner: &str, tag: &str) -> Result<bool> {
    let aside = path.with_extension(format!("lock.{}", tag));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    let found = fs::read_to_string(&aside).unwrap_or_default();
    if found == owner {
        fs::remove_file(&aside)?;
        return Ok(true);
    }
    match fs::hard_link(&aside, path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            warn!(lock = %path.display(), owner = %found, "Lock changed hands while being broken");
        }
        Err(e) => return Err(e.into()),
    }
    fs::remove_file(&aside)?;
    Ok(false)
}

fn lock_timeout(path: &Path) -> MembershipError {
    MembershipError::Backend(format!("timed out waiting for lock {}", path.display()))
}

/// Owner token of a lock file older than `stale_after`.
fn stale_owner(path: &Path, stale_after: Duration) -> Option<String> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let age = SystemTime::now().duration_since(modified).ok()?;
    if age <= stale_after {
        return None;
    }
    fs::read_to_string(path).ok()
}

fn read_blob(path: &Path) -> Result<Option<Bytes>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

struct WriteJob {
    path: PathBuf,
    lock_path: PathBuf,
    stale_lock_timeout: Duration,
    lock_wait: Duration,
    extractor: VersionExtractor,
    bytes: Bytes,
    condition: WriteCondition,
}

impl WriteJob {
    fn run(self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| MembershipError::Config(format!("{} has no parent", self.path.display())))?;
        fs::create_dir_all(dir)?;

        let _guard = LockGuard::acquire(&self.lock_path, self.stale_lock_timeout, self.lock_wait)?;

        let current = match read_blob(&self.path)? {
            Some(existing) => Some(stored_value(existing, &self.extractor)?.version),
            None => None,
        };
        let version = check_condition(current, &self.bytes, self.condition, &self.extractor)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&self.bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| MembershipError::Io(e.error))?;

        debug!(path = %self.path.display(), version = %version, "Persisted configuration");
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn read(&self) -> Result<Option<StoredValue>> {
        self.ensure_running()?;
        let started = Instant::now();
        let result = match tokio::fs::read(&self.path).await {
            Ok(data) => stored_value(Bytes::from(data), &self.extractor).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        };
        observe("file", "read", started, &result);
        result
    }

    async fn write(&self, bytes: Bytes, condition: WriteCondition) -> Result<()> {
        self.ensure_running()?;
        let started = Instant::now();
        let job = WriteJob {
            path: self.path.clone(),
            lock_path: self.lock_path.clone(),
            stale_lock_timeout: self.stale_lock_timeout,
            lock_wait: self.lock_wait,
            extractor: self.extractor.clone(),
            bytes,
            condition,
        };
        let result = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| MembershipError::Backend(format!("file store writer panicked: {}", e)))
            .and_then(|r| r);
        observe("file", "write", started, &result);
        result
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
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
    use crate::types::ConfigVersion;
    use tempfile::TempDir;

    fn blob(version: u64) -> Bytes {
        let mut cfg = NodesConfiguration::empty();
        cfg.version = ConfigVersion(version);
        codec::encode(&cfg).unwrap()
    }

    #[tokio::test]
    async fn test_path_layout() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path(), "alpha");
        assert_eq!(
            store.path(),
            dir.path().join("alpha").join(NODES_CONFIGURATION_FILE)
        );
        assert!(store.describe().starts_with("file://"));
        assert!(store.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path(), "alpha");
        store
            .write(blob(0), WriteCondition::CreateIfNotExists)
            .await
            .unwrap();
        store
            .write(blob(1), WriteCondition::CompareVersionAndSwap(ConfigVersion(0)))
            .await
            .unwrap();
        let value = store.read().await.unwrap().unwrap();
        assert_eq!(value.version, ConfigVersion(1));
        assert!(!store.lock_path.exists());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path(), "alpha")
            .with_stale_lock_timeout(Duration::ZERO)
            .with_lock_wait(Duration::from_millis(200));
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(&store.lock_path, b"999999").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        store
            .write(blob(0), WriteCondition::CreateIfNotExists)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_held_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path(), "alpha")
            .with_lock_wait(Duration::from_millis(50));
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(&store.lock_path, b"1").unwrap();

        let err = store
            .write(blob(0), WriteCondition::CreateIfNotExists)
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::Backend(_)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path(), "alpha");
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"garbage").unwrap();
        assert!(matches!(
            store.read().await,
            Err(MembershipError::Corrupt(_))
        ));
    }

    #[test]
    fn test_release_leaves_a_lock_taken_over_by_another_writer() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("nodes_configuration.lock");
        let guard = LockGuard::acquire(&lock, Duration::from_secs(30), Duration::from_millis(100))
            .unwrap();
        assert_eq!(fs::read_to_string(&lock).unwrap(), guard.token);

        fs::write(&lock, b"other-writer").unwrap();
        drop(guard);
        assert_eq!(fs::read_to_string(&lock).unwrap(), "other-writer");
    }

    #[test]
    fn test_breaking_puts_back_a_lock_with_another_owner() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("nodes_configuration.lock");
        fs::write(&lock, b"fresh-owner").unwrap();

        assert!(!remove_if_owned(&lock, "stale-owner", "breaker").unwrap());
        assert_eq!(fs::read_to_string(&lock).unwrap(), "fresh-owner");
        assert!(remove_if_owned(&lock, "fresh-owner", "breaker").unwrap());
        assert!(!lock.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}

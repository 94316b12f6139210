//! Process-local view of the published configuration.
//!
//! The replica publishes snapshots through a `tokio::sync::watch` channel.
//! Readers clone an `Arc` and never hold a lock across an await; the only
//! write path is [`LocalReplica::offer`], which swaps in a snapshot only if
//! it is strictly newer than the one held.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::codec;
use super::configuration::NodesConfiguration;
use super::error::{MembershipError, Result};
use super::metrics;
use super::retry;
use super::store::{ConfigStore, ReadOutcome};
use crate::types::ConfigVersion;

/// Shared, monotonically advancing configuration snapshot.
#[derive(Debug)]
pub struct LocalReplica {
    tx: watch::Sender<Arc<NodesConfiguration>>,
}

impl Default for LocalReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalReplica {
    /// Replica holding the empty configuration at version 0.
    pub fn new() -> Self {
        Self::with_initial(Arc::new(NodesConfiguration::empty()))
    }

    pub fn with_initial(initial: Arc<NodesConfiguration>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Latest snapshot.
    pub fn current(&self) -> Arc<NodesConfiguration> {
        self.tx.borrow().clone()
    }

    pub fn version(&self) -> ConfigVersion {
        self.tx.borrow().version()
    }

    /// Receiver notified on every accepted snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<NodesConfiguration>> {
        self.tx.subscribe()
    }

    /// Install `snapshot` if it is strictly newer than the current one.
    ///
    /// Returns `true` if the snapshot was accepted.
    pub fn offer(&self, snapshot: Arc<NodesConfiguration>) -> bool {
        let incoming = snapshot.version();
        let mut held = ConfigVersion::EMPTY;
        let accepted = self.tx.send_if_modified(|current| {
            held = current.version();
            if incoming > held {
                *current = snapshot;
                true
            } else {
                false
            }
        });

        if accepted {
            metrics::record_published_version(incoming.0);
            debug!(from = %held, to = %incoming, "Replica advanced");
        } else {
            metrics::record_stale_snapshot();
            debug!(held = %held, offered = %incoming, "Discarded stale snapshot");
        }
        accepted
    }

    /// Pull from `store` once. Returns `true` if the replica advanced.
    ///
    /// Transient read failures are retried under [`retry::store_policy`].
    pub async fn refresh(&self, store: &dyn ConfigStore) -> Result<bool> {
        let base = self.version();
        let outcome =
            retry::with_store_policy(|| store.read_if_newer(base), MembershipError::is_retriable)
                .await?;
        match outcome {
            ReadOutcome::Value(value) => {
                let config = codec::decode(&value.bytes)?;
                Ok(self.offer(Arc::new(config)))
            }
            ReadOutcome::UpToDate | ReadOutcome::NotFound => Ok(false),
        }
    }

    /// Poll `store` every `interval` until `shutdown` fires.
    ///
    /// Read failures are logged and counted; the loop never exits on them.
    pub fn spawn_poller(
        self: Arc<Self>,
        store: Arc<dyn ConfigStore>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(store = %store.describe(), interval_ms = interval.as_millis() as u64, "Replica poller started");

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Replica poller stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.refresh(store.as_ref()).await {
                            Ok(_) => {}
                            Err(MembershipError::ShuttingDown) => {
                                info!("Store shut down; replica poller stopping");
                                break;
                            }
                            Err(e) => {
                                metrics::record_poll_failure();
                                warn!(error = %e, "Replica poll failed");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Wait until the replica holds `target` or newer.
    ///
    /// `None` waits forever.
    pub async fn wait_for_version(
        &self,
        target: ConfigVersion,
        timeout: Option<Duration>,
    ) -> Result<Arc<NodesConfiguration>> {
        let mut rx = self.subscribe();
        let wait = async {
            rx.wait_for(|cfg| cfg.version() >= target)
                .await
                .map(|cfg| cfg.clone())
                .map_err(|_| MembershipError::ShuttingDown)
        };

        match timeout {
            None => wait.await,
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                MembershipError::PropagationTimeout {
                    target,
                    lagging: vec![format!("local replica at {}", self.version())],
                }
            })?,
        }
    }
}

//! The proposer: read-modify-CAS against the configuration store.
//!
//! Every change to the published configuration goes through
//! [`NodesConfigurationManager::propose`]. The caller supplies a closure that
//! builds an [`Update`] from the latest configuration; on a CAS conflict the
//! manager re-reads and calls the closure again, so the update is always
//! recomputed against the base it will be applied to.

use std::sync::Arc;

use backon::BackoffBuilder;
use tracing::{debug, info, warn};

use super::codec;
use super::configuration::NodesConfiguration;
use super::error::{MembershipError, Result};
use super::replica::LocalReplica;
use super::retry;
use super::store::{ConfigStore, WriteCondition};
use super::update::{Update, apply};
use crate::constants::DEFAULT_CAS_MAX_ATTEMPTS;

/// Result of a proposal.
#[derive(Debug, Clone)]
pub struct Proposal {
    /// The configuration now published (new, or the unchanged base).
    pub config: Arc<NodesConfiguration>,
    /// False when the builder decided nothing needed to change.
    pub changed: bool,
}

/// Result of [`NodesConfigurationManager::bootstrap`].
#[derive(Debug, Clone)]
pub enum BootstrapOutcome {
    Created(Arc<NodesConfiguration>),
    AlreadyBootstrapped(Arc<NodesConfiguration>),
}

impl BootstrapOutcome {
    pub fn config(&self) -> &Arc<NodesConfiguration> {
        match self {
            BootstrapOutcome::Created(cfg) | BootstrapOutcome::AlreadyBootstrapped(cfg) => cfg,
        }
    }
}

pub struct NodesConfigurationManager {
    store: Arc<dyn ConfigStore>,
    replica: Arc<LocalReplica>,
    cas_max_attempts: usize,
}

impl NodesConfigurationManager {
    pub fn new(store: Arc<dyn ConfigStore>, replica: Arc<LocalReplica>) -> Self {
        Self {
            store,
            replica,
            cas_max_attempts: DEFAULT_CAS_MAX_ATTEMPTS,
        }
    }

    pub fn with_cas_max_attempts(mut self, attempts: usize) -> Self {
        self.cas_max_attempts = attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn replica(&self) -> &Arc<LocalReplica> {
        &self.replica
    }

    pub fn current(&self) -> Arc<NodesConfiguration> {
        self.replica.current()
    }

    /// Pull the latest configuration into the replica.
    pub async fn refresh(&self) -> Result<Arc<NodesConfiguration>> {
        self.replica.refresh(self.store.as_ref()).await?;
        Ok(self.replica.current())
    }

    /// Apply the update built by `build` to the latest configuration.
    ///
    /// Invariant violations from `build` or from applying its update are
    /// returned at once. Conflicts are retried up to the configured bound,
    /// after which `RetriesExhausted` wraps the last conflict.
    pub async fn propose<F>(&self, mut build: F) -> Result<Arc<NodesConfiguration>>
    where
        F: FnMut(&NodesConfiguration) -> Result<Update>,
    {
        self.propose_if(|cfg| build(cfg).map(Some))
            .await
            .map(|p| p.config)
    }

    /// Like [`propose`](Self::propose), but `build` may return `None` to
    /// signal that the latest configuration already has what it wants.
    pub async fn propose_if<F>(&self, mut build: F) -> Result<Proposal>
    where
        F: FnMut(&NodesConfiguration) -> Result<Option<Update>>,
    {
        let mut delays = retry::cas_policy_with_attempts(self.cas_max_attempts).build();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            match self.propose_once(&mut build).await {
                Ok(proposal) => {
                    if attempt > 1 {
                        retry::record_retry_success("cas");
                    }
                    return Ok(proposal);
                }
                Err(e) if e.is_conflict() => match delays.next() {
                    Some(delay) => {
                        retry::record_retry_attempt("cas", attempt);
                        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "CAS conflict, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        retry::record_retry_exhausted("cas");
                        return Err(MembershipError::RetriesExhausted {
                            operation: "propose".to_string(),
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn propose_once<F>(&self, build: &mut F) -> Result<Proposal>
    where
        F: FnMut(&NodesConfiguration) -> Result<Option<Update>>,
    {
        let (base, condition) = match self.store.read().await? {
            None => (
                Arc::new(NodesConfiguration::empty()),
                WriteCondition::CreateIfNotExists,
            ),
            Some(value) => {
                let base = if value.version == self.replica.version() {
                    self.replica.current()
                } else {
                    let decoded = Arc::new(codec::decode(&value.bytes)?);
                    self.replica.offer(decoded.clone());
                    decoded
                };
                let version = base.version();
                (base, WriteCondition::CompareVersionAndSwap(version))
            }
        };

        let Some(update) = build(&base)? else {
            return Ok(Proposal {
                config: base,
                changed: false,
            });
        };
        let next = Arc::new(apply(&base, &update)?);
        let bytes = codec::encode(&next)?;
        self.store.write(bytes, condition).await?;

        self.replica.offer(next.clone());
        info!(
            from = %base.version(),
            to = %next.version(),
            ops = update.len(),
            maintenance = update.maintenance.as_deref().unwrap_or(""),
            "Published nodes configuration"
        );
        Ok(Proposal {
            config: next,
            changed: true,
        })
    }

    /// Seed the store with `initial` (or the empty configuration).
    ///
    /// Succeeds without writing if a record already exists.
    pub async fn bootstrap(&self, initial: Option<NodesConfiguration>) -> Result<BootstrapOutcome> {
        let initial = initial.unwrap_or_else(NodesConfiguration::empty);
        initial.validate()?;
        let bytes = codec::encode(&initial)?;

        match self
            .store
            .write(bytes, WriteCondition::CreateIfNotExists)
            .await
        {
            Ok(()) => {
                let cfg = Arc::new(initial);
                self.replica.offer(cfg.clone());
                info!(version = %cfg.version(), store = %self.store.describe(), "Bootstrapped nodes configuration");
                Ok(BootstrapOutcome::Created(cfg))
            }
            Err(e) if e.is_conflict() => {
                let cfg = self.refresh().await?;
                info!(version = %cfg.version(), "Nodes configuration already bootstrapped");
                Ok(BootstrapOutcome::AlreadyBootstrapped(cfg))
            }
            Err(e) => Err(e),
        }
    }

    /// Unconditionally replace the stored configuration.
    ///
    /// Emergency path. Replicas holding a newer version will not go back.
    pub async fn overwrite(&self, config: NodesConfiguration) -> Result<Arc<NodesConfiguration>> {
        config.validate()?;
        let bytes = codec::encode(&config)?;
        warn!(
            version = %config.version(),
            store = %self.store.describe(),
            "Overwriting nodes configuration without CAS"
        );
        self.store.write(bytes, WriteCondition::Overwrite).await?;
        let cfg = Arc::new(config);
        if !self.replica.offer(cfg.clone()) {
            warn!(
                written = %cfg.version(),
                held = %self.replica.version(),
                "Local replica already holds a newer version than the overwrite"
            );
        }
        Ok(cfg)
    }
}

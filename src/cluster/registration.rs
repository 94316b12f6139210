//! Self-registration of a starting node.
//!
//! A node configured with a unique name looks itself up in the published
//! configuration. If it is missing it claims the smallest free index; if it
//! is present with a stale entry it republishes its entry; if the published
//! entry is newer than what the node would write, it refuses to start.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use super::config::{MembershipConfig, SelfRegistrationSettings};
use super::configuration::{
    NodeAddress, NodeEndpoints, SequencerMembership, ServiceDiscoveryEntry, StorageAttributes,
};
use super::error::{MembershipError, Result};
use super::identity::allocate_indices;
use super::manager::NodesConfigurationManager;
use super::metrics;
use super::replica::LocalReplica;
use super::store::ConfigStore;
use super::update::{NodeUpdate, Update};
use crate::constants::{DEFAULT_REGISTRATION_MAX_ATTEMPTS, DEFAULT_SLEEP_AFTER_REGISTRATION_SECS};
use crate::types::NodeIndex;

/// What self-registration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Added under a freshly allocated index.
    Registered { index: NodeIndex },
    /// Existing entry republished.
    Updated { index: NodeIndex },
    /// Published entry already matches.
    UpToDate { index: NodeIndex },
}

impl RegistrationOutcome {
    pub fn index(&self) -> NodeIndex {
        match self {
            RegistrationOutcome::Registered { index }
            | RegistrationOutcome::Updated { index }
            | RegistrationOutcome::UpToDate { index } => *index,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RegistrationOutcome::Registered { .. } => "registered",
            RegistrationOutcome::Updated { .. } => "updated",
            RegistrationOutcome::UpToDate { .. } => "up_to_date",
        }
    }
}

pub struct SelfRegistration {
    settings: SelfRegistrationSettings,
    max_attempts: usize,
    sleep_after: Duration,
    wait_timeout: Option<Duration>,
}

impl SelfRegistration {
    pub fn new(settings: SelfRegistrationSettings) -> Self {
        Self {
            settings,
            max_attempts: DEFAULT_REGISTRATION_MAX_ATTEMPTS,
            sleep_after: Duration::from_secs(DEFAULT_SLEEP_AFTER_REGISTRATION_SECS),
            wait_timeout: None,
        }
    }

    pub fn from_config(config: &MembershipConfig) -> Self {
        Self {
            settings: config.self_registration.clone(),
            max_attempts: config.registration_max_attempts,
            sleep_after: config.sleep_after_registration,
            wait_timeout: Some(config.propagation_timeout),
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_sleep_after(mut self, sleep: Duration) -> Self {
        self.sleep_after = sleep;
        self
    }

    /// The entry this node wants published, at `version`.
    pub fn desired_entry(&self, version: u64) -> Result<ServiceDiscoveryEntry> {
        build_entry(&self.settings, version)
    }

    /// Register or refresh this node's entry.
    pub async fn register(
        &self,
        store: Arc<dyn ConfigStore>,
        replica: Arc<LocalReplica>,
    ) -> Result<RegistrationOutcome> {
        let result = self.register_inner(store, replica).await;
        match &result {
            Ok(outcome) => metrics::record_registration(outcome.label()),
            Err(e) => {
                metrics::record_registration(e.root_cause().label());
                error!(error = %e, "Self-registration failed");
            }
        }
        result
    }

    async fn register_inner(
        &self,
        store: Arc<dyn ConfigStore>,
        replica: Arc<LocalReplica>,
    ) -> Result<RegistrationOutcome> {
        if !self.settings.enabled {
            return Err(MembershipError::NotFound(
                "self-registration is disabled".to_string(),
            ));
        }
        let name = self
            .settings
            .name
            .clone()
            .ok_or_else(|| MembershipError::Config("self-registration requires a node name".to_string()))?;

        let manager = NodesConfigurationManager::new(store, replica.clone())
            .with_cas_max_attempts(self.max_attempts);

        let mut outcome = None;
        let proposal = manager
            .propose_if(|cfg| {
                let Some((index, existing)) = cfg.node_by_name(&name) else {
                    let index = self.pick_index(cfg)?;
                    outcome = Some(RegistrationOutcome::Registered { index });
                    return self.add_update(index).map(Some);
                };

                let published = existing.version;
                let desired = self.settings.node_version.unwrap_or(published);
                if desired < published {
                    return Err(MembershipError::Downgrade { published, desired });
                }
                let entry = build_entry(&self.settings, desired)?;
                if &entry == existing {
                    outcome = Some(RegistrationOutcome::UpToDate { index });
                    return Ok(None);
                }
                outcome = Some(RegistrationOutcome::Updated { index });
                Ok(Some(
                    Update::new()
                        .with_maintenance(format!("self-registration:{}", name))
                        .reset(index, entry),
                ))
            })
            .await?;

        let outcome = outcome.ok_or_else(|| {
            MembershipError::Backend("registration produced no outcome".to_string())
        })?;

        if let RegistrationOutcome::UpToDate { index } = outcome {
            info!(name = %name, index = %index, version = %proposal.config.version(), "Node entry is up to date");
            return Ok(outcome);
        }

        replica
            .wait_for_version(proposal.config.version(), self.wait_timeout)
            .await?;
        info!(
            name = %name,
            index = %outcome.index(),
            outcome = outcome.label(),
            version = %proposal.config.version(),
            sleep_ms = self.sleep_after.as_millis() as u64,
            "Self-registration published; pausing for propagation"
        );
        if !self.sleep_after.is_zero() {
            tokio::time::sleep(self.sleep_after).await;
        }
        Ok(outcome)
    }

    /// Explicit index if it is free, otherwise the smallest free one.
    fn pick_index(&self, cfg: &super::configuration::NodesConfiguration) -> Result<NodeIndex> {
        if let Some(index) = self.settings.index
            && !cfg.contains(index)
        {
            return Ok(index);
        }
        allocate_indices(cfg, 1, &BTreeSet::new())?
            .into_iter()
            .next()
            .ok_or_else(|| MembershipError::Backend("index allocation returned nothing".to_string()))
    }

    fn add_update(&self, index: NodeIndex) -> Result<Update> {
        let entry = build_entry(&self.settings, self.settings.node_version.unwrap_or(0))?;
        let attributes = entry.roles.storage.then(|| {
            StorageAttributes::new(self.settings.num_shards).with_capacity(self.settings.storage_capacity)
        });
        let sequencer = entry.roles.sequencer.then(|| SequencerMembership {
            enabled: true,
            weight: self.settings.sequencer_weight,
        });
        Ok(Update::new()
            .with_maintenance(format!("self-registration:{}", entry.name))
            .push(NodeUpdate::Add {
                index,
                entry,
                attributes,
                sequencer,
            }))
    }
}

fn parse_optional(addr: &Option<String>) -> Result<Option<NodeAddress>> {
    addr.as_deref().map(NodeAddress::parse).transpose()
}

/// Build a service discovery entry from registration settings.
pub fn build_entry(settings: &SelfRegistrationSettings, version: u64) -> Result<ServiceDiscoveryEntry> {
    let name = settings
        .name
        .clone()
        .ok_or_else(|| MembershipError::Config("node name is required".to_string()))?;
    let data = settings
        .address
        .as_deref()
        .ok_or_else(|| MembershipError::Config("data address is required".to_string()))
        .and_then(NodeAddress::parse)?;

    let mut endpoints = NodeEndpoints::new(data);
    if let Some(addr) = parse_optional(&settings.ssl_address)? {
        endpoints = endpoints.with_ssl(addr);
    }
    if let Some(addr) = parse_optional(&settings.gossip_address)? {
        endpoints = endpoints.with_gossip(addr);
    }
    if let Some(addr) = parse_optional(&settings.server_to_server_address)? {
        endpoints = endpoints.with_server_to_server(addr);
    }
    if let Some(addr) = parse_optional(&settings.admin_address)? {
        endpoints = endpoints.with_admin(addr);
    }

    let mut entry = ServiceDiscoveryEntry::new(name, endpoints, settings.roles).with_version(version);
    entry.location = settings.location.clone();
    entry.tags = settings.tags.clone();
    entry.validate()?;
    Ok(entry)
}

//! Membership runtime of one cluster node.
//!
//! [`MembershipNode::start`] brings a node into the cluster:
//!
//! 1. open the configured store and load the local replica,
//! 2. self-register (or find the operator-assigned entry),
//! 3. start the replica poller, the self-consistency monitor and the
//!    introspection server under one [`BackgroundTaskRegistry`].
//!
//! A fence under the graceful policy fires the registry's shutdown signal;
//! callers await it with [`MembershipNode::wait_for_shutdown`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use super::background_tasks::{BackgroundTaskRegistry, TaskStatus};
use super::config::MembershipConfig;
use super::configuration::NodesConfiguration;
use super::error::{MembershipError, Result};
use super::fencing::{
    FenceHandler, FenceState, RegisteredIdentity, SelfConsistencyMonitor, SessionTag,
    ShutdownSignal,
};
use super::identity::NodeIdentityFinder;
use super::registration::{RegistrationOutcome, SelfRegistration};
use super::replica::LocalReplica;
use super::store::{self, ConfigStore};
use crate::server::health::{IntrospectionServer, IntrospectionState};
use crate::types::NodeIndex;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MembershipNode {
    store: Arc<dyn ConfigStore>,
    replica: Arc<LocalReplica>,
    fence: Arc<FenceState>,
    identity: RegisteredIdentity,
    registration: Option<RegistrationOutcome>,
    introspection_addr: SocketAddr,
    shutdown_rx: broadcast::Receiver<()>,
    tasks: BackgroundTaskRegistry,
}

impl MembershipNode {
    /// Open the configured store and join the cluster.
    pub async fn start(config: MembershipConfig) -> Result<Self> {
        let store = store::open(&config).await?;
        Self::start_with(config, store, None).await
    }

    /// Join using an already opened store. `handler` overrides what happens
    /// on a fence; by default the node's own shutdown signal fires.
    pub async fn start_with(
        config: MembershipConfig,
        store: Arc<dyn ConfigStore>,
        handler: Option<Arc<dyn FenceHandler>>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| MembershipError::Config(errors.join("; ")))?;
        let finder = NodeIdentityFinder::from_settings(&config.self_registration)?;

        let replica = Arc::new(LocalReplica::new());
        replica.refresh(store.as_ref()).await?;

        let registration = if config.self_registration.enabled {
            let outcome = SelfRegistration::from_config(&config)
                .register(store.clone(), replica.clone())
                .await?;
            Some(outcome)
        } else {
            None
        };

        let cfg = replica.current();
        let index = match registration {
            Some(outcome) => outcome.index(),
            None => finder.find(&cfg).ok_or_else(|| {
                MembershipError::NotFound(format!("no entry for {} in {}", finder, cfg.version()))
            })?,
        };
        let identity = RegisteredIdentity::from_config(&cfg, index).ok_or_else(|| {
            MembershipError::IdentityLost(format!("{} vanished after registration", index))
        })?;

        let mut tasks = BackgroundTaskRegistry::new();
        let shutdown_rx = tasks.subscribe();
        let fence = Arc::new(FenceState::new());

        tasks.adopt(
            "replica_poller",
            replica
                .clone()
                .spawn_poller(store.clone(), config.poll_interval, tasks.subscribe()),
        );

        let handler =
            handler.unwrap_or_else(|| Arc::new(ShutdownSignal::new(tasks.shutdown_sender())));
        tasks.adopt(
            "self_consistency_monitor",
            SelfConsistencyMonitor::spawn(
                replica.clone(),
                finder,
                identity,
                config.fencing_policy(),
                handler,
                fence.clone(),
            ),
        );

        let state = Arc::new(IntrospectionState::new(replica.clone(), fence.clone()));
        state.set_identity(identity);
        let server = IntrospectionServer::bind(
            &format!("0.0.0.0:{}", config.introspection_port),
            state,
        )
        .await?;
        let introspection_addr = server.local_addr()?;
        tasks.spawn("introspection_server", async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Introspection server failed");
            }
        });

        info!(
            index = %index,
            generation = %identity.generation,
            version = %cfg.version(),
            introspection = %introspection_addr,
            store = %store.describe(),
            "Membership node started"
        );

        Ok(Self {
            store,
            replica,
            fence,
            identity,
            registration,
            introspection_addr,
            shutdown_rx,
            tasks,
        })
    }

    pub fn index(&self) -> NodeIndex {
        self.identity.index
    }

    pub fn identity(&self) -> &RegisteredIdentity {
        &self.identity
    }

    /// `None` when the node found an operator-assigned entry instead.
    pub fn registration(&self) -> Option<RegistrationOutcome> {
        self.registration
    }

    pub fn replica(&self) -> &Arc<LocalReplica> {
        &self.replica
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn current(&self) -> Arc<NodesConfiguration> {
        self.replica.current()
    }

    pub fn fence(&self) -> &Arc<FenceState> {
        &self.fence
    }

    pub fn is_fenced(&self) -> bool {
        self.fence.is_fenced()
    }

    pub fn introspection_addr(&self) -> SocketAddr {
        self.introspection_addr
    }

    /// Tag for a session opened against this node now.
    pub fn open_session(&self) -> Option<SessionTag> {
        SessionTag::open(&self.replica.current(), self.identity.index)
    }

    pub fn task_status(&self) -> Vec<(&'static str, TaskStatus)> {
        self.tasks.status()
    }

    /// Resolves when shutdown is requested, by a fence or by [`stop`](Self::stop).
    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.shutdown_rx.recv().await;
    }

    pub async fn stop(mut self) {
        info!(index = %self.identity.index, "Stopping membership node");
        self.tasks.shutdown(SHUTDOWN_TIMEOUT).await;
        self.store.shutdown();
    }
}

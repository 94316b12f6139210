//! Self-consistency fencing.
//!
//! A running node remembers the identity it registered with. Every time its
//! replica advances, it re-checks that identity against the new
//! configuration. If the entry vanished, was re-published by someone else,
//! or had its generation bumped, the node is no longer the process the
//! cluster believes it to be and must stop serving.
//!
//! # Safety Properties
//!
//! 1. **One-way**: once fenced, a node never un-fences; restart is required
//! 2. **Atomic transitions**: state changes use `SeqCst` ordering
//! 3. **Observable**: every transition is logged and recorded to Prometheus

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::configuration::NodesConfiguration;
use super::error::MembershipError;
use super::identity::NodeIdentityFinder;
use super::metrics;
use super::replica::LocalReplica;
use super::update::now_millis;
use crate::types::{ConfigVersion, NodeGeneration, NodeIndex};

/// What to do when the node's identity no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FencingPolicy {
    /// Log the mismatch and keep running.
    LogOnly,
    /// Fence and ask the process to shut down.
    GracefulShutdown,
    /// Fence and exit the process immediately.
    HardExit,
}

/// Fenced/not-fenced flag with entry time and reason.
#[derive(Debug, Default)]
pub struct FenceState {
    active: AtomicBool,
    fenced_at_millis: AtomicU64,
    reason: Mutex<Option<String>>,
}

impl FenceState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_fenced(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Epoch millis when the node fenced itself, or 0.
    pub fn fenced_at(&self) -> u64 {
        self.fenced_at_millis.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Enter the fenced state. Returns `true` only for the first entry.
    pub fn enter(&self, label: &str, reason: impl Into<String>) -> bool {
        if self.active.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.fenced_at_millis.store(now_millis(), Ordering::SeqCst);
        *self.reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.into());
        metrics::enter_fenced(label);
        true
    }
}

/// Identity a node registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredIdentity {
    pub index: NodeIndex,
    pub service_discovery_version: u64,
    pub generation: NodeGeneration,
}

impl RegisteredIdentity {
    /// Snapshot the identity of `index` as published in `config`.
    pub fn from_config(config: &NodesConfiguration, index: NodeIndex) -> Option<Self> {
        let entry = config.node(index)?;
        Some(Self {
            index,
            service_discovery_version: entry.version,
            generation: config.generation(index)?,
        })
    }
}

/// Result of comparing a registered identity with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityCheck {
    Consistent,
    /// The finder no longer resolves to our index.
    Lost { reason: String },
    /// Our entry was re-published with a different version.
    Superseded {
        published_version: u64,
        registered_version: u64,
    },
    /// Our storage generation moved on.
    GenerationChanged {
        registered: NodeGeneration,
        published: NodeGeneration,
    },
}

impl IdentityCheck {
    pub fn is_consistent(&self) -> bool {
        matches!(self, IdentityCheck::Consistent)
    }

    pub fn label(&self) -> &'static str {
        match self {
            IdentityCheck::Consistent => "consistent",
            IdentityCheck::Lost { .. } => "lost",
            IdentityCheck::Superseded { .. } => "superseded",
            IdentityCheck::GenerationChanged { .. } => "generation_changed",
        }
    }

    /// Convert a mismatch into the matching error.
    pub fn into_result(self, index: NodeIndex) -> Result<(), MembershipError> {
        match self {
            IdentityCheck::Consistent => Ok(()),
            IdentityCheck::Lost { reason } => Err(MembershipError::IdentityLost(reason)),
            IdentityCheck::Superseded {
                published_version,
                registered_version,
            } => Err(MembershipError::IdentitySuperseded {
                index,
                registered: registered_version,
                published: published_version,
            }),
            IdentityCheck::GenerationChanged {
                registered,
                published,
            } => Err(MembershipError::IdentitySuperseded {
                index,
                registered: registered.value() as u64,
                published: published.value() as u64,
            }),
        }
    }
}

impl std::fmt::Display for IdentityCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityCheck::Consistent => write!(f, "consistent"),
            IdentityCheck::Lost { reason } => write!(f, "identity lost: {}", reason),
            IdentityCheck::Superseded {
                published_version,
                registered_version,
            } => write!(
                f,
                "service discovery version changed from {} to {}",
                registered_version, published_version
            ),
            IdentityCheck::GenerationChanged {
                registered,
                published,
            } => write!(f, "generation changed from {} to {}", registered, published),
        }
    }
}

/// Compare `registered` with what `config` says about us.
pub fn check_identity(
    config: &NodesConfiguration,
    finder: &NodeIdentityFinder,
    registered: &RegisteredIdentity,
) -> IdentityCheck {
    match finder.find(config) {
        None => {
            return IdentityCheck::Lost {
                reason: format!("{} not found in {}", finder, config.version()),
            };
        }
        Some(index) if index != registered.index => {
            return IdentityCheck::Lost {
                reason: format!(
                    "{} now resolves to {} instead of {}",
                    finder, index, registered.index
                ),
            };
        }
        Some(_) => {}
    }

    let Some(entry) = config.node(registered.index) else {
        return IdentityCheck::Lost {
            reason: format!("{} missing from {}", registered.index, config.version()),
        };
    };
    if entry.version != registered.service_discovery_version {
        return IdentityCheck::Superseded {
            published_version: entry.version,
            registered_version: registered.service_discovery_version,
        };
    }
    match config.generation(registered.index) {
        Some(published) if published != registered.generation => IdentityCheck::GenerationChanged {
            registered: registered.generation,
            published,
        },
        _ => IdentityCheck::Consistent,
    }
}

/// Reaction to a fencing decision.
pub trait FenceHandler: Send + Sync {
    fn on_graceful_shutdown(&self, reason: &str);

    fn on_hard_exit(&self, reason: &str) {
        error!(reason, "Exiting immediately after identity mismatch");
        std::process::exit(1);
    }
}

/// Handler that signals shutdown on a broadcast channel.
pub struct ShutdownSignal {
    tx: broadcast::Sender<()>,
}

impl ShutdownSignal {
    pub fn new(tx: broadcast::Sender<()>) -> Self {
        Self { tx }
    }
}

impl FenceHandler for ShutdownSignal {
    fn on_graceful_shutdown(&self, reason: &str) {
        info!(reason, "Requesting graceful shutdown");
        let _ = self.tx.send(());
    }
}

/// Background watcher that fences the node on identity mismatch.
pub struct SelfConsistencyMonitor;

impl SelfConsistencyMonitor {
    /// Check the current snapshot and every later one until fenced or the
    /// replica is dropped.
    pub fn spawn(
        replica: Arc<LocalReplica>,
        finder: NodeIdentityFinder,
        registered: RegisteredIdentity,
        policy: FencingPolicy,
        handler: Arc<dyn FenceHandler>,
        state: Arc<FenceState>,
    ) -> JoinHandle<()> {
        let mut rx = replica.subscribe();
        drop(replica);
        tokio::spawn(async move {
            let mut last_reported: Option<ConfigVersion> = None;
            metrics::record_generation(registered.index.value(), registered.generation.value());

            loop {
                let config = rx.borrow_and_update().clone();
                let check = check_identity(&config, &finder, &registered);

                if !check.is_consistent() {
                    let reason = format!("{} at {}", check, config.version());
                    match policy {
                        FencingPolicy::LogOnly => {
                            if last_reported != Some(config.version()) {
                                last_reported = Some(config.version());
                                metrics::record_fence_ignored(check.label());
                                error!(
                                    index = %registered.index,
                                    version = %config.version(),
                                    reason = %check,
                                    "Node configuration mismatch; continuing because shutdown on mismatch is disabled"
                                );
                            }
                        }
                        FencingPolicy::GracefulShutdown => {
                            if state.enter(check.label(), reason.clone()) {
                                error!(index = %registered.index, reason = %reason, "Fencing node");
                                handler.on_graceful_shutdown(&reason);
                            }
                            break;
                        }
                        FencingPolicy::HardExit => {
                            if state.enter(check.label(), reason.clone()) {
                                error!(index = %registered.index, reason = %reason, "Fencing node");
                                handler.on_hard_exit(&reason);
                            }
                            break;
                        }
                    }
                }

                if rx.changed().await.is_err() {
                    warn!("Replica dropped; self-consistency monitor stopping");
                    break;
                }
            }
        })
    }
}

/// Generation-stamped handle to a node, taken when a session was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTag {
    pub index: NodeIndex,
    pub generation: NodeGeneration,
    pub opened_at_version: ConfigVersion,
    /// Version in which the node holding `index` was added.
    pub added_at: Option<ConfigVersion>,
}

impl SessionTag {
    pub fn open(config: &NodesConfiguration, index: NodeIndex) -> Option<Self> {
        Some(Self {
            index,
            generation: config.generation(index)?,
            opened_at_version: config.version(),
            added_at: config.added_at(index),
        })
    }

    /// A session is stale once the node is gone, its generation moved, or
    /// the index was removed and added again.
    pub fn is_stale(&self, config: &NodesConfiguration) -> bool {
        config.generation(self.index) != Some(self.generation)
            || config.added_at(self.index) != self.added_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::configuration::{
        NodeAddress, NodeEndpoints, RoleSet, ServiceDiscoveryEntry, StorageAttributes,
    };
    use crate::cluster::update::{Update, apply};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn entry(name: &str) -> ServiceDiscoveryEntry {
        ServiceDiscoveryEntry::new(
            name,
            NodeEndpoints::new(NodeAddress::tcp("127.0.0.1", 4440)),
            RoleSet::BOTH,
        )
    }

    fn base() -> NodesConfiguration {
        apply(
            &NodesConfiguration::empty(),
            &Update::new().add(NodeIndex(0), entry("a"), Some(StorageAttributes::new(1))),
        )
        .unwrap()
    }

    #[derive(Default)]
    struct CountingHandler {
        graceful: AtomicUsize,
        hard: AtomicUsize,
    }

    impl FenceHandler for CountingHandler {
        fn on_graceful_shutdown(&self, _reason: &str) {
            self.graceful.fetch_add(1, Ordering::SeqCst);
        }

        fn on_hard_exit(&self, _reason: &str) {
            self.hard.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_fence_state_enters_once() {
        let state = FenceState::new();
        assert!(!state.is_fenced());
        assert!(state.enter("lost", "gone"));
        assert!(!state.enter("lost", "again"));
        assert!(state.is_fenced());
        assert!(state.fenced_at() > 0);
        assert_eq!(state.reason().as_deref(), Some("gone"));
    }

    #[test]
    fn test_check_identity_cases() {
        let cfg = base();
        let finder = NodeIdentityFinder::ByName("a".to_string());
        let registered = RegisteredIdentity::from_config(&cfg, NodeIndex(0)).unwrap();
        assert!(check_identity(&cfg, &finder, &registered).is_consistent());

        let bumped = apply(&cfg, &Update::new().bump_generation(NodeIndex(0))).unwrap();
        assert!(matches!(
            check_identity(&bumped, &finder, &registered),
            IdentityCheck::GenerationChanged { .. }
        ));

        let reset = apply(&cfg, &Update::new().reset(NodeIndex(0), entry("a").with_version(5))).unwrap();
        assert_eq!(
            check_identity(&reset, &finder, &registered),
            IdentityCheck::Superseded {
                published_version: 5,
                registered_version: 0
            }
        );

        let drained = apply(
            &cfg,
            &Update::new().drain(NodeIndex(0)).remove(NodeIndex(0)),
        )
        .unwrap();
        assert!(matches!(
            check_identity(&drained, &finder, &registered),
            IdentityCheck::Lost { .. }
        ));
    }

    #[test]
    fn test_into_result_maps_errors() {
        let check = IdentityCheck::Lost {
            reason: "x".to_string(),
        };
        assert!(matches!(
            check.into_result(NodeIndex(0)),
            Err(MembershipError::IdentityLost(_))
        ));
        assert!(IdentityCheck::Consistent.into_result(NodeIndex(0)).is_ok());
    }

    #[test]
    fn test_session_tag_staleness() {
        let cfg = base();
        let tag = SessionTag::open(&cfg, NodeIndex(0)).unwrap();
        assert!(!tag.is_stale(&cfg));
        let bumped = apply(&cfg, &Update::new().bump_generation(NodeIndex(0))).unwrap();
        assert!(tag.is_stale(&bumped));
        assert!(SessionTag::open(&cfg, NodeIndex(4)).is_none());
    }

    #[test]
    fn test_session_tag_stale_after_remove_and_re_add() {
        let cfg = base();
        let tag = SessionTag::open(&cfg, NodeIndex(0)).unwrap();
        assert_eq!(tag.added_at, Some(cfg.version()));

        let removed = apply(&cfg, &Update::new().remove(NodeIndex(0))).unwrap();
        assert!(tag.is_stale(&removed));
        let re_added = apply(
            &removed,
            &Update::new().add(NodeIndex(0), entry("a"), Some(StorageAttributes::new(1))),
        )
        .unwrap();
        assert_eq!(re_added.generation(NodeIndex(0)), Some(tag.generation));
        assert!(tag.is_stale(&re_added));

        let unrelated = apply(
            &cfg,
            &Update::new().set_sequencer(NodeIndex(0), None, Some(2.0)),
        )
        .unwrap();
        assert!(!tag.is_stale(&unrelated));
    }

    #[tokio::test]
    async fn test_monitor_fences_on_generation_bump() {
        let cfg = Arc::new(base());
        let replica = Arc::new(LocalReplica::with_initial(cfg.clone()));
        let registered = RegisteredIdentity::from_config(&cfg, NodeIndex(0)).unwrap();
        let handler = Arc::new(CountingHandler::default());
        let state = Arc::new(FenceState::new());

        let handle = SelfConsistencyMonitor::spawn(
            replica.clone(),
            NodeIdentityFinder::ByName("a".to_string()),
            registered,
            FencingPolicy::GracefulShutdown,
            handler.clone(),
            state.clone(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!state.is_fenced());

        replica.offer(Arc::new(
            apply(&cfg, &Update::new().bump_generation(NodeIndex(0))).unwrap(),
        ));
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(state.is_fenced());
        assert_eq!(handler.graceful.load(Ordering::SeqCst), 1);
        assert_eq!(handler.hard.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_monitor_log_only_keeps_running() {
        let cfg = Arc::new(base());
        let replica = Arc::new(LocalReplica::with_initial(cfg.clone()));
        let registered = RegisteredIdentity::from_config(&cfg, NodeIndex(0)).unwrap();
        let handler = Arc::new(CountingHandler::default());
        let state = Arc::new(FenceState::new());

        let handle = SelfConsistencyMonitor::spawn(
            replica.clone(),
            NodeIdentityFinder::ByName("a".to_string()),
            registered,
            FencingPolicy::LogOnly,
            handler.clone(),
            state.clone(),
        );

        replica.offer(Arc::new(
            apply(&cfg, &Update::new().bump_generation(NodeIndex(0))).unwrap(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        assert!(!state.is_fenced());
        assert_eq!(handler.graceful.load(Ordering::SeqCst), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_shutdown_signal_handler() {
        let (tx, mut rx) = broadcast::channel(1);
        ShutdownSignal::new(tx).on_graceful_shutdown("test");
        assert!(rx.recv().await.is_ok());
    }
}

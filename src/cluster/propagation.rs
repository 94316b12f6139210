//! Propagation barrier: wait until participants have applied a version.
//!
//! A participant is anything that can report which configuration version it
//! has applied: a client's own replica, the store, or a running server probed
//! through its introspection endpoint. Participants that report themselves
//! stopped drop out of the wait set; participants that fail to answer are
//! retried until the deadline.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::error::{MembershipError, Result};
use super::metrics;
use super::replica::LocalReplica;
use super::store::ConfigStore;
use crate::constants::{
    DEFAULT_PROPAGATION_POLL_MS, DEFAULT_PROPAGATION_TIMEOUT_SECS,
    INTROSPECTION_REQUEST_TIMEOUT_MS,
};
use crate::types::ConfigVersion;

/// Something whose applied configuration version can be observed.
#[async_trait]
pub trait Participant: Send + Sync {
    fn name(&self) -> String;

    /// Version currently applied, or `None` if it holds nothing yet.
    async fn applied_version(&self) -> Result<Option<ConfigVersion>>;

    /// A stopped participant is excluded from the barrier.
    async fn is_stopped(&self) -> bool {
        false
    }
}

/// A client's own replica.
pub struct ReplicaParticipant {
    name: String,
    replica: Arc<LocalReplica>,
}

impl ReplicaParticipant {
    pub fn new(name: impl Into<String>, replica: Arc<LocalReplica>) -> Self {
        Self {
            name: name.into(),
            replica,
        }
    }
}

#[async_trait]
impl Participant for ReplicaParticipant {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn applied_version(&self) -> Result<Option<ConfigVersion>> {
        Ok(Some(self.replica.version()))
    }
}

/// The store itself, for "is it durable" checks.
pub struct StoreParticipant {
    store: Arc<dyn ConfigStore>,
}

impl StoreParticipant {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Participant for StoreParticipant {
    fn name(&self) -> String {
        format!("store {}", self.store.describe())
    }

    async fn applied_version(&self) -> Result<Option<ConfigVersion>> {
        Ok(self.store.read().await?.map(|v| v.version))
    }
}

#[derive(Deserialize)]
struct VersionBody {
    version: u64,
}

/// Client shared by every [`HttpParticipant`] that is not given its own.
static INTROSPECTION_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(INTROSPECTION_REQUEST_TIMEOUT_MS))
        .build()
        .unwrap_or_default()
});

/// A running server, probed via `GET /nodes_config/version`.
pub struct HttpParticipant {
    name: String,
    addr: String,
    url: String,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl HttpParticipant {
    /// `addr` is `host:port` or a base URL.
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        let addr = addr.into();
        let base = if addr.contains("://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr)
        };
        Self {
            name: name.into(),
            url: format!("{}/nodes_config/version", base),
            addr,
            request_timeout: Duration::from_millis(INTROSPECTION_REQUEST_TIMEOUT_MS),
            client: INTROSPECTION_CLIENT.clone(),
        }
    }

    /// Bound on one whole request, connect through body.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn request_error(&self, e: reqwest::Error) -> MembershipError {
        if e.is_timeout() {
            MembershipError::Backend(format!("{}: request timed out", self.addr))
        } else {
            MembershipError::Backend(format!("{}: {}", self.addr, e))
        }
    }
}

#[async_trait]
impl Participant for HttpParticipant {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn applied_version(&self) -> Result<Option<ConfigVersion>> {
        let body: VersionBody = self
            .client
            .get(&self.url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.request_error(e))?
            .error_for_status()
            .map_err(|e| self.request_error(e))?
            .json()
            .await
            .map_err(|e| self.request_error(e))?;
        Ok(Some(ConfigVersion(body.version)))
    }
}

/// Participant whose state is set by hand. Used by launchers and tests.
#[derive(Default)]
pub struct StaticParticipant {
    name: String,
    version: Mutex<Option<ConfigVersion>>,
    stopped: AtomicBool,
    unreachable: AtomicBool,
}

impl StaticParticipant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn set_version(&self, version: ConfigVersion) {
        *self.version.lock().unwrap_or_else(|e| e.into_inner()) = Some(version);
    }

    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Participant for StaticParticipant {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn applied_version(&self) -> Result<Option<ConfigVersion>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(MembershipError::Backend(format!("{} unreachable", self.name)));
        }
        Ok(*self.version.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Barrier options.
#[derive(Debug, Clone, Copy)]
pub struct PropagationOptions {
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl Default for PropagationOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(DEFAULT_PROPAGATION_TIMEOUT_SECS)),
            poll_interval: Duration::from_millis(DEFAULT_PROPAGATION_POLL_MS),
        }
    }
}

/// Last observed state of one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantStatus {
    Converged(ConfigVersion),
    Lagging(Option<ConfigVersion>),
    Stopped,
    Unreachable(String),
}

impl ParticipantStatus {
    fn is_settled(&self) -> bool {
        matches!(
            self,
            ParticipantStatus::Converged(_) | ParticipantStatus::Stopped
        )
    }
}

/// Outcome of [`await_version`].
#[derive(Debug, Clone)]
pub struct PropagationReport {
    pub target: ConfigVersion,
    pub statuses: Vec<(String, ParticipantStatus)>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl PropagationReport {
    /// True when every participant converged or stopped.
    pub fn converged(&self) -> bool {
        self.statuses.iter().all(|(_, s)| s.is_settled())
    }

    /// Participants that neither converged nor stopped.
    pub fn lagging(&self) -> Vec<String> {
        self.statuses
            .iter()
            .filter(|(_, s)| !s.is_settled())
            .map(|(name, status)| format!("{} ({:?})", name, status))
            .collect()
    }

    pub fn status_of(&self, name: &str) -> Option<&ParticipantStatus> {
        self.statuses
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    /// Convert a timed-out report into `PropagationTimeout`.
    pub fn into_result(self) -> Result<Self> {
        if self.timed_out {
            Err(MembershipError::PropagationTimeout {
                target: self.target,
                lagging: self.lagging(),
            })
        } else {
            Ok(self)
        }
    }
}

async fn observe(participant: &dyn Participant, target: ConfigVersion) -> ParticipantStatus {
    if participant.is_stopped().await {
        return ParticipantStatus::Stopped;
    }
    match participant.applied_version().await {
        Ok(Some(v)) if v >= target => ParticipantStatus::Converged(v),
        Ok(applied) => ParticipantStatus::Lagging(applied),
        Err(e) => ParticipantStatus::Unreachable(e.to_string()),
    }
}

/// Wait until every participant has applied `target` or stopped.
///
/// Never fails by itself: a timeout is reported through
/// [`PropagationReport::timed_out`] and the caller decides whether that is
/// an error.
pub async fn await_version(
    target: ConfigVersion,
    participants: &[Arc<dyn Participant>],
    options: PropagationOptions,
) -> PropagationReport {
    let started = Instant::now();
    let deadline = options.timeout.map(|t| started + t);
    let mut statuses: Vec<(String, ParticipantStatus)> = participants
        .iter()
        .map(|p| (p.name(), ParticipantStatus::Lagging(None)))
        .collect();

    let timed_out = loop {
        let pending: Vec<usize> = statuses
            .iter()
            .enumerate()
            .filter(|(_, (_, s))| !s.is_settled())
            .map(|(i, _)| i)
            .collect();

        let observed = join_all(
            pending
                .iter()
                .map(|&i| observe(participants[i].as_ref(), target)),
        )
        .await;
        for (i, status) in pending.into_iter().zip(observed) {
            if let ParticipantStatus::Unreachable(reason) = &status {
                debug!(participant = %statuses[i].0, reason = %reason, "Participant unreachable");
            }
            statuses[i].1 = status;
        }

        if statuses.iter().all(|(_, s)| s.is_settled()) {
            break false;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break true;
        }
        tokio::time::sleep(options.poll_interval).await;
    };

    let report = PropagationReport {
        target,
        statuses,
        elapsed: started.elapsed(),
        timed_out,
    };

    let secs = report.elapsed.as_secs_f64();
    if timed_out {
        metrics::record_propagation("timeout", secs);
        warn!(
            target = %target,
            lagging = ?report.lagging(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Propagation timed out"
        );
    } else {
        metrics::record_propagation("converged", secs);
        info!(
            target = %target,
            participants = participants.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Configuration propagated"
        );
    }
    report
}

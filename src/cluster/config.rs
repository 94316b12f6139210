//! Configuration for the membership subsystem.
//!
//! # Configuration Profiles
//!
//! ```rust,no_run
//! use membrane::cluster::{MembershipConfig, MembershipProfile};
//!
//! // Development: local file store, fast polling, short post-registration pause
//! let dev = MembershipConfig::from_profile(MembershipProfile::Development);
//!
//! // Production: conservative timeouts, hard bounds on retries
//! let prod = MembershipConfig::from_profile(MembershipProfile::Production);
//! ```
//!
//! Or read everything from `MEMBRANE_*` environment variables with
//! [`MembershipConfig::from_env`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::configuration::{RoleSet, validate_location, validate_tag_key};
use super::fencing::FencingPolicy;
use crate::constants::{
    DEFAULT_CAS_MAX_ATTEMPTS, DEFAULT_INTROSPECTION_PORT, DEFAULT_NUM_SHARDS,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_PROPAGATION_POLL_MS, DEFAULT_PROPAGATION_TIMEOUT_SECS,
    DEFAULT_REGISTRATION_MAX_ATTEMPTS, DEFAULT_ROLES, DEFAULT_RQLITE_TABLE,
    DEFAULT_SAGA_OUTER_TRIES, DEFAULT_SEQUENCER_WEIGHT, DEFAULT_SLEEP_AFTER_REGISTRATION_SECS,
    DEFAULT_STALE_LOCK_SECS, DEFAULT_STORAGE_CAPACITY,
};
use crate::types::NodeIndex;

/// Validated configuration profiles.
///
/// | Profile | Store | Poll | Propagation timeout | Pause after registration |
/// |---------|-------|------|---------------------|--------------------------|
/// | Development | file (tmp) | 200ms | 10s | 0s |
/// | Production | file | 1s | 60s | 5s |
/// | Test | memory | 20ms | 5s | 0s |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipProfile {
    Development,
    Production,
    Test,
}

impl MembershipProfile {
    pub fn description(&self) -> &'static str {
        match self {
            MembershipProfile::Development => "Local development with a file store",
            MembershipProfile::Production => "Conservative timeouts for real clusters",
            MembershipProfile::Test => "In-memory store with tight timings",
        }
    }
}

impl fmt::Display for MembershipProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipProfile::Development => write!(f, "development"),
            MembershipProfile::Production => write!(f, "production"),
            MembershipProfile::Test => write!(f, "test"),
        }
    }
}

impl FromStr for MembershipProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(MembershipProfile::Development),
            "production" | "prod" => Ok(MembershipProfile::Production),
            "test" => Ok(MembershipProfile::Test),
            _ => Err(format!(
                "Unknown profile '{}'. Valid options: development, production, test",
                s
            )),
        }
    }
}

/// Object storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreType {
    /// Local filesystem.
    Local { path: String },
    /// Amazon S3 or S3-compatible storage.
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    },
    /// Google Cloud Storage.
    Gcs {
        bucket: String,
        service_account_key: Option<String>,
    },
    /// Azure Blob Storage.
    Azure {
        container: String,
        account: String,
        access_key: Option<String>,
    },
    /// Process-local object store, for tests.
    InMemory,
}

/// Where the configuration record lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local store. Only useful for tests and single-process demos.
    Memory,
    /// Directory tree with one file per cluster.
    File { root: PathBuf },
    /// Object storage with conditional puts.
    ObjectStore(ObjectStoreType),
    /// rqlite row keyed by cluster name.
    Rqlite { url: String, table: String },
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::File { .. } => "file",
            StoreBackend::ObjectStore(_) => "object_store",
            StoreBackend::Rqlite { .. } => "rqlite",
        }
    }
}

/// Default file-store root for a cluster.
pub fn default_file_store_root() -> PathBuf {
    std::env::temp_dir().join("membrane")
}

/// What a node publishes about itself when self-registration is on.
#[derive(Debug, Clone, PartialEq)]
pub struct SelfRegistrationSettings {
    /// Register/update our own entry in the store.
    pub enabled: bool,
    /// Unique node name; the identity key when self-registering.
    pub name: Option<String>,
    /// Desired entry version. `None` keeps whatever is published.
    pub node_version: Option<u64>,
    /// Explicit index when identity is assigned by an operator.
    pub index: Option<NodeIndex>,
    pub address: Option<String>,
    pub ssl_address: Option<String>,
    pub gossip_address: Option<String>,
    pub server_to_server_address: Option<String>,
    pub admin_address: Option<String>,
    pub roles: RoleSet,
    pub location: Option<String>,
    pub sequencer_weight: f64,
    pub storage_capacity: f64,
    pub num_shards: u16,
    pub tags: BTreeMap<String, String>,
}

impl Default for SelfRegistrationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            name: None,
            node_version: None,
            index: None,
            address: None,
            ssl_address: None,
            gossip_address: None,
            server_to_server_address: None,
            admin_address: None,
            roles: DEFAULT_ROLES.parse().unwrap_or(RoleSet::BOTH),
            location: None,
            sequencer_weight: DEFAULT_SEQUENCER_WEIGHT,
            storage_capacity: DEFAULT_STORAGE_CAPACITY,
            num_shards: DEFAULT_NUM_SHARDS,
            tags: BTreeMap::new(),
        }
    }
}

/// What to do when the running node no longer matches the published config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FencingSettings {
    pub shutdown_on_mismatch: bool,
    pub hard_exit_on_mismatch: bool,
}

impl Default for FencingSettings {
    fn default() -> Self {
        Self {
            shutdown_on_mismatch: true,
            hard_exit_on_mismatch: false,
        }
    }
}

impl FencingSettings {
    pub fn policy(&self) -> FencingPolicy {
        match (self.shutdown_on_mismatch, self.hard_exit_on_mismatch) {
            (false, _) => FencingPolicy::LogOnly,
            (true, false) => FencingPolicy::GracefulShutdown,
            (true, true) => FencingPolicy::HardExit,
        }
    }
}

/// Membership subsystem configuration.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Cluster name; keys the store record.
    pub cluster_name: String,
    pub store: StoreBackend,
    /// Interval between replica polls.
    pub poll_interval: Duration,
    /// Bound on read-modify-CAS attempts per proposal.
    pub cas_max_attempts: usize,
    /// Bound on self-registration attempts.
    pub registration_max_attempts: usize,
    /// Pause after publishing our own entry.
    pub sleep_after_registration: Duration,
    pub propagation_timeout: Duration,
    pub propagation_poll_interval: Duration,
    /// Bound on whole-saga attempts.
    pub saga_outer_tries: usize,
    /// Continue a saga after a propagation timeout instead of retrying it.
    pub proceed_on_propagation_timeout: bool,
    /// Shards given to storage nodes added without an explicit count.
    pub default_num_shards: u16,
    /// A file-store lock older than this is broken.
    pub stale_lock_timeout: Duration,
    pub self_registration: SelfRegistrationSettings,
    pub fencing: FencingSettings,
    /// Introspection HTTP port (0 = any free port).
    pub introspection_port: u16,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            cluster_name: "membrane".to_string(),
            store: StoreBackend::File {
                root: default_file_store_root(),
            },
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            cas_max_attempts: DEFAULT_CAS_MAX_ATTEMPTS,
            registration_max_attempts: DEFAULT_REGISTRATION_MAX_ATTEMPTS,
            sleep_after_registration: Duration::from_secs(DEFAULT_SLEEP_AFTER_REGISTRATION_SECS),
            propagation_timeout: Duration::from_secs(DEFAULT_PROPAGATION_TIMEOUT_SECS),
            propagation_poll_interval: Duration::from_millis(DEFAULT_PROPAGATION_POLL_MS),
            saga_outer_tries: DEFAULT_SAGA_OUTER_TRIES,
            proceed_on_propagation_timeout: false,
            default_num_shards: DEFAULT_NUM_SHARDS,
            stale_lock_timeout: Duration::from_secs(DEFAULT_STALE_LOCK_SECS),
            self_registration: SelfRegistrationSettings::default(),
            fencing: FencingSettings::default(),
            introspection_port: DEFAULT_INTROSPECTION_PORT,
        }
    }
}

impl MembershipConfig {
    /// Create a configuration from a validated profile.
    pub fn from_profile(profile: MembershipProfile) -> Self {
        let defaults = Self::default();
        match profile {
            MembershipProfile::Development => Self {
                poll_interval: Duration::from_millis(200),
                propagation_timeout: Duration::from_secs(10),
                sleep_after_registration: Duration::ZERO,
                ..defaults
            },
            MembershipProfile::Production => defaults,
            MembershipProfile::Test => Self {
                store: StoreBackend::Memory,
                poll_interval: Duration::from_millis(20),
                propagation_timeout: Duration::from_secs(5),
                propagation_poll_interval: Duration::from_millis(10),
                sleep_after_registration: Duration::ZERO,
                introspection_port: 0,
                ..defaults
            },
        }
    }

    /// Fencing policy derived from the mismatch settings.
    pub fn fencing_policy(&self) -> FencingPolicy {
        self.fencing.policy()
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cluster_name.is_empty() {
            errors.push("cluster_name must not be empty".to_string());
        }
        if self.cluster_name.contains('/') {
            errors.push(format!(
                "cluster_name '{}' must not contain '/'",
                self.cluster_name
            ));
        }
        if self.poll_interval.is_zero() {
            errors.push("poll_interval must be greater than zero".to_string());
        }
        if self.cas_max_attempts == 0 {
            errors.push("cas_max_attempts must be at least 1".to_string());
        }
        if self.registration_max_attempts == 0 {
            errors.push("registration_max_attempts must be at least 1".to_string());
        }
        if self.saga_outer_tries == 0 {
            errors.push("saga_outer_tries must be at least 1".to_string());
        }
        if self.propagation_poll_interval.is_zero() {
            errors.push("propagation_poll_interval must be greater than zero".to_string());
        }
        if self.propagation_poll_interval >= self.propagation_timeout {
            errors.push(format!(
                "propagation_poll_interval ({:?}) must be less than propagation_timeout ({:?})",
                self.propagation_poll_interval, self.propagation_timeout
            ));
        }
        if self.default_num_shards == 0 {
            errors.push("default_num_shards must be at least 1".to_string());
        }

        if let StoreBackend::Rqlite { url, table } = &self.store {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("rqlite url '{}' must be http(s)", url));
            }
            if table.is_empty() || table.contains('/') {
                errors.push(format!("rqlite table '{}' is invalid", table));
            }
        }

        let reg = &self.self_registration;
        if reg.enabled {
            match &reg.name {
                Some(name) if !name.trim().is_empty() => {}
                _ => errors.push("self-registration requires a node name".to_string()),
            }
            if reg.address.is_none() {
                errors.push("self-registration requires a data address".to_string());
            }
        }
        if reg.roles.is_empty() {
            errors.push("at least one role is required".to_string());
        }
        if reg.roles.storage && reg.num_shards == 0 {
            errors.push("storage nodes need num_shards >= 1".to_string());
        }
        if !reg.sequencer_weight.is_finite() || reg.sequencer_weight < 0.0 {
            errors.push(format!(
                "sequencer_weight ({}) must be finite and non-negative",
                reg.sequencer_weight
            ));
        }
        if !reg.storage_capacity.is_finite() || reg.storage_capacity < 0.0 {
            errors.push(format!(
                "storage_capacity ({}) must be finite and non-negative",
                reg.storage_capacity
            ));
        }
        if let Some(location) = &reg.location
            && let Err(e) = validate_location(location)
        {
            errors.push(e.to_string());
        }
        for key in reg.tags.keys() {
            if let Err(e) = validate_tag_key(key) {
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `MEMBRANE_PROFILE`: base profile (default: production)
    /// - `MEMBRANE_CLUSTER_NAME`: cluster name
    /// - `MEMBRANE_STORE`: `memory`, `file`, `local`, `s3`, `gcs`, `azure`, `rqlite`
    /// - `MEMBRANE_STORE_ROOT`: file or local object store root
    /// - `MEMBRANE_RQLITE_URL`, `MEMBRANE_RQLITE_TABLE`
    /// - `S3_BUCKET`/`AWS_S3_BUCKET`, `AWS_REGION`, `AWS_ENDPOINT`, `AWS_ACCESS_KEY_ID`,
    ///   `AWS_SECRET_ACCESS_KEY`, `GCS_BUCKET`, `GOOGLE_APPLICATION_CREDENTIALS`,
    ///   `AZURE_CONTAINER`, `AZURE_STORAGE_ACCOUNT`, `AZURE_STORAGE_ACCESS_KEY`
    /// - `MEMBRANE_POLL_INTERVAL_MS`, `MEMBRANE_CAS_MAX_ATTEMPTS`,
    ///   `MEMBRANE_PROPAGATION_TIMEOUT_SECS`, `MEMBRANE_SAGA_OUTER_TRIES`,
    ///   `MEMBRANE_SLEEP_AFTER_REGISTRATION_SECS`
    /// - `MEMBRANE_SELF_REGISTRATION`, `MEMBRANE_NODE_NAME`, `MEMBRANE_NODE_VERSION`,
    ///   `MEMBRANE_NODE_INDEX`, `MEMBRANE_ADDRESS`, `MEMBRANE_SSL_ADDRESS`,
    ///   `MEMBRANE_GOSSIP_ADDRESS`, `MEMBRANE_S2S_ADDRESS`, `MEMBRANE_ADMIN_ADDRESS`,
    ///   `MEMBRANE_ROLES`, `MEMBRANE_LOCATION`, `MEMBRANE_SEQUENCER_WEIGHT`,
    ///   `MEMBRANE_STORAGE_CAPACITY`, `MEMBRANE_NUM_SHARDS`, `MEMBRANE_TAGS`
    /// - `MEMBRANE_SHUTDOWN_ON_MISMATCH`, `MEMBRANE_HARD_EXIT_ON_MISMATCH`
    /// - `MEMBRANE_INTROSPECTION_PORT`
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let profile = match std::env::var("MEMBRANE_PROFILE") {
            Ok(p) => p.parse::<MembershipProfile>()?,
            Err(_) => MembershipProfile::Production,
        };
        let defaults = Self::from_profile(profile);

        let cluster_name =
            std::env::var("MEMBRANE_CLUSTER_NAME").unwrap_or_else(|_| defaults.cluster_name.clone());

        let store_root = std::env::var("MEMBRANE_STORE_ROOT").ok();
        let store = match std::env::var("MEMBRANE_STORE")
            .map(|s| s.to_lowercase())
            .ok()
            .as_deref()
        {
            None => defaults.store.clone(),
            Some("memory") => StoreBackend::Memory,
            Some("file") => StoreBackend::File {
                root: store_root
                    .map(PathBuf::from)
                    .unwrap_or_else(default_file_store_root),
            },
            Some("local") => StoreBackend::ObjectStore(ObjectStoreType::Local {
                path: store_root.ok_or("MEMBRANE_STORE_ROOT must be set when MEMBRANE_STORE=local")?,
            }),
            Some("s3") => {
                let bucket = std::env::var("AWS_S3_BUCKET")
                    .or_else(|_| std::env::var("S3_BUCKET"))
                    .map_err(|_| "S3_BUCKET or AWS_S3_BUCKET must be set when MEMBRANE_STORE=s3")?;
                let region = std::env::var("AWS_REGION")
                    .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
                    .unwrap_or_else(|_| "us-east-1".to_string());
                StoreBackend::ObjectStore(ObjectStoreType::S3 {
                    bucket,
                    region,
                    endpoint: std::env::var("AWS_ENDPOINT")
                        .or_else(|_| std::env::var("S3_ENDPOINT"))
                        .ok(),
                    access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
                    secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
                })
            }
            Some("gcs") => StoreBackend::ObjectStore(ObjectStoreType::Gcs {
                bucket: std::env::var("GCS_BUCKET")
                    .map_err(|_| "GCS_BUCKET must be set when MEMBRANE_STORE=gcs")?,
                service_account_key: std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok(),
            }),
            Some("azure") => StoreBackend::ObjectStore(ObjectStoreType::Azure {
                container: std::env::var("AZURE_CONTAINER")
                    .map_err(|_| "AZURE_CONTAINER must be set")?,
                account: std::env::var("AZURE_STORAGE_ACCOUNT")
                    .map_err(|_| "AZURE_STORAGE_ACCOUNT must be set")?,
                access_key: std::env::var("AZURE_STORAGE_ACCESS_KEY").ok(),
            }),
            Some("rqlite") => StoreBackend::Rqlite {
                url: std::env::var("MEMBRANE_RQLITE_URL")
                    .map_err(|_| "MEMBRANE_RQLITE_URL must be set when MEMBRANE_STORE=rqlite")?,
                table: std::env::var("MEMBRANE_RQLITE_TABLE")
                    .unwrap_or_else(|_| DEFAULT_RQLITE_TABLE.to_string()),
            },
            Some(other) => return Err(format!("Unknown MEMBRANE_STORE '{}'", other).into()),
        };

        let poll_interval = env_parse::<u64>("MEMBRANE_POLL_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        let cas_max_attempts =
            env_parse::<usize>("MEMBRANE_CAS_MAX_ATTEMPTS")?.unwrap_or(defaults.cas_max_attempts);
        let propagation_timeout = env_parse::<u64>("MEMBRANE_PROPAGATION_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.propagation_timeout);
        let saga_outer_tries =
            env_parse::<usize>("MEMBRANE_SAGA_OUTER_TRIES")?.unwrap_or(defaults.saga_outer_tries);
        let sleep_after_registration = env_parse::<u64>("MEMBRANE_SLEEP_AFTER_REGISTRATION_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.sleep_after_registration);
        let introspection_port = env_parse::<u16>("MEMBRANE_INTROSPECTION_PORT")?
            .unwrap_or(defaults.introspection_port);

        let reg_defaults = SelfRegistrationSettings::default();
        let self_registration = SelfRegistrationSettings {
            enabled: env_parse::<bool>("MEMBRANE_SELF_REGISTRATION")?.unwrap_or(false),
            name: std::env::var("MEMBRANE_NODE_NAME").ok(),
            node_version: env_parse::<u64>("MEMBRANE_NODE_VERSION")?,
            index: env_parse::<NodeIndex>("MEMBRANE_NODE_INDEX")?,
            address: std::env::var("MEMBRANE_ADDRESS").ok(),
            ssl_address: std::env::var("MEMBRANE_SSL_ADDRESS").ok(),
            gossip_address: std::env::var("MEMBRANE_GOSSIP_ADDRESS").ok(),
            server_to_server_address: std::env::var("MEMBRANE_S2S_ADDRESS").ok(),
            admin_address: std::env::var("MEMBRANE_ADMIN_ADDRESS").ok(),
            roles: match std::env::var("MEMBRANE_ROLES") {
                Ok(roles) => roles
                    .parse::<RoleSet>()
                    .map_err(|e| format!("Invalid MEMBRANE_ROLES: {}", e))?,
                Err(_) => reg_defaults.roles,
            },
            location: std::env::var("MEMBRANE_LOCATION").ok(),
            sequencer_weight: env_parse::<f64>("MEMBRANE_SEQUENCER_WEIGHT")?
                .unwrap_or(reg_defaults.sequencer_weight),
            storage_capacity: env_parse::<f64>("MEMBRANE_STORAGE_CAPACITY")?
                .unwrap_or(reg_defaults.storage_capacity),
            num_shards: env_parse::<u16>("MEMBRANE_NUM_SHARDS")?
                .unwrap_or(reg_defaults.num_shards),
            tags: match std::env::var("MEMBRANE_TAGS") {
                Ok(tags) => parse_tags(&tags)?,
                Err(_) => BTreeMap::new(),
            },
        };

        let fencing = FencingSettings {
            shutdown_on_mismatch: env_parse::<bool>("MEMBRANE_SHUTDOWN_ON_MISMATCH")?
                .unwrap_or(defaults.fencing.shutdown_on_mismatch),
            hard_exit_on_mismatch: env_parse::<bool>("MEMBRANE_HARD_EXIT_ON_MISMATCH")?
                .unwrap_or(defaults.fencing.hard_exit_on_mismatch),
        };

        let config = Self {
            cluster_name,
            store,
            poll_interval,
            cas_max_attempts,
            sleep_after_registration,
            propagation_timeout,
            saga_outer_tries,
            self_registration,
            fencing,
            introspection_port,
            ..defaults
        };

        config.validate().map_err(|errors| errors.join("; "))?;
        Ok(config)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid {}: {}", key, e)),
        Err(_) => Ok(None),
    }
}

/// Parse tags in `key:value,key2:` form.
///
/// Keys must be non-empty and contain neither `:` nor `,`. Values may be
/// empty. An empty input yields no tags.
pub fn parse_tags(raw: &str) -> Result<BTreeMap<String, String>, String> {
    let mut tags = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once(':')
            .ok_or_else(|| format!("tag '{}' must be in key:value form", pair))?;
        validate_tag_key(key).map_err(|e| e.to_string())?;
        if tags.insert(key.to_string(), value.to_string()).is_some() {
            return Err(format!("tag key '{}' given twice", key));
        }
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MembershipConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fencing_policy(), FencingPolicy::GracefulShutdown);
        assert_eq!(config.sleep_after_registration, Duration::from_secs(5));
    }

    #[test]
    fn test_all_profiles_valid() {
        for profile in [
            MembershipProfile::Development,
            MembershipProfile::Production,
            MembershipProfile::Test,
        ] {
            let config = MembershipConfig::from_profile(profile);
            assert!(config.validate().is_ok(), "profile {} invalid", profile);
            assert!(!profile.description().is_empty());
        }
        assert_eq!(
            MembershipConfig::from_profile(MembershipProfile::Test).store,
            StoreBackend::Memory
        );
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!("dev".parse::<MembershipProfile>(), Ok(MembershipProfile::Development));
        assert_eq!("PROD".parse::<MembershipProfile>(), Ok(MembershipProfile::Production));
        assert!("staging".parse::<MembershipProfile>().is_err());
    }

    #[test]
    fn test_validate_collects_errors() {
        let config = MembershipConfig {
            cluster_name: String::new(),
            cas_max_attempts: 0,
            saga_outer_tries: 0,
            ..MembershipConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_self_registration_requires_name_and_address() {
        let mut config = MembershipConfig::default();
        config.self_registration.enabled = true;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("node name")));
        assert!(errors.iter().any(|e| e.contains("data address")));
    }

    #[test]
    fn test_fencing_policy_matrix() {
        let policy = |shutdown, hard| {
            FencingSettings {
                shutdown_on_mismatch: shutdown,
                hard_exit_on_mismatch: hard,
            }
            .policy()
        };
        assert_eq!(policy(false, false), FencingPolicy::LogOnly);
        assert_eq!(policy(false, true), FencingPolicy::LogOnly);
        assert_eq!(policy(true, false), FencingPolicy::GracefulShutdown);
        assert_eq!(policy(true, true), FencingPolicy::HardExit);
    }

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("key:value,key2:").unwrap();
        assert_eq!(tags.get("key").map(String::as_str), Some("value"));
        assert_eq!(tags.get("key2").map(String::as_str), Some(""));
        assert!(parse_tags("").unwrap().is_empty());
        assert!(parse_tags(":v").is_err());
        assert!(parse_tags("novalue").is_err());
        assert!(parse_tags("a:1,a:2").is_err());
    }

    #[test]
    fn test_rqlite_url_validated() {
        let config = MembershipConfig {
            store: StoreBackend::Rqlite {
                url: "localhost:4001".to_string(),
                table: "t".to_string(),
            },
            ..MembershipConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_names() {
        assert_eq!(StoreBackend::Memory.name(), "memory");
        assert_eq!(
            StoreBackend::ObjectStore(ObjectStoreType::InMemory).name(),
            "object_store"
        );
    }
}

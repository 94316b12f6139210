//! Integration tests for MembershipConfig.
//!
//! These tests verify profile defaults, validation and object store
//! construction.

use std::time::Duration;

use membrane::cluster::object_store::create_object_store;
use membrane::cluster::{MembershipConfig, MembershipProfile, ObjectStoreType, StoreBackend};
use tempfile::TempDir;

// ============================================================================
// Profiles
// ============================================================================

#[test]
fn test_every_profile_validates() {
    for profile in [
        MembershipProfile::Development,
        MembershipProfile::Production,
        MembershipProfile::Test,
    ] {
        let config = MembershipConfig::from_profile(profile);
        assert!(config.validate().is_ok(), "{} should validate", profile);
        assert!(!profile.description().is_empty());
    }
}

#[test]
fn test_profiles_differ_in_timings() {
    let dev = MembershipConfig::from_profile(MembershipProfile::Development);
    let prod = MembershipConfig::from_profile(MembershipProfile::Production);
    let test = MembershipConfig::from_profile(MembershipProfile::Test);
    assert!(test.poll_interval < dev.poll_interval);
    assert!(dev.poll_interval <= prod.poll_interval);
    assert_eq!(test.sleep_after_registration, Duration::ZERO);
    assert!(matches!(prod.store, StoreBackend::File { .. }));
}

#[test]
fn test_profile_round_trips_through_display() {
    for profile in [
        MembershipProfile::Development,
        MembershipProfile::Production,
        MembershipProfile::Test,
    ] {
        assert_eq!(profile.to_string().parse::<MembershipProfile>().unwrap(), profile);
    }
    assert_eq!("prod".parse::<MembershipProfile>().unwrap(), MembershipProfile::Production);
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_validation_collects_every_error() {
    let mut config = MembershipConfig::from_profile(MembershipProfile::Test);
    config.cluster_name = String::new();
    config.cas_max_attempts = 0;
    config.saga_outer_tries = 0;
    config.propagation_poll_interval = config.propagation_timeout;

    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 4, "{:?}", errors);
    assert!(errors.iter().any(|e| e.contains("cluster_name")));
    assert!(errors.iter().any(|e| e.contains("cas_max_attempts")));
    assert!(errors.iter().any(|e| e.contains("saga_outer_tries")));
    assert!(errors.iter().any(|e| e.contains("propagation_poll_interval")));
}

#[test]
fn test_self_registration_requirements() {
    let mut config = MembershipConfig::from_profile(MembershipProfile::Test);
    config.self_registration.enabled = true;
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("node name")));
    assert!(errors.iter().any(|e| e.contains("data address")));

    config.self_registration.name = Some("n1".to_string());
    config.self_registration.address = Some("127.0.0.1:4440".to_string());
    assert!(config.validate().is_ok());

    config.self_registration.sequencer_weight = f64::NAN;
    config.self_registration.location = Some("eu..b".to_string());
    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 2, "{:?}", errors);
}

#[test]
fn test_rqlite_backend_is_checked() {
    let mut config = MembershipConfig::from_profile(MembershipProfile::Test);
    config.store = StoreBackend::Rqlite {
        url: "rqlite:4001".to_string(),
        table: String::new(),
    };
    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 2, "{:?}", errors);
}

// ============================================================================
// Object stores
// ============================================================================

#[test]
fn test_local_object_store_creates_directory() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("objects");
    let store = ObjectStoreType::Local {
        path: path.to_string_lossy().into_owned(),
    };
    create_object_store(&store).unwrap();
    assert!(path.is_dir());
}

#[test]
fn test_in_memory_object_store() {
    assert!(create_object_store(&ObjectStoreType::InMemory).is_ok());
}

#[test]
fn test_s3_object_store_with_endpoint() {
    let store = ObjectStoreType::S3 {
        bucket: "membership".to_string(),
        region: "us-east-1".to_string(),
        endpoint: Some("http://localhost:9000".to_string()),
        access_key_id: Some("minio".to_string()),
        secret_access_key: Some("minio123".to_string()),
    };
    assert!(create_object_store(&store).is_ok());
}

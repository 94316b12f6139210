//! Object store construction for the object-storage configuration backend.

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use std::sync::Arc;
use tracing::info;

use super::config::ObjectStoreType;
use super::error::{MembershipError, Result};

/// Build an object store client for `store_type`.
///
/// Local stores create their root directory. Cloud builders do not connect
/// until the first request, so bad credentials surface on first read.
pub fn create_object_store(store_type: &ObjectStoreType) -> Result<Arc<dyn ObjectStore>> {
    match store_type {
        ObjectStoreType::Local { path } => {
            std::fs::create_dir_all(path).map_err(|e| {
                MembershipError::Config(format!("Failed to create store directory {}: {}", path, e))
            })?;
            let store = LocalFileSystem::new_with_prefix(path)?;
            info!(path = %path, "Using local object store");
            Ok(Arc::new(store))
        }
        ObjectStoreType::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
        } => {
            use object_store::aws::{AmazonS3Builder, S3ConditionalPut};

            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(bucket)
                .with_region(region)
                .with_conditional_put(S3ConditionalPut::ETagMatch);

            if let Some(ep) = endpoint {
                builder = builder.with_endpoint(ep).with_allow_http(true);
            }
            if let (Some(key), Some(secret)) = (access_key_id, secret_access_key) {
                builder = builder
                    .with_access_key_id(key)
                    .with_secret_access_key(secret);
            }

            let store = builder.build().map_err(|e| {
                MembershipError::Config(format!("Failed to create S3 object store: {}", e))
            })?;
            info!(bucket = %bucket, region = %region, "Using S3 object store");
            Ok(Arc::new(store))
        }
        ObjectStoreType::Gcs {
            bucket,
            service_account_key,
        } => {
            use object_store::gcp::GoogleCloudStorageBuilder;

            let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket);
            if let Some(key_path) = service_account_key {
                builder = builder.with_service_account_path(key_path);
            }

            let store = builder.build().map_err(|e| {
                MembershipError::Config(format!("Failed to create GCS object store: {}", e))
            })?;
            info!(bucket = %bucket, "Using GCS object store");
            Ok(Arc::new(store))
        }
        ObjectStoreType::Azure {
            container,
            account,
            access_key,
        } => {
            use object_store::azure::MicrosoftAzureBuilder;

            let mut builder = MicrosoftAzureBuilder::new()
                .with_container_name(container)
                .with_account(account);
            if let Some(key) = access_key {
                builder = builder.with_access_key(key);
            }

            let store = builder.build().map_err(|e| {
                MembershipError::Config(format!("Failed to create Azure object store: {}", e))
            })?;
            info!(container = %container, account = %account, "Using Azure object store");
            Ok(Arc::new(store))
        }
        ObjectStoreType::InMemory => Ok(Arc::new(InMemory::new())),
    }
}

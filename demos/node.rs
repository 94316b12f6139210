//! Membership node example.
//!
//! Joins a cluster by self-registering in the shared configuration store,
//! then follows the published configuration until it is fenced or stopped.
//!
//! ## Running
//!
//! Single node against a local file store:
//! ```bash
//! MEMBRANE_STORE=file MEMBRANE_STORE_ROOT=/tmp/membrane \
//! MEMBRANE_SELF_REGISTRATION=true \
//! MEMBRANE_NODE_NAME=storage-0 \
//! MEMBRANE_ADDRESS=127.0.0.1:4440 \
//! cargo run --example node
//! ```
//!
//! With JSON logging for production:
//! ```bash
//! LOG_FORMAT=json RUST_LOG=info cargo run --example node
//! ```
//!
//! More nodes sharing the same store (in separate terminals):
//! ```bash
//! MEMBRANE_STORE=file MEMBRANE_STORE_ROOT=/tmp/membrane MEMBRANE_SELF_REGISTRATION=true \
//! MEMBRANE_NODE_NAME=storage-1 MEMBRANE_ADDRESS=127.0.0.1:4441 MEMBRANE_INTROSPECTION_PORT=6441 \
//! cargo run --example node
//! ```
//!
//! With S3 as the store (MinIO example):
//! ```bash
//! MEMBRANE_STORE=s3 \
//! S3_BUCKET=membership \
//! AWS_ENDPOINT=http://localhost:9000 \
//! AWS_ACCESS_KEY_ID=minioadmin \
//! AWS_SECRET_ACCESS_KEY=minioadmin \
//! MEMBRANE_SELF_REGISTRATION=true MEMBRANE_NODE_NAME=storage-0 MEMBRANE_ADDRESS=127.0.0.1:4440 \
//! cargo run --example node
//! ```
//!
//! ## Introspection Endpoints
//!
//! Served on `MEMBRANE_INTROSPECTION_PORT` (default 6440, 0 picks a free port):
//! - `GET /health` - Liveness check
//! - `GET /ready` - Readiness check (503 once fenced)
//! - `GET /metrics` - Prometheus metrics
//! - `GET /nodes_config/version` - Version of the local replica
//! - `GET /identity` - Index, name and generation of this node
//!
//! ## Fencing
//!
//! When the published configuration removes this node, bumps its generation
//! or hands its name to a newer entry, the node shuts down. Set
//! `MEMBRANE_SHUTDOWN_ON_MISMATCH=false` to only log the mismatch, or
//! `MEMBRANE_HARD_EXIT_ON_MISMATCH=true` to exit the process immediately.

use membrane::cluster::{MembershipConfig, MembershipNode};
use membrane::telemetry::{LogFormat, init_logging};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set LOG_FORMAT=json for output suitable for log aggregators
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let config = MembershipConfig::from_env()?;
    info!(
        cluster = %config.cluster_name,
        store = ?config.store,
        introspection_port = config.introspection_port,
        "Starting membership node"
    );

    let mut node = MembershipNode::start(config).await?;
    let identity = node.identity().clone();
    info!(
        index = %identity.index,
        generation = %identity.generation,
        registration = ?node.registration(),
        version = %node.current().version(),
        introspection = %node.introspection_addr(),
        "Node is a cluster member"
    );

    let interrupted = tokio::select! {
        _ = node.wait_for_shutdown() => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    info!(interrupted, fenced = node.is_fenced(), "Shutdown requested");

    node.stop().await;
    Ok(())
}

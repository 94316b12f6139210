//! Node introspection over HTTP.
//!
//! A small HTTP/1.1 server, one request per connection, that lets operators
//! and propagation barriers look inside a running node.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness check (always 200 while the server runs)
//! - `GET /ready` - Readiness check (503 while fenced or before identity is resolved)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /nodes_config/version` - `{"version": n}` of the local replica
//! - `GET /identity` - index, name, generation and fence state of this node
//!
//! # Usage
//!
//! ```rust,no_run
//! use membrane::cluster::fencing::FenceState;
//! use membrane::cluster::replica::LocalReplica;
//! use membrane::server::health::{IntrospectionServer, IntrospectionState};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let state = Arc::new(IntrospectionState::new(
//!         Arc::new(LocalReplica::new()),
//!         Arc::new(FenceState::new()),
//!     ));
//!     let server = IntrospectionServer::bind("0.0.0.0:6440", state).await.unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::cluster::error::Result;
use crate::cluster::fencing::{FenceState, RegisteredIdentity};
use crate::cluster::replica::LocalReplica;

/// Health check response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Alive but not serving: fenced or identity not yet resolved.
    NotReady,
}

impl HealthStatus {
    pub fn http_status_code(&self) -> u16 {
        match self {
            HealthStatus::Healthy => 200,
            HealthStatus::NotReady => 503,
        }
    }

    pub fn http_status_text(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "OK",
            HealthStatus::NotReady => "Service Unavailable",
        }
    }
}

/// What the server reports about its node.
pub struct IntrospectionState {
    replica: Arc<LocalReplica>,
    fence: Arc<FenceState>,
    identity: OnceCell<RegisteredIdentity>,
}

impl IntrospectionState {
    pub fn new(replica: Arc<LocalReplica>, fence: Arc<FenceState>) -> Self {
        Self {
            replica,
            fence,
            identity: OnceCell::new(),
        }
    }

    /// Record the identity this node registered with. Only the first call
    /// has an effect.
    pub fn set_identity(&self, identity: RegisteredIdentity) -> bool {
        self.identity.set(identity).is_ok()
    }

    pub fn identity(&self) -> Option<&RegisteredIdentity> {
        self.identity.get()
    }

    pub fn health_status(&self) -> HealthStatus {
        if self.fence.is_fenced() || self.identity.get().is_none() {
            HealthStatus::NotReady
        } else {
            HealthStatus::Healthy
        }
    }

    /// Why the node is not ready, if it isn't.
    fn not_ready_reason(&self) -> Option<String> {
        if self.fence.is_fenced() {
            return Some(
                self.fence
                    .reason()
                    .unwrap_or_else(|| "fenced".to_string()),
            );
        }
        self.identity
            .get()
            .is_none()
            .then(|| "identity not resolved".to_string())
    }
}

/// Lightweight HTTP server for introspection endpoints.
pub struct IntrospectionServer {
    listener: TcpListener,
    state: Arc<IntrospectionState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl IntrospectionServer {
    /// Bind to `addr` (e.g. `"0.0.0.0:6440"`, port 0 for any).
    pub async fn bind(addr: &str, state: Arc<IntrospectionState>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        info!(addr = %addr, "Introspection server listening");
        Ok(Self {
            listener,
            state,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> &Arc<IntrospectionState> {
        &self.state
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Introspection server shutdown signal sent");
    }

    /// Serve requests until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Introspection server shutting down");
                    return Ok(());
                }
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((mut stream, addr)) => {
                            debug!(client_addr = %addr, "Introspection connection");
                            let state = self.state.clone();

                            tokio::spawn(async move {
                                let mut buf = [0u8; 1024];
                                match stream.read(&mut buf).await {
                                    Ok(n) if n > 0 => {
                                        let request = String::from_utf8_lossy(&buf[..n]);
                                        let response = handle_request(&request, &state);
                                        if let Err(e) = stream.write_all(response.as_bytes()).await {
                                            debug!(error = ?e, "Failed to write introspection response");
                                        }
                                    }
                                    Ok(_) => debug!("Empty request received"),
                                    Err(e) => debug!(error = ?e, "Failed to read introspection request"),
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = ?e, "Failed to accept introspection connection");
                        }
                    }
                }
            }
        }
    }
}

fn handle_request(request: &str, state: &IntrospectionState) -> String {
    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    let path = if parts.len() >= 2 { parts[1] } else { "/" };

    match path.trim_end_matches('/') {
        "/health" | "/healthz" | "/live" => text_response(HealthStatus::Healthy, "status: healthy\n"),
        "/ready" | "/readyz" => ready_response(state),
        "/metrics" => metrics_response(),
        "/nodes_config/version" => json_response(
            HealthStatus::Healthy,
            &json!({ "version": state.replica.version().value() }),
        ),
        "/identity" => identity_response(state),
        _ => not_found_response(),
    }
}

fn text_response(status: HealthStatus, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status.http_status_code(),
        status.http_status_text(),
        body
    )
}

fn json_response(status: HealthStatus, body: &serde_json::Value) -> String {
    let body = body.to_string();
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status.http_status_code(),
        status.http_status_text(),
        body.len(),
        body
    )
}

fn ready_response(state: &IntrospectionState) -> String {
    match state.not_ready_reason() {
        None => text_response(HealthStatus::Healthy, "status: ready\n"),
        Some(reason) => text_response(
            HealthStatus::NotReady,
            &format!("status: not_ready\nreason: {}\n", reason),
        ),
    }
}

fn identity_response(state: &IntrospectionState) -> String {
    let fenced = state.fence.is_fenced();
    match state.identity() {
        Some(identity) => {
            let config = state.replica.current();
            json_response(
                HealthStatus::Healthy,
                &json!({
                    "index": identity.index.value(),
                    "name": config.node(identity.index).map(|e| e.name.clone()),
                    "generation": identity.generation.value(),
                    "service_discovery_version": identity.service_discovery_version,
                    "fenced": fenced,
                }),
            )
        }
        None => json_response(
            HealthStatus::NotReady,
            &json!({ "index": null, "fenced": fenced }),
        ),
    }
}

fn metrics_response() -> String {
    match crate::cluster::metrics::encode_metrics() {
        Ok(body) => format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            body
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            "HTTP/1.1 500 Internal Server Error\r\n\
             Content-Type: text/plain\r\n\
             Connection: close\r\n\
             \r\n\
             error: failed to encode metrics\n"
                .to_string()
        }
    }
}

fn not_found_response() -> String {
    "HTTP/1.1 404 Not Found\r\n\
     Content-Type: text/plain\r\n\
     Connection: close\r\n\
     \r\n\
     Available endpoints:\n\
     - /health - Liveness check\n\
     - /ready - Readiness check (fails while fenced)\n\
     - /metrics - Prometheus metrics\n\
     - /nodes_config/version - Applied configuration version\n\
     - /identity - This node's registered identity\n"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::configuration::{
        NodeAddress, NodeEndpoints, NodesConfiguration, RoleSet, ServiceDiscoveryEntry,
        StorageAttributes,
    };
    use crate::cluster::propagation::{HttpParticipant, Participant};
    use crate::cluster::update::{Update, apply};
    use crate::types::{ConfigVersion, NodeIndex};

    fn state_with_node() -> Arc<IntrospectionState> {
        let update = Update::new().add(
            NodeIndex(0),
            ServiceDiscoveryEntry::new(
                "alpha",
                NodeEndpoints::new(NodeAddress::tcp("127.0.0.1", 4440)),
                RoleSet::STORAGE,
            ),
            Some(StorageAttributes::new(1)),
        );
        let cfg = Arc::new(apply(&NodesConfiguration::empty(), &update).unwrap());
        let replica = Arc::new(LocalReplica::with_initial(cfg));
        Arc::new(IntrospectionState::new(replica, Arc::new(FenceState::new())))
    }

    #[test]
    fn test_health_status_codes() {
        assert_eq!(HealthStatus::Healthy.http_status_code(), 200);
        assert_eq!(HealthStatus::NotReady.http_status_code(), 503);
    }

    #[test]
    fn test_ready_requires_identity() {
        let state = state_with_node();
        let response = handle_request("GET /ready HTTP/1.1\r\n", &state);
        assert!(response.contains("503 Service Unavailable"));
        assert!(response.contains("identity not resolved"));

        let cfg = state.replica.current();
        assert!(state.set_identity(RegisteredIdentity::from_config(&cfg, NodeIndex(0)).unwrap()));
        let response = handle_request("GET /ready HTTP/1.1\r\n", &state);
        assert!(response.contains("200 OK"));
        assert!(response.contains("status: ready"));
    }

    #[test]
    fn test_ready_fails_when_fenced() {
        let state = state_with_node();
        let cfg = state.replica.current();
        state.set_identity(RegisteredIdentity::from_config(&cfg, NodeIndex(0)).unwrap());
        state.fence.enter("superseded", "entry re-published");

        let response = handle_request("GET /readyz HTTP/1.1\r\n", &state);
        assert!(response.contains("503 Service Unavailable"));
        assert!(response.contains("reason: entry re-published"));
        assert_eq!(state.health_status(), HealthStatus::NotReady);
    }

    #[test]
    fn test_version_and_identity_json() {
        let state = state_with_node();
        let response = handle_request("GET /nodes_config/version HTTP/1.1\r\n", &state);
        assert!(response.contains("application/json"));
        assert!(response.ends_with(r#"{"version":1}"#));

        let cfg = state.replica.current();
        state.set_identity(RegisteredIdentity::from_config(&cfg, NodeIndex(0)).unwrap());
        let response = handle_request("GET /identity HTTP/1.1\r\n", &state);
        let body: serde_json::Value =
            serde_json::from_str(response.split("\r\n\r\n").nth(1).unwrap()).unwrap();
        assert_eq!(body["index"], 0);
        assert_eq!(body["name"], "alpha");
        assert_eq!(body["generation"], 1);
        assert_eq!(body["fenced"], false);
    }

    #[test]
    fn test_unknown_and_malformed_paths() {
        let state = state_with_node();
        assert!(handle_request("GET /nope HTTP/1.1\r\n", &state).contains("404 Not Found"));
        assert!(handle_request("", &state).contains("404 Not Found"));
        assert!(handle_request("GET /health/ HTTP/1.1\r\n", &state).contains("200 OK"));
    }

    #[test]
    fn test_metrics_response_format() {
        let response = metrics_response();
        assert!(response.contains("HTTP/1.1"));
        assert!(response.contains("Content-Type: text/plain"));
    }

    #[tokio::test]
    async fn test_http_participant_reads_served_version() {
        let state = state_with_node();
        let server = Arc::new(IntrospectionServer::bind("127.0.0.1:0", state).await.unwrap());
        let addr = server.local_addr().unwrap();
        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let participant = HttpParticipant::new("alpha", addr.to_string());
        assert_eq!(
            participant.applied_version().await.unwrap(),
            Some(ConfigVersion(1))
        );

        server.shutdown();
        assert!(handle.await.unwrap().is_ok());
    }
}

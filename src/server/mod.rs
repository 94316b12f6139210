//! Network surfaces of a membership node.
//!
//! Only the introspection endpoint lives here; membership changes travel
//! through the configuration store, not through node-to-node RPC.

pub mod health;

pub use health::{HealthStatus, IntrospectionServer, IntrospectionState};

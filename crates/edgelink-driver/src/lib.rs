//! Edgelink Driver - turns declarative endpoint and tunnel specs into live edge sessions
//!
//! The driver sits between a reconciliation loop, which decides *what* should
//! exist, and an edge session (see `edgelink-session`), which knows *how* to
//! talk to the edge.
//!
//! # Features
//!
//! - **Agent endpoints**: [`AgentDriver`] creates, replaces and deletes named
//!   forwarding sessions, pooling replacements when the edge allows it
//! - **Raw tunnels**: [`TunnelDriver`] keeps label-routed tunnels and proxies
//!   their connections to a fixed destination over TCP
//! - **Health**: session events become latched ready/alive states readable
//!   from synchronous probe handlers
//! - **Remote control**: stop/restart requests from the edge shut the driver
//!   down; update requests are refused
//!
//! # Example Usage
//!
//! ```no_run
//! use edgelink_driver::{AgentDriver, DriverConfig, EndpointSpec, UpstreamSpec};
//! use edgelink_session::local::LocalConnector;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = AgentDriver::connect(&LocalConnector::new(), DriverConfig::default()).await?;
//!
//!     let spec = EndpointSpec {
//!         url: "tcp://127.0.0.1:9000".to_string(),
//!         upstream: UpstreamSpec {
//!             url: "tcp://127.0.0.1:8080".to_string(),
//!             protocol: None,
//!         },
//!         ..Default::default()
//!     };
//!     let result = driver.create_agent_endpoint("web", &spec, None, &[]).await?;
//!     println!("serving on {}", result.url);
//!
//!     driver.delete_agent_endpoint("web").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! Operations on *different* names run concurrently. Operations on the *same*
//! name are expected to be serialized by the caller; the registry lock only
//! covers the map itself, never a session open or close. Callers cancel an
//! operation by dropping its future (for example through
//! `tokio::time::timeout`).

mod agent;
mod config;
mod error;
mod health;
mod proxy;
mod registry;
mod tunnel;

#[cfg(test)]
mod testing;

// Re-export public API
pub use agent::{AgentDriver, EndpointResult, EndpointSpec, UpstreamSpec};
pub use config::{DriverConfig, AUTHTOKEN_ENV, DEFAULT_STOP_DISCONNECT_DELAY};
pub use error::DriverError;
pub use health::{
    HealthAggregator, HealthBridge, HealthCheck, HealthError, HealthReceiver, HealthSender,
};
pub use registry::Registry;
pub use tunnel::TunnelDriver;

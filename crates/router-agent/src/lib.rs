//! Router control-plane agent
//!
//! Receives configuration commands from the management plane over HTTP and
//! translates them into appliance configuration and firewall statements,
//! coordinates active/standby failover through keepalived and reports
//! identity, HA role and health.
//!
//! # Components
//!
//! - **Agent**: command handlers, serialized on the configuration lock
//! - **HardwareAddressResolver**: MAC to interface name with bounded retry
//! - **CommandServer**: axum routes, one per command, plus `/metrics`
//! - **AgentServer**: wires the tree, HA coordinator and health monitor

pub mod agent;
pub mod config;
pub mod http_server;
pub mod metrics;
pub mod resolver;
pub mod server;
pub mod system;
pub mod types;

pub use agent::{Agent, AgentSettings};
pub use config::{Config, ConfigError};
pub use http_server::{AppState, CommandServer, router};
pub use metrics::MetricsRegistry;
pub use resolver::{HardwareAddressResolver, MacLookup, SysfsMacLookup};
pub use server::AgentServer;
pub use system::{IpCommand, NetworkControl};

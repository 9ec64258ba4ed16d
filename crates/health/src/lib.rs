//! Appliance health probing for the router agent.
//!
//! Probes are independent checks of the local system. The monitor runs them
//! on a fixed period and keeps the aggregated [`HealthStatus`] that `ping`
//! reports:
//! - read-only filesystem detection (statvfs)
//! - duplicate address flag file
//!
//! # Example
//!
//! ```no_run
//! use health::{DuplicateAddressProbe, HealthMonitor, HealthProbe, ReadOnlyFsProbe};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let probes: Vec<Arc<dyn HealthProbe>> = vec![
//!     Arc::new(ReadOnlyFsProbe::new(vec!["/".into()])),
//!     Arc::new(DuplicateAddressProbe::new("/var/run/router-agent/duplicate-ip")),
//! ];
//! let monitor = HealthMonitor::new(probes, Duration::from_secs(60));
//! let status = monitor.check_now().await;
//! # }
//! ```

pub mod monitor;
pub mod probes;
pub mod types;

pub use monitor::HealthMonitor;
pub use probes::{DuplicateAddressProbe, HealthProbe, ReadOnlyFsProbe};
pub use types::{HealthStats, HealthStatus, ProbeResult};

//! Active/standby failover for the router agent
//!
//! Failover itself is delegated to an external keepalived process. This
//! crate renders its configuration, keeps the set of virtual IPs that move
//! with the master role, and tracks which role this node currently holds.
//!
//! # Example
//!
//! ```no_run
//! use configtree::{ConfigTree, VyattaBackend, config_lock};
//! use ha::{
//!     HaCoordinator, HaSettings, KeepalivedConfigGenerator, KeepalivedPaths,
//!     NotifyScriptHandler, SystemKeepalived,
//! };
//! use std::sync::Arc;
//!
//! let paths = KeepalivedPaths::default();
//! let lock = config_lock(ConfigTree::new(Arc::new(VyattaBackend::default())));
//! let generator = KeepalivedConfigGenerator::new(paths.clone(), "eth0");
//! let control = Arc::new(SystemKeepalived::new("/usr/sbin/keepalived", paths));
//! let handler = Arc::new(NotifyScriptHandler::new(generator.clone(), control.clone()));
//!
//! let coordinator = HaCoordinator::new(lock, generator, control, handler, HaSettings::default());
//! ```

mod coordinator;
mod keepalived;
mod registry;
mod types;

pub use coordinator::{HaCoordinator, NotifyScriptHandler, TransitionHandler};
pub use keepalived::{
    KeepalivedConfigGenerator, KeepalivedControl, SystemKeepalived, file_checksum, parse_peer,
    write_if_changed,
};
pub use registry::VipPairRegistry;
pub use types::{
    DEFAULT_POLL_INTERVAL, HaRole, HaSettings, HaState, HaStats, HaStatus, HeartbeatConfig,
    KeepalivedPaths, VipAssociation,
};

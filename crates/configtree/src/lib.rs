//! Appliance configuration as an ordered statement tree.
//!
//! The tree mirrors the appliance's hierarchical configuration
//! (`interfaces ethernet eth1 address 10.0.0.5/24`). Changes are staged in
//! memory and committed as a single batch, so a command either lands
//! completely or not at all.
//!
//! # Example
//!
//! ```no_run
//! use configtree::{CommitMode, ConfigTree, MemoryBackend};
//! use std::sync::Arc;
//!
//! # async fn example() -> common::Result<()> {
//! let mut tree = ConfigTree::new(Arc::new(MemoryBackend::new()));
//! tree.set("interfaces ethernet eth1 address 10.0.0.5/24");
//! tree.set("interfaces ethernet eth1 duplex auto");
//!
//! // One commit for both statements
//! tree.apply(CommitMode::Commit).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod firewall;
pub mod tree;

pub use backend::{CommitMode, ConfigBackend, ConfigBatch, MemoryBackend, VyattaBackend};
pub use firewall::{
    Action, ConnState, Direction, FirewallPolicyBuilder, FirewallRule, InterfacePolicy,
    InterfaceRole, Placement, RuleKey, RuleTag,
};
pub use tree::{Change, ConfigTree, Node};

use std::sync::Arc;
use tokio::sync::Mutex;

/// The process-wide exclusive lock; owning the tree makes it the only way in.
pub type ConfigLock = Arc<Mutex<ConfigTree>>;

/// Wrap a tree in the process-wide lock
pub fn config_lock(tree: ConfigTree) -> ConfigLock {
    Arc::new(Mutex::new(tree))
}

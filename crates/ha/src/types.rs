//! High-availability data types.

use configtree::CommitMode;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Default polling period of both coordinator loops
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Failover role of this appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaRole {
    Master,
    Backup,
}

impl std::fmt::Display for HaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaRole::Master => write!(f, "MASTER"),
            HaRole::Backup => write!(f, "BACKUP"),
        }
    }
}

/// Role as reported to the management plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaStatus {
    NoHa,
    Master,
    Backup,
}

/// Last role observed by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaState {
    pub is_master: bool,
    pub last_observed_at: Option<SystemTime>,
}

impl HaState {
    pub fn role(&self) -> HaRole {
        if self.is_master {
            HaRole::Master
        } else {
            HaRole::Backup
        }
    }
}

impl Default for HaState {
    fn default() -> Self {
        // Start as backup until the daemon says otherwise
        Self {
            is_master: false,
            last_observed_at: None,
        }
    }
}

/// A virtual IP bound to an interface.
///
/// Two associations are equal when interface and address match; the
/// prefix length does not take part in identity.
#[derive(Debug, Clone, Eq)]
pub struct VipAssociation {
    pub interface: String,
    pub virtual_ip: IpAddr,
    pub prefix_len: u8,
}

impl VipAssociation {
    pub fn new(interface: impl Into<String>, virtual_ip: IpAddr, prefix_len: u8) -> Self {
        Self {
            interface: interface.into(),
            virtual_ip,
            prefix_len,
        }
    }
}

impl PartialEq for VipAssociation {
    fn eq(&self, other: &Self) -> bool {
        self.interface == other.interface && self.virtual_ip == other.virtual_ip
    }
}

impl Hash for VipAssociation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.interface.hash(state);
        self.virtual_ip.hash(state);
    }
}

/// Heartbeat session parameters rendered into the daemon configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interface carrying heartbeat traffic
    pub interface: String,
    pub local_ip: IpAddr,
    /// Falls back to `local_ip` when the peer is unknown
    pub peer_ip: Option<IpAddr>,
    /// Targets whose reachability is tracked
    pub monitors: Vec<String>,
    /// Advertisement interval in seconds
    pub keepalive_interval: u32,
}

/// Files shared with the heartbeat daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepalivedPaths {
    pub config_file: PathBuf,
    pub script_dir: PathBuf,
    /// Role indicator written by the notify scripts
    pub state_file: PathBuf,
    pub pid_file: PathBuf,
}

impl KeepalivedPaths {
    pub fn master_script(&self) -> PathBuf {
        self.script_dir.join("notify_master.sh")
    }

    pub fn backup_script(&self) -> PathBuf {
        self.script_dir.join("notify_backup.sh")
    }

    pub fn script_for(&self, role: HaRole) -> PathBuf {
        match role {
            HaRole::Master => self.master_script(),
            HaRole::Backup => self.backup_script(),
        }
    }
}

impl Default for KeepalivedPaths {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("/etc/keepalived/keepalived.conf"),
            script_dir: PathBuf::from("/var/lib/router-agent/keepalived"),
            state_file: PathBuf::from("/var/lib/router-agent/keepalived/state"),
            pid_file: PathBuf::from("/var/run/keepalived.pid"),
        }
    }
}

/// Coordinator timing and commit behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaSettings {
    /// Period of the role-detection loop
    pub poll_interval: Duration,
    /// Period of the daemon liveness guard
    pub liveness_interval: Duration,
    /// How statements staged by a transition handler are committed
    pub commit_mode: CommitMode,
}

impl Default for HaSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            liveness_interval: DEFAULT_POLL_INTERVAL,
            commit_mode: CommitMode::Commit,
        }
    }
}

/// Coordinator statistics
#[derive(Debug, Clone, Default)]
pub struct HaStats {
    /// Number of transitions to Master
    pub master_transitions: u64,

    /// Number of transitions to Backup
    pub backup_transitions: u64,

    /// Transition handlers that failed and were retried
    pub failed_transitions: u64,

    /// Daemon restarts (config changes and liveness guard)
    pub keepalived_restarts: u64,

    /// Polls where the role indicator could not be read
    pub indicator_read_failures: u64,
}

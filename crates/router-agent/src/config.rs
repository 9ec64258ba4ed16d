//! Configuration loading and validation for the router agent

use common::RetryPolicy;
use configtree::CommitMode;
use ha::{HaSettings, KeepalivedPaths};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub management: ManagementSettings,

    #[serde(default)]
    pub paths: PathSettings,

    #[serde(default)]
    pub keepalived: KeepalivedSettings,

    #[serde(default)]
    pub ha: HaLoopSettings,

    #[serde(default)]
    pub resolver: ResolverSettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.server.validate()?;
        self.management.validate()?;
        self.ha.validate()?;
        self.resolver.validate()?;
        self.health.validate()?;
        Ok(())
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerSettings {
    #[validate(custom = "validate_listen_addr")]
    pub listen: String,
}

/// Management network of the appliance
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ManagementSettings {
    /// Interface carrying management traffic; never taken down and the
    /// only one accepting ssh
    #[validate(custom = "validate_interface_name")]
    pub interface: String,

    #[validate(range(min = 1))]
    pub ssh_port: u16,

    /// Next hop for the callback host route when the callback address is
    /// outside `cidr`
    pub gateway: Option<IpAddr>,

    pub cidr: Option<IpNetwork>,

    /// Callback address used until `init` provides one
    pub callback_ip: Option<IpAddr>,
}

/// Files the agent reads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub version_file: PathBuf,
    pub duplicate_address_flag: PathBuf,
    pub sysfs_net: PathBuf,
}

/// Heartbeat daemon binary and shared files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepalivedSettings {
    pub binary: PathBuf,
    pub config_file: PathBuf,
    pub script_dir: PathBuf,
    pub state_file: PathBuf,
    pub pid_file: PathBuf,
}

/// HA loop settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HaLoopSettings {
    /// Resume HA at startup using the configuration left by a previous run
    pub enabled_at_boot: bool,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_loop_interval")]
    pub poll_interval: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_loop_interval")]
    pub liveness_interval: Duration,
}

/// Hardware address resolution retry budget
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ResolverSettings {
    #[validate(range(min = 1, max = 100))]
    pub attempts: u32,

    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

/// Health probe settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealthSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_loop_interval")]
    pub interval: Duration,

    /// Mount points checked for read-only state
    #[validate(length(min = 1))]
    pub readonly_paths: Vec<PathBuf>,
}

/// Configuration backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Transaction wrapper of the appliance configuration system
    pub wrapper: PathBuf,

    /// Command printing the running configuration as `set` lines
    pub show_command: String,

    /// Persist every commit to the boot configuration
    pub save_on_commit: bool,

    /// Record batches in memory instead of committing them
    pub dry_run: bool,
}

/// Metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

// Default implementations

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7272".to_string(),
        }
    }
}

impl Default for ManagementSettings {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            ssh_port: 22,
            gateway: None,
            cidr: None,
            callback_ip: None,
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            version_file: PathBuf::from("/etc/router-agent/version"),
            duplicate_address_flag: PathBuf::from("/var/lib/router-agent/duplicate-ip"),
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl Default for KeepalivedSettings {
    fn default() -> Self {
        let paths = KeepalivedPaths::default();
        Self {
            binary: PathBuf::from("/usr/sbin/keepalived"),
            config_file: paths.config_file,
            script_dir: paths.script_dir,
            state_file: paths.state_file,
            pid_file: paths.pid_file,
        }
    }
}

impl Default for HaLoopSettings {
    fn default() -> Self {
        Self {
            enabled_at_boot: false,
            poll_interval: ha::DEFAULT_POLL_INTERVAL,
            liveness_interval: ha::DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            attempts: policy.attempts,
            interval: policy.interval,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            readonly_paths: vec![PathBuf::from("/")],
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            wrapper: PathBuf::from(configtree::backend::DEFAULT_WRAPPER),
            show_command: "/opt/vyatta/bin/cli-shell-api showConfig --show-active-only --show-commands"
                .to_string(),
            save_on_commit: false,
            dry_run: false,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// Custom validators

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.trim()
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

fn validate_interface_name(name: &str) -> Result<(), ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::new("interface_empty"));
    }
    // IFNAMSIZ minus the terminator
    if name.len() > 15 || name.contains(char::is_whitespace) || name.contains('/') {
        return Err(ValidationError::new("interface_invalid"));
    }
    Ok(())
}

fn validate_loop_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if !(100..=3_600_000).contains(&millis) {
        return Err(ValidationError::new("interval_out_of_range"));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/router-agent/agent.yaml")];

        if let Some(home_path) = dirs::home_dir().map(|h| h.join(".config/router-agent/agent.yaml")) {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./router-agent.yaml"));

        paths.into_iter().find(|p| p.is_file())
    }

    pub fn keepalived_paths(&self) -> KeepalivedPaths {
        KeepalivedPaths {
            config_file: self.keepalived.config_file.clone(),
            script_dir: self.keepalived.script_dir.clone(),
            state_file: self.keepalived.state_file.clone(),
            pid_file: self.keepalived.pid_file.clone(),
        }
    }

    pub fn ha_settings(&self) -> HaSettings {
        HaSettings {
            poll_interval: self.ha.poll_interval,
            liveness_interval: self.ha.liveness_interval,
            commit_mode: self.commit_mode(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.resolver.attempts, self.resolver.interval)
    }

    pub fn commit_mode(&self) -> CommitMode {
        if self.backend.save_on_commit {
            CommitMode::CommitAndSave
        } else {
            CommitMode::Commit
        }
    }

    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or("info")
    }

    pub fn json_logs(&self) -> bool {
        self.logging.format.as_deref() == Some("json")
    }
}

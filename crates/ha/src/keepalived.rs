//! Heartbeat daemon configuration and notify scripts.
//!
//! The daemon itself is an external keepalived process. This module renders
//! its configuration, writes it only when the content changes, and talks to
//! the running process through [`KeepalivedControl`].

use crate::types::{HaRole, HeartbeatConfig, KeepalivedPaths, VipAssociation};
use async_trait::async_trait;
use common::{Error, Result, exec};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Header placed on every generated file
const GENERATED_HEADER: &str = "# Generated by router-agent, do not edit.";

/// Name of the check tracking the agent process itself
const AGENT_CHECK: &str = "monitor_agent";

/// Virtual router id shared by both peers
const VIRTUAL_ROUTER_ID: u8 = 50;

/// Control over the running heartbeat daemon
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeepalivedControl: Send + Sync {
    /// Restart the daemon so it reloads its configuration
    async fn restart(&self) -> Result<()>;

    /// Whether the daemon process is alive
    async fn is_running(&self) -> bool;

    /// Execute a generated notify script
    async fn run_script(&self, script: &Path) -> Result<()>;
}

/// [`KeepalivedControl`] for a keepalived process on this host
#[derive(Debug, Clone)]
pub struct SystemKeepalived {
    binary: PathBuf,
    paths: KeepalivedPaths,
}

impl SystemKeepalived {
    pub fn new(binary: impl Into<PathBuf>, paths: KeepalivedPaths) -> Self {
        Self {
            binary: binary.into(),
            paths,
        }
    }

    fn pid(&self) -> Option<i32> {
        let content = std::fs::read_to_string(&self.paths.pid_file).ok()?;
        content.trim().parse().ok()
    }
}

#[async_trait]
impl KeepalivedControl for SystemKeepalived {
    async fn restart(&self) -> Result<()> {
        let script = format!(
            "pkill -TERM -x keepalived || true\nsleep 1\n{} -D -S 2 -f {} -p {}\n",
            self.binary.display(),
            self.paths.config_file.display(),
            self.paths.pid_file.display(),
        );
        exec::run_script(&script).await?.check("keepalived restart")?;
        info!("Restarted keepalived");
        Ok(())
    }

    async fn is_running(&self) -> bool {
        match self.pid() {
            // Signal 0 only probes for existence
            Some(pid) => kill(Pid::from_raw(pid), None).is_ok(),
            None => false,
        }
    }

    async fn run_script(&self, script: &Path) -> Result<()> {
        let path = script.to_string_lossy();
        exec::run("/bin/bash", &[path.as_ref()])
            .await?
            .check(&format!("notify script {}", path))?;
        Ok(())
    }
}

/// Renders and installs the daemon configuration and notify scripts
#[derive(Debug, Clone)]
pub struct KeepalivedConfigGenerator {
    paths: KeepalivedPaths,
    /// Never brought down by the notify scripts
    management_interface: String,
    /// Process name tracked by the agent check
    agent_process: String,
}

impl KeepalivedConfigGenerator {
    pub fn new(paths: KeepalivedPaths, management_interface: impl Into<String>) -> Self {
        Self {
            paths,
            management_interface: management_interface.into(),
            agent_process: "router-agent".to_string(),
        }
    }

    pub fn paths(&self) -> &KeepalivedPaths {
        &self.paths
    }

    /// Render the daemon configuration.
    ///
    /// The instance always starts as BACKUP with preemption disabled, so
    /// a recovering node never steals mastership from a healthy peer.
    pub fn render(&self, heartbeat: &HeartbeatConfig) -> String {
        let peer = heartbeat.peer_ip.unwrap_or(heartbeat.local_ip);
        let mut checks = vec![(
            AGENT_CHECK.to_string(),
            format!("/usr/bin/pgrep -x {}", self.agent_process),
        )];
        for target in &heartbeat.monitors {
            checks.push((monitor_name(target), format!("/bin/ping -c 1 -W 1 {}", target)));
        }

        let mut out = String::new();
        out.push_str(GENERATED_HEADER);
        out.push_str("\n\nglobal_defs {\n");
        out.push_str("    vrrp_garp_master_refresh 60\n");
        out.push_str("    vrrp_check_unicast_src\n");
        out.push_str("    script_user root\n");
        out.push_str("    enable_script_security\n");
        out.push_str("}\n");

        for (name, script) in &checks {
            out.push_str(&format!(
                "\nvrrp_script {} {{\n    script \"{}\"\n    interval 1\n    weight -2\n    fall 3\n    rise 3\n}}\n",
                name, script
            ));
        }

        out.push_str("\nvrrp_instance router_ha {\n");
        out.push_str("    state BACKUP\n");
        out.push_str(&format!("    interface {}\n", heartbeat.interface));
        out.push_str(&format!("    virtual_router_id {}\n", VIRTUAL_ROUTER_ID));
        out.push_str("    priority 100\n");
        out.push_str(&format!("    advert_int {}\n", heartbeat.keepalive_interval.max(1)));
        out.push_str("    nopreempt\n\n");
        out.push_str(&format!("    unicast_src_ip {}\n", heartbeat.local_ip));
        out.push_str(&format!("    unicast_peer {{\n        {}\n    }}\n\n", peer));

        out.push_str("    track_script {\n");
        for (name, _) in &checks {
            out.push_str(&format!("        {}\n", name));
        }
        out.push_str("    }\n\n");

        let master = self.paths.master_script();
        let backup = self.paths.backup_script();
        out.push_str(&format!("    notify_master \"/bin/bash {}\"\n", master.display()));
        out.push_str(&format!("    notify_backup \"/bin/bash {}\"\n", backup.display()));
        out.push_str(&format!("    notify_fault \"/bin/bash {}\"\n", backup.display()));
        out.push_str("}\n");
        out
    }

    /// Render the script run when this node takes the given role.
    ///
    /// Both scripts record the role in the state file first; the
    /// coordinator reads it back to detect transitions.
    pub fn render_notify_script(&self, role: HaRole, vips: &[VipAssociation]) -> String {
        let mut out = String::from("#!/bin/bash\n");
        out.push_str(GENERATED_HEADER);
        out.push('\n');
        out.push_str(&format!("echo {} > {}\n", role, self.paths.state_file.display()));

        let each_data_nic = format!(
            "for nic in $(ls /sys/class/net | grep '^eth'); do\n    [ \"$nic\" = \"{}\" ] && continue\n",
            self.management_interface
        );

        match role {
            HaRole::Master => {
                out.push_str(&each_data_nic);
                out.push_str("    ip link set dev \"$nic\" up\ndone\n");
                for vip in vips {
                    out.push_str(&format!(
                        "ip addr add {}/{} dev {} 2>/dev/null || true\n",
                        vip.virtual_ip, vip.prefix_len, vip.interface
                    ));
                }
                // Gratuitous ARP so neighbours learn the new owner
                for vip in vips.iter().filter(|v| v.virtual_ip.is_ipv4()) {
                    out.push_str(&format!(
                        "arping -q -A -c 3 -I {} {} >/dev/null 2>&1 &\n",
                        vip.interface, vip.virtual_ip
                    ));
                }
            }
            HaRole::Backup => {
                for vip in vips {
                    out.push_str(&format!(
                        "ip addr del {}/{} dev {} 2>/dev/null || true\n",
                        vip.virtual_ip, vip.prefix_len, vip.interface
                    ));
                }
                out.push_str(&each_data_nic);
                out.push_str("    ip link set dev \"$nic\" down\ndone\n");
            }
        }
        out
    }

    /// Write both notify scripts. Returns whether either changed.
    pub async fn install_notify_scripts(&self, vips: &[VipAssociation]) -> Result<bool> {
        let mut changed = false;
        for role in [HaRole::Master, HaRole::Backup] {
            let path = self.paths.script_for(role);
            let content = self.render_notify_script(role, vips);
            changed |= write_if_changed(&path, &content, 0o755).await?;
        }
        if changed {
            info!(vips = vips.len(), "Regenerated notify scripts");
        }
        Ok(changed)
    }

    /// Write the configuration and restart the daemon if its checksum moved.
    ///
    /// Returns whether a restart was issued.
    pub async fn install_config(
        &self,
        content: &str,
        control: &dyn KeepalivedControl,
    ) -> Result<bool> {
        let path = &self.paths.config_file;
        let previous = read_existing(path).await?;
        let before = previous.as_deref().map(checksum);

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(path, content).await?;

        let after = file_checksum(path).await?;
        if before == after {
            debug!(path = %path.display(), "Keepalived config unchanged");
            return Ok(false);
        }

        info!(path = %path.display(), "Keepalived config changed, restarting daemon");
        if let Err(e) = control.restart().await {
            warn!(error = %e, "Keepalived restart failed, restoring previous config");
            // The next install must see a change again and retry the restart
            let restored = match previous {
                Some(bytes) => tokio::fs::write(path, bytes).await,
                None => tokio::fs::remove_file(path).await,
            };
            if let Err(restore) = restored {
                warn!(
                    error = %restore,
                    path = %path.display(),
                    "Failed to restore keepalived config"
                );
            }
            return Err(Error::keepalived(format!("restart after config change: {}", e)));
        }
        Ok(true)
    }
}

/// SHA-256 of a file as lowercase hex, `None` when the file is missing.
pub async fn file_checksum(path: &Path) -> Result<Option<String>> {
    Ok(read_existing(path).await?.as_deref().map(checksum))
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn read_existing(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write `content` unless the file already holds it. Returns whether it wrote.
pub async fn write_if_changed(path: &Path, content: &str, mode: u32) -> Result<bool> {
    if let Ok(existing) = tokio::fs::read_to_string(path).await {
        if existing == content {
            return Ok(false);
        }
    }

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, content).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    debug!(path = %path.display(), "Wrote file");
    Ok(true)
}

/// Check name for a monitored target
fn monitor_name(target: &str) -> String {
    let sanitized: String = target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("monitor_{}", sanitized)
}

/// Parse the peer address the way the management plane sends it; empty
/// means unknown.
pub fn parse_peer(peer: &str) -> Result<Option<IpAddr>> {
    let peer = peer.trim();
    if peer.is_empty() {
        return Ok(None);
    }
    peer.parse()
        .map(Some)
        .map_err(|_| Error::config(format!("invalid peer address: {}", peer)))
}

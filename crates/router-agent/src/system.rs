//! Link and route control outside the configuration tree.

use async_trait::async_trait;
use common::{Error, Result, exec};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{debug, info};

/// Host networking operations used by the command handlers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkControl: Send + Sync {
    /// Set the link alias (`ip link set dev X alias ...`)
    async fn set_alias(&self, interface: &str, alias: &str) -> Result<()>;

    /// Whether the link is administratively and operationally up
    async fn is_link_up(&self, interface: &str) -> Result<bool>;

    async fn set_links_down(&self, interfaces: &[String]) -> Result<()>;

    /// Bring down every ethernet link except the management one
    async fn shutdown_data_links(&self, management_interface: &str) -> Result<()>;

    /// Allow binding to addresses not (yet) present, needed for VIPs
    async fn enable_nonlocal_bind(&self) -> Result<()>;

    /// Install a /32 (or /128) route to `destination`
    async fn add_host_route(
        &self,
        destination: IpAddr,
        interface: &str,
        gateway: Option<IpAddr>,
    ) -> Result<()>;

    async fn remove_host_route(&self, destination: IpAddr) -> Result<()>;

    /// Interface the kernel would use to reach `destination`
    async fn route_interface(&self, destination: IpAddr) -> Result<Option<String>>;
}

/// [`NetworkControl`] through iproute2 and sysctl
#[derive(Debug, Clone)]
pub struct IpCommand {
    sysfs_net: PathBuf,
}

impl IpCommand {
    pub fn new(sysfs_net: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_net: sysfs_net.into(),
        }
    }

    async fn ip(&self, args: &[&str]) -> Result<String> {
        let output = exec::run("ip", args).await?;
        Ok(output.check(&format!("ip {}", args.join(" ")))?.stdout)
    }
}

fn host_prefix(destination: IpAddr) -> String {
    match destination {
        IpAddr::V4(ip) => format!("{}/32", ip),
        IpAddr::V6(ip) => format!("{}/128", ip),
    }
}

#[async_trait]
impl NetworkControl for IpCommand {
    async fn set_alias(&self, interface: &str, alias: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", interface, "alias", alias]).await?;
        debug!(interface, alias, "Set link alias");
        Ok(())
    }

    async fn is_link_up(&self, interface: &str) -> Result<bool> {
        // Prints nothing when the link is down
        let out = self.ip(&["link", "show", "dev", interface, "up"]).await?;
        Ok(!out.trim().is_empty())
    }

    async fn set_links_down(&self, interfaces: &[String]) -> Result<()> {
        for interface in interfaces {
            self.ip(&["link", "set", "dev", interface, "down"]).await?;
        }
        Ok(())
    }

    async fn shutdown_data_links(&self, management_interface: &str) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.sysfs_net).await?;
        let mut links = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains("eth") && name != management_interface {
                links.push(name);
            }
        }
        links.sort();
        info!(?links, "Shutting down data links");
        self.set_links_down(&links).await
    }

    async fn enable_nonlocal_bind(&self) -> Result<()> {
        exec::run("sysctl", &["-w", "net.ipv4.ip_nonlocal_bind=1"])
            .await?
            .check("sysctl")?;
        Ok(())
    }

    async fn add_host_route(
        &self,
        destination: IpAddr,
        interface: &str,
        gateway: Option<IpAddr>,
    ) -> Result<()> {
        let prefix = host_prefix(destination);
        let gateway = gateway.map(|gw| gw.to_string());
        let mut args = vec!["route", "replace", prefix.as_str()];
        if let Some(gw) = &gateway {
            args.extend(["via", gw.as_str()]);
        }
        args.extend(["dev", interface]);
        self.ip(&args).await?;
        info!(%destination, interface, gateway = ?gateway, "Installed host route");
        Ok(())
    }

    async fn remove_host_route(&self, destination: IpAddr) -> Result<()> {
        let prefix = host_prefix(destination);
        self.ip(&["route", "del", &prefix]).await?;
        Ok(())
    }

    async fn route_interface(&self, destination: IpAddr) -> Result<Option<String>> {
        let out = self.ip(&["route", "get", &destination.to_string()]).await?;
        Ok(parse_route_device(&out))
    }
}

/// Device name from `ip route get` output
fn parse_route_device(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    while let Some(word) = words.next() {
        if word == "dev" {
            return words.next().map(str::to_string);
        }
    }
    None
}

/// First line of the version file, empty when it cannot be read
pub fn read_version(path: &std::path::Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => content.lines().next().unwrap_or_default().trim().to_string(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No version file");
            String::new()
        }
    }
}

/// Error for a link that never came up
pub fn link_down_error(interface: &str, waited_secs: u64) -> Error {
    Error::command(format!(
        "nic {} still down after {} seconds",
        interface, waited_secs
    ))
}

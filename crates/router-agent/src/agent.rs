//! Command handlers.
//!
//! Every mutating command holds the process-wide configuration lock for its
//! whole duration. A command either applies all of its statements in one
//! commit or leaves the tree at the last committed state.

use crate::metrics::MetricsRegistry;
use crate::resolver::HardwareAddressResolver;
use crate::system::{NetworkControl, link_down_error};
use crate::types::{
    ConfigureNicCmd, DefaultActionCmd, EnableHaCmd, InitConfig, InterfaceSpec, PingResponse,
    RemoveNicCmd, parse_ip, prefix_len,
};
use common::{Error, Result, RetryPolicy, retry};
use configtree::{
    CommitMode, ConfigLock, ConfigTree, Direction, FirewallPolicyBuilder, InterfacePolicy,
};
use ha::{HaCoordinator, HeartbeatConfig, VipAssociation, parse_peer};
use health::HealthMonitor;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Link-up wait after configuring interfaces as master
pub const LINK_UP_POLICY: RetryPolicy = RetryPolicy::new(10, Duration::from_secs(1));

/// Static settings of the agent
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub management_interface: String,
    pub management_gateway: Option<IpAddr>,
    pub management_cidr: Option<IpNetwork>,
    /// Used until `init` provides a callback address
    pub callback_ip: Option<IpAddr>,
    pub commit_mode: CommitMode,
    pub link_up_policy: RetryPolicy,
    /// Read once at startup
    pub version: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            management_interface: "eth0".to_string(),
            management_gateway: None,
            management_cidr: None,
            callback_ip: None,
            commit_mode: CommitMode::Commit,
            link_up_policy: LINK_UP_POLICY,
            version: String::new(),
        }
    }
}

/// The command surface wired onto the configuration tree and HA core
pub struct Agent {
    lock: ConfigLock,
    firewall: FirewallPolicyBuilder,
    resolver: HardwareAddressResolver,
    network: Arc<dyn NetworkControl>,
    ha: Arc<HaCoordinator>,
    health: Arc<HealthMonitor>,
    metrics: Option<Arc<MetricsRegistry>>,
    settings: AgentSettings,
    init: RwLock<InitConfig>,
    /// Callback address the host route currently points at
    routed_callback: Mutex<Option<IpAddr>>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lock: ConfigLock,
        firewall: FirewallPolicyBuilder,
        resolver: HardwareAddressResolver,
        network: Arc<dyn NetworkControl>,
        ha: Arc<HaCoordinator>,
        health: Arc<HealthMonitor>,
        metrics: Option<Arc<MetricsRegistry>>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            lock,
            firewall,
            resolver,
            network,
            ha,
            health,
            metrics,
            settings,
            init: RwLock::new(InitConfig::default()),
            routed_callback: Mutex::new(None),
        }
    }

    pub fn ha(&self) -> &Arc<HaCoordinator> {
        &self.ha
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn config_lock(&self) -> &ConfigLock {
        &self.lock
    }

    async fn apply(&self, tree: &mut ConfigTree) -> Result<()> {
        let outcome = tree.apply(self.settings.commit_mode).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_apply(match &outcome {
                Ok(true) => "committed",
                Ok(false) => "noop",
                Err(_) => "failed",
            });
        }
        outcome.map(|_| ())
    }

    /// Address, link settings and firewall for each interface.
    pub async fn configure_nic(&self, cmd: &ConfigureNicCmd) -> Result<()> {
        let mut guard = self.lock.lock().await;
        let tree = &mut *guard;

        let mut configured: Vec<(String, &InterfaceSpec)> = Vec::with_capacity(cmd.nics.len());
        let staged = async {
            for nic in &cmd.nics {
                let name = self.resolver.resolve(&nic.mac).await?;
                self.stage_interface(tree, &name, nic)?;
                configured.push((name, nic));
            }
            self.apply(tree).await
        };
        // Borrow of `tree` ends with the staged future
        let result = staged.await;
        if let Err(e) = result {
            discard(&mut guard, "configure-nic", &e);
            return Err(e);
        }

        for (name, nic) in &configured {
            if let Some(alias) = nic.link_alias() {
                self.network.set_alias(name, &alias).await?;
            }
        }

        let names: Vec<String> = configured.iter().map(|(name, _)| name.clone()).collect();
        if self.ha.is_master().await {
            for name in &names {
                self.wait_link_up(name).await?;
            }
        } else {
            // Links stay down on the backup until it takes over
            self.network.set_links_down(&names).await?;
        }

        self.ha.refresh_notify_scripts().await?;
        info!(interfaces = ?names, "Configured interfaces");
        Ok(())
    }

    fn stage_interface(
        &self,
        tree: &mut ConfigTree,
        name: &str,
        nic: &InterfaceSpec,
    ) -> Result<()> {
        let address = nic.address()?;
        let prefix = nic.prefix_len()?;

        tree.set(&format!("interfaces ethernet {} address {}/{}", name, address, prefix));
        for setting in ["duplex", "smp_affinity", "speed"] {
            tree.set(&format!("interfaces ethernet {} {} auto", name, setting));
        }

        let policy = InterfacePolicy {
            address,
            role: nic.category.role(),
            default_action: nic.default_action(),
        };
        self.firewall.configure_interface(tree, name, &policy);
        debug!(interface = name, %address, prefix, "Staged interface");
        Ok(())
    }

    async fn wait_link_up(&self, interface: &str) -> Result<()> {
        let policy = self.settings.link_up_policy;
        let network = &self.network;
        retry(policy, move || async move {
            if network.is_link_up(interface).await? {
                Ok(())
            } else {
                Err(Error::command(format!("nic {} is down", interface)))
            }
        })
        .await
        .map_err(|_| {
            let waited = policy.interval.as_secs() * u64::from(policy.attempts);
            link_down_error(interface, waited)
        })
    }

    /// Delete the interfaces and both of their rulesets.
    pub async fn remove_nic(&self, cmd: &RemoveNicCmd) -> Result<()> {
        let mut guard = self.lock.lock().await;
        let tree = &mut *guard;

        let result = async {
            for nic in &cmd.nics {
                let name = self.resolver.resolve(&nic.mac).await?;
                tree.delete(&format!("interfaces ethernet {}", name));
                self.firewall.remove_interface_firewall(tree, &name);
                info!(interface = %name, "Removing interface");
            }
            self.apply(tree).await
        }
        .await;

        if let Err(e) = result {
            discard(&mut guard, "remove-nic", &e);
            return Err(e);
        }

        self.ha.refresh_notify_scripts().await?;
        Ok(())
    }

    /// Override the default action of both rulesets.
    pub async fn configure_default_action(&self, cmd: &DefaultActionCmd) -> Result<()> {
        let mut guard = self.lock.lock().await;
        let tree = &mut *guard;

        let result = async {
            for nic in &cmd.nics {
                let name = self.resolver.resolve(&nic.mac).await?;
                let action = nic.action();
                for direction in Direction::ALL {
                    self.firewall.set_default_action(tree, &name, direction, action);
                }
                info!(interface = %name, %action, "Setting firewall default action");
            }
            self.apply(tree).await
        }
        .await;

        if let Err(e) = result {
            discard(&mut guard, "configure-nic-default-action", &e);
            return Err(e);
        }
        Ok(())
    }

    /// Firewall exceptions, VIP registration and heartbeat daemon setup.
    pub async fn enable_ha(&self, cmd: &EnableHaCmd) -> Result<()> {
        let mut guard = self.lock.lock().await;
        let tree = &mut *guard;

        let staged = async {
            let heartbeat_interface = self.resolver.resolve(&cmd.heartbeat_nic).await?;
            let local_ip = parse_ip(&cmd.local_ip)?;
            let peer_ip = parse_peer(&cmd.peer_ip)?;

            self.firewall.add_heartbeat_exception(
                tree,
                &heartbeat_interface,
                peer_ip.unwrap_or(local_ip),
            );

            let mut vips = Vec::with_capacity(cmd.vips.len());
            for vip in &cmd.vips {
                let interface = self.resolver.resolve(&vip.nic_mac).await?;
                let address = parse_ip(&vip.nic_vip)?;
                let prefix = prefix_len(&vip.netmask)?;
                self.firewall.add_secondary_ip_exception(tree, &interface, address);
                vips.push(VipAssociation::new(interface, address, prefix));
            }

            self.apply(tree).await?;

            let heartbeat = HeartbeatConfig {
                interface: heartbeat_interface,
                local_ip,
                peer_ip,
                monitors: cmd.monitors.clone(),
                keepalive_interval: cmd.keepalive,
            };
            Ok::<_, Error>((heartbeat, vips))
        }
        .await;

        let (heartbeat, vips) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                discard(&mut guard, "enable-ha", &e);
                return Err(e);
            }
        };

        // Still under the lock: no transition can run half-way through
        let restarted = self.ha.enable(&heartbeat, &vips).await?;
        info!(
            interface = %heartbeat.interface,
            vips = vips.len(),
            restarted,
            "HA enabled"
        );
        Ok(())
    }

    /// Resume HA at boot: data links down, non-local bind, role side effects.
    pub async fn bootstrap_ha(&self) -> Result<()> {
        self.network
            .shutdown_data_links(&self.settings.management_interface)
            .await?;
        self.network.enable_nonlocal_bind().await?;
        self.ha.bootstrap().await
    }

    /// Store the init configuration and route the callback address.
    pub async fn init(&self, config: InitConfig) -> Result<()> {
        info!(uuid = %config.uuid, callback = ?config.callback_ip, "Init");
        *self.init.write().await = config;
        self.ensure_callback_route().await
    }

    pub async fn init_config(&self) -> InitConfig {
        self.init.read().await.clone()
    }

    /// Keep a host route to the callback address over the management link.
    pub async fn ensure_callback_route(&self) -> Result<()> {
        let configured = self.init.read().await.callback_ip;
        let Some(callback) = configured.or(self.settings.callback_ip) else {
            return Ok(());
        };

        let mut routed = self.routed_callback.lock().await;
        if *routed == Some(callback) {
            return Ok(());
        }

        match *routed {
            None => debug!(%callback, "Adding route to callback address"),
            Some(old) => {
                debug!(%old, %callback, "Callback address changed, replacing route");
                if let Err(e) = self.network.remove_host_route(old).await {
                    warn!(%old, error = %e, "Failed to remove stale callback route");
                }
            }
        }

        let mgmt = self.settings.management_interface.as_str();
        let in_mgmt_cidr = self
            .settings
            .management_cidr
            .is_some_and(|cidr| cidr.contains(callback));

        if !in_mgmt_cidr {
            self.network
                .add_host_route(callback, mgmt, self.settings.management_gateway)
                .await?;
        } else if self.network.route_interface(callback).await?.as_deref() != Some(mgmt) {
            self.network.add_host_route(callback, mgmt, None).await?;
        } else {
            debug!(%callback, "Management network already reaches callback address");
        }

        *routed = Some(callback);
        Ok(())
    }

    /// Identity, version, HA role and health. Route errors are only logged.
    pub async fn ping(&self) -> PingResponse {
        if let Err(e) = self.ensure_callback_route().await {
            warn!(error = %e, "Failed to route callback address");
        }

        let health = self.health.status().await;
        PingResponse {
            uuid: self.init.read().await.uuid.clone(),
            version: self.settings.version.clone(),
            ha_status: self.ha.status().await,
            healthy: health.healthy,
            health_detail: health.detail.unwrap_or_default(),
        }
    }

    /// Liveness only
    pub fn echo(&self) {}
}

/// Return the tree to its last committed state after a failed command
fn discard(tree: &mut ConfigTree, command: &str, error: &Error) {
    if tree.has_pending() {
        warn!(command, error = %error, "Command failed, discarding staged configuration");
        tree.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MacLookup;
    use crate::system::MockNetworkControl;
    use async_trait::async_trait;
    use configtree::{MemoryBackend, config_lock};
    use ha::{
        HaSettings, KeepalivedConfigGenerator, KeepalivedControl, KeepalivedPaths,
        NotifyScriptHandler,
    };
    use mockall::predicate::eq;
    use std::path::Path;
    use tempfile::TempDir;

    struct NoNics;

    #[async_trait]
    impl MacLookup for NoNics {
        async fn lookup(&self, mac: &str) -> Result<String> {
            Err(Error::not_found(mac))
        }
    }

    struct IdleKeepalived;

    #[async_trait]
    impl KeepalivedControl for IdleKeepalived {
        async fn restart(&self) -> Result<()> {
            Ok(())
        }

        async fn is_running(&self) -> bool {
            true
        }

        async fn run_script(&self, _script: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn agent(dir: &TempDir, network: MockNetworkControl, settings: AgentSettings) -> Agent {
        let paths = KeepalivedPaths {
            config_file: dir.path().join("keepalived.conf"),
            script_dir: dir.path().join("scripts"),
            state_file: dir.path().join("state"),
            pid_file: dir.path().join("keepalived.pid"),
        };
        let lock = config_lock(ConfigTree::new(Arc::new(MemoryBackend::new())));
        let generator = KeepalivedConfigGenerator::new(paths, "eth0");
        let control = Arc::new(IdleKeepalived);
        let handler = Arc::new(NotifyScriptHandler::new(generator.clone(), control.clone()));
        let ha = Arc::new(HaCoordinator::new(
            lock.clone(),
            generator,
            control,
            handler,
            HaSettings::default(),
        ));

        Agent::new(
            lock,
            FirewallPolicyBuilder::new("eth0", 22),
            HardwareAddressResolver::new(Arc::new(NoNics), RetryPolicy::new(1, Duration::ZERO)),
            Arc::new(network),
            ha,
            Arc::new(HealthMonitor::new(Vec::new(), Duration::from_secs(60))),
            None,
            settings,
        )
    }

    fn settings() -> AgentSettings {
        AgentSettings {
            management_gateway: Some("192.168.0.1".parse().unwrap()),
            management_cidr: Some("192.168.0.0/24".parse().unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_callback_outside_management_network_goes_via_gateway() {
        let dir = TempDir::new().unwrap();
        let callback: IpAddr = "10.9.0.1".parse().unwrap();
        let gateway: IpAddr = "192.168.0.1".parse().unwrap();
        let mut network = MockNetworkControl::new();
        network
            .expect_add_host_route()
            .with(eq(callback), eq("eth0"), eq(Some(gateway)))
            .times(1)
            .returning(|_, _, _| Ok(()));
        network.expect_route_interface().never();

        let agent = agent(&dir, network, settings());
        let init = InitConfig {
            callback_ip: Some(callback),
            ..Default::default()
        };
        agent.init(init).await.unwrap();
        agent.ping().await;
    }

    #[tokio::test]
    async fn test_callback_inside_management_network() {
        let dir = TempDir::new().unwrap();
        let mut network = MockNetworkControl::new();
        network
            .expect_route_interface()
            .times(1)
            .returning(|_| Ok(Some("eth0".to_string())));
        network.expect_add_host_route().never();

        let agent = agent(
            &dir,
            network,
            AgentSettings {
                callback_ip: Some("192.168.0.10".parse().unwrap()),
                ..settings()
            },
        );
        agent.ensure_callback_route().await.unwrap();
        // Already routed, nothing to look up again
        agent.ensure_callback_route().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_logs_route_failure() {
        let dir = TempDir::new().unwrap();
        let mut network = MockNetworkControl::new();
        network
            .expect_add_host_route()
            .times(2)
            .returning(|_, _, _| Err(Error::command("ip route failed")));

        let agent = agent(
            &dir,
            network,
            AgentSettings {
                callback_ip: Some("10.9.0.1".parse().unwrap()),
                ..Default::default()
            },
        );

        // Not routed after a failure, so the next ping tries again
        assert_eq!(agent.ping().await.ha_status, ha::HaStatus::NoHa);
        assert!(agent.ping().await.healthy);
    }

    #[tokio::test]
    async fn test_bootstrap_ha() {
        let dir = TempDir::new().unwrap();
        let mut network = MockNetworkControl::new();
        network
            .expect_shutdown_data_links()
            .with(eq("eth0"))
            .times(1)
            .returning(|_| Ok(()));
        network
            .expect_enable_nonlocal_bind()
            .times(1)
            .returning(|| Ok(()));

        let agent = agent(&dir, network, AgentSettings::default());
        agent.bootstrap_ha().await.unwrap();

        assert!(agent.ha().is_enabled());
        assert!(!agent.ha().is_master().await);
    }
}

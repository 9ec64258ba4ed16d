//! Process wiring: configuration tree, HA core, health loop and HTTP surface.

use crate::agent::{Agent, AgentSettings, LINK_UP_POLICY};
use crate::config::{BackendSettings, Config};
use crate::http_server::{AppState, CommandServer};
use crate::metrics::MetricsRegistry;
use crate::resolver::{HardwareAddressResolver, SysfsMacLookup};
use crate::system::{IpCommand, read_version};
use anyhow::Context;
use common::exec;
use configtree::{
    ConfigBackend, ConfigTree, FirewallPolicyBuilder, MemoryBackend, VyattaBackend, config_lock,
};
use ha::{HaCoordinator, KeepalivedConfigGenerator, NotifyScriptHandler, SystemKeepalived};
use health::{DuplicateAddressProbe, HealthMonitor, HealthProbe, ReadOnlyFsProbe};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Router agent process
pub struct AgentServer {
    config: Config,
}

impl AgentServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until ctrl-c
    pub async fn run(self) -> anyhow::Result<()> {
        let stop = CancellationToken::new();
        let signal = stop.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            signal.cancel();
        });
        self.run_until(stop).await
    }

    /// Run until `stop` fires
    pub async fn run_until(self, stop: CancellationToken) -> anyhow::Result<()> {
        let config = self.config;
        let listen_addr: SocketAddr = config
            .server
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {}", config.server.listen))?;

        let backend: Arc<dyn ConfigBackend> = if config.backend.dry_run {
            warn!("Dry run: configuration batches are recorded, not committed");
            Arc::new(MemoryBackend::new())
        } else {
            Arc::new(VyattaBackend::new(config.backend.wrapper.clone()))
        };
        let lock = config_lock(load_tree(&config.backend, backend).await);

        let metrics = if config.metrics.enabled {
            info!("Metrics enabled on {}/metrics", listen_addr);
            Some(Arc::new(MetricsRegistry::new()))
        } else {
            info!("Metrics disabled");
            None
        };

        // HA core
        let paths = config.keepalived_paths();
        let generator =
            KeepalivedConfigGenerator::new(paths.clone(), config.management.interface.clone());
        let control = Arc::new(SystemKeepalived::new(config.keepalived.binary.clone(), paths));
        let handler = Arc::new(NotifyScriptHandler::new(generator.clone(), control.clone()));
        let coordinator = Arc::new(HaCoordinator::new(
            lock.clone(),
            generator,
            control,
            handler,
            config.ha_settings(),
        ));

        // Health
        let probes: Vec<Arc<dyn HealthProbe>> = vec![
            Arc::new(ReadOnlyFsProbe::new(config.health.readonly_paths.clone())),
            Arc::new(DuplicateAddressProbe::new(config.paths.duplicate_address_flag.clone())),
        ];
        let health = Arc::new(HealthMonitor::new(probes, config.health.interval));

        let resolver = HardwareAddressResolver::new(
            Arc::new(SysfsMacLookup::new(config.paths.sysfs_net.clone())),
            config.retry_policy(),
        );
        let settings = AgentSettings {
            management_interface: config.management.interface.clone(),
            management_gateway: config.management.gateway,
            management_cidr: config.management.cidr,
            callback_ip: config.management.callback_ip,
            commit_mode: config.commit_mode(),
            link_up_policy: LINK_UP_POLICY,
            version: read_version(&config.paths.version_file),
        };
        info!(version = %settings.version, "Router agent starting");

        let firewall = FirewallPolicyBuilder::new(
            config.management.interface.clone(),
            config.management.ssh_port,
        );
        let agent = Arc::new(Agent::new(
            lock,
            firewall,
            resolver,
            Arc::new(IpCommand::new(config.paths.sysfs_net.clone())),
            coordinator.clone(),
            health.clone(),
            metrics.clone(),
            settings,
        ));

        if config.ha.enabled_at_boot {
            if let Err(e) = agent.bootstrap_ha().await {
                warn!(error = %e, "Failed to resume HA, the role loop will retry transitions");
            }
        }

        let mut tasks = coordinator.spawn(stop.clone());
        tasks.push(tokio::spawn(health.clone().run(stop.clone())));

        let server = CommandServer::new(AppState { agent, metrics }, listen_addr);
        let served = server.run(stop.clone()).await;
        // The server only returns early on error; take the loops down with it
        stop.cancel();

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        served.context("command server failed")?;
        info!("Router agent stopped");
        Ok(())
    }
}

/// Seed the tree from the running configuration, empty when unavailable
async fn load_tree(settings: &BackendSettings, backend: Arc<dyn ConfigBackend>) -> ConfigTree {
    if settings.dry_run {
        return ConfigTree::new(backend);
    }

    let loaded = exec::run_script(&settings.show_command)
        .await
        .and_then(|output| output.check("show configuration"))
        .map(|output| output.stdout);
    match loaded {
        Ok(commands) => {
            let tree = ConfigTree::from_commands(&commands, backend);
            info!(statements = tree.commands().len(), "Loaded running configuration");
            tree
        }
        Err(e) => {
            warn!(error = %e, "Could not read running configuration, starting empty");
            ConfigTree::new(backend)
        }
    }
}

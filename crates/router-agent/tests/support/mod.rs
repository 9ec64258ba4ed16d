//! Fakes and a fully wired agent over an in-memory backend

#![allow(dead_code)]

use async_trait::async_trait;
use common::{Error, Result, RetryPolicy};
use configtree::{ConfigTree, FirewallPolicyBuilder, MemoryBackend, config_lock};
use ha::{
    HaCoordinator, HaSettings, KeepalivedConfigGenerator, KeepalivedControl, KeepalivedPaths,
    NotifyScriptHandler,
};
use health::HealthMonitor;
use router_agent::{Agent, AgentSettings, HardwareAddressResolver, MacLookup, NetworkControl};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const ETH1_MAC: &str = "52:54:00:00:00:01";
pub const ETH2_MAC: &str = "52:54:00:00:00:02";

/// MAC table that can miss a number of lookups first
#[derive(Default)]
pub struct FakeLookup {
    table: HashMap<String, String>,
    pub misses: AtomicU32,
    pub calls: AtomicU32,
}

impl FakeLookup {
    pub fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            table: entries
                .iter()
                .map(|(mac, name)| (mac.to_string(), name.to_string()))
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl MacLookup for FakeLookup {
    async fn lookup(&self, mac: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.misses.load(Ordering::SeqCst);
        if pending > 0 {
            self.misses.store(pending - 1, Ordering::SeqCst);
            return Err(Error::not_found(mac));
        }
        self.table
            .get(mac)
            .cloned()
            .ok_or_else(|| Error::not_found(mac))
    }
}

/// Records link and route operations
#[derive(Default)]
pub struct FakeNetwork {
    pub links_down: AtomicBool,
    pub aliases: Mutex<Vec<(String, String)>>,
    pub downed: Mutex<Vec<String>>,
    pub routes: Mutex<Vec<(IpAddr, String, Option<IpAddr>)>>,
    pub link_checks: AtomicU32,
}

#[async_trait]
impl NetworkControl for FakeNetwork {
    async fn set_alias(&self, interface: &str, alias: &str) -> Result<()> {
        self.aliases
            .lock()
            .unwrap()
            .push((interface.to_string(), alias.to_string()));
        Ok(())
    }

    async fn is_link_up(&self, _interface: &str) -> Result<bool> {
        self.link_checks.fetch_add(1, Ordering::SeqCst);
        Ok(!self.links_down.load(Ordering::SeqCst))
    }

    async fn set_links_down(&self, interfaces: &[String]) -> Result<()> {
        self.downed.lock().unwrap().extend_from_slice(interfaces);
        Ok(())
    }

    async fn shutdown_data_links(&self, _management_interface: &str) -> Result<()> {
        Ok(())
    }

    async fn enable_nonlocal_bind(&self) -> Result<()> {
        Ok(())
    }

    async fn add_host_route(
        &self,
        destination: IpAddr,
        interface: &str,
        gateway: Option<IpAddr>,
    ) -> Result<()> {
        self.routes
            .lock()
            .unwrap()
            .push((destination, interface.to_string(), gateway));
        Ok(())
    }

    async fn remove_host_route(&self, destination: IpAddr) -> Result<()> {
        self.routes.lock().unwrap().retain(|(dst, _, _)| *dst != destination);
        Ok(())
    }

    async fn route_interface(&self, _destination: IpAddr) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Daemon stand-in counting restarts and executed scripts
#[derive(Default)]
pub struct FakeKeepalived {
    pub restarts: AtomicU32,
    pub scripts: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl KeepalivedControl for FakeKeepalived {
    async fn restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_running(&self) -> bool {
        true
    }

    async fn run_script(&self, script: &Path) -> Result<()> {
        self.scripts.lock().unwrap().push(script.to_path_buf());
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub paths: KeepalivedPaths,
    pub backend: Arc<MemoryBackend>,
    pub lookup: Arc<FakeLookup>,
    pub network: Arc<FakeNetwork>,
    pub keepalived: Arc<FakeKeepalived>,
    pub agent: Arc<Agent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_tree("")
    }

    /// Agent over a tree seeded with `commands`
    pub fn with_tree(commands: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = KeepalivedPaths {
            config_file: dir.path().join("keepalived.conf"),
            script_dir: dir.path().join("scripts"),
            state_file: dir.path().join("state"),
            pid_file: dir.path().join("keepalived.pid"),
        };

        let backend = Arc::new(MemoryBackend::new());
        let lock = config_lock(ConfigTree::from_commands(commands, backend.clone()));
        let lookup = Arc::new(FakeLookup::new(&[(ETH1_MAC, "eth1"), (ETH2_MAC, "eth2")]));
        let network = Arc::new(FakeNetwork::default());
        let keepalived = Arc::new(FakeKeepalived::default());

        let generator = KeepalivedConfigGenerator::new(paths.clone(), "eth0");
        let handler = Arc::new(NotifyScriptHandler::new(generator.clone(), keepalived.clone()));
        let ha = Arc::new(HaCoordinator::new(
            lock.clone(),
            generator,
            keepalived.clone(),
            handler,
            HaSettings::default(),
        ));
        let health = Arc::new(HealthMonitor::new(Vec::new(), Duration::from_secs(60)));

        let agent = Arc::new(Agent::new(
            lock,
            FirewallPolicyBuilder::new("eth0", 22),
            HardwareAddressResolver::new(
                lookup.clone(),
                RetryPolicy::new(5, Duration::from_secs(1)),
            ),
            network.clone(),
            ha,
            health,
            None,
            AgentSettings {
                version: "1.0.0".to_string(),
                ..Default::default()
            },
        ));

        Self {
            dir,
            paths,
            backend,
            lookup,
            network,
            keepalived,
            agent,
        }
    }

    /// Current statements of the tree
    pub async fn commands(&self) -> Vec<String> {
        self.agent.config_lock().lock().await.commands()
    }
}

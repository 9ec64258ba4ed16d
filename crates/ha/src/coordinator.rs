//! Role tracking and daemon supervision.
//!
//! The coordinator polls the role indicator written by the notify scripts.
//! A role change is applied while holding the process-wide configuration
//! lock, so command handlers never observe a half-finished transition.

use crate::keepalived::{KeepalivedConfigGenerator, KeepalivedControl};
use crate::registry::VipPairRegistry;
use crate::types::{
    HaRole, HaSettings, HaState, HaStats, HaStatus, HeartbeatConfig, VipAssociation,
};
use async_trait::async_trait;
use common::Result;
use configtree::{ConfigLock, ConfigTree};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Side effects of taking a role.
///
/// Called with the configuration lock held. Statements staged on the tree
/// are committed as one batch once the handler returns, or rolled back if
/// it fails. Implementations must be safe to re-run for a role that is
/// already in effect.
#[async_trait]
pub trait TransitionHandler: Send + Sync {
    async fn on_role_change(&self, role: HaRole, tree: &mut ConfigTree) -> Result<()>;
}

/// Runs the generated notify script for the new role
pub struct NotifyScriptHandler {
    generator: KeepalivedConfigGenerator,
    control: Arc<dyn KeepalivedControl>,
}

impl NotifyScriptHandler {
    pub fn new(generator: KeepalivedConfigGenerator, control: Arc<dyn KeepalivedControl>) -> Self {
        Self { generator, control }
    }
}

#[async_trait]
impl TransitionHandler for NotifyScriptHandler {
    async fn on_role_change(&self, role: HaRole, _tree: &mut ConfigTree) -> Result<()> {
        let script = self.generator.paths().script_for(role);
        if !script.exists() {
            debug!(%role, "No notify script installed yet");
            return Ok(());
        }
        self.control.run_script(&script).await
    }
}

#[derive(Debug, Clone, Copy)]
enum LoopKind {
    RoleDetection,
    Liveness,
}

/// Owner of the HA state, the VIP registry and the daemon lifecycle
pub struct HaCoordinator {
    enabled: AtomicBool,
    state: RwLock<HaState>,
    stats: RwLock<HaStats>,
    registry: RwLock<VipPairRegistry>,
    lock: ConfigLock,
    generator: KeepalivedConfigGenerator,
    control: Arc<dyn KeepalivedControl>,
    handler: Arc<dyn TransitionHandler>,
    settings: HaSettings,
}

impl HaCoordinator {
    pub fn new(
        lock: ConfigLock,
        generator: KeepalivedConfigGenerator,
        control: Arc<dyn KeepalivedControl>,
        handler: Arc<dyn TransitionHandler>,
        settings: HaSettings,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            state: RwLock::new(HaState::default()),
            stats: RwLock::new(HaStats::default()),
            registry: RwLock::new(VipPairRegistry::new()),
            lock,
            generator,
            control,
            handler,
            settings,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether this node acts as master. Always true without HA.
    pub async fn is_master(&self) -> bool {
        !self.is_enabled() || self.state.read().await.is_master
    }

    pub async fn status(&self) -> HaStatus {
        if !self.is_enabled() {
            return HaStatus::NoHa;
        }
        match self.state.read().await.role() {
            HaRole::Master => HaStatus::Master,
            HaRole::Backup => HaStatus::Backup,
        }
    }

    pub async fn state(&self) -> HaState {
        *self.state.read().await
    }

    pub async fn stats(&self) -> HaStats {
        self.stats.read().await.clone()
    }

    pub async fn vips(&self) -> Vec<VipAssociation> {
        self.registry.read().await.to_vec()
    }

    /// Turn HA on: register VIPs, install scripts and daemon configuration.
    ///
    /// The caller holds the configuration lock. Returns whether the daemon
    /// was restarted.
    pub async fn enable(
        &self,
        heartbeat: &HeartbeatConfig,
        vips: &[VipAssociation],
    ) -> Result<bool> {
        self.add_vips(vips).await?;
        // Scripts must exist before the daemon can call them
        self.refresh_notify_scripts().await?;

        let conf = self.generator.render(heartbeat);
        let restarted = self
            .generator
            .install_config(&conf, self.control.as_ref())
            .await?;
        if restarted {
            self.stats.write().await.keepalived_restarts += 1;
        }

        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!(interface = %heartbeat.interface, "HA enabled");
        }
        Ok(restarted)
    }

    /// Register VIPs, regenerating the scripts when membership changed
    pub async fn add_vips(&self, vips: &[VipAssociation]) -> Result<bool> {
        let snapshot = {
            let mut registry = self.registry.write().await;
            if !registry.add(vips) {
                return Ok(false);
            }
            registry.to_vec()
        };
        self.generator.install_notify_scripts(&snapshot).await?;
        Ok(true)
    }

    /// Unregister VIPs, regenerating the scripts when membership changed
    pub async fn remove_vips(&self, vips: &[VipAssociation]) -> Result<bool> {
        let snapshot = {
            let mut registry = self.registry.write().await;
            if !registry.remove(vips) {
                return Ok(false);
            }
            registry.to_vec()
        };
        self.generator.install_notify_scripts(&snapshot).await?;
        Ok(true)
    }

    /// Rewrite the scripts from the registry if their content is stale
    pub async fn refresh_notify_scripts(&self) -> Result<bool> {
        let snapshot = self.vips().await;
        self.generator.install_notify_scripts(&snapshot).await
    }

    /// Read the role indicator. `None` when it cannot be read.
    async fn observe_role(&self) -> Option<HaRole> {
        let path = &self.generator.paths().state_file;
        match tokio::fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => None,
            Ok(content) if content.contains("MASTER") => Some(HaRole::Master),
            Ok(_) => Some(HaRole::Backup),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Role indicator unreadable");
                None
            }
        }
    }

    /// One iteration of role detection. Returns whether the role flipped.
    ///
    /// An unreadable indicator keeps the last known role.
    pub async fn poll_once(&self) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }

        let Some(observed) = self.observe_role().await else {
            self.stats.write().await.indicator_read_failures += 1;
            return Ok(false);
        };

        let previous = self.state.read().await.role();
        if observed == previous {
            self.state.write().await.last_observed_at = Some(SystemTime::now());
            return Ok(false);
        }

        // Nothing else may touch the tree while the role changes
        let mut tree = self.lock.lock().await;
        self.set_role(observed).await;
        info!(from = %previous, to = %observed, "HA role changed");

        if let Err(e) = self.transition(observed, &mut tree).await {
            // Restore the old role so the next poll runs the transition again
            self.set_role(previous).await;
            self.stats.write().await.failed_transitions += 1;
            warn!(role = %observed, error = %e, "Transition handler failed, will retry");
            return Err(e);
        }

        let mut stats = self.stats.write().await;
        match observed {
            HaRole::Master => stats.master_transitions += 1,
            HaRole::Backup => stats.backup_transitions += 1,
        }
        Ok(true)
    }

    /// Run the handler for `role` and commit whatever it staged
    async fn transition(&self, role: HaRole, tree: &mut ConfigTree) -> Result<()> {
        if let Err(e) = self.handler.on_role_change(role, tree).await {
            tree.rollback();
            return Err(e);
        }
        tree.apply(self.settings.commit_mode).await?;
        Ok(())
    }

    async fn set_role(&self, role: HaRole) {
        let mut state = self.state.write().await;
        state.is_master = role == HaRole::Master;
        state.last_observed_at = Some(SystemTime::now());
    }

    /// Restart the daemon if it died. Returns whether a restart was issued.
    pub async fn check_liveness(&self) -> Result<bool> {
        if !self.is_enabled() || self.control.is_running().await {
            return Ok(false);
        }

        warn!("Keepalived is not running, restarting");
        self.control.restart().await?;
        self.stats.write().await.keepalived_restarts += 1;
        Ok(true)
    }

    /// Resume HA on a node that was already configured before a restart.
    ///
    /// Adopts the role recorded by the notify scripts, backup if none, and
    /// re-applies its side effects. Must not be called with the lock held.
    pub async fn bootstrap(&self) -> Result<()> {
        if let Some(role) = self.observe_role().await {
            self.set_role(role).await;
        }
        self.enabled.store(true, Ordering::SeqCst);
        info!(role = %self.state.read().await.role(), "Resuming HA");
        self.reconcile().await
    }

    /// Re-run the side effects of the current role under the lock
    pub async fn reconcile(&self) -> Result<()> {
        let mut tree = self.lock.lock().await;
        let role = self.state.read().await.role();
        self.transition(role, &mut tree).await
    }

    /// Role-detection loop, one poll per interval until `stop` fires
    pub async fn run_role_loop(self: Arc<Self>, stop: CancellationToken) {
        self.run_periodic(LoopKind::RoleDetection, stop).await;
    }

    /// Liveness guard loop, one check per interval until `stop` fires
    pub async fn run_liveness_loop(self: Arc<Self>, stop: CancellationToken) {
        self.run_periodic(LoopKind::Liveness, stop).await;
    }

    async fn run_periodic(&self, kind: LoopKind, stop: CancellationToken) {
        let period = match kind {
            LoopKind::RoleDetection => self.settings.poll_interval,
            LoopKind::Liveness => self.settings.liveness_interval,
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(?kind, period_ms = period.as_millis() as u64, "Starting loop");

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!(?kind, "Loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let outcome = match kind {
                        LoopKind::RoleDetection => self.poll_once().await,
                        LoopKind::Liveness => self.check_liveness().await,
                    };
                    if let Err(e) = outcome {
                        warn!(?kind, error = %e, "Loop iteration failed");
                    }
                }
            }
        }
    }

    /// Spawn both loops on the runtime
    pub fn spawn(self: &Arc<Self>, stop: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).run_role_loop(stop.clone())),
            tokio::spawn(Arc::clone(self).run_liveness_loop(stop)),
        ]
    }
}

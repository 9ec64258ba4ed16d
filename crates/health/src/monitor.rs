//! Periodic aggregation of health probes.

use crate::probes::HealthProbe;
use crate::types::{HealthStats, HealthStatus, ProbeResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health monitor keeping the last aggregated status
pub struct HealthMonitor {
    probes: Vec<Arc<dyn HealthProbe>>,
    period: Duration,
    status: RwLock<HealthStatus>,
    stats: RwLock<HealthStats>,
}

impl HealthMonitor {
    /// Create a monitor; the status is healthy until the first cycle runs
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>, period: Duration) -> Self {
        Self {
            probes,
            period,
            status: RwLock::new(HealthStatus::default()),
            stats: RwLock::new(HealthStats::default()),
        }
    }

    /// Last computed status
    pub async fn status(&self) -> HealthStatus {
        self.status.read().await.clone()
    }

    pub async fn stats(&self) -> HealthStats {
        *self.stats.read().await
    }

    /// Run every probe now and cache the aggregate
    pub async fn check_now(&self) -> HealthStatus {
        let start = Instant::now();
        let mut results: Vec<ProbeResult> = Vec::with_capacity(self.probes.len());
        for probe in &self.probes {
            results.push(probe.probe().await);
        }
        let status = HealthStatus::aggregate(&results);

        {
            let mut stats = self.stats.write().await;
            stats.cycles += 1;
            if !status.healthy {
                stats.unhealthy_cycles += 1;
            }
            stats.last_duration = start.elapsed();
        }

        let mut current = self.status.write().await;
        if current.healthy != status.healthy {
            if status.healthy {
                info!("Appliance is now HEALTHY");
            } else {
                warn!(detail = ?status.detail, "Appliance is now UNHEALTHY");
            }
        }
        *current = status.clone();
        debug!(%status, probes = self.probes.len(), "Health cycle complete");
        status
    }

    /// Probe every period until `stop` fires
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_now().await;
                }
                _ = stop.cancelled() => {
                    info!("Health monitor stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct Switch {
        healthy: AtomicBool,
        runs: AtomicU32,
    }

    impl Switch {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                runs: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for Switch {
        async fn probe(&self) -> ProbeResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                ProbeResult::healthy(self.name())
            } else {
                ProbeResult::unhealthy(self.name(), "switched off")
            }
        }

        fn name(&self) -> &str {
            "switch"
        }
    }

    #[tokio::test]
    async fn test_healthy_before_first_cycle() {
        let probes: Vec<Arc<dyn HealthProbe>> = vec![Switch::new(false)];
        let monitor = HealthMonitor::new(probes, Duration::from_secs(5));
        assert!(monitor.status().await.healthy);
    }

    #[tokio::test]
    async fn test_check_now_caches_status() {
        let switch = Switch::new(true);
        let probes: Vec<Arc<dyn HealthProbe>> = vec![switch.clone()];
        let monitor = HealthMonitor::new(probes, Duration::from_secs(5));

        assert!(monitor.check_now().await.healthy);

        switch.healthy.store(false, Ordering::SeqCst);
        let status = monitor.check_now().await;
        assert!(!status.healthy);
        assert_eq!(status.detail.as_deref(), Some("switch: switched off"));
        assert_eq!(monitor.status().await, status);

        let stats = monitor.stats().await;
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.unhealthy_cycles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_probes_periodically() {
        let switch = Switch::new(true);
        let probes: Vec<Arc<dyn HealthProbe>> = vec![switch.clone()];
        let monitor = Arc::new(HealthMonitor::new(probes, Duration::from_secs(5)));
        let stop = CancellationToken::new();
        let handle = tokio::spawn(monitor.clone().run(stop.clone()));

        // First tick fires immediately, then one per period
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(switch.runs.load(Ordering::SeqCst), 3);

        stop.cancel();
        handle.await.unwrap();
    }
}

//! Prometheus metrics for the router agent.

use ha::{HaStats, HaStatus};
use health::HealthStatus;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::time::Duration;

/// Labels for command metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabels {
    /// Command path without the leading slash
    pub command: String,
    /// success or failure
    pub result: String,
}

/// Labels for per-command latency
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandNameLabels {
    pub command: String,
}

/// Labels for configuration applies
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ApplyLabels {
    /// committed, noop or failed
    pub result: String,
}

/// Labels for role transitions
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RoleLabels {
    /// master or backup
    pub role: String,
}

/// Metrics registry with all agent metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    commands_total: Family<CommandLabels, Counter>,
    command_duration_seconds: Family<CommandNameLabels, Histogram>,
    config_applies_total: Family<ApplyLabels, Counter>,
    /// 0=no HA, 1=master, 2=backup
    ha_role: Gauge,
    /// Transitions seen by the coordinator, mirrored at scrape time
    ha_transitions: Family<RoleLabels, Gauge>,
    keepalived_restarts: Gauge,
    vip_associations: Gauge,
    healthy: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let commands_total = Family::<CommandLabels, Counter>::default();
        registry.register(
            "router_agent_commands",
            "Commands handled by name and result",
            commands_total.clone(),
        );

        let command_duration_seconds =
            Family::<CommandNameLabels, Histogram>::new_with_constructor(|| {
                // 1ms to ~16s; configure-nic waits for links
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "router_agent_command_duration_seconds",
            "Command handling time in seconds",
            command_duration_seconds.clone(),
        );

        let config_applies_total = Family::<ApplyLabels, Counter>::default();
        registry.register(
            "router_agent_config_applies",
            "Configuration tree applies by result",
            config_applies_total.clone(),
        );

        let ha_role = Gauge::default();
        registry.register(
            "router_agent_ha_role",
            "Current HA role (0=no HA, 1=master, 2=backup)",
            ha_role.clone(),
        );

        let ha_transitions = Family::<RoleLabels, Gauge>::default();
        registry.register(
            "router_agent_ha_transitions",
            "Role transitions applied since start",
            ha_transitions.clone(),
        );

        let keepalived_restarts = Gauge::default();
        registry.register(
            "router_agent_keepalived_restarts",
            "Keepalived restarts issued since start",
            keepalived_restarts.clone(),
        );

        let vip_associations = Gauge::default();
        registry.register(
            "router_agent_vip_associations",
            "Registered virtual IP associations",
            vip_associations.clone(),
        );

        let healthy = Gauge::default();
        registry.register(
            "router_agent_healthy",
            "Aggregated appliance health (1=healthy, 0=unhealthy)",
            healthy.clone(),
        );

        Self {
            registry,
            commands_total,
            command_duration_seconds,
            config_applies_total,
            ha_role,
            ha_transitions,
            keepalived_restarts,
            vip_associations,
            healthy,
        }
    }

    /// Record a handled command
    pub fn record_command(&self, command: &str, success: bool, duration: Duration) {
        self.commands_total
            .get_or_create(&CommandLabels {
                command: command.to_string(),
                result: if success { "success" } else { "failure" }.to_string(),
            })
            .inc();

        self.command_duration_seconds
            .get_or_create(&CommandNameLabels {
                command: command.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    /// Record the outcome of a tree apply
    pub fn record_apply(&self, result: &str) {
        self.config_applies_total
            .get_or_create(&ApplyLabels {
                result: result.to_string(),
            })
            .inc();
    }

    /// Mirror the coordinator's view
    pub fn observe_ha(&self, status: HaStatus, stats: &HaStats, vips: usize) {
        let role = match status {
            HaStatus::NoHa => 0,
            HaStatus::Master => 1,
            HaStatus::Backup => 2,
        };
        self.ha_role.set(role);

        for (role, count) in [
            ("master", stats.master_transitions),
            ("backup", stats.backup_transitions),
        ] {
            self.ha_transitions
                .get_or_create(&RoleLabels {
                    role: role.to_string(),
                })
                .set(count as i64);
        }
        self.keepalived_restarts.set(stats.keepalived_restarts as i64);
        self.vip_associations.set(vips as i64);
    }

    pub fn observe_health(&self, status: &HealthStatus) {
        self.healthy.set(if status.healthy { 1 } else { 0 });
    }

    /// Prometheus text exposition
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_command() {
        let metrics = MetricsRegistry::new();
        metrics.record_command("configurenic", true, Duration::from_millis(20));
        metrics.record_command("configurenic", false, Duration::from_millis(5));

        let text = metrics.encode().unwrap();
        assert!(text.contains(
            "router_agent_commands_total{command=\"configurenic\",result=\"success\"} 1"
        ));
        assert!(text.contains(
            "router_agent_commands_total{command=\"configurenic\",result=\"failure\"} 1"
        ));
        assert!(text.contains("router_agent_command_duration_seconds_count{command=\"configurenic\"} 2"));
    }

    #[test]
    fn test_observe_ha_and_health() {
        let metrics = MetricsRegistry::new();
        let stats = HaStats {
            master_transitions: 3,
            backup_transitions: 2,
            keepalived_restarts: 1,
            ..Default::default()
        };
        metrics.observe_ha(HaStatus::Backup, &stats, 4);
        metrics.observe_health(&HealthStatus {
            healthy: false,
            detail: Some("read-only".to_string()),
        });
        metrics.record_apply("committed");

        let text = metrics.encode().unwrap();
        assert!(text.contains("router_agent_ha_role 2"));
        assert!(text.contains("router_agent_ha_transitions{role=\"master\"} 3"));
        assert!(text.contains("router_agent_keepalived_restarts 1"));
        assert!(text.contains("router_agent_vip_associations 4"));
        assert!(text.contains("router_agent_healthy 0"));
        assert!(text.contains("router_agent_config_applies_total{result=\"committed\"} 1"));
    }
}

//! Health probe types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub probe: String,
    pub healthy: bool,
    /// Why the probe failed
    pub detail: Option<String>,
}

impl ProbeResult {
    pub fn healthy(probe: impl Into<String>) -> Self {
        Self {
            probe: probe.into(),
            healthy: true,
            detail: None,
        }
    }

    pub fn unhealthy(probe: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            probe: probe.into(),
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// Aggregated health of the appliance as reported by `ping`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub detail: Option<String>,
}

impl HealthStatus {
    /// Healthy only when every probe is; details of failed probes are joined.
    pub fn aggregate(results: &[ProbeResult]) -> Self {
        let details: Vec<String> = results
            .iter()
            .filter(|r| !r.healthy)
            .map(|r| match &r.detail {
                Some(detail) => format!("{}: {}", r.probe, detail),
                None => r.probe.clone(),
            })
            .collect();

        if details.is_empty() {
            Self::default()
        } else {
            Self {
                healthy: false,
                detail: Some(details.join("; ")),
            }
        }
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            detail: None,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.healthy, &self.detail) {
            (true, _) => write!(f, "HEALTHY"),
            (false, Some(detail)) => write!(f, "UNHEALTHY ({})", detail),
            (false, None) => write!(f, "UNHEALTHY"),
        }
    }
}

/// Health monitor statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthStats {
    /// Completed probe cycles
    pub cycles: u64,

    /// Cycles that ended unhealthy
    pub unhealthy_cycles: u64,

    /// Duration of the last cycle
    pub last_duration: Duration,
}

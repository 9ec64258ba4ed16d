//! Health probe implementations.

use crate::types::ProbeResult;
use async_trait::async_trait;
use nix::sys::statvfs::{FsFlags, statvfs};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Health probe trait
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Run the probe once
    async fn probe(&self) -> ProbeResult;

    /// Name reported in failure details
    fn name(&self) -> &str;
}

/// Fails when any of the watched mount points went read-only
pub struct ReadOnlyFsProbe {
    paths: Vec<PathBuf>,
}

impl ReadOnlyFsProbe {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl HealthProbe for ReadOnlyFsProbe {
    async fn probe(&self) -> ProbeResult {
        let paths = self.paths.clone();
        // statvfs blocks on a wedged filesystem
        let outcome = tokio::task::spawn_blocking(move || {
            let mut read_only = Vec::new();
            for path in &paths {
                match statvfs(path) {
                    Ok(stat) if stat.flags().contains(FsFlags::ST_RDONLY) => {
                        read_only.push(path.display().to_string());
                    }
                    Ok(_) => {}
                    Err(e) => debug!(path = %path.display(), error = %e, "statvfs failed"),
                }
            }
            read_only
        })
        .await;

        match outcome {
            Ok(read_only) if read_only.is_empty() => ProbeResult::healthy(self.name()),
            Ok(read_only) => {
                warn!(paths = ?read_only, "Filesystem is read-only");
                ProbeResult::unhealthy(
                    self.name(),
                    format!("read-only filesystem: {}", read_only.join(", ")),
                )
            }
            Err(e) => ProbeResult::unhealthy(self.name(), format!("probe task failed: {}", e)),
        }
    }

    fn name(&self) -> &str {
        "readonly-fs"
    }
}

/// Fails while the duplicate-address flag file exists.
///
/// The file is dropped by the address conflict detector; its content
/// names the conflicting address.
pub struct DuplicateAddressProbe {
    flag_file: PathBuf,
}

impl DuplicateAddressProbe {
    pub fn new(flag_file: impl Into<PathBuf>) -> Self {
        Self {
            flag_file: flag_file.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for DuplicateAddressProbe {
    async fn probe(&self) -> ProbeResult {
        match tokio::fs::read_to_string(&self.flag_file).await {
            Ok(content) => {
                let detail = content.trim();
                let detail = if detail.is_empty() {
                    "duplicate address detected"
                } else {
                    detail
                };
                warn!(detail, "Duplicate address flagged");
                ProbeResult::unhealthy(self.name(), detail)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProbeResult::healthy(self.name()),
            Err(e) => ProbeResult::unhealthy(
                self.name(),
                format!("cannot read {}: {}", self.flag_file.display(), e),
            ),
        }
    }

    fn name(&self) -> &str {
        "duplicate-address"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_readonly_probe_on_writable_dir() {
        let dir = TempDir::new().unwrap();
        let probe = ReadOnlyFsProbe::new(vec![dir.path().to_path_buf()]);
        let result = probe.probe().await;
        assert!(result.healthy);
        assert_eq!(result.probe, "readonly-fs");
    }

    #[tokio::test]
    async fn test_readonly_probe_ignores_missing_path() {
        let probe = ReadOnlyFsProbe::new(vec![PathBuf::from("/nonexistent/router-agent")]);
        assert!(probe.probe().await.healthy);
    }

    #[tokio::test]
    async fn test_duplicate_address_probe() {
        let dir = TempDir::new().unwrap();
        let flag = dir.path().join("duplicate-ip");
        let probe = DuplicateAddressProbe::new(&flag);

        assert!(probe.probe().await.healthy);

        std::fs::write(&flag, "10.0.0.5 is used by 52:54:00:aa:bb:cc\n").unwrap();
        let result = probe.probe().await;
        assert!(!result.healthy);
        assert_eq!(result.detail.as_deref(), Some("10.0.0.5 is used by 52:54:00:aa:bb:cc"));

        std::fs::write(&flag, "").unwrap();
        assert_eq!(
            probe.probe().await.detail.as_deref(),
            Some("duplicate address detected")
        );
    }
}

//! Hardware address to interface name resolution.

use async_trait::async_trait;
use common::{Error, Result, RetryPolicy, retry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// One lookup attempt against the system
#[async_trait]
pub trait MacLookup: Send + Sync {
    /// Interface currently owning `mac`, `NotFound` when none does
    async fn lookup(&self, mac: &str) -> Result<String>;
}

/// Scans `<root>/*/address` as exposed by sysfs
#[derive(Debug, Clone)]
pub struct SysfsMacLookup {
    root: PathBuf,
}

impl SysfsMacLookup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsMacLookup {
    fn default() -> Self {
        Self::new("/sys/class/net")
    }
}

#[async_trait]
impl MacLookup for SysfsMacLookup {
    async fn lookup(&self, mac: &str) -> Result<String> {
        let wanted = mac.trim().to_ascii_lowercase();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let address = match tokio::fs::read_to_string(entry.path().join("address")).await {
                Ok(address) => address,
                Err(_) => continue,
            };
            if address.trim().to_ascii_lowercase() == wanted {
                return Ok(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Err(Error::not_found(format!("no interface with MAC {}", mac)))
    }
}

/// Resolves hardware addresses with a bounded retry.
///
/// Freshly hot-plugged interfaces take a moment to show up, so a miss is
/// retried before it becomes fatal.
#[derive(Clone)]
pub struct HardwareAddressResolver {
    lookup: Arc<dyn MacLookup>,
    policy: RetryPolicy,
}

impl HardwareAddressResolver {
    pub fn new(lookup: Arc<dyn MacLookup>, policy: RetryPolicy) -> Self {
        Self { lookup, policy }
    }

    pub async fn resolve(&self, mac: &str) -> Result<String> {
        let result = retry(self.policy, || self.lookup.lookup(mac)).await;
        match &result {
            Ok(name) => debug!(mac, interface = %name, "Resolved hardware address"),
            Err(e) => warn!(
                mac,
                attempts = self.policy.attempts,
                error = %e,
                "Hardware address resolution failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn sysfs(nics: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, mac) in nics {
            let nic = dir.path().join(name);
            std::fs::create_dir(&nic).unwrap();
            std::fs::write(nic.join("address"), format!("{}\n", mac)).unwrap();
        }
        // Entries without an address file are skipped
        std::fs::create_dir(dir.path().join("bonding_masters")).unwrap();
        dir
    }

    /// Misses a fixed number of times before finding the interface
    struct Flaky {
        misses: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MacLookup for Flaky {
        async fn lookup(&self, mac: &str) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.misses {
                Err(Error::not_found(mac))
            } else {
                Ok("eth1".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_sysfs_lookup_is_case_insensitive() {
        let dir = sysfs(&[("eth0", "52:54:00:aa:bb:01"), ("eth1", "52:54:00:aa:bb:02")]);
        let lookup = SysfsMacLookup::new(dir.path());

        assert_eq!(lookup.lookup("52:54:00:AA:BB:02").await.unwrap(), "eth1");
        assert!(lookup.lookup("52:54:00:aa:bb:03").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_retries_transient_miss() {
        let flaky = Arc::new(Flaky {
            misses: 2,
            calls: AtomicU32::new(0),
        });
        let resolver = HardwareAddressResolver::new(
            flaky.clone(),
            RetryPolicy::new(5, Duration::from_secs(1)),
        );

        let start = tokio::time::Instant::now();
        assert_eq!(resolver.resolve("52:54:00:aa:bb:02").await.unwrap(), "eth1");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_gives_up_after_budget() {
        let flaky = Arc::new(Flaky {
            misses: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let resolver = HardwareAddressResolver::new(flaky.clone(), RetryPolicy::default());

        let err = resolver.resolve("52:54:00:aa:bb:02").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 5);
    }
}

//! Backends that commit configuration batches to the appliance.

use async_trait::async_trait;
use common::{Error, Result, exec};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Default location of the vyatta configuration wrapper
pub const DEFAULT_WRAPPER: &str = "/opt/vyatta/sbin/vyatta-cfg-cmd-wrapper";

/// Whether a commit is also persisted to the boot configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Commit,
    CommitAndSave,
}

/// A batch of `set`/`delete` statements committed as one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBatch {
    pub commands: Vec<String>,
    pub mode: CommitMode,
}

/// Something able to commit a configuration batch atomically.
///
/// Implementations must either commit every statement or none of them.
#[async_trait]
pub trait ConfigBackend: Send + Sync {
    async fn commit(&self, batch: &ConfigBatch) -> Result<()>;
}

/// Commits through the vyatta configuration wrapper in a single session.
pub struct VyattaBackend {
    wrapper: PathBuf,
}

impl VyattaBackend {
    pub fn new(wrapper: impl Into<PathBuf>) -> Self {
        Self {
            wrapper: wrapper.into(),
        }
    }

    /// Build the shell script for one configuration session.
    ///
    /// Any failing statement discards the whole session.
    pub fn script(&self, batch: &ConfigBatch) -> String {
        let wrapper = self.wrapper.display();
        let mut script = String::new();
        script.push_str(&format!("W={}\n", wrapper));
        script.push_str("trap '$W discard >/dev/null 2>&1; $W end >/dev/null 2>&1' ERR\n");
        script.push_str("set -e\n");
        script.push_str("$W begin\n");
        for command in &batch.commands {
            script.push_str(&format!("$W {}\n", command));
        }
        script.push_str("$W commit\n");
        if batch.mode == CommitMode::CommitAndSave {
            script.push_str("$W save\n");
        }
        script.push_str("$W end\n");
        script
    }
}

impl Default for VyattaBackend {
    fn default() -> Self {
        Self::new(DEFAULT_WRAPPER)
    }
}

#[async_trait]
impl ConfigBackend for VyattaBackend {
    async fn commit(&self, batch: &ConfigBatch) -> Result<()> {
        debug!(changes = batch.commands.len(), "Committing through vyatta wrapper");
        let output = exec::run_script(&self.script(batch)).await?;
        if !output.success() {
            warn!(status = output.status, stderr = %output.stderr.trim(), "Vyatta commit failed");
            return Err(Error::apply(format!(
                "commit exited with {}: {}{}",
                output.status,
                output.stdout.trim(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Keeps committed batches in memory instead of touching the appliance.
///
/// Used for dry runs; a failure can be armed for the next commit.
#[derive(Default)]
pub struct MemoryBackend {
    batches: Mutex<Vec<ConfigBatch>>,
    fail_next: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail
    pub fn fail_next_commit(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Batches committed so far
    pub fn batches(&self) -> Vec<ConfigBatch> {
        self.batches
            .lock()
            .map(|batches| batches.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConfigBackend for MemoryBackend {
    async fn commit(&self, batch: &ConfigBatch) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::apply("commit rejected"));
        }
        for command in &batch.commands {
            debug!(command = %command, "dry-run");
        }
        self.batches
            .lock()
            .map_err(|_| Error::other("memory backend lock poisoned"))?
            .push(batch.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vyatta_script() {
        let backend = VyattaBackend::new("/usr/bin/wrapper");
        let batch = ConfigBatch {
            commands: vec![
                "delete firewall name eth1.in".to_string(),
                "set interfaces ethernet eth1 address 10.0.0.5/24".to_string(),
            ],
            mode: CommitMode::CommitAndSave,
        };

        let script = backend.script(&batch);
        let lines: Vec<_> = script.lines().collect();
        assert_eq!(lines[0], "W=/usr/bin/wrapper");
        assert!(lines.contains(&"set -e"));
        let begin = lines.iter().position(|l| *l == "$W begin").unwrap();
        assert_eq!(lines[begin + 1], "$W delete firewall name eth1.in");
        assert_eq!(lines[begin + 2], "$W set interfaces ethernet eth1 address 10.0.0.5/24");
        assert_eq!(lines[begin + 3], "$W commit");
        assert_eq!(lines[begin + 4], "$W save");
        assert_eq!(lines[begin + 5], "$W end");
    }

    #[test]
    fn test_vyatta_script_without_save() {
        let backend = VyattaBackend::default();
        let batch = ConfigBatch {
            commands: vec![],
            mode: CommitMode::Commit,
        };
        assert!(!backend.script(&batch).contains("$W save"));
    }

    #[tokio::test]
    async fn test_memory_backend_fail_next() {
        let backend = MemoryBackend::new();
        let batch = ConfigBatch {
            commands: vec!["set system host-name r1".to_string()],
            mode: CommitMode::Commit,
        };

        backend.fail_next_commit();
        assert!(backend.commit(&batch).await.is_err());
        assert!(backend.commit(&batch).await.is_ok());
        assert_eq!(backend.batches(), vec![batch]);
    }
}

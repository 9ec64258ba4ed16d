//! Integration tests for role transitions and the shared configuration lock

use async_trait::async_trait;
use common::Result;
use configtree::{ConfigTree, MemoryBackend, config_lock};
use ha::{
    HaCoordinator, HaRole, HaSettings, HaStatus, HeartbeatConfig, KeepalivedConfigGenerator,
    KeepalivedControl, KeepalivedPaths, TransitionHandler,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

/// Daemon stand-in that is always alive
#[derive(Default)]
struct FakeKeepalived {
    restarts: AtomicU32,
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

    async fn run_script(&self, _script: &Path) -> Result<()> {
        Ok(())
    }
}

/// Marks the tree so tests can see the handler ran under the lock
#[derive(Default)]
struct TreeMarker {
    roles: Mutex<Vec<HaRole>>,
    fail: AtomicBool,
}

#[async_trait]
impl TransitionHandler for TreeMarker {
    async fn on_role_change(&self, role: HaRole, tree: &mut ConfigTree) -> Result<()> {
        tree.set_value("system ha-role", &role.to_string());
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(common::Error::command("notify script failed"));
        }
        self.roles.lock().unwrap().push(role);
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    paths: KeepalivedPaths,
    coordinator: Arc<HaCoordinator>,
    lock: configtree::ConfigLock,
    backend: Arc<MemoryBackend>,
    handler: Arc<TreeMarker>,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let paths = KeepalivedPaths {
        config_file: dir.path().join("keepalived.conf"),
        script_dir: dir.path().join("scripts"),
        state_file: dir.path().join("state"),
        pid_file: dir.path().join("keepalived.pid"),
    };
    let backend = Arc::new(MemoryBackend::new());
    let lock = config_lock(ConfigTree::new(backend.clone()));
    let handler = Arc::new(TreeMarker::default());
    let coordinator = Arc::new(HaCoordinator::new(
        lock.clone(),
        KeepalivedConfigGenerator::new(paths.clone(), "eth0"),
        Arc::new(FakeKeepalived::default()),
        handler.clone(),
        HaSettings::default(),
    ));

    let heartbeat = HeartbeatConfig {
        interface: "eth2".to_string(),
        local_ip: "10.1.0.2".parse().unwrap(),
        peer_ip: None,
        monitors: vec!["10.0.0.1".to_string()],
        keepalive_interval: 1,
    };
    assert_ok!(coordinator.enable(&heartbeat, &[]).await);

    Fixture {
        _dir: dir,
        paths,
        coordinator,
        lock,
        backend,
        handler,
    }
}

#[tokio::test(start_paused = true)]
async fn test_transition_waits_for_lock_holder() {
    let f = fixture().await;
    let stop = CancellationToken::new();
    let handles = f.coordinator.spawn(stop.clone());

    // A command handler is mid-way through its work
    let guard = f.lock.lock().await;
    std::fs::write(&f.paths.state_file, "MASTER\n").unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(f.coordinator.status().await, HaStatus::Backup);
    assert!(f.handler.roles.lock().unwrap().is_empty());

    drop(guard);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(f.coordinator.status().await, HaStatus::Master);
    assert_eq!(*f.handler.roles.lock().unwrap(), vec![HaRole::Master]);
    let tree = f.lock.lock().await;
    assert_eq!(tree.get("system ha-role").and_then(|n| n.value()), Some("MASTER"));
    // Committed with the transition, not left for the next command
    assert!(!tree.has_pending());
    drop(tree);
    assert_eq!(
        f.backend.batches()[0].commands,
        vec!["set system ha-role MASTER".to_string()]
    );

    stop.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_every_transition_is_applied() {
    let f = fixture().await;
    let stop = CancellationToken::new();
    let handles = f.coordinator.spawn(stop.clone());

    for role in ["MASTER", "BACKUP", "MASTER"] {
        std::fs::write(&f.paths.state_file, role).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    assert_eq!(
        *f.handler.roles.lock().unwrap(),
        vec![HaRole::Master, HaRole::Backup, HaRole::Master]
    );
    let stats = f.coordinator.stats().await;
    assert_eq!(stats.master_transitions, 2);
    assert_eq!(stats.backup_transitions, 1);

    stop.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_loops_stop_on_cancel() {
    let f = fixture().await;
    let stop = CancellationToken::new();
    let handles = f.coordinator.spawn(stop.clone());

    stop.cancel();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}

#[tokio::test]
async fn test_failed_transition_stages_nothing() {
    let f = fixture().await;
    std::fs::write(&f.paths.state_file, "MASTER").unwrap();
    f.handler.fail.store(true, Ordering::SeqCst);

    assert_err!(f.coordinator.poll_once().await);
    assert_eq!(f.coordinator.status().await, HaStatus::Backup);
    {
        let tree = f.lock.lock().await;
        assert!(!tree.has_pending());
        assert!(!tree.contains("system ha-role"));
    }
    assert!(f.backend.batches().is_empty());

    // The retry commits the role in one batch
    assert!(assert_ok!(f.coordinator.poll_once().await));
    assert_eq!(f.backend.batches().len(), 1);
    assert!(!f.lock.lock().await.has_pending());
}

// Integration test: changes under a watched directory replace the process

use std::time::Duration;
use tempfile::TempDir;
use warden::config::{EcosystemFile, SpecStore, SupervisorSettings};
use warden::error::Result;
use warden::process::{HandleSummary, ProcessState, SupervisorHandle, UsageSample, UsageSource};

/// Every process looks small and idle
struct IdleUsage;

impl UsageSource for IdleUsage {
    fn sample(&mut self, _pid: u32) -> Result<UsageSample> {
        Ok(UsageSample {
            memory_bytes: 10 << 20,
            cpu_fraction: 0.0,
        })
    }
}

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        monitor_interval_ms: 20,
        kill_timeout_ms: 500,
        ..SupervisorSettings::default()
    }
}

async fn wait_for<F>(handle: &SupervisorHandle, check: F) -> Vec<HandleSummary>
where
    F: Fn(&[HandleSummary]) -> bool,
{
    for _ in 0..500 {
        let status = handle.status().await.unwrap();
        if check(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {:?}", handle.status().await.unwrap());
}

#[tokio::test]
async fn test_watched_change_restarts_instance() {
    let app_dir = TempDir::new().unwrap();
    let log_dir = TempDir::new().unwrap();

    let json = r#"{ "apps": [
        { "name": "watched", "script": "sleep", "args": "30", "watch": true }
    ] }"#;
    let file = EcosystemFile::from_json_str(json, app_dir.path().to_path_buf()).unwrap();
    let (store, _) = SpecStore::load(&file).unwrap();

    let (handle, task) =
        SupervisorHandle::spawn(store, settings(), log_dir.path().to_path_buf(), IdleUsage);

    let status = wait_for(&handle, |s| {
        s.len() == 1 && s[0].state == ProcessState::Running
    })
    .await;
    let first_pid = status[0].pid.unwrap();

    // let the watcher record its baseline
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(app_dir.path().join("app.conf"), "reloaded = true").unwrap();

    let status = wait_for(&handle, |s| {
        s.len() == 1
            && s[0].state == ProcessState::Running
            && s[0].pid.is_some_and(|pid| pid != first_pid)
    })
    .await;

    assert_eq!(status[0].restart_count, 1);
    assert_eq!(status[0].last_cause.as_deref(), Some("watched files changed"));
    assert_eq!(status[0].alarm, None);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_unwatched_app_ignores_changes() {
    let app_dir = TempDir::new().unwrap();
    let log_dir = TempDir::new().unwrap();

    let json = r#"{ "apps": [
        { "name": "steady", "script": "sleep", "args": "30" }
    ] }"#;
    let file = EcosystemFile::from_json_str(json, app_dir.path().to_path_buf()).unwrap();
    let (store, _) = SpecStore::load(&file).unwrap();

    let (handle, task) =
        SupervisorHandle::spawn(store, settings(), log_dir.path().to_path_buf(), IdleUsage);

    let status = wait_for(&handle, |s| {
        s.len() == 1 && s[0].state == ProcessState::Running
    })
    .await;
    let pid = status[0].pid;

    std::fs::write(app_dir.path().join("app.conf"), "changed").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = handle.status().await.unwrap();
    assert_eq!(status[0].pid, pid);
    assert_eq!(status[0].restart_count, 0);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

use super::*;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const GIB: u64 = 1 << 30;

/// Reports 1.1 GiB for pids marked heavy, 100 MiB for everything else
#[derive(Clone, Default)]
struct FakeUsage {
    heavy: Arc<Mutex<HashSet<u32>>>,
}

impl FakeUsage {
    fn make_heavy(&self, pid: u32) {
        self.heavy.lock().unwrap().insert(pid);
    }
}

impl UsageSource for FakeUsage {
    fn sample(&mut self, pid: u32) -> Result<UsageSample> {
        let memory_bytes = if self.heavy.lock().unwrap().contains(&pid) {
            GIB + (100 << 20)
        } else {
            100 << 20
        };
        Ok(UsageSample {
            memory_bytes,
            cpu_fraction: 0.01,
        })
    }
}

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        monitor_interval_ms: 20,
        restart_delay_ms: 20,
        max_restart_delay_ms: 200,
        max_restarts: 15,
        restart_window_secs: 60,
        min_uptime_ms: 30_000,
        spawn_timeout_ms: 5_000,
        kill_timeout_ms: 500,
    }
}

fn ecosystem(dir: &Path, apps: serde_json::Value) -> EcosystemFile {
    let json = serde_json::json!({ "apps": apps }).to_string();
    EcosystemFile::from_json_str(&json, dir.to_path_buf()).unwrap()
}

fn start(dir: &TempDir, apps: serde_json::Value, source: FakeUsage) -> (SupervisorHandle, JoinHandle<()>) {
    let (store, rejected) = SpecStore::load(&ecosystem(dir.path(), apps)).unwrap();
    assert!(rejected.is_empty());
    SupervisorHandle::spawn(store, settings(), dir.path().join("logs"), source)
}

/// Poll `status()` until `check` accepts it
async fn wait_for<F>(handle: &SupervisorHandle, what: &str, check: F) -> Vec<HandleSummary>
where
    F: Fn(&[HandleSummary]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = handle.status().await.unwrap();
        if check(&status) {
            return status;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {}: {:?}", what, status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn only(status: &[HandleSummary]) -> &HandleSummary {
    assert_eq!(status.len(), 1, "expected one handle: {:?}", status);
    &status[0]
}

fn sleeper(name: &str) -> serde_json::Value {
    serde_json::json!({ "name": name, "script": "sleep", "args": "30", "interpreter": "none" })
}

#[tokio::test]
async fn test_fileship_breach_restarts_once() {
    let dir = TempDir::new().unwrap();
    let usage = FakeUsage::default();
    let (handle, task) = start(
        &dir,
        serde_json::json!([{
            "name": "fileship-srv",
            "script": "sleep",
            "args": "30",
            "interpreter": "none",
            "instances": 1,
            "autorestart": true,
            "watch": false,
            "max_memory_restart": "1G"
        }]),
        usage.clone(),
    );

    let status = wait_for(&handle, "running", |s| {
        s.len() == 1 && s[0].state == ProcessState::Running
    })
    .await;
    let first_pid = only(&status).pid.unwrap();
    usage.make_heavy(first_pid);

    let status = wait_for(&handle, "breach restart", |s| {
        s.len() == 1
            && s[0].state == ProcessState::Running
            && s[0].pid.is_some_and(|pid| pid != first_pid)
    })
    .await;

    let summary = only(&status);
    assert_eq!(summary.restart_count, 1);
    assert!(summary
        .last_cause
        .as_deref()
        .is_some_and(|cause| cause.contains("memory limit")));
    assert_eq!(summary.alarm, None);

    // the replacement stays under the ceiling, so no further restarts
    tokio::time::sleep(Duration::from_millis(150)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(only(&status).restart_count, 1);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_clean_exit_without_autorestart_retires() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(
        &dir,
        serde_json::json!([{ "name": "oneshot", "script": "true", "interpreter": "none", "autorestart": false }]),
        FakeUsage::default(),
    );

    let status = wait_for(&handle, "retired", |s| {
        s.len() == 1 && s[0].state == ProcessState::Retired
    })
    .await;
    let summary = only(&status);
    assert_eq!(summary.restart_count, 0);
    assert_eq!(summary.last_exit, Some(ExitStatus::Code(0)));
    assert_eq!(summary.pid, None);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(only(&status).state, ProcessState::Retired);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_clean_exit_with_autorestart_waits_base_delay_then_stop_retires() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(
        &dir,
        serde_json::json!([{
            "name": "worker",
            "script": "true",
            "interpreter": "none",
            "autorestart": true,
            "restart_delay": 10_000
        }]),
        FakeUsage::default(),
    );

    let status = wait_for(&handle, "restarting", |s| {
        s.len() == 1 && s[0].state == ProcessState::Restarting
    })
    .await;
    let summary = only(&status);
    assert_eq!(summary.restart_count, 1);
    assert_eq!(summary.last_exit, Some(ExitStatus::Code(0)));

    let outcome = handle.stop("worker").await.unwrap();
    assert_eq!(outcome.acted, vec![SlotId::new("worker", 0)]);
    assert_eq!(outcome.exit_code(), exit_code::SUCCESS);

    let status = handle.status().await.unwrap();
    assert_eq!(only(&status).state, ProcessState::Retired);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(only(&status).state, ProcessState::Retired);
    assert_eq!(only(&status).restart_count, 1);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_crash_loop_escalates() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(
        &dir,
        serde_json::json!([{
            "name": "crasher",
            "script": "false",
            "interpreter": "none",
            "max_restarts": 3,
            "restart_delay": 5
        }]),
        FakeUsage::default(),
    );

    let status = wait_for(&handle, "escalation", |s| {
        s.len() == 1 && s[0].state == ProcessState::Retired
    })
    .await;
    let summary = only(&status);
    assert_eq!(summary.restart_count, 3);
    assert_eq!(summary.last_exit, Some(ExitStatus::Code(1)));
    assert!(summary.alarm.is_some());

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_stop_then_start() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(&dir, serde_json::json!([sleeper("api")]), FakeUsage::default());

    wait_for(&handle, "running", |s| {
        s.len() == 1 && s[0].state == ProcessState::Running
    })
    .await;

    handle.stop("api").await.unwrap();
    let status = wait_for(&handle, "stopped", |s| {
        s.len() == 1 && s[0].state == ProcessState::Retired
    })
    .await;
    assert_eq!(only(&status).last_cause.as_deref(), Some("operator request"));
    assert_eq!(only(&status).restart_count, 0);

    let outcome = handle.start("api").await.unwrap();
    assert_eq!(outcome.acted.len(), 1);
    wait_for(&handle, "running again", |s| {
        s.len() == 1 && s[0].state == ProcessState::Running
    })
    .await;

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_restart_replaces_process() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(&dir, serde_json::json!([sleeper("api")]), FakeUsage::default());

    let status = wait_for(&handle, "running", |s| {
        s.len() == 1 && s[0].state == ProcessState::Running
    })
    .await;
    let first_pid = only(&status).pid.unwrap();

    handle.restart("api").await.unwrap();
    let status = wait_for(&handle, "new process", |s| {
        s.len() == 1
            && s[0].state == ProcessState::Running
            && s[0].pid.is_some_and(|pid| pid != first_pid)
    })
    .await;
    assert_eq!(only(&status).restart_count, 0);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_unknown_app() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(&dir, serde_json::json!([sleeper("api")]), FakeUsage::default());

    for result in [
        handle.start("nope").await,
        handle.stop("nope").await,
        handle.restart("nope").await,
    ] {
        let err = result.unwrap_err();
        assert!(matches!(err, WardenError::ProcessNotFound(_)));
        assert_eq!(err.exit_code(), exit_code::NO_SUCH_PROCESS);
    }

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_spawn_failure_does_not_block_other_apps() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(
        &dir,
        serde_json::json!([
            { "name": "ghost", "script": "no-such-program-for-warden", "interpreter": "none", "restart_delay": 10_000 },
            sleeper("api")
        ]),
        FakeUsage::default(),
    );

    let status = wait_for(&handle, "api running", |s| {
        s.iter()
            .any(|h| h.app == "api" && h.state == ProcessState::Running)
    })
    .await;
    let ghost = status.iter().find(|h| h.app == "ghost").unwrap();
    assert_eq!(ghost.state, ProcessState::Restarting);
    assert!(ghost
        .last_cause
        .as_deref()
        .is_some_and(|cause| cause.starts_with("spawn failed")));

    let outcome = handle.restart("ghost").await.unwrap();
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.exit_code(), exit_code::PARTIAL_FAILURE);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_reload_scales_and_removes() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(
        &dir,
        serde_json::json!([sleeper("api"), sleeper("old")]),
        FakeUsage::default(),
    );

    wait_for(&handle, "both running", |s| {
        s.len() == 2 && s.iter().all(|h| h.state == ProcessState::Running)
    })
    .await;

    let mut api = sleeper("api");
    api["instances"] = serde_json::json!(2);
    let outcome = handle
        .reload(ecosystem(dir.path(), serde_json::json!([api])))
        .await
        .unwrap();
    assert_eq!(outcome.changed, vec!["api"]);
    assert_eq!(outcome.removed, vec!["old"]);
    assert_eq!(outcome.exit_code(), exit_code::SUCCESS);

    let status = wait_for(&handle, "scaled", |s| {
        s.len() == 2
            && s.iter()
                .all(|h| h.app == "api" && h.state == ProcessState::Running)
    })
    .await;
    let instances: Vec<u32> = status.iter().map(|h| h.instance).collect();
    assert_eq!(instances, vec![0, 1]);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_reload_reports_rejected_entries() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(&dir, serde_json::json!([sleeper("api")]), FakeUsage::default());

    let outcome = handle
        .reload(ecosystem(
            dir.path(),
            serde_json::json!([sleeper("api"), { "name": "typo", "script": "x", "autorestrat": true }]),
        ))
        .await
        .unwrap();
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].0, "typo");
    assert!(outcome.rejected[0].1.contains("autorestrat"));
    assert_eq!(outcome.exit_code(), exit_code::PARTIAL_FAILURE);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(
        &dir,
        serde_json::json!([sleeper("a"), sleeper("b")]),
        FakeUsage::default(),
    );

    wait_for(&handle, "running", |s| {
        s.len() == 2 && s.iter().all(|h| h.state == ProcessState::Running)
    })
    .await;

    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .unwrap()
        .unwrap();
    task.await.unwrap();

    assert!(matches!(
        handle.status().await,
        Err(WardenError::SupervisorGone)
    ));
}

#[tokio::test]
async fn test_output_is_captured() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(
        &dir,
        serde_json::json!([{
            "name": "talker",
            "script": "echo",
            "args": "hello from talker",
            "interpreter": "none",
            "autorestart": false
        }]),
        FakeUsage::default(),
    );

    wait_for(&handle, "retired", |s| {
        s.len() == 1 && s[0].state == ProcessState::Retired
    })
    .await;

    let log = dir.path().join("logs").join("talker-0-out.log");
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let content = std::fs::read_to_string(&log).unwrap_or_default();
        if content.contains("hello from talker") {
            break;
        }
        assert!(Instant::now() < deadline, "log never written: {:?}", content);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_crash_without_autorestart_still_backs_off() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(
        &dir,
        serde_json::json!([{
            "name": "flaky",
            "script": "false",
            "interpreter": "none",
            "autorestart": false,
            "max_restarts": 2,
            "restart_delay": 5
        }]),
        FakeUsage::default(),
    );

    let status = wait_for(&handle, "escalation", |s| {
        s.len() == 1 && s[0].state == ProcessState::Retired
    })
    .await;
    let summary = only(&status);
    assert_eq!(summary.restart_count, 2);
    assert_eq!(summary.last_exit, Some(ExitStatus::Code(1)));
    assert!(summary.alarm.is_some());

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_breach_restarts_count_toward_cap() {
    let dir = TempDir::new().unwrap();
    let usage = FakeUsage::default();
    let (handle, task) = start(
        &dir,
        serde_json::json!([{
            "name": "hog",
            "script": "sleep",
            "args": "30",
            "interpreter": "none",
            "max_restarts": 2,
            "max_memory_restart": "1G"
        }]),
        usage.clone(),
    );

    let mut seen = HashSet::new();
    for _ in 0..3 {
        let status = wait_for(&handle, "fresh instance", |s| {
            s.len() == 1
                && s[0].state == ProcessState::Running
                && s[0].pid.is_some_and(|pid| !seen.contains(&pid))
        })
        .await;
        let pid = only(&status).pid.unwrap();
        seen.insert(pid);
        usage.make_heavy(pid);
    }

    let status = wait_for(&handle, "escalation", |s| {
        s.len() == 1 && s[0].state == ProcessState::Retired
    })
    .await;
    let summary = only(&status);
    assert_eq!(summary.restart_count, 2);
    assert!(summary.alarm.is_some());
    assert!(summary
        .last_cause
        .as_deref()
        .is_some_and(|cause| cause.contains("memory limit")));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_restart_count_survives_backoff_reset() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(
        &dir,
        serde_json::json!([{
            "name": "steady-crasher",
            "script": "sh",
            "args": ["-c", "sleep 0.3; exit 1"],
            "interpreter": "none",
            "restart_delay": 10,
            "min_uptime": 100
        }]),
        FakeUsage::default(),
    );

    let mut previous = 0;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = handle.status().await.unwrap();
        let summary = only(&status);
        assert!(summary.restart_count >= previous, "restart count went backwards");
        assert_eq!(summary.alarm, None);
        previous = summary.restart_count;
        if previous >= 3 {
            break;
        }
        assert!(Instant::now() < deadline, "only {} restarts: {:?}", previous, status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_shrink_then_grow_keeps_instance_count() {
    let dir = TempDir::new().unwrap();
    let stubborn = |instances: u32| {
        serde_json::json!([{
            "name": "stubborn",
            "script": "sh",
            "args": ["-c", "trap '' TERM; exec sleep 30"],
            "interpreter": "none",
            "instances": instances
        }])
    };
    let (handle, task) = start(&dir, stubborn(2), FakeUsage::default());

    let status = wait_for(&handle, "both running", |s| {
        s.len() == 2 && s.iter().all(|h| h.state == ProcessState::Running)
    })
    .await;
    let second_pid = status[1].pid.unwrap();
    // let the shell install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    handle.reload(ecosystem(dir.path(), stubborn(1))).await.unwrap();
    // instance 1 ignores SIGTERM, so it is still stopping here
    handle.reload(ecosystem(dir.path(), stubborn(2))).await.unwrap();

    let status = wait_for(&handle, "instance 1 replaced", |s| {
        s.len() == 2
            && s.iter().all(|h| h.state == ProcessState::Running)
            && s[1].pid.is_some_and(|pid| pid != second_pid)
    })
    .await;
    let instances: Vec<u32> = status.iter().map(|h| h.instance).collect();
    assert_eq!(instances, vec![0, 1]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.status().await.unwrap().len(), 2);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_spawn_timeout_is_recorded_as_spawn_failure() {
    let dir = TempDir::new().unwrap();
    let (store, _) = SpecStore::load(&ecosystem(dir.path(), serde_json::json!([sleeper("slow")])))
        .unwrap();
    let (events, _receiver) = mpsc::channel(QUEUE_CAPACITY);
    let (snapshot, _snapshot_rx) = watch::channel(MonitorSnapshot::default());
    let mut supervisor = Supervisor {
        store,
        settings: SupervisorSettings {
            max_restarts: 0,
            ..settings()
        },
        log_dir: dir.path().join("logs"),
        slots: BTreeMap::new(),
        events,
        snapshot,
        next_token: 0,
        shutting_down: false,
        shutdown_waiters: Vec::new(),
    };

    let id = SlotId::new("slow", 0);
    supervisor.slots.insert(id.clone(), Slot::new(id.clone()));
    let timed_out = WardenError::TimedOut("spawn of 'slow' after 5000ms".to_string());
    supervisor.on_spawn_failure(&id, &timed_out);

    let status = supervisor.status();
    let summary = only(&status);
    assert_eq!(summary.state, ProcessState::Retired);
    assert_eq!(summary.pid, None);
    assert!(summary.alarm.is_some());
    let cause = summary.last_cause.as_deref().unwrap();
    assert!(cause.starts_with("spawn failed"));
    assert!(cause.contains("timed out"));
}

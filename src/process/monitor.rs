use crate::error::{Result, WardenError};
use crate::process::watch::{scan, PathWatcher};
use crate::process::{SlotId, UsageSample};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Where resource readings come from
pub trait UsageSource: Send + 'static {
    /// Read the current usage of `pid`; `UsageUnavailable` once it is gone
    fn sample(&mut self, pid: u32) -> Result<UsageSample>;
}

/// Usage readings from the operating system via sysinfo
pub struct SysinfoSource {
    system: System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSource for SysinfoSource {
    fn sample(&mut self, pid: u32) -> Result<UsageSample> {
        let sys_pid = Pid::from_u32(pid);

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        let process = self
            .system
            .process(sys_pid)
            .ok_or(WardenError::UsageUnavailable(pid))?;

        Ok(UsageSample {
            memory_bytes: process.memory(),
            // sysinfo reports percent of one core
            cpu_fraction: process.cpu_usage() / 100.0,
        })
    }
}

/// A live process the monitor should sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub slot: SlotId,
    pub generation: u64,
    pub pid: u32,
    /// Only running processes are checked against their ceiling
    pub running: bool,
    pub memory_limit: Option<u64>,
}

/// What the supervisor publishes for the monitor to read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub targets: Vec<WatchTarget>,
    /// Watch paths of every app that has a live instance
    pub watches: BTreeMap<String, BTreeSet<PathBuf>>,
}

/// Reports emitted by the monitor; it never touches handle state itself
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Usage {
        slot: SlotId,
        generation: u64,
        sample: UsageSample,
    },
    Breach {
        slot: SlotId,
        generation: u64,
        memory_bytes: u64,
        limit_bytes: u64,
    },
    FilesChanged {
        app: String,
    },
}

type TargetKey = (SlotId, u64);

/// Periodically samples every live process and reports usage, breaches and file changes
pub struct ResourceMonitor<S: UsageSource> {
    source: S,
    interval: Duration,
    last_known: HashMap<TargetKey, UsageSample>,
    /// Targets currently above their ceiling, already reported
    breached: HashSet<TargetKey>,
    watcher: PathWatcher,
}

impl<S: UsageSource> ResourceMonitor<S> {
    pub fn new(source: S, interval: Duration) -> Self {
        Self {
            source,
            interval,
            last_known: HashMap::new(),
            breached: HashSet::new(),
            watcher: PathWatcher::new(),
        }
    }

    /// Run one sampling pass over the targets of `snapshot`
    pub fn tick(&mut self, snapshot: &MonitorSnapshot) -> Vec<MonitorEvent> {
        let live: HashSet<TargetKey> = snapshot
            .targets
            .iter()
            .map(|t| (t.slot.clone(), t.generation))
            .collect();
        self.last_known.retain(|key, _| live.contains(key));
        self.breached.retain(|key| live.contains(key));

        let mut events = Vec::new();

        for target in &snapshot.targets {
            let key = (target.slot.clone(), target.generation);

            let sample = match self.source.sample(target.pid) {
                Ok(sample) => {
                    self.last_known.insert(key.clone(), sample);
                    sample
                }
                Err(e) => {
                    debug!("{} (pid {}): {}", target.slot, target.pid, e);
                    if let Some(sample) = self.last_known.get(&key) {
                        events.push(MonitorEvent::Usage {
                            slot: target.slot.clone(),
                            generation: target.generation,
                            sample: *sample,
                        });
                    }
                    continue;
                }
            };

            events.push(MonitorEvent::Usage {
                slot: target.slot.clone(),
                generation: target.generation,
                sample,
            });

            let Some(limit) = target.memory_limit else {
                continue;
            };

            if target.running && sample.memory_bytes > limit {
                if self.breached.insert(key) {
                    warn!(
                        slot = %target.slot,
                        memory_bytes = sample.memory_bytes,
                        limit_bytes = limit,
                        "memory limit exceeded"
                    );
                    events.push(MonitorEvent::Breach {
                        slot: target.slot.clone(),
                        generation: target.generation,
                        memory_bytes: sample.memory_bytes,
                        limit_bytes: limit,
                    });
                }
            } else {
                self.breached.remove(&key);
            }
        }

        events
    }

    /// Fingerprint the watch paths on the blocking pool and report changed apps
    pub async fn poll_watches(
        &mut self,
        watches: &BTreeMap<String, BTreeSet<PathBuf>>,
    ) -> Vec<MonitorEvent> {
        let scanned = if watches.is_empty() {
            BTreeMap::new()
        } else {
            let watches = watches.clone();
            match tokio::task::spawn_blocking(move || scan(&watches)).await {
                Ok(scanned) => scanned,
                Err(e) => {
                    warn!("Scanning watch paths failed: {}", e);
                    return Vec::new();
                }
            }
        };

        self.watcher
            .update(scanned)
            .into_iter()
            .map(|app| MonitorEvent::FilesChanged { app })
            .collect()
    }

    /// Sample on every interval until the snapshot publisher or the event queue goes away
    pub async fn run<E>(
        mut self,
        mut snapshots: watch::Receiver<MonitorSnapshot>,
        events: mpsc::Sender<E>,
    ) where
        E: From<MonitorEvent> + Send + 'static,
    {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            if snapshots.has_changed().is_err() {
                debug!("Snapshot publisher gone, resource monitor stopping");
                return;
            }
            let snapshot = snapshots.borrow_and_update().clone();

            let mut batch = self.tick(&snapshot);
            batch.extend(self.poll_watches(&snapshot.watches).await);

            for event in batch {
                if events.send(E::from(event)).await.is_err() {
                    return;
                }
            }
        }
    }
}

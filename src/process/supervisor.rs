use crate::config::{EcosystemFile, SpecStore, SupervisorSettings};
use crate::error::{exit_code, Result, WardenError};
use crate::process::monitor::{
    MonitorEvent, MonitorSnapshot, ResourceMonitor, UsageSource, WatchTarget,
};
use crate::process::restart::{RestartAction, RestartCause, RestartPolicy, RestartTracker};
use crate::process::spawner::{send_signal, spawn_instance};
use crate::process::{
    ExitCause, ExitStatus, HandleSummary, ProcessHandle, ProcessState, SlotId, UsageSample,
};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Capacity of the supervisor's event queue
const QUEUE_CAPACITY: usize = 256;

/// Per-instance result of an operator command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub acted: Vec<SlotId>,
    pub failed: Vec<(SlotId, String)>,
}

impl CommandOutcome {
    /// 0 when every instance was acted on, 3 (partial failure) otherwise
    pub fn exit_code(&self) -> i32 {
        if self.failed.is_empty() {
            exit_code::SUCCESS
        } else {
            exit_code::PARTIAL_FAILURE
        }
    }
}

/// Result of a configuration reload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    /// Entries refused by validation, with the reason
    pub rejected: Vec<(String, String)>,
    /// Instances that could not be spawned while applying the reload
    pub failed: Vec<(SlotId, String)>,
}

impl ReloadOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.rejected.is_empty() && self.failed.is_empty() {
            exit_code::SUCCESS
        } else {
            exit_code::PARTIAL_FAILURE
        }
    }
}

/// Operator requests, answered over a oneshot channel
#[derive(Debug)]
pub enum Request {
    Start {
        name: String,
        reply: oneshot::Sender<Result<CommandOutcome>>,
    },
    Stop {
        name: String,
        reply: oneshot::Sender<Result<CommandOutcome>>,
    },
    Restart {
        name: String,
        reply: oneshot::Sender<Result<CommandOutcome>>,
    },
    Reload {
        file: EcosystemFile,
        reply: oneshot::Sender<Result<ReloadOutcome>>,
    },
    Status {
        reply: oneshot::Sender<Vec<HandleSummary>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Everything the supervisor loop reacts to, in arrival order
#[derive(Debug)]
pub enum Event {
    Request(Request),
    /// The child was still alive right after spawn
    Confirmed { slot: SlotId, generation: u64 },
    Exited {
        slot: SlotId,
        generation: u64,
        status: ExitStatus,
    },
    Monitor(MonitorEvent),
    RestartDue { slot: SlotId, token: u64 },
    /// Grace period after the stop signal ran out
    StopTimeout { slot: SlotId, generation: u64 },
}

impl From<MonitorEvent> for Event {
    fn from(event: MonitorEvent) -> Self {
        Event::Monitor(event)
    }
}

/// Why the supervisor itself is ending the current process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Stop,
    /// Stop, then forget the slot
    Remove,
    Restart,
    Breach { memory_bytes: u64, limit_bytes: u64 },
    Watch,
}

#[derive(Debug)]
struct PendingRestart {
    token: u64,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct Slot {
    handle: ProcessHandle,
    tracker: RestartTracker,
    intent: Option<Intent>,
    pending: Option<PendingRestart>,
}

impl Slot {
    fn new(id: SlotId) -> Self {
        Self {
            handle: ProcessHandle::new(id),
            tracker: RestartTracker::new(),
            intent: None,
            pending: None,
        }
    }

    /// Start the lineage over, as after a manual restart
    fn reset_lineage(&mut self) {
        self.handle.restart_count = 0;
        self.handle.alarm = None;
        self.tracker.reset();
        self.intent = None;
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
    }
}

fn transition(handle: &mut ProcessHandle, next: ProcessState, cause: &str) {
    if let Err(e) = handle.transition(next, cause) {
        error!("{}", e);
    }
}

/// Cloneable front door to a running supervisor loop
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    events: mpsc::Sender<Event>,
}

impl SupervisorHandle {
    /// Start the supervisor loop and its resource monitor, then launch every app in `store`
    ///
    /// # Arguments
    /// * `store` - Validated specs to supervise
    /// * `settings` - Global timing and restart settings
    /// * `log_dir` - Directory receiving captured output
    /// * `source` - Where the monitor reads resource usage from
    ///
    /// # Returns
    /// The handle plus the loop's task, which ends after `shutdown`
    pub fn spawn<S: UsageSource>(
        store: SpecStore,
        settings: SupervisorSettings,
        log_dir: PathBuf,
        source: S,
    ) -> (Self, JoinHandle<()>) {
        let (events, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let (snapshot, snapshot_rx) = watch::channel(MonitorSnapshot::default());

        let monitor = ResourceMonitor::new(source, settings.monitor_interval());
        tokio::spawn(monitor.run(snapshot_rx, events.clone()));

        let supervisor = Supervisor {
            store,
            settings,
            log_dir,
            slots: BTreeMap::new(),
            events: events.clone(),
            snapshot,
            next_token: 0,
            shutting_down: false,
            shutdown_waiters: Vec::new(),
        };
        let task = tokio::spawn(supervisor.run(receiver));

        (Self { events }, task)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(Event::Request(build(reply)))
            .await
            .map_err(|_| WardenError::SupervisorGone)?;
        response.await.map_err(|_| WardenError::SupervisorGone)
    }

    pub async fn start(&self, name: &str) -> Result<CommandOutcome> {
        let name = name.to_string();
        self.request(|reply| Request::Start { name, reply }).await?
    }

    pub async fn stop(&self, name: &str) -> Result<CommandOutcome> {
        let name = name.to_string();
        self.request(|reply| Request::Stop { name, reply }).await?
    }

    pub async fn restart(&self, name: &str) -> Result<CommandOutcome> {
        let name = name.to_string();
        self.request(|reply| Request::Restart { name, reply }).await?
    }

    pub async fn reload(&self, file: EcosystemFile) -> Result<ReloadOutcome> {
        self.request(|reply| Request::Reload { file, reply }).await?
    }

    pub async fn status(&self) -> Result<Vec<HandleSummary>> {
        self.request(|reply| Request::Status { reply }).await
    }

    /// Stop every instance and wait until the loop has let go of all of them
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Request::Shutdown { reply }).await
    }
}

/// The control loop: sole owner of the slot map
struct Supervisor {
    store: SpecStore,
    settings: SupervisorSettings,
    log_dir: PathBuf,
    slots: BTreeMap<SlotId, Slot>,
    /// Fed to waiter and timer tasks so their results come back through the queue
    events: mpsc::Sender<Event>,
    snapshot: watch::Sender<MonitorSnapshot>,
    next_token: u64,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl Supervisor {
    async fn run(mut self, mut receiver: mpsc::Receiver<Event>) {
        info!("Supervisor started with {} app(s)", self.store.len());

        let names: Vec<String> = self.store.iter().map(|spec| spec.name.clone()).collect();
        for name in names {
            if let Ok(outcome) = self.start_app(&name).await {
                for (slot, reason) in &outcome.failed {
                    error!("Failed to start {}: {}", slot, reason);
                }
            }
        }
        self.publish();

        while let Some(event) = receiver.recv().await {
            self.handle_event(event).await;
            self.publish();

            if self.shutting_down && self.finish_shutdown() {
                break;
            }
        }

        info!("Supervisor stopped");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Request(request) => self.handle_request(request).await,
            Event::Confirmed { slot, generation } => self.on_confirmed(&slot, generation),
            Event::Exited {
                slot,
                generation,
                status,
            } => self.on_exit(&slot, generation, status),
            Event::Monitor(MonitorEvent::Usage {
                slot,
                generation,
                sample,
            }) => self.on_usage(&slot, generation, sample),
            Event::Monitor(MonitorEvent::Breach {
                slot,
                generation,
                memory_bytes,
                limit_bytes,
            }) => self.on_breach(&slot, generation, memory_bytes, limit_bytes),
            Event::Monitor(MonitorEvent::FilesChanged { app }) => self.on_files_changed(&app),
            Event::RestartDue { slot, token } => self.on_restart_due(&slot, token).await,
            Event::StopTimeout { slot, generation } => self.on_stop_timeout(&slot, generation),
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Start { name, reply } => {
                let result = if self.shutting_down {
                    Err(WardenError::SupervisorGone)
                } else {
                    self.start_app(&name).await
                };
                let _ = reply.send(result);
            }
            Request::Stop { name, reply } => {
                let _ = reply.send(self.stop_app(&name));
            }
            Request::Restart { name, reply } => {
                let result = if self.shutting_down {
                    Err(WardenError::SupervisorGone)
                } else {
                    self.restart_app(&name).await
                };
                let _ = reply.send(result);
            }
            Request::Reload { file, reply } => {
                let result = if self.shutting_down {
                    Err(WardenError::SupervisorGone)
                } else {
                    self.reload(file).await
                };
                let _ = reply.send(result);
            }
            Request::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Request::Shutdown { reply } => {
                self.shutdown_waiters.push(reply);
                self.begin_shutdown();
            }
        }
    }

    // --- operator commands ---

    async fn start_app(&mut self, name: &str) -> Result<CommandOutcome> {
        let instances = self
            .store
            .get(name)
            .map(|spec| spec.instances)
            .ok_or_else(|| WardenError::ProcessNotFound(name.to_string()))?;

        let mut outcome = CommandOutcome::default();
        for instance in 0..instances {
            let id = SlotId::new(name, instance);
            match self.slots.get_mut(&id) {
                None => {
                    self.slots.insert(id.clone(), Slot::new(id.clone()));
                    self.launch(&id, &mut outcome).await;
                }
                Some(slot) if slot.handle.state == ProcessState::Retired => {
                    slot.reset_lineage();
                    transition(&mut slot.handle, ProcessState::Starting, "started by operator");
                    self.launch(&id, &mut outcome).await;
                }
                Some(_) => outcome.acted.push(id),
            }
        }

        Ok(outcome)
    }

    fn stop_app(&mut self, name: &str) -> Result<CommandOutcome> {
        let ids = self.app_slots(name);
        if ids.is_empty() && !self.store.contains(name) {
            return Err(WardenError::ProcessNotFound(name.to_string()));
        }

        let mut outcome = CommandOutcome::default();
        for id in ids {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            match slot.handle.state {
                ProcessState::Starting | ProcessState::Running => {
                    if slot.intent != Some(Intent::Remove) {
                        slot.intent = Some(Intent::Stop);
                    }
                    self.terminate(&id);
                }
                ProcessState::Restarting => self.retire(&id, "stopped by operator"),
                _ => {}
            }
            outcome.acted.push(id);
        }

        Ok(outcome)
    }

    async fn restart_app(&mut self, name: &str) -> Result<CommandOutcome> {
        let instances = self
            .store
            .get(name)
            .map(|spec| spec.instances)
            .ok_or_else(|| WardenError::ProcessNotFound(name.to_string()))?;

        let mut outcome = CommandOutcome::default();
        for instance in 0..instances {
            let id = SlotId::new(name, instance);
            if !self.slots.contains_key(&id) {
                self.slots.insert(id.clone(), Slot::new(id.clone()));
                self.launch(&id, &mut outcome).await;
                continue;
            }
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };

            slot.reset_lineage();
            match slot.handle.state {
                ProcessState::Starting | ProcessState::Running => {
                    slot.intent = Some(Intent::Restart);
                    self.terminate(&id);
                    outcome.acted.push(id);
                }
                ProcessState::Restarting | ProcessState::Retired => {
                    slot.cancel_pending();
                    transition(&mut slot.handle, ProcessState::Starting, "restarted by operator");
                    self.launch(&id, &mut outcome).await;
                }
                ProcessState::Exited | ProcessState::Killed => {}
            }
        }

        Ok(outcome)
    }

    async fn reload(&mut self, file: EcosystemFile) -> Result<ReloadOutcome> {
        let (diff, rejected) = self.store.reload(&file)?;

        let mut outcome = ReloadOutcome {
            rejected: rejected
                .iter()
                .map(|r| (r.label.clone(), r.error.to_string()))
                .collect(),
            ..ReloadOutcome::default()
        };

        for name in &diff.removed {
            for id in self.app_slots(name) {
                self.remove_slot(&id);
            }
        }

        for name in &diff.added {
            if let Ok(started) = self.start_app(name).await {
                outcome.failed.extend(started.failed);
            }
        }

        for name in &diff.changed {
            let mut scaled = CommandOutcome::default();
            self.scale(name, &mut scaled).await;
            outcome.failed.extend(scaled.failed);
        }

        outcome.added = diff.added;
        outcome.removed = diff.removed;
        outcome.changed = diff.changed;
        Ok(outcome)
    }

    fn status(&self) -> Vec<HandleSummary> {
        self.slots.values().map(|slot| slot.handle.summary()).collect()
    }

    fn begin_shutdown(&mut self) {
        if !self.shutting_down {
            info!("Supervisor shutting down, stopping {} slot(s)", self.slots.len());
        }
        self.shutting_down = true;

        let ids: Vec<SlotId> = self.slots.keys().cloned().collect();
        for id in ids {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            match slot.handle.state {
                ProcessState::Starting | ProcessState::Running => {
                    if slot.intent.is_none() {
                        slot.intent = Some(Intent::Stop);
                        self.terminate(&id);
                    }
                }
                ProcessState::Restarting => self.retire(&id, "supervisor shutting down"),
                _ => {}
            }
        }
    }

    /// Answer shutdown waiters once no process is left; true when the loop should end
    fn finish_shutdown(&mut self) -> bool {
        if self.slots.values().any(|slot| slot.handle.state.has_live_pid()) {
            return false;
        }
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        true
    }

    // --- slot lifecycle ---

    async fn launch(&mut self, id: &SlotId, outcome: &mut CommandOutcome) {
        match self.spawn_slot(id).await {
            Ok(()) => outcome.acted.push(id.clone()),
            Err(e) => outcome.failed.push((id.clone(), e.to_string())),
        }
    }

    /// Spawn the process for a slot already in `Starting`
    async fn spawn_slot(&mut self, id: &SlotId) -> Result<()> {
        let result = match self.store.get(&id.app) {
            Some(spec) => {
                spawn_instance(spec, id.instance, &self.log_dir, self.settings.spawn_timeout())
                    .await
            }
            None => Err(WardenError::ProcessNotFound(id.app.clone())),
        };

        match result {
            Ok(spawned) => {
                if let Some(slot) = self.slots.get_mut(id) {
                    slot.handle.pid = Some(spawned.pid);
                    slot.handle.started_at = Some(SystemTime::now());
                    info!(
                        slot = %id,
                        pid = spawned.pid,
                        generation = slot.handle.generation,
                        "process spawned"
                    );
                    let generation = slot.handle.generation;
                    self.watch_child(id.clone(), generation, spawned.child);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Failed to spawn {}: {}", id, e);
                self.on_spawn_failure(id, &e);
                Err(e)
            }
        }
    }

    /// Wait for the child on its own task and report back through the queue
    fn watch_child(&self, slot: SlotId, generation: u64, mut child: Child) {
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Ok(None) = child.try_wait() {
                let confirmed = Event::Confirmed {
                    slot: slot.clone(),
                    generation,
                };
                let _ = events.send(confirmed).await;
            }

            let status = match child.wait().await {
                Ok(status) => ExitStatus::from(status),
                Err(e) => {
                    warn!("Failed to wait for {}: {}", slot, e);
                    ExitStatus::Code(-1)
                }
            };

            let _ = events
                .send(Event::Exited {
                    slot,
                    generation,
                    status,
                })
                .await;
        });
    }

    /// Send the stop signal and arm the kill timer
    fn terminate(&self, id: &SlotId) {
        let Some(slot) = self.slots.get(id) else {
            return;
        };
        let Some(pid) = slot.handle.signalable_pid() else {
            return;
        };

        if let Err(e) = send_signal(pid, Signal::SIGTERM) {
            // the exit notification is already on its way
            warn!("{}", e);
        }

        let grace = self
            .store
            .get(&id.app)
            .map(|spec| spec.kill_timeout(&self.settings))
            .unwrap_or(Duration::from_millis(self.settings.kill_timeout_ms));
        let events = self.events.clone();
        let timeout = Event::StopTimeout {
            slot: id.clone(),
            generation: slot.handle.generation,
        };
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(timeout).await;
        });
    }

    fn retire(&mut self, id: &SlotId, cause: &str) {
        if let Some(slot) = self.slots.get_mut(id) {
            slot.cancel_pending();
            slot.intent = None;
            transition(&mut slot.handle, ProcessState::Retired, cause);
        }
    }

    fn schedule_restart(&mut self, id: &SlotId, delay: Duration, cause: &str) {
        let token = self.next_token;
        self.next_token += 1;

        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        transition(&mut slot.handle, ProcessState::Restarting, cause);
        slot.intent = None;

        let events = self.events.clone();
        let target = id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events
                .send(Event::RestartDue {
                    slot: target,
                    token,
                })
                .await;
        });

        slot.cancel_pending();
        slot.pending = Some(PendingRestart { token, task });
    }

    /// Stop and forget a slot, waiting for its process first if it has one
    fn remove_slot(&mut self, id: &SlotId) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        if slot.handle.state.has_live_pid() {
            slot.intent = Some(Intent::Remove);
            self.terminate(id);
        } else {
            if slot.handle.state == ProcessState::Restarting {
                self.retire(id, "removed from configuration");
            }
            self.slots.remove(id);
            info!(slot = %id, "slot removed");
        }
    }

    /// Bring an app's slot count in line with its `instances`
    async fn scale(&mut self, name: &str, outcome: &mut CommandOutcome) {
        let Some(instances) = self.store.get(name).map(|spec| spec.instances) else {
            return;
        };

        let existing = self.app_slots(name);
        for id in existing.iter().filter(|id| id.instance >= instances) {
            self.remove_slot(id);
        }

        // a stopped app stays stopped
        let active = existing.is_empty()
            || existing.iter().any(|id| {
                self.slots
                    .get(id)
                    .is_some_and(|slot| slot.handle.state != ProcessState::Retired)
            });
        if !active {
            return;
        }

        for instance in 0..instances {
            let id = SlotId::new(name, instance);
            match self.slots.get_mut(&id) {
                None => {
                    info!(slot = %id, "scaling up");
                    self.slots.insert(id.clone(), Slot::new(id.clone()));
                    self.launch(&id, outcome).await;
                }
                // still stopping from an earlier scale-down: respawn once it exits
                Some(slot) if slot.intent == Some(Intent::Remove) => {
                    info!(slot = %id, "scaling up, keeping the stopping slot");
                    slot.intent = Some(Intent::Restart);
                    outcome.acted.push(id);
                }
                Some(_) => {}
            }
        }
    }

    // --- events ---

    fn on_confirmed(&mut self, id: &SlotId, generation: u64) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        if slot.handle.generation == generation && slot.handle.state == ProcessState::Starting {
            transition(&mut slot.handle, ProcessState::Running, "pid confirmed live");
        }
    }

    fn on_exit(&mut self, id: &SlotId, generation: u64, status: ExitStatus) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        if slot.handle.generation != generation || !slot.handle.state.has_live_pid() {
            debug!(slot = %id, generation, "discarding stale exit");
            return;
        }

        let uptime = slot.handle.uptime();
        let intent = slot.intent.take();

        let (state, cause, restart_cause) = match (intent, status) {
            (
                Some(Intent::Breach {
                    memory_bytes,
                    limit_bytes,
                }),
                _,
            ) => (
                ProcessState::Killed,
                ExitCause::MemoryLimit {
                    memory_bytes,
                    limit_bytes,
                },
                RestartCause::Breach,
            ),
            (Some(Intent::Watch), _) => (
                ProcessState::Killed,
                ExitCause::FilesChanged,
                RestartCause::Killed,
            ),
            (Some(_), _) => (ProcessState::Killed, ExitCause::Operator, RestartCause::Killed),
            (None, ExitStatus::Signal(_)) => (
                ProcessState::Killed,
                ExitCause::Signaled(status),
                RestartCause::Killed,
            ),
            (None, ExitStatus::Code(code)) => (
                ProcessState::Exited,
                ExitCause::Exited(status),
                RestartCause::Exited { code: Some(code) },
            ),
        };

        let reason = cause.to_string();
        slot.handle.last_exit = Some(status);
        slot.handle.last_cause = Some(cause);
        transition(&mut slot.handle, state, &reason);

        self.after_exit(id, intent, restart_cause, uptime);
    }

    fn on_spawn_failure(&mut self, id: &SlotId, error: &WardenError) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let intent = slot.intent.take();
        let cause = ExitCause::SpawnFailed(error.to_string());
        let reason = cause.to_string();
        slot.handle.last_exit = None;
        slot.handle.last_cause = Some(cause);
        transition(&mut slot.handle, ProcessState::Exited, &reason);

        self.after_exit(id, intent, RestartCause::Exited { code: None }, None);
    }

    /// Route a handle that just left `Starting`/`Running`
    fn after_exit(
        &mut self,
        id: &SlotId,
        intent: Option<Intent>,
        cause: RestartCause,
        uptime: Option<Duration>,
    ) {
        if self.shutting_down {
            self.retire(id, "supervisor shutting down");
            return;
        }

        match intent {
            Some(Intent::Stop) => self.retire(id, "stopped by operator"),
            Some(Intent::Remove) => {
                self.retire(id, "removed from configuration");
                self.slots.remove(id);
                info!(slot = %id, "slot removed");
            }
            Some(Intent::Restart) => {
                self.schedule_restart(id, Duration::ZERO, "restart requested by operator")
            }
            Some(Intent::Watch) => {
                if let Some(slot) = self.slots.get_mut(id) {
                    slot.handle.restart_count += 1;
                }
                self.schedule_restart(id, Duration::ZERO, "watched files changed");
            }
            Some(Intent::Breach { .. }) => self.consult_policy(id, RestartCause::Breach, uptime),
            None => self.consult_policy(id, cause, uptime),
        }
    }

    fn consult_policy(&mut self, id: &SlotId, cause: RestartCause, uptime: Option<Duration>) {
        let Some(policy) = self
            .store
            .get(&id.app)
            .map(|spec| RestartPolicy::new(&self.settings, spec))
        else {
            self.retire(id, "app no longer configured");
            return;
        };
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };

        let decision = policy.decide(&mut slot.tracker, cause, uptime, Instant::now());
        match decision.action {
            RestartAction::Stop => self.retire(id, "autorestart disabled"),
            RestartAction::Escalate => {
                let alarm = format!(
                    "{} ({} restarts within {}s)",
                    WardenError::Escalated(id.to_string()),
                    policy.max_restarts,
                    policy.window.as_secs()
                );
                error!(slot = %id, "{}", alarm);
                slot.handle.alarm = Some(alarm);
                self.retire(id, "restart limit exceeded");
            }
            RestartAction::Restart => {
                slot.handle.restart_count += 1;
                let cause = format!("restart in {}ms", decision.delay.as_millis());
                self.schedule_restart(id, decision.delay, &cause);
            }
        }
    }

    async fn on_restart_due(&mut self, id: &SlotId, token: u64) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let current = slot.pending.as_ref().map(|pending| pending.token);
        if slot.handle.state != ProcessState::Restarting || current != Some(token) {
            debug!(slot = %id, token, "discarding stale restart timer");
            return;
        }

        slot.pending = None;
        transition(&mut slot.handle, ProcessState::Starting, "restart delay elapsed");
        let _ = self.spawn_slot(id).await;
    }

    fn on_usage(&mut self, id: &SlotId, generation: u64, sample: UsageSample) {
        if let Some(slot) = self.slots.get_mut(id) {
            if slot.handle.generation == generation && slot.handle.state.has_live_pid() {
                slot.handle.usage = sample;
            }
        }
    }

    fn on_breach(&mut self, id: &SlotId, generation: u64, memory_bytes: u64, limit_bytes: u64) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        if slot.handle.generation != generation
            || slot.handle.state != ProcessState::Running
            || slot.intent.is_some()
        {
            return;
        }

        warn!(
            slot = %id,
            memory_bytes,
            limit_bytes,
            "memory limit exceeded, restarting"
        );
        slot.intent = Some(Intent::Breach {
            memory_bytes,
            limit_bytes,
        });
        self.terminate(id);
    }

    fn on_files_changed(&mut self, app: &str) {
        for id in self.app_slots(app) {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            if slot.handle.state.has_live_pid() && slot.intent.is_none() {
                info!(slot = %id, "watched files changed, restarting");
                slot.intent = Some(Intent::Watch);
                self.terminate(&id);
            }
        }
    }

    fn on_stop_timeout(&mut self, id: &SlotId, generation: u64) {
        let Some(slot) = self.slots.get(id) else {
            return;
        };
        if slot.handle.generation != generation {
            return;
        }
        if let Some(pid) = slot.handle.signalable_pid() {
            warn!(slot = %id, pid, "process ignored SIGTERM, sending SIGKILL");
            if let Err(e) = send_signal(pid, Signal::SIGKILL) {
                warn!("{}", e);
            }
        }
    }

    // --- helpers ---

    fn app_slots(&self, app: &str) -> Vec<SlotId> {
        self.slots
            .keys()
            .filter(|id| id.app == app)
            .cloned()
            .collect()
    }

    /// Publish the live processes and their watch paths for the monitor
    fn publish(&self) {
        let targets: Vec<WatchTarget> = self
            .slots
            .values()
            .filter_map(|slot| {
                let pid = slot.handle.signalable_pid()?;
                Some(WatchTarget {
                    slot: slot.handle.slot.clone(),
                    generation: slot.handle.generation,
                    pid,
                    running: slot.handle.state == ProcessState::Running,
                    memory_limit: self
                        .store
                        .get(&slot.handle.slot.app)
                        .and_then(|spec| spec.max_memory_bytes),
                })
            })
            .collect();

        let watches = self
            .store
            .iter()
            .filter(|spec| {
                !spec.watch_paths.is_empty() && targets.iter().any(|t| t.slot.app == spec.name)
            })
            .map(|spec| (spec.name.clone(), spec.watch_paths.clone()))
            .collect();

        let next = MonitorSnapshot { targets, watches };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests;

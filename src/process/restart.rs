use crate::config::{ProcessSpec, SupervisorSettings};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// What ended the process, as seen by the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    /// Exited on its own; `None` when the spawn itself failed
    Exited { code: Option<i32> },
    /// Ended by a signal nobody in the supervisor asked for
    Killed,
    /// Stopped by the supervisor for exceeding its memory ceiling
    Breach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartAction {
    Restart,
    Stop,
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartDecision {
    pub action: RestartAction,
    pub delay: Duration,
}

impl RestartDecision {
    fn stop() -> Self {
        Self {
            action: RestartAction::Stop,
            delay: Duration::ZERO,
        }
    }

    fn escalate() -> Self {
        Self {
            action: RestartAction::Escalate,
            delay: Duration::ZERO,
        }
    }

    fn restart(delay: Duration) -> Self {
        Self {
            action: RestartAction::Restart,
            delay,
        }
    }
}

/// Restart policy of one app: global settings with the app's overrides applied
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub autorestart: bool,
    /// Base delay of the exponential backoff
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Restarts allowed inside `window` before escalating
    pub max_restarts: u32,
    pub window: Duration,
    /// Running time after which the backoff exponent resets
    pub stability: Duration,
}

impl RestartPolicy {
    pub fn new(settings: &SupervisorSettings, spec: &ProcessSpec) -> Self {
        let base_delay = spec.restart_delay_ms.unwrap_or(settings.restart_delay_ms);
        Self {
            autorestart: spec.autorestart,
            base_delay: Duration::from_millis(base_delay),
            max_delay: Duration::from_millis(settings.max_restart_delay_ms.max(base_delay)),
            max_restarts: spec.max_restarts.unwrap_or(settings.max_restarts),
            window: Duration::from_secs(settings.restart_window_secs),
            stability: Duration::from_millis(spec.min_uptime_ms.unwrap_or(settings.min_uptime_ms)),
        }
    }

    /// `min(base * 2^n, max_delay)`
    pub fn backoff(&self, exponent: u32) -> Duration {
        let factor = 2_u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide what happens after a process ended
    ///
    /// # Arguments
    /// * `tracker` - Restart history of the slot, updated when a restart is granted
    /// * `cause` - Why the process ended
    /// * `uptime` - How long it had been confirmed running, if at all
    /// * `now` - Current time, injected for deterministic tests
    pub fn decide(
        &self,
        tracker: &mut RestartTracker,
        cause: RestartCause,
        uptime: Option<Duration>,
        now: Instant,
    ) -> RestartDecision {
        if uptime.is_some_and(|up| up >= self.stability) {
            tracker.consecutive = 0;
        }

        if !self.autorestart && matches!(cause, RestartCause::Exited { code: Some(0) }) {
            return RestartDecision::stop();
        }

        tracker.prune(now, self.window);
        if tracker.recent_restarts() >= self.max_restarts as usize {
            return RestartDecision::escalate();
        }

        tracker.record(now);

        match cause {
            RestartCause::Breach => RestartDecision::restart(Duration::ZERO),
            RestartCause::Exited { .. } | RestartCause::Killed => {
                let delay = self.backoff(tracker.consecutive);
                tracker.consecutive = tracker.consecutive.saturating_add(1);
                RestartDecision::restart(delay)
            }
        }
    }
}

/// Restart history of one slot
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    restarts: VecDeque<Instant>,
    /// Backoff exponent: failures since the last stable run
    consecutive: u32,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, at: Instant) {
        self.restarts.push_back(at);
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.restarts.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Restarts recorded inside the window as of the last decision
    pub fn recent_restarts(&self) -> usize {
        self.restarts.len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    /// Forget all history (manual restart)
    pub fn reset(&mut self) {
        self.restarts.clear();
        self.consecutive = 0;
    }
}

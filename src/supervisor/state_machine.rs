//! Supervisor lifecycle
//!
//! STARTING -> RUNNING -> {STALLED, MAINTENANCE, CRASHED} -> RESTARTING -> RUNNING,
//! with SHUTDOWN reachable from every state and terminal.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Starting,
    Running,
    Stalled,
    Maintenance,
    Crashed,
    Restarting,
    Shutdown,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Starting => write!(f, "STARTING"),
            LifecycleState::Running => write!(f, "RUNNING"),
            LifecycleState::Stalled => write!(f, "STALLED"),
            LifecycleState::Maintenance => write!(f, "MAINTENANCE"),
            LifecycleState::Crashed => write!(f, "CRASHED"),
            LifecycleState::Restarting => write!(f, "RESTARTING"),
            LifecycleState::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub timestamp: i64,
    pub reason: String,
}

/// Exponential restart delay: `base * 2^(failures - 1)`, capped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the restart that follows the `failures`-th consecutive failure
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Pure lifecycle bookkeeping, no I/O
pub struct SupervisorMachine {
    current: LifecycleState,
    entered_at: Instant,
    consecutive_failures: u32,
    backoff: BackoffPolicy,
    history: Vec<Transition>,
    max_history: usize,
}

impl SupervisorMachine {
    pub fn new(backoff: BackoffPolicy, consecutive_failures: u32) -> Self {
        Self {
            current: LifecycleState::Starting,
            entered_at: Instant::now(),
            consecutive_failures,
            backoff,
            history: Vec::new(),
            max_history: 100,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.current
    }

    pub fn time_in_state(&self) -> Duration {
        self.entered_at.elapsed()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self.current, target) {
            (Shutdown, _) => false,
            (_, Shutdown) => true,

            (Starting, Running) => true,
            (Starting, Crashed) => true,

            (Running, Stalled) => true,
            (Running, Maintenance) => true,
            (Running, Crashed) => true,

            (Stalled, Restarting) => true,
            (Maintenance, Restarting) => true,
            (Crashed, Restarting) => true,

            (Restarting, Running) => true,
            (Restarting, Crashed) => true,

            _ => false,
        }
    }

    /// Move to `target`; an illegal move is logged and refused
    pub fn transition_to(&mut self, target: LifecycleState, reason: impl Into<String>) -> bool {
        let reason = reason.into();

        if !self.can_transition_to(target) {
            warn!("Invalid supervisor transition: {} -> {} ({})", self.current, target, reason);
            return false;
        }

        info!("Supervisor: {} -> {} ({})", self.current, target, reason);

        self.history.push(Transition {
            from: self.current,
            to: target,
            timestamp: chrono::Utc::now().timestamp_millis(),
            reason,
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        self.current = target;
        self.entered_at = Instant::now();
        true
    }

    /// Count a crash or stall and return how long to wait before restarting
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.backoff.delay(self.consecutive_failures)
    }

    /// A RUNNING stretch of at least `healthy_for` clears the failure counter
    pub fn note_healthy(&mut self, healthy_for: Duration) -> bool {
        if self.current == LifecycleState::Running
            && self.consecutive_failures > 0
            && self.time_in_state() >= healthy_for
        {
            info!(
                "Healthy for {:?}, resetting failure count ({})",
                healthy_for, self.consecutive_failures
            );
            self.consecutive_failures = 0;
            return true;
        }
        false
    }

    pub fn is_terminal(&self) -> bool {
        self.current == LifecycleState::Shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(300))
    }

    #[test]
    fn test_backoff_strictly_increases_until_cap() {
        let policy = policy();
        let delays: Vec<u64> = (1..=10).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300, 300, 300]);
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut machine = SupervisorMachine::new(policy(), 0);
        assert_eq!(machine.state(), LifecycleState::Starting);

        assert!(machine.transition_to(LifecycleState::Running, "worker started"));
        assert!(machine.transition_to(LifecycleState::Crashed, "worker exited"));
        assert!(machine.transition_to(LifecycleState::Restarting, "backoff elapsed"));
        assert!(machine.transition_to(LifecycleState::Running, "worker started"));
        assert!(machine.transition_to(LifecycleState::Maintenance, "market closed"));
        assert!(machine.transition_to(LifecycleState::Restarting, "market open"));
        assert!(machine.transition_to(LifecycleState::Running, "worker started"));
        assert!(machine.transition_to(LifecycleState::Shutdown, "stop requested"));

        assert!(machine.is_terminal());
        assert_eq!(machine.history().len(), 8);
    }

    #[test]
    fn test_invalid_transitions_refused() {
        let mut machine = SupervisorMachine::new(policy(), 0);
        assert!(!machine.transition_to(LifecycleState::Stalled, "not running yet"));
        assert!(!machine.transition_to(LifecycleState::Starting, "same"));

        machine.transition_to(LifecycleState::Running, "up");
        assert!(!machine.transition_to(LifecycleState::Restarting, "skip failure state"));

        machine.transition_to(LifecycleState::Shutdown, "stop");
        assert!(!machine.transition_to(LifecycleState::Running, "after shutdown"));
        assert_eq!(machine.state(), LifecycleState::Shutdown);
    }

    #[test]
    fn test_record_failure_escalates() {
        let mut machine = SupervisorMachine::new(policy(), 0);
        assert_eq!(machine.record_failure(), Duration::from_secs(5));
        assert_eq!(machine.record_failure(), Duration::from_secs(10));
        assert_eq!(machine.record_failure(), Duration::from_secs(20));
        assert_eq!(machine.consecutive_failures(), 3);
    }

    #[test]
    fn test_failures_resume_from_persisted_count() {
        let mut machine = SupervisorMachine::new(policy(), 3);
        assert_eq!(machine.record_failure(), Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_running_resets_counter() {
        let mut machine = SupervisorMachine::new(policy(), 0);
        machine.record_failure();
        machine.record_failure();
        machine.transition_to(LifecycleState::Running, "up");

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(!machine.note_healthy(Duration::from_secs(600)));
        assert_eq!(machine.consecutive_failures(), 2);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(machine.note_healthy(Duration::from_secs(600)));
        assert_eq!(machine.consecutive_failures(), 0);
    }
}

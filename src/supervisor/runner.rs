use super::heartbeat::Heartbeat;
use super::state_machine::{BackoffPolicy, LifecycleState, SupervisorMachine};
use crate::broker::Broker;
use crate::config::SupervisorConfig;
use crate::error::{ConnectivityError, TraderError};
use crate::notify::{self, Notifier};
use crate::persistence::{StateStore, SupervisorState};
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};

pub type WorkerHandle = JoinHandle<Result<()>>;

/// Transitions logged when the restart limit gives up
const RECENT_TRANSITIONS: usize = 6;

/// Progress the worker needs on disk before it may act on it
///
/// The supervisor saves it and answers on `ack`: `true` once the save succeeded.
#[derive(Debug)]
pub struct Checkpoint {
    pub last_processed_candle: i64,
    pub signal_extreme: i64,
    pub ack: oneshot::Sender<bool>,
}

/// What a freshly launched worker starts from
pub struct WorkerContext {
    /// Candles at or before this timestamp must not be evaluated
    pub resume_after: Option<i64>,
    pub last_signal_extreme: Option<i64>,
    pub heartbeat: Heartbeat,
    /// Flips to `true` when the worker should finish its current cycle and return
    pub stop: watch::Receiver<bool>,
    /// Synchronous saves, answered by the supervisor
    pub checkpoints: mpsc::Sender<Checkpoint>,
}

/// Start/stop capability the supervisor drives
pub trait WorkerFactory: Send + Sync {
    fn spawn(&self, ctx: WorkerContext) -> WorkerHandle;
}

struct RunningWorker {
    handle: WorkerHandle,
    stop: watch::Sender<bool>,
    checkpoints: mpsc::Receiver<Checkpoint>,
}

enum WorkerExit {
    Finished,
    Maintenance,
    Failed(String),
}

enum Event {
    Exited(WorkerExit),
    Stalled(Duration),
    Maintenance,
    ShutdownRequested,
}

fn classify(result: std::result::Result<Result<()>, JoinError>) -> WorkerExit {
    match result {
        Ok(Ok(())) => WorkerExit::Finished,
        Ok(Err(TraderError::Connectivity(ConnectivityError::Maintenance))) => WorkerExit::Maintenance,
        Ok(Err(e)) => WorkerExit::Failed(e.to_string()),
        Err(e) if e.is_panic() => WorkerExit::Failed(format!("worker panicked: {}", e)),
        Err(e) => WorkerExit::Failed(format!("worker aborted: {}", e)),
    }
}

/// Keeps one trading worker alive
///
/// Sole writer of `SupervisorState`. Crashes and stalls restart the worker after an
/// exponential backoff; maintenance windows pause it without counting as failures.
pub struct RecoverySupervisor {
    config: SupervisorConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    factory: Arc<dyn WorkerFactory>,
}

impl RecoverySupervisor {
    pub fn new(
        config: SupervisorConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        factory: Arc<dyn WorkerFactory>,
    ) -> Self {
        Self {
            config,
            broker,
            store,
            notifier,
            factory,
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped) and return the
    /// last persisted state. Hitting the restart limit persists the state and fails
    /// with `TraderError::RestartLimit`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<SupervisorState> {
        let mut state = self.store.load().await?.unwrap_or_default();

        if let Some(last) = state.last_processed_candle_timestamp {
            tracing::info!("Resuming after candle {}", last);
        }

        let backoff = BackoffPolicy::new(
            Duration::from_secs(self.config.backoff_base_secs),
            Duration::from_secs(self.config.backoff_max_secs),
        );
        let mut machine = SupervisorMachine::new(backoff, state.consecutive_failure_count);

        let heartbeat = Heartbeat::new();
        if let Some(ts) = state.last_processed_candle_timestamp {
            heartbeat.record_candle(ts);
        }
        if let Some(ts) = state.last_signal_extreme_timestamp {
            heartbeat.record_signal(ts);
        }

        let mut worker: Option<RunningWorker> = None;

        while !machine.is_terminal() {
            if stop_requested(&shutdown) {
                if let Some(running) = worker.take() {
                    self.stop_worker(running).await;
                }
                self.enter(&mut machine, &mut state, &heartbeat, LifecycleState::Shutdown, "stop requested")
                    .await;
                break;
            }

            match machine.state() {
                LifecycleState::Starting | LifecycleState::Restarting => {
                    worker = Some(self.launch(&heartbeat));
                    self.enter(&mut machine, &mut state, &heartbeat, LifecycleState::Running, "worker launched")
                        .await;
                }

                LifecycleState::Running => {
                    let Some(running) = worker.as_mut() else {
                        self.enter(&mut machine, &mut state, &heartbeat, LifecycleState::Crashed, "worker missing")
                            .await;
                        continue;
                    };

                    let event = self
                        .watch_worker(running, &mut machine, &mut state, &heartbeat, &mut shutdown)
                        .await;

                    match event {
                        Event::Exited(exit) => {
                            worker = None;
                            match exit {
                                WorkerExit::Maintenance => {
                                    self.enter(&mut machine, &mut state, &heartbeat, LifecycleState::Maintenance, "worker hit maintenance")
                                        .await;
                                }
                                WorkerExit::Finished if stop_requested(&shutdown) => {}
                                WorkerExit::Finished => {
                                    self.enter(&mut machine, &mut state, &heartbeat, LifecycleState::Crashed, "worker exited unexpectedly")
                                        .await;
                                }
                                WorkerExit::Failed(reason) => {
                                    tracing::error!("Worker failed: {}", reason);
                                    self.enter(&mut machine, &mut state, &heartbeat, LifecycleState::Crashed, reason)
                                        .await;
                                }
                            }
                        }
                        Event::Stalled(silent) => {
                            if let Some(running) = worker.take() {
                                self.stop_worker(running).await;
                            }
                            let reason = format!("no heartbeat for {}s", silent.as_secs());
                            self.enter(&mut machine, &mut state, &heartbeat, LifecycleState::Stalled, reason)
                                .await;
                        }
                        Event::Maintenance => {
                            if let Some(running) = worker.take() {
                                self.stop_worker(running).await;
                            }
                            self.enter(&mut machine, &mut state, &heartbeat, LifecycleState::Maintenance, "venue reports maintenance")
                                .await;
                        }
                        // handled at the top of the loop
                        Event::ShutdownRequested => {}
                    }
                }

                LifecycleState::Crashed | LifecycleState::Stalled => {
                    let delay = machine.record_failure();
                    state.consecutive_failure_count = machine.consecutive_failures();

                    if let Some(max) = self.config.max_restarts {
                        let failures = machine.consecutive_failures();
                        if failures > max {
                            tracing::error!(
                                "{} consecutive failures exceed the restart limit of {}",
                                failures,
                                max
                            );
                            for t in machine.history().iter().rev().take(RECENT_TRANSITIONS).rev() {
                                tracing::error!("  {} -> {}: {}", t.from, t.to, t.reason);
                            }
                            self.enter(&mut machine, &mut state, &heartbeat, LifecycleState::Shutdown, "restart limit reached")
                                .await;
                            return Err(TraderError::RestartLimit { failures, limit: max });
                        }
                    }

                    self.persist(&mut state, &heartbeat).await;
                    tracing::warn!(
                        "Restarting in {:?} (failure #{})",
                        delay,
                        machine.consecutive_failures()
                    );

                    if !wait_or_shutdown(delay, &mut shutdown).await {
                        continue;
                    }
                    self.enter(&mut machine, &mut state, &heartbeat, LifecycleState::Restarting, "backoff elapsed")
                        .await;
                }

                LifecycleState::Maintenance => {
                    state.maintenance_window_active = true;
                    self.persist(&mut state, &heartbeat).await;

                    if !self.wait_for_maintenance_end(&mut shutdown).await {
                        continue;
                    }

                    state.maintenance_window_active = false;
                    self.enter(&mut machine, &mut state, &heartbeat, LifecycleState::Restarting, "maintenance over")
                        .await;
                }

                LifecycleState::Shutdown => break,
            }
        }

        state.maintenance_window_active = false;
        self.persist(&mut state, &heartbeat).await;
        tracing::info!("Supervisor stopped");

        Ok(state)
    }

    fn launch(&self, heartbeat: &Heartbeat) -> RunningWorker {
        let (stop_tx, stop_rx) = watch::channel(false);

        // A fresh worker gets a full stall timeout to warm up
        heartbeat.beat();

        let (checkpoint_tx, checkpoint_rx) = mpsc::channel(1);

        let ctx = WorkerContext {
            resume_after: heartbeat.last_processed_candle(),
            last_signal_extreme: heartbeat.last_signal_extreme(),
            heartbeat: heartbeat.clone(),
            stop: stop_rx,
            checkpoints: checkpoint_tx,
        };

        RunningWorker {
            handle: self.factory.spawn(ctx),
            stop: stop_tx,
            checkpoints: checkpoint_rx,
        }
    }

    async fn watch_worker(
        &self,
        running: &mut RunningWorker,
        machine: &mut SupervisorMachine,
        state: &mut SupervisorState,
        heartbeat: &Heartbeat,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Event {
        let period = self.config.check_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut running.handle => return Event::Exited(classify(result)),

                Some(checkpoint) = running.checkpoints.recv() => {
                    heartbeat.record_candle(checkpoint.last_processed_candle);
                    heartbeat.record_signal(checkpoint.signal_extreme);
                    let saved = self.persist(state, heartbeat).await;
                    // The worker may have been aborted meanwhile
                    let _ = checkpoint.ack.send(saved);
                }

                _ = ticker.tick() => {
                    if state.absorb_progress(heartbeat.last_processed_candle(), heartbeat.last_signal_extreme()) {
                        self.persist(state, heartbeat).await;
                    }

                    if machine.note_healthy(self.config.healthy_reset()) {
                        state.consecutive_failure_count = 0;
                        self.persist(state, heartbeat).await;
                    }

                    match self.broker.is_market_in_maintenance().await {
                        Ok(true) => return Event::Maintenance,
                        Ok(false) => {
                            let silent = heartbeat.since_last_beat();
                            if silent >= self.config.stall_timeout() {
                                return Event::Stalled(silent);
                            }
                        }
                        // Connectivity unknown: not a stall, the worker's own retries decide
                        Err(e) => tracing::warn!("Maintenance check failed: {}", e),
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Event::ShutdownRequested;
                    }
                }
            }
        }
    }

    /// Ask the worker to stop after its current cycle; abort it after the grace period
    async fn stop_worker(&self, running: RunningWorker) {
        let RunningWorker {
            mut handle,
            stop,
            checkpoints,
        } = running;
        let _ = stop.send(true);
        // A checkpoint in flight now fails, so the worker drops its order and winds down
        drop(checkpoints);

        match timeout(self.config.stop_grace(), &mut handle).await {
            Ok(result) => {
                if let WorkerExit::Failed(reason) = classify(result) {
                    tracing::warn!("Worker failed while stopping: {}", reason);
                }
            }
            Err(_) => {
                tracing::warn!(
                    "Worker ignored stop for {:?}, aborting",
                    self.config.stop_grace()
                );
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    /// Poll until the venue is open again; false if shutdown arrived first
    async fn wait_for_maintenance_end(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if !wait_or_shutdown(self.config.maintenance_poll(), shutdown).await {
                return false;
            }

            match self.broker.is_market_in_maintenance().await {
                Ok(false) => return true,
                Ok(true) => tracing::debug!("Still in maintenance"),
                Err(e) => tracing::warn!("Maintenance check failed: {}", e),
            }
        }
    }

    async fn enter(
        &self,
        machine: &mut SupervisorMachine,
        state: &mut SupervisorState,
        heartbeat: &Heartbeat,
        target: LifecycleState,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        let from = machine.state();

        if !machine.transition_to(target, reason.clone()) {
            return;
        }

        state.consecutive_failure_count = machine.consecutive_failures();
        self.persist(state, heartbeat).await;

        let message = notify::transition_message(&from.to_string(), &target.to_string(), &reason);
        notify::deliver(self.notifier.as_ref(), &message).await;
    }

    /// Fold in worker progress and save; false when the store refused it
    async fn persist(&self, state: &mut SupervisorState, heartbeat: &Heartbeat) -> bool {
        state.absorb_progress(heartbeat.last_processed_candle(), heartbeat.last_signal_extreme());

        let silent = chrono::Duration::from_std(heartbeat.since_last_beat()).unwrap_or_default();
        state.last_heartbeat_time = Some(Utc::now() - silent);

        match self.store.save(state).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to persist supervisor state: {}", e);
                false
            }
        }
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `delay`; false if shutdown was requested meanwhile
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(delay) => true,
        changed = shutdown.changed() => {
            !(changed.is_err() || *shutdown.borrow())
        }
    }
}

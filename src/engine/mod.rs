//! The per-instrument trading loop
//!
//! One candle is processed completely (buffer, detect, filter, size, execute)
//! before the next is admitted. A stop request is only observed between cycles.

pub mod stats;

pub use stats::{DailySummary, SessionStats};

use crate::broker::{with_retries, Broker};
use crate::config::{AppConfig, EngineConfig};
use crate::error::{ConnectivityError, ExecutionError, SizingError};
use crate::execution::{CandleBuffer, TradeExecutor};
use crate::models::{Candle, TradeDecision};
use crate::notify::{self, Notifier};
use crate::persistence::TradeJournal;
use crate::risk::{EdgeEstimate, PositionSizer};
use crate::strategy::{validate_candle_uniformity, PatternDetector, PatternScanner, SignalFilter};
use crate::supervisor::{Checkpoint, Heartbeat, WorkerContext, WorkerFactory, WorkerHandle};
use crate::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};

/// What happened to one candle
#[derive(Debug, Clone, PartialEq)]
pub enum CandleOutcome {
    /// At or before the resume cursor
    AlreadyProcessed,
    /// Rejected by the buffer as out of order
    OutOfOrder,
    NoPattern,
    Filtered(String),
    /// Same extreme already produced a trade
    RepeatedSignal,
    NotSized(SizingError),
    /// The signal could not be saved, so no order was sent
    NotCheckpointed,
    ExecutionFailed(ExecutionError),
    Traded(TradeDecision),
}

pub struct TradingEngine {
    symbol: String,
    bucket_seconds: i64,
    config: EngineConfig,
    broker: Arc<dyn Broker>,
    buffer: CandleBuffer,
    scanner: Box<dyn PatternScanner>,
    filter: SignalFilter,
    sizer: PositionSizer,
    edge: EdgeEstimate,
    executor: TradeExecutor,
    journal: Arc<dyn TradeJournal>,
    notifier: Arc<dyn Notifier>,
    heartbeat: Heartbeat,
    checkpoints: Option<mpsc::Sender<Checkpoint>>,
    stats: SessionStats,
    cursor: Option<i64>,
    last_signal_extreme: Option<i64>,
}

impl TradingEngine {
    pub fn new(
        config: &AppConfig,
        broker: Arc<dyn Broker>,
        journal: Arc<dyn TradeJournal>,
        notifier: Arc<dyn Notifier>,
        heartbeat: Heartbeat,
    ) -> Self {
        let symbol = config.instrument.symbol.clone();

        Self {
            bucket_seconds: config.instrument.bucket_seconds as i64,
            config: config.engine.clone(),
            buffer: CandleBuffer::new(config.detector.lookback_window),
            scanner: Box::new(PatternDetector::new(config.detector.clone())),
            filter: SignalFilter::new(config.filter.clone()),
            sizer: PositionSizer::new(config.sizing.clone()),
            edge: EdgeEstimate::from_config(&config.sizing),
            executor: TradeExecutor::new(broker.clone(), symbol.clone()),
            stats: SessionStats::new(config.sizing.point_value),
            broker,
            journal,
            notifier,
            heartbeat,
            checkpoints: None,
            symbol,
            cursor: None,
            last_signal_extreme: None,
        }
    }

    /// Continue from persisted progress
    pub fn resume(mut self, last_processed: Option<i64>, last_signal_extreme: Option<i64>) -> Self {
        self.cursor = last_processed;
        self.last_signal_extreme = last_signal_extreme;
        self
    }

    /// Save every signal through `checkpoints` before its order is sent
    pub fn with_checkpoints(mut self, checkpoints: mpsc::Sender<Checkpoint>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Fill the buffer with recent history without evaluating it
    ///
    /// Nothing that closed before the engine started is traded.
    pub async fn warm_up(&mut self) -> std::result::Result<(), ConnectivityError> {
        let count = self.buffer.capacity();
        let broker = self.broker.clone();
        let symbol = self.symbol.clone();

        let candles = with_retries("warm-up history", self.config.retry_budget, self.config.retry_delay(), || {
            broker.get_recent_candles(&symbol, count)
        })
        .await?;

        for candle in candles {
            if let Err(e) = self.buffer.append(candle) {
                tracing::warn!("Warm-up candle dropped: {}", e);
            }
        }

        let newest = self.buffer.last_timestamp();
        self.cursor = match (self.cursor, newest) {
            (Some(cursor), Some(newest)) => Some(cursor.max(newest)),
            (cursor, None) => cursor,
            (None, newest) => newest,
        };

        if let Some(cursor) = self.cursor {
            self.heartbeat.record_candle(cursor);
        }
        self.heartbeat.beat();

        tracing::info!(
            symbol = %self.symbol,
            "Warmed up with {} candles, evaluating after {:?}",
            self.buffer.len(),
            self.cursor
        );

        Ok(())
    }

    /// Fetch the latest closed candle and process everything new since the cursor
    ///
    /// Returns the outcomes in candle order; empty when nothing new has closed.
    pub async fn poll_once(&mut self) -> std::result::Result<Vec<CandleOutcome>, ConnectivityError> {
        let broker = self.broker.clone();
        let symbol = self.symbol.clone();

        let latest = with_retries("latest candle", self.config.retry_budget, self.config.retry_delay(), || {
            broker.get_latest_closed_candle(&symbol)
        })
        .await?;

        let Some(latest) = latest else {
            return Ok(Vec::new());
        };

        if self.cursor.is_some_and(|cursor| latest.timestamp <= cursor) {
            // Nothing new; still catching up to the resume point feeds the window
            self.process_candle(latest).await?;
            return Ok(Vec::new());
        }

        let mut pending = vec![latest];

        // More than one bucket since the cursor: recover the candles in between
        if let Some(cursor) = self.cursor {
            if latest.timestamp - cursor > self.bucket_seconds {
                let count = self.buffer.capacity();
                let recent = with_retries("gap recovery", self.config.retry_budget, self.config.retry_delay(), || {
                    broker.get_recent_candles(&symbol, count)
                })
                .await?;

                let missed: Vec<Candle> = recent
                    .into_iter()
                    .filter(|c| c.timestamp > cursor && c.timestamp < latest.timestamp)
                    .collect();
                if !missed.is_empty() {
                    tracing::info!("Recovered {} missed candles", missed.len());
                }

                let expected = (latest.timestamp - cursor) / self.bucket_seconds - 1;
                let lost = expected - missed.len() as i64;
                if lost > 0 {
                    tracing::warn!(
                        symbol = %self.symbol,
                        "Data quality: {} candles between {} and {} could not be recovered",
                        lost,
                        cursor,
                        latest.timestamp
                    );
                }
                pending = missed;
                pending.push(latest);
            }
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for candle in pending {
            outcomes.push(self.process_candle(candle).await?);
        }
        Ok(outcomes)
    }

    /// Run one candle through the whole pipeline
    ///
    /// Only connectivity failures while fetching balance or symbol limits are
    /// returned as errors; everything else is a local outcome.
    pub async fn process_candle(
        &mut self,
        candle: Candle,
    ) -> std::result::Result<CandleOutcome, ConnectivityError> {
        if self.cursor.is_some_and(|cursor| candle.timestamp <= cursor) {
            // Kept as window context only, never evaluated again
            if self
                .buffer
                .last_timestamp()
                .map_or(true, |last| candle.timestamp > last)
            {
                if let Err(e) = self.buffer.append(candle) {
                    tracing::warn!(symbol = %self.symbol, "Context candle dropped: {}", e);
                }
            }
            tracing::debug!("Skipping candle {} (already processed)", candle.timestamp);
            return Ok(CandleOutcome::AlreadyProcessed);
        }

        if let Err(e) = self.buffer.append(candle) {
            tracing::warn!(symbol = %self.symbol, "Data quality: {}", e);
            return Ok(CandleOutcome::OutOfOrder);
        }

        // Recorded before any order goes out so a restart never replays this candle
        self.cursor = Some(candle.timestamp);
        self.heartbeat.record_candle(candle.timestamp);
        self.heartbeat.beat();

        if let Some(finished) = self.stats.observe_candle(&candle) {
            tracing::info!("{}", finished);
        }

        let window = self.buffer.snapshot();
        for gap in validate_candle_uniformity(window.candles(), self.config.gap_tolerance_secs) {
            if gap.to == candle.timestamp {
                tracing::warn!(
                    symbol = %self.symbol,
                    "Data quality: {}s gap between {} and {}",
                    gap.gap_secs,
                    gap.from,
                    gap.to
                );
            }
        }

        let Some(candidate) = self.scanner.scan(&window) else {
            return Ok(CandleOutcome::NoPattern);
        };
        self.stats.record_detected();

        tracing::info!(
            symbol = %self.symbol,
            "{} candidate: extreme {} @ {}, move {:.4}%, recovery {:.4}%, velocity {:.4}, range {}",
            self.scanner.name(),
            candidate.extreme_price,
            candidate.extreme_timestamp,
            candidate.decline_pct,
            candidate.recovery_pct,
            candidate.velocity,
            candidate.confirmation_range
        );

        if let Some(reason) = self.filter.rejection_reason(&candidate) {
            self.stats.record_filtered();
            tracing::info!("Candidate filtered: {}", reason);
            return Ok(CandleOutcome::Filtered(reason));
        }

        if self.last_signal_extreme == Some(candidate.extreme_timestamp) {
            tracing::debug!(
                "Extreme at {} already traded, ignoring",
                candidate.extreme_timestamp
            );
            return Ok(CandleOutcome::RepeatedSignal);
        }

        let broker = self.broker.clone();
        let symbol = self.symbol.clone();
        let budget = self.config.retry_budget;
        let delay = self.config.retry_delay();

        let balance = with_retries("account balance", budget, delay, || broker.get_account_balance()).await?;
        let spec = with_retries("symbol spec", budget, delay, || broker.get_symbol_spec(&symbol)).await?;

        let volume = match self.sizer.size(balance, &self.edge, &spec) {
            Ok(volume) => volume,
            Err(e) => {
                tracing::info!("No trade: {}", e);
                return Ok(CandleOutcome::NotSized(e));
            }
        };

        // Durable before the order leaves: a crash mid-submit may lose this trade,
        // a restart never repeats it
        if !self.checkpoint(candle.timestamp, candidate.extreme_timestamp).await {
            tracing::error!(
                symbol = %self.symbol,
                "Signal at extreme {} could not be saved, order not sent",
                candidate.extreme_timestamp
            );
            return Ok(CandleOutcome::NotCheckpointed);
        }
        self.heartbeat.record_signal(candidate.extreme_timestamp);

        let decision = match self
            .executor
            .submit(&candidate, volume, &spec, candle.timestamp)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                self.stats.record_rejected();
                tracing::warn!(symbol = %self.symbol, "Order not placed: {}", e);
                return Ok(CandleOutcome::ExecutionFailed(e));
            }
        };

        self.last_signal_extreme = Some(candidate.extreme_timestamp);
        self.stats.record_submitted(&decision);

        tracing::info!(
            symbol = %self.symbol,
            "Trade #{} placed: {} {} @ {} tp {}",
            decision.ticket,
            decision.direction,
            decision.volume,
            decision.entry_price,
            decision.take_profit_price
        );

        if let Err(e) = self.journal.append(&decision).await {
            tracing::error!("Failed to journal trade #{}: {}", decision.ticket, e);
        }
        notify::deliver(self.notifier.as_ref(), &notify::trade_message(&decision)).await;

        Ok(CandleOutcome::Traded(decision))
    }

    /// Ask the supervisor to save progress and the signal; true once it is on disk
    ///
    /// Without a supervisor attached there is nothing to wait for.
    async fn checkpoint(&self, candle: i64, signal_extreme: i64) -> bool {
        let Some(checkpoints) = &self.checkpoints else {
            return true;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let request = Checkpoint {
            last_processed_candle: candle,
            signal_extreme,
            ack: ack_tx,
        };

        if checkpoints.send(request).await.is_err() {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    /// Poll until `stop` flips; connectivity failures beyond the retry budget end the run
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        if self.config.warmup {
            self.warm_up().await?;
        } else {
            self.heartbeat.beat();
        }

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if *stop.borrow() {
                break;
            }

            self.poll_once().await?;
        }

        tracing::info!("{}", self.stats.summary());
        Ok(())
    }
}

/// Launches a fresh `TradingEngine` per supervisor restart
pub struct EngineWorkerFactory {
    config: AppConfig,
    broker: Arc<dyn Broker>,
    journal: Arc<dyn TradeJournal>,
    notifier: Arc<dyn Notifier>,
}

impl EngineWorkerFactory {
    pub fn new(
        config: AppConfig,
        broker: Arc<dyn Broker>,
        journal: Arc<dyn TradeJournal>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            broker,
            journal,
            notifier,
        }
    }
}

impl WorkerFactory for EngineWorkerFactory {
    fn spawn(&self, ctx: WorkerContext) -> WorkerHandle {
        let engine = TradingEngine::new(
            &self.config,
            self.broker.clone(),
            self.journal.clone(),
            self.notifier.clone(),
            ctx.heartbeat,
        )
        .resume(ctx.resume_after, ctx.last_signal_extreme)
        .with_checkpoints(ctx.checkpoints);

        tokio::spawn(engine.run(ctx.stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ScriptedBroker;
    use crate::models::{PatternKind, SymbolSpec};
    use crate::notify::LogNotifier;
    use crate::persistence::{JsonLinesJournal, SupervisorState};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const SYMBOL: &str = "Step Index";

    fn spec() -> SymbolSpec {
        SymbolSpec {
            min_volume: dec!(0.1),
            max_volume: dec!(50),
            volume_step: dec!(0.01),
            spread: dec!(1),
            stops_level: Decimal::ZERO,
            point: dec!(0.1),
        }
    }

    fn bar(i: i64, low: Decimal, high: Decimal, close: Decimal) -> Candle {
        Candle::new(i * 60, close, high, low, close)
    }

    fn flat(i: i64, close: Decimal) -> Candle {
        bar(i, close - dec!(0.5), close + dec!(0.5), close)
    }

    /// Flat history, a sharp dip bottoming at index 6 and a strong rebound at 7
    fn v_series() -> Vec<Candle> {
        vec![
            flat(0, dec!(1000)),
            flat(1, dec!(1000)),
            flat(2, dec!(1000)),
            flat(3, dec!(1000)),
            flat(4, dec!(1000)),
            flat(5, dec!(996)),
            flat(6, dec!(990)),
            // velocity 5, range 2; tp 994.5 above the 993.5 ask
            bar(7, dec!(993), dec!(995), dec!(993)),
            bar(8, dec!(996.8), dec!(998.5), dec!(997)),
            flat(9, dec!(1001)),
        ]
    }

    struct Fixture {
        broker: Arc<ScriptedBroker>,
        engine: TradingEngine,
        heartbeat: Heartbeat,
        _dir: TempDir,
    }

    fn fixture(candles: Vec<Candle>, history: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ScriptedBroker::new(SYMBOL, candles, spec(), dec!(90)).with_history(history));
        let heartbeat = Heartbeat::new();
        let mut config = AppConfig::default();
        config.detector.kind = PatternKind::V;

        let engine = TradingEngine::new(
            &config,
            broker.clone(),
            Arc::new(JsonLinesJournal::new(dir.path().join("trades.jsonl"))),
            Arc::new(LogNotifier),
            heartbeat.clone(),
        );

        Fixture {
            broker,
            engine,
            heartbeat,
            _dir: dir,
        }
    }

    async fn drain(fixture: &mut Fixture) -> Vec<CandleOutcome> {
        let mut all = Vec::new();
        while !fixture.broker.is_exhausted() {
            all.extend(fixture.engine.poll_once().await.unwrap());
        }
        all
    }

    type SeenCheckpoints = Arc<Mutex<Vec<(i64, i64, usize)>>>;

    /// Stands in for the supervisor: saves nothing, acknowledges every checkpoint and
    /// notes how many orders the venue had seen when it arrived
    fn acknowledge_all(broker: Arc<ScriptedBroker>) -> (mpsc::Sender<Checkpoint>, SeenCheckpoints) {
        let (tx, mut rx) = mpsc::channel::<Checkpoint>(1);
        let seen: SeenCheckpoints = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            while let Some(checkpoint) = rx.recv().await {
                log.lock().unwrap().push((
                    checkpoint.last_processed_candle,
                    checkpoint.signal_extreme,
                    broker.submitted_orders().len(),
                ));
                let _ = checkpoint.ack.send(true);
            }
        });

        (tx, seen)
    }

    #[tokio::test]
    async fn test_warm_up_does_not_trade_history() {
        let mut fx = fixture(v_series(), 10);
        fx.engine.warm_up().await.unwrap();

        assert_eq!(fx.engine.cursor(), Some(9 * 60));
        assert!(fx.engine.poll_once().await.unwrap().is_empty());
        assert!(fx.broker.submitted_orders().is_empty());
        assert_eq!(fx.heartbeat.last_processed_candle(), Some(9 * 60));
    }

    #[tokio::test]
    async fn test_v_rebound_trades_once() {
        let mut fx = fixture(v_series(), 5);
        fx.engine.warm_up().await.unwrap();

        let outcomes = drain(&mut fx).await;
        let trades: Vec<&TradeDecision> = outcomes
            .iter()
            .filter_map(|o| match o {
                CandleOutcome::Traded(d) => Some(d),
                _ => None,
            })
            .collect();

        assert_eq!(trades.len(), 1);
        let trade = trades[0];
        assert_eq!(trade.direction, crate::models::Direction::Long);
        // 90 * 0.175 / 10 = 1.575
        assert_eq!(trade.volume, dec!(1.57));
        assert_eq!(fx.broker.submitted_orders().len(), 1);
        assert_eq!(trade.take_profit_price, dec!(994.5));
        assert_eq!(trade.entry_price, dec!(993.5));
        assert_eq!(fx.heartbeat.last_signal_extreme(), Some(6 * 60));

        // later candles keep the same bottom in the window but never trade it again
        assert!(outcomes.contains(&CandleOutcome::RepeatedSignal));
        assert_eq!(fx.engine.stats().summary().trades_submitted, 1);
    }

    #[tokio::test]
    async fn test_resume_skips_processed_candles() {
        let mut fx = fixture(v_series(), 5);
        fx.engine = fx.engine.resume(Some(9 * 60), None);

        let outcomes = drain(&mut fx).await;
        assert!(outcomes.is_empty());
        assert!(fx.broker.submitted_orders().is_empty());
    }

    #[tokio::test]
    async fn test_resume_keeps_window_context() {
        let mut fx = fixture(v_series(), 5);
        fx.engine = fx.engine.resume(Some(7 * 60), None);
        fx.engine.warm_up().await.unwrap();

        let outcomes = drain(&mut fx).await;
        assert_eq!(outcomes.len(), 2);
        match &outcomes[0] {
            CandleOutcome::Traded(decision) => assert_eq!(decision.timestamp, 8 * 60),
            other => panic!("expected a trade, got {:?}", other),
        }
        assert_eq!(outcomes[1], CandleOutcome::RepeatedSignal);
    }

    #[tokio::test]
    async fn test_resumed_signal_is_not_traded_again() {
        let mut fx = fixture(v_series(), 5);
        fx.engine = fx.engine.resume(Some(7 * 60), Some(6 * 60));
        fx.engine.warm_up().await.unwrap();

        let outcomes = drain(&mut fx).await;
        assert_eq!(
            outcomes,
            vec![CandleOutcome::RepeatedSignal, CandleOutcome::RepeatedSignal]
        );
        assert!(fx.broker.submitted_orders().is_empty());
    }

    #[tokio::test]
    async fn test_signal_is_saved_before_order_and_survives_restart() {
        let mut first = fixture(v_series(), 5);
        let (tx, seen) = acknowledge_all(first.broker.clone());
        first.engine = first.engine.with_checkpoints(tx);
        first.engine.warm_up().await.unwrap();
        drain(&mut first).await;

        assert_eq!(first.broker.submitted_orders().len(), 1);
        // candle 7 triggered the bottom at 360 and was saved while no order existed
        assert_eq!(seen.lock().unwrap().clone(), vec![(7 * 60, 6 * 60, 0)]);

        // a periodic save that raced the order holds the cursor only; the checkpoint
        // adds the signal
        let mut saved = SupervisorState::default();
        saved.absorb_progress(Some(7 * 60), None);
        let (candle, extreme, _) = seen.lock().unwrap()[0];
        saved.absorb_progress(Some(candle), Some(extreme));

        // restart and replay the same stream from the saved state
        let mut second = fixture(v_series(), 5);
        second.engine = second.engine.resume(
            saved.last_processed_candle_timestamp,
            saved.last_signal_extreme_timestamp,
        );
        second.engine.warm_up().await.unwrap();

        let outcomes = drain(&mut second).await;
        assert_eq!(
            outcomes,
            vec![CandleOutcome::RepeatedSignal, CandleOutcome::RepeatedSignal]
        );
        assert!(second.broker.submitted_orders().is_empty());
    }

    #[tokio::test]
    async fn test_unsaved_signal_sends_no_order() {
        let mut fx = fixture(v_series(), 5);
        let (tx, rx) = mpsc::channel::<Checkpoint>(1);
        drop(rx);
        fx.engine = fx.engine.with_checkpoints(tx);
        fx.engine.warm_up().await.unwrap();

        let outcomes = drain(&mut fx).await;
        assert!(outcomes.contains(&CandleOutcome::NotCheckpointed));
        assert!(fx.broker.submitted_orders().is_empty());
        assert_eq!(fx.heartbeat.last_signal_extreme(), None);
    }

    #[tokio::test]
    async fn test_already_processed_candle_is_skipped() {
        let mut fx = fixture(v_series(), 0);
        fx.engine = fx.engine.resume(Some(120), None);

        let outcome = fx.engine.process_candle(flat(2, dec!(1000))).await.unwrap();
        assert_eq!(outcome, CandleOutcome::AlreadyProcessed);

        let outcome = fx.engine.process_candle(flat(3, dec!(1000))).await.unwrap();
        assert_eq!(outcome, CandleOutcome::NoPattern);
        assert_eq!(fx.engine.cursor(), Some(180));
    }

    #[tokio::test]
    async fn test_wide_confirmation_is_filtered() {
        let mut series = v_series();
        // rebound candle with a 3-point range (cap is 2.1)
        series[7] = bar(7, dec!(992), dec!(995), dec!(993));
        let mut fx = fixture(series[..8].to_vec(), 0);

        let mut outcomes = Vec::new();
        for candle in &series[..8] {
            outcomes.push(fx.engine.process_candle(*candle).await.unwrap());
        }

        assert!(matches!(outcomes.last(), Some(CandleOutcome::Filtered(_))));
        assert!(fx.broker.submitted_orders().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_order_does_not_halt_loop() {
        let mut fx = fixture(v_series(), 5);
        fx.engine.warm_up().await.unwrap();
        fx.broker.reject_orders(Some("market closed".to_string()));

        let outcomes = drain(&mut fx).await;
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, CandleOutcome::ExecutionFailed(ExecutionError::Rejected(_)))));
        assert_eq!(fx.engine.cursor(), Some(9 * 60));
        assert_eq!(fx.engine.stats().summary().trades_submitted, 0);
    }

    #[tokio::test]
    async fn test_low_balance_means_no_trade() {
        let mut fx = fixture(v_series(), 5);
        fx.broker.set_balance(dec!(5));
        fx.engine.warm_up().await.unwrap();

        let outcomes = drain(&mut fx).await;
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, CandleOutcome::NotSized(SizingError::BelowMinimumVolume { .. }))));
        assert!(fx.broker.submitted_orders().is_empty());
    }

    #[tokio::test]
    async fn test_stale_candle_leaves_state_unchanged() {
        let mut fx = fixture(v_series(), 0);
        fx.engine.process_candle(flat(3, dec!(1000))).await.unwrap();

        // cursor guard sees it first
        let outcome = fx.engine.process_candle(flat(1, dec!(1000))).await.unwrap();
        assert_eq!(outcome, CandleOutcome::AlreadyProcessed);
        assert_eq!(fx.engine.cursor(), Some(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_exhaustion_escalates() {
        let mut fx = fixture(v_series(), 5);
        fx.broker.fail_next(10);

        let result = fx.engine.poll_once().await;
        assert!(matches!(result, Err(ConnectivityError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_recovery_processes_missed_candles() {
        let mut fx = fixture(v_series(), 5);
        fx.engine.warm_up().await.unwrap();
        fx.broker.set_auto_advance(false);
        fx.broker.release(3);

        let outcomes = fx.engine.poll_once().await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(fx.engine.cursor(), Some(7 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_wider_than_window_processes_what_remains() {
        let mut fx = fixture(v_series(), 1);
        fx.engine.warm_up().await.unwrap();
        assert_eq!(fx.engine.cursor(), Some(0));
        fx.broker.set_auto_advance(false);
        fx.broker.release(9);

        // candles 1..=4 fell out of the recovery window; 5..=8 and the latest remain
        let outcomes = fx.engine.poll_once().await.unwrap();
        assert_eq!(outcomes.len(), 5);
        assert!(!outcomes.contains(&CandleOutcome::OutOfOrder));
        assert_eq!(fx.engine.cursor(), Some(9 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_between_cycles() {
        let fx = fixture(v_series(), 5);
        let (stop_tx, stop_rx) = watch::channel(false);
        let broker = fx.broker.clone();

        let handle = tokio::spawn(fx.engine.run(stop_rx));
        tokio::time::sleep(std::time::Duration::from_secs(200)).await;
        stop_tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert!(broker.is_exhausted());
        assert_eq!(broker.submitted_orders().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_ends_run() {
        let fx = fixture(v_series(), 5);
        fx.broker.set_maintenance(true);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let result = fx.engine.run(stop_rx).await;
        assert!(matches!(
            result,
            Err(crate::TraderError::Connectivity(ConnectivityError::Maintenance))
        ));
    }
}

use super::{Broker, SyntheticCandleGenerator};
use crate::config::{InstrumentConfig, PaperConfig};
use crate::error::{ConnectivityError, ExecutionError};
use crate::models::{
    Candle, Direction, FillMode, OrderRequest, OrderResult, Quote, SymbolSpec,
};
use crate::risk::round_down_to_step;
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Candles kept in memory
const HISTORY_LIMIT: usize = 1000;
/// Candles generated behind the clock on first use
const INITIAL_HISTORY: i64 = 100;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
struct PaperPosition {
    ticket: u64,
    direction: Direction,
    entry_price: Decimal,
    volume: Decimal,
    take_profit: Decimal,
}

struct PaperState {
    generator: SyntheticCandleGenerator,
    history: VecDeque<Candle>,
    balance: Decimal,
    positions: Vec<PaperPosition>,
    next_ticket: u64,
}

/// In-process simulated venue
///
/// One synthetic candle per wall-clock bucket. Orders fill completely at the
/// requested price or are rejected; positions close when a later candle trades
/// through the take-profit.
pub struct PaperBroker {
    symbol: String,
    bucket_seconds: i64,
    config: PaperConfig,
    clock: Clock,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(instrument: &InstrumentConfig, config: PaperConfig) -> Self {
        Self::with_clock(instrument, config, Arc::new(Utc::now))
    }

    pub fn with_clock(instrument: &InstrumentConfig, config: PaperConfig, clock: Clock) -> Self {
        let generator =
            SyntheticCandleGenerator::new(config.seed, config.start_price, config.volatility);

        tracing::info!(
            "Paper venue ready: {} (balance {}, spread {})",
            instrument.symbol,
            config.balance,
            config.spread
        );

        Self {
            symbol: instrument.symbol.clone(),
            bucket_seconds: instrument.bucket_seconds as i64,
            state: Mutex::new(PaperState {
                generator,
                history: VecDeque::new(),
                balance: config.balance,
                positions: Vec::new(),
                next_ticket: 1,
            }),
            config,
            clock,
        }
    }

    /// Open positions (for summaries and tests)
    pub fn open_position_count(&self) -> usize {
        self.lock().map(|s| s.positions.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, PaperState>, ConnectivityError> {
        self.state
            .lock()
            .map_err(|e| ConnectivityError::Unavailable(format!("paper state poisoned: {}", e)))
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), ConnectivityError> {
        if symbol == self.symbol {
            Ok(())
        } else {
            Err(ConnectivityError::Unavailable(format!("unknown symbol {}", symbol)))
        }
    }

    fn last_closed_bucket(&self) -> i64 {
        let now = (self.clock)().timestamp();
        now - now.rem_euclid(self.bucket_seconds) - self.bucket_seconds
    }

    /// Generate candles up to the last closed bucket and settle positions
    fn catch_up(&self, state: &mut PaperState) {
        let last_closed = self.last_closed_bucket();
        let mut next = match state.history.back() {
            Some(candle) => candle.timestamp + self.bucket_seconds,
            None => last_closed - (INITIAL_HISTORY - 1) * self.bucket_seconds,
        };

        // Skip far-behind buckets after a long pause
        let oldest_useful = last_closed - (HISTORY_LIMIT as i64 - 1) * self.bucket_seconds;
        if next < oldest_useful {
            next = oldest_useful;
        }

        while next <= last_closed {
            let candle = state.generator.next_candle(next);
            self.settle_positions(state, &candle);
            state.history.push_back(candle);
            next += self.bucket_seconds;
        }

        while state.history.len() > HISTORY_LIMIT {
            state.history.pop_front();
        }
    }

    fn settle_positions(&self, state: &mut PaperState, candle: &Candle) {
        let mut realized = Decimal::ZERO;

        state.positions.retain(|position| {
            let hit = match position.direction {
                Direction::Long => candle.high >= position.take_profit,
                Direction::Short => candle.low <= position.take_profit,
            };
            if hit {
                let points = match position.direction {
                    Direction::Long => position.take_profit - position.entry_price,
                    Direction::Short => position.entry_price - position.take_profit,
                };
                realized += points * position.volume;
                tracing::info!(
                    "Paper position #{} closed at take profit {} ({} points)",
                    position.ticket,
                    position.take_profit,
                    points
                );
            }
            !hit
        });

        state.balance += realized;
    }

    fn spec(&self) -> SymbolSpec {
        SymbolSpec {
            min_volume: self.config.min_volume,
            max_volume: self.config.max_volume,
            volume_step: self.config.volume_step,
            spread: self.config.spread,
            stops_level: self.config.stops_level,
            point: self.config.point,
        }
    }

    fn quote_from(&self, state: &PaperState) -> Option<Quote> {
        let last = state.history.back()?;
        let half_spread = self.config.spread / Decimal::TWO;
        Some(Quote {
            bid: last.close - half_spread,
            ask: last.close + half_spread,
        })
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn get_latest_closed_candle(
        &self,
        symbol: &str,
    ) -> Result<Option<Candle>, ConnectivityError> {
        self.check_symbol(symbol)?;
        let mut state = self.lock()?;
        self.catch_up(&mut state);
        Ok(state.history.back().copied())
    }

    async fn get_recent_candles(
        &self,
        symbol: &str,
        count: usize,
    ) -> Result<Vec<Candle>, ConnectivityError> {
        self.check_symbol(symbol)?;
        let mut state = self.lock()?;
        self.catch_up(&mut state);
        let skip = state.history.len().saturating_sub(count);
        Ok(state.history.iter().skip(skip).copied().collect())
    }

    async fn get_account_balance(&self) -> Result<Decimal, ConnectivityError> {
        Ok(self.lock()?.balance)
    }

    async fn get_symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, ConnectivityError> {
        self.check_symbol(symbol)?;
        Ok(self.spec())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, ConnectivityError> {
        self.check_symbol(symbol)?;
        let mut state = self.lock()?;
        self.catch_up(&mut state);
        self.quote_from(&state)
            .ok_or_else(|| ConnectivityError::Unavailable("no prices yet".to_string()))
    }

    async fn has_open_position(&self, symbol: &str) -> Result<bool, ConnectivityError> {
        self.check_symbol(symbol)?;
        Ok(!self.lock()?.positions.is_empty())
    }

    async fn submit_order(&self, request: OrderRequest) -> Result<OrderResult, ExecutionError> {
        self.check_symbol(&request.symbol)?;
        let spec = self.spec();

        if request.volume < spec.min_volume || request.volume > spec.max_volume {
            return Err(ExecutionError::Rejected(format!(
                "volume {} outside [{}, {}]",
                request.volume, spec.min_volume, spec.max_volume
            )));
        }
        if round_down_to_step(request.volume, spec.volume_step) != request.volume {
            return Err(ExecutionError::Rejected(format!(
                "volume {} not aligned to step {}",
                request.volume, spec.volume_step
            )));
        }

        let mut state = self.lock()?;
        self.catch_up(&mut state);

        let quote = self
            .quote_from(&state)
            .ok_or_else(|| ExecutionError::Rejected("no prices yet".to_string()))?;
        let market = quote.entry_for(request.direction);

        match request.fill_mode {
            FillMode::AllOrNothing => {
                if market != request.entry_price {
                    return Err(ExecutionError::Rejected(format!(
                        "requote: market {} vs requested {}",
                        market, request.entry_price
                    )));
                }
            }
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.positions.push(PaperPosition {
            ticket,
            direction: request.direction,
            entry_price: request.entry_price,
            volume: request.volume,
            take_profit: request.take_profit_price,
        });

        Ok(OrderResult {
            ticket,
            fill_price: request.entry_price,
            filled_volume: request.volume,
        })
    }

    async fn is_market_in_maintenance(&self) -> Result<bool, ConnectivityError> {
        let hour = (self.clock)().hour();
        Ok(self.config.maintenance_hours_utc.contains(&hour))
    }
}

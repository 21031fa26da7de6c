use crate::models::{Candle, TradeDecision};
use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use std::fmt;

/// Counters for one UTC day of the candle stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailySummary {
    pub day: Option<NaiveDate>,
    pub candles_processed: u64,
    pub candidates_detected: u64,
    pub candidates_filtered: u64,
    pub trades_submitted: u64,
    pub trades_rejected: u64,
    /// Sum of target distance x volume x point value over submitted trades
    pub expected_profit: Decimal,
}

impl fmt::Display for DailySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let day = self
            .day
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "Session {}: {} candles, {} candidates ({} filtered), {} trades, {} rejected, expected profit {}",
            day,
            self.candles_processed,
            self.candidates_detected,
            self.candidates_filtered,
            self.trades_submitted,
            self.trades_rejected,
            self.expected_profit
        )
    }
}

#[derive(Debug, Clone)]
pub struct SessionStats {
    point_value: Decimal,
    current: DailySummary,
}

impl SessionStats {
    pub fn new(point_value: Decimal) -> Self {
        Self {
            point_value,
            current: DailySummary::default(),
        }
    }

    /// Count a processed candle
    ///
    /// When the candle belongs to a later UTC day than the running counters, the
    /// finished day is returned and counting restarts.
    pub fn observe_candle(&mut self, candle: &Candle) -> Option<DailySummary> {
        let day = DateTime::from_timestamp(candle.timestamp, 0).map(|t| t.date_naive());

        let finished = match (self.current.day, day) {
            (Some(current), Some(day)) if day > current => {
                let done = std::mem::take(&mut self.current);
                Some(done)
            }
            _ => None,
        };

        if self.current.day.is_none() {
            self.current.day = day;
        }
        self.current.candles_processed += 1;

        finished
    }

    pub fn record_detected(&mut self) {
        self.current.candidates_detected += 1;
    }

    pub fn record_filtered(&mut self) {
        self.current.candidates_filtered += 1;
    }

    pub fn record_submitted(&mut self, decision: &TradeDecision) {
        self.current.trades_submitted += 1;
        self.current.expected_profit += decision.target_points() * decision.volume * self.point_value;
    }

    pub fn record_rejected(&mut self) {
        self.current.trades_rejected += 1;
    }

    pub fn summary(&self) -> &DailySummary {
        &self.current
    }
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// OHLC candle for one closed time bucket
///
/// `timestamp` is the bucket index (bucket open time in epoch seconds).
/// Strictly increasing across the stream; a closed candle is never mutated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl Candle {
    pub fn new(timestamp: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
        }
    }

    /// High minus low
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    /// Wall-clock open time of the bucket
    pub fn open_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Reversal shape the detector looks for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Local minimum then recovery, trades long
    #[default]
    V,
    /// Local maximum then decline, trades short
    InvertedV,
}

impl PatternKind {
    pub fn direction(&self) -> Direction {
        match self {
            PatternKind::V => Direction::Long,
            PatternKind::InvertedV => Direction::Short,
        }
    }
}

/// Reversal found in one buffer snapshot
///
/// For a V the extreme is the bottom; for an inverted V it is the top.
/// Percentages are expressed in percent (20 means 20%).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternCandidate {
    pub kind: PatternKind,
    pub extreme_index: usize,
    pub extreme_price: Decimal,
    pub extreme_timestamp: i64,
    pub decline_pct: Decimal,
    pub recovery_pct: Decimal,
    pub velocity: Decimal,
    pub confirmation_range: Decimal,
    pub confirmation_high: Decimal,
    pub confirmation_low: Decimal,
    pub confirmation_close: Decimal,
    pub confirmation_timestamp: i64,
}

impl PatternCandidate {
    pub fn direction(&self) -> Direction {
        self.kind.direction()
    }
}

/// Order volume constraints and pricing details reported by the venue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolSpec {
    pub min_volume: Decimal,
    pub max_volume: Decimal,
    pub volume_step: Decimal,
    pub spread: Decimal,
    /// Minimum distance between entry and target, in points
    pub stops_level: Decimal,
    /// Price size of one point
    pub point: Decimal,
}

impl SymbolSpec {
    /// Minimum entry/target distance in price units
    pub fn stops_distance(&self) -> Decimal {
        self.stops_level * self.point
    }
}

/// Current bid/ask
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Quote {
    /// Price a market order in `direction` would pay
    pub fn entry_for(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Long => self.ask,
            Direction::Short => self.bid,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    /// Fill completely at the requested price or not at all
    AllOrNothing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub entry_price: Decimal,
    pub take_profit_price: Decimal,
    pub fill_mode: FillMode,
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResult {
    pub ticket: u64,
    pub fill_price: Decimal,
    pub filled_volume: Decimal,
}

/// A submitted trade. Terminal once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeDecision {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub volume: Decimal,
    pub take_profit_price: Decimal,
    /// Candle timestamp that triggered the trade (idempotency key)
    pub timestamp: i64,
    pub ticket: u64,
    pub created_at: DateTime<Utc>,
}

impl TradeDecision {
    /// Target distance in price units, always positive for a valid decision
    pub fn target_points(&self) -> Decimal {
        match self.direction {
            Direction::Long => self.take_profit_price - self.entry_price,
            Direction::Short => self.entry_price - self.take_profit_price,
        }
    }
}

//! Durable supervisor state and the trade journal
//!
//! Two backends: a JSON file written atomically (default) and Redis.

pub mod file;
pub mod redis_store;

pub use file::{JsonFileStore, JsonLinesJournal};
pub use redis_store::RedisPersistence;

use crate::config::{PersistenceBackend, PersistenceConfig};
use crate::models::TradeDecision;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The smallest record that lets a restarted worker resume without replaying candles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorState {
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// No candle at or before this timestamp is evaluated again
    pub last_processed_candle_timestamp: Option<i64>,
    /// Extreme of the last pattern that produced a signal; one bottom trades once
    pub last_signal_extreme_timestamp: Option<i64>,
    pub consecutive_failure_count: u32,
    pub maintenance_window_active: bool,
}

impl SupervisorState {
    /// Fold worker progress in; timestamps only move forward
    ///
    /// Returns true when anything changed.
    pub fn absorb_progress(&mut self, candle: Option<i64>, signal_extreme: Option<i64>) -> bool {
        let candle = later(self.last_processed_candle_timestamp, candle);
        let extreme = later(self.last_signal_extreme_timestamp, signal_extreme);
        let changed = candle != self.last_processed_candle_timestamp
            || extreme != self.last_signal_extreme_timestamp;

        self.last_processed_candle_timestamp = candle;
        self.last_signal_extreme_timestamp = extreme;
        changed
    }
}

fn later(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// `None` when nothing has been persisted yet
    async fn load(&self) -> Result<Option<SupervisorState>>;

    async fn save(&self, state: &SupervisorState) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// Append-only record of submitted trades
#[async_trait]
pub trait TradeJournal: Send + Sync {
    async fn append(&self, decision: &TradeDecision) -> Result<()>;

    /// Most recent `limit` decisions, oldest first
    async fn recent(&self, limit: usize) -> Result<Vec<TradeDecision>>;
}

/// Build the configured backend pair
pub async fn open(
    config: &PersistenceConfig,
) -> Result<(Arc<dyn StateStore>, Arc<dyn TradeJournal>)> {
    match config.backend {
        PersistenceBackend::File => {
            let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(&config.state_path));
            let journal: Arc<dyn TradeJournal> =
                Arc::new(JsonLinesJournal::new(&config.journal_path));
            Ok((store, journal))
        }
        PersistenceBackend::Redis => {
            let redis =
                Arc::new(RedisPersistence::new(&config.redis_url, &config.key_prefix).await?);
            let store: Arc<dyn StateStore> = redis.clone();
            let journal: Arc<dyn TradeJournal> = redis;
            Ok((store, journal))
        }
    }
}

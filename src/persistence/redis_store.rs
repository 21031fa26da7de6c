use super::{StateStore, SupervisorState, TradeJournal};
use crate::models::TradeDecision;
use crate::{Result, TraderError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::time::{timeout, Duration};

/// Redis persistence for supervisor state and the trade journal
///
/// State lives in a hash `{prefix}:state` (one field per value, empty string for
/// unset), trades in a list `{prefix}:trades` appended with RPUSH.
pub struct RedisPersistence {
    conn: ConnectionManager,
    state_key: String,
    trades_key: String,
}

impl RedisPersistence {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `key_prefix` - Namespace for this bot's keys
    pub async fn new(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| {
                TraderError::Persistence("Redis connection timeout after 5 seconds".to_string())
            })??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            state_key: format!("{}:state", key_prefix),
            trades_key: format!("{}:trades", key_prefix),
        })
    }
}

fn opt_to_field<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn field<T: FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<Option<T>> {
    match fields.get(name).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| TraderError::Persistence(format!("bad value for {}: {:?}", name, raw))),
    }
}

#[async_trait]
impl StateStore for RedisPersistence {
    async fn load(&self) -> Result<Option<SupervisorState>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(&self.state_key).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let last_heartbeat_time = match fields.get("last_heartbeat_time").map(String::as_str) {
            None | Some("") => None,
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| TraderError::Persistence(format!("bad heartbeat time: {}", e)))?
                    .with_timezone(&Utc),
            ),
        };

        Ok(Some(SupervisorState {
            last_heartbeat_time,
            last_processed_candle_timestamp: field(&fields, "last_processed_candle_timestamp")?,
            last_signal_extreme_timestamp: field(&fields, "last_signal_extreme_timestamp")?,
            consecutive_failure_count: field(&fields, "consecutive_failure_count")?.unwrap_or(0),
            maintenance_window_active: field(&fields, "maintenance_window_active")?.unwrap_or(false),
        }))
    }

    async fn save(&self, state: &SupervisorState) -> Result<()> {
        let mut conn = self.conn.clone();

        let fields = [
            (
                "last_heartbeat_time",
                opt_to_field(state.last_heartbeat_time.map(|t| t.to_rfc3339())),
            ),
            (
                "last_processed_candle_timestamp",
                opt_to_field(state.last_processed_candle_timestamp),
            ),
            (
                "last_signal_extreme_timestamp",
                opt_to_field(state.last_signal_extreme_timestamp),
            ),
            (
                "consecutive_failure_count",
                state.consecutive_failure_count.to_string(),
            ),
            (
                "maintenance_window_active",
                state.maintenance_window_active.to_string(),
            ),
        ];

        conn.hset_multiple::<_, _, _, ()>(&self.state_key, &fields).await?;

        tracing::debug!("State saved to Redis key {}", self.state_key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&self.state_key).await?;
        Ok(())
    }
}

#[async_trait]
impl TradeJournal for RedisPersistence {
    async fn append(&self, decision: &TradeDecision) -> Result<()> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(decision)?;
        conn.rpush::<_, _, ()>(&self.trades_key, value).await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<TradeDecision>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let start = -(limit as isize);
        let raw: Vec<String> = conn.lrange(&self.trades_key, start, -1).await?;

        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(TraderError::from))
            .collect()
    }
}

//! Application configuration
//!
//! Layered: built-in defaults, then an optional TOML file, then `REVERSALBOT__*`
//! environment variables (`REVERSALBOT__FILTER__VELOCITY_THRESHOLD=2.5`).
//! Every component gets its own section at construction; nothing reads globals.

use crate::models::PatternKind;
use crate::{Result, TraderError};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "REVERSALBOT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub instrument: InstrumentConfig,
    pub detector: DetectorConfig,
    pub filter: FilterConfig,
    pub sizing: SizingConfig,
    pub engine: EngineConfig,
    pub supervisor: SupervisorConfig,
    pub persistence: PersistenceConfig,
    pub paper: PaperConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub symbol: String,
    /// Candle bucket length
    pub bucket_seconds: u64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            symbol: "Step Index".to_string(),
            bucket_seconds: 60,
        }
    }
}

/// Shape detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub kind: PatternKind,
    pub lookback_window: usize,
    pub min_decline_pct: Decimal,
    pub min_recovery_pct: Decimal,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: PatternKind::V,
            lookback_window: 5,
            min_decline_pct: dec!(0.01),
            min_recovery_pct: dec!(0.01),
        }
    }
}

/// Tradability gates. Calibrated from historical fits, not derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub recovery_pct_threshold: Decimal,
    pub velocity_threshold: Decimal,
    pub range_threshold: Decimal,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            recovery_pct_threshold: dec!(0.0248),
            velocity_threshold: dec!(2.1),
            range_threshold: dec!(2.1),
        }
    }
}

/// Fractional Kelly sizing inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub win_rate: Decimal,
    pub payoff_ratio: Decimal,
    /// De-risking multiplier applied to the full Kelly fraction
    pub kelly_multiplier: Decimal,
    /// Cap on the applied bankroll fraction
    pub max_kelly_fraction: Decimal,
    /// Adverse move (in points) one lot is sized against
    pub risk_points_per_lot: Decimal,
    /// Account currency per point per lot
    pub point_value: Decimal,
    pub balance_floor: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            win_rate: dec!(0.8),
            payoff_ratio: dec!(2.0),
            kelly_multiplier: dec!(0.25),
            max_kelly_fraction: dec!(0.5),
            risk_points_per_lot: dec!(10.0),
            point_value: dec!(1.0),
            balance_floor: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_interval_secs: u64,
    /// Consecutive connectivity failures tolerated before the loop gives up
    pub retry_budget: u32,
    pub retry_delay_secs: u64,
    pub gap_tolerance_secs: u64,
    pub warmup: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            retry_budget: 5,
            retry_delay_secs: 5,
            gap_tolerance_secs: 70,
            warmup: true,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub check_interval_secs: u64,
    pub stall_timeout_secs: u64,
    pub maintenance_poll_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Uninterrupted RUNNING time after which the failure counter resets
    pub healthy_reset_secs: u64,
    pub stop_grace_secs: u64,
    pub max_restarts: Option<u32>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            stall_timeout_secs: 300,
            maintenance_poll_secs: 60,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            healthy_reset_secs: 600,
            stop_grace_secs: 5,
            max_restarts: None,
        }
    }
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn maintenance_poll(&self) -> Duration {
        Duration::from_secs(self.maintenance_poll_secs)
    }

    pub fn healthy_reset(&self) -> Duration {
        Duration::from_secs(self.healthy_reset_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    File,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    pub state_path: PathBuf,
    pub journal_path: PathBuf,
    pub redis_url: String,
    pub key_prefix: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::File,
            state_path: PathBuf::from("state/supervisor_state.json"),
            journal_path: PathBuf::from("state/trades.jsonl"),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "reversalbot".to_string(),
        }
    }
}

/// Simulated venue used by `run --paper`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub seed: u64,
    pub start_price: Decimal,
    /// Typical per-candle move in price units
    pub volatility: Decimal,
    pub balance: Decimal,
    pub spread: Decimal,
    pub min_volume: Decimal,
    pub max_volume: Decimal,
    pub volume_step: Decimal,
    pub stops_level: Decimal,
    pub point: Decimal,
    pub maintenance_hours_utc: Vec<u32>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            start_price: dec!(8000),
            volatility: dec!(1.5),
            balance: dec!(90),
            spread: dec!(1.0),
            min_volume: dec!(0.1),
            max_volume: dec!(50),
            volume_step: dec!(0.01),
            stops_level: Decimal::ZERO,
            point: dec!(0.1),
            maintenance_hours_utc: vec![1, 2],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl AppConfig {
    /// Load defaults, then `path` if it exists, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;

        tracing::info!(
            "Configuration loaded (symbol: {}, window: {}, kind: {:?})",
            config.instrument.symbol,
            config.detector.lookback_window,
            config.detector.kind
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn ensure(ok: bool, msg: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(TraderError::Config(msg.to_string()))
            }
        }

        ensure(
            self.detector.lookback_window >= 3,
            "detector.lookback_window must be at least 3",
        )?;
        ensure(
            self.detector.min_decline_pct >= Decimal::ZERO
                && self.detector.min_recovery_pct >= Decimal::ZERO,
            "detector percentages must be non-negative",
        )?;
        ensure(
            self.filter.recovery_pct_threshold >= Decimal::ZERO
                && self.filter.velocity_threshold >= Decimal::ZERO
                && self.filter.range_threshold >= Decimal::ZERO,
            "filter thresholds must be non-negative",
        )?;
        ensure(
            self.sizing.win_rate >= Decimal::ZERO && self.sizing.win_rate <= Decimal::ONE,
            "sizing.win_rate must be between 0 and 1",
        )?;
        ensure(
            self.sizing.payoff_ratio > Decimal::ZERO,
            "sizing.payoff_ratio must be positive",
        )?;
        ensure(
            self.sizing.kelly_multiplier > Decimal::ZERO
                && self.sizing.kelly_multiplier <= Decimal::ONE,
            "sizing.kelly_multiplier must be in (0, 1]",
        )?;
        ensure(
            self.sizing.max_kelly_fraction > Decimal::ZERO
                && self.sizing.max_kelly_fraction <= Decimal::ONE,
            "sizing.max_kelly_fraction must be in (0, 1]",
        )?;
        ensure(
            self.sizing.risk_points_per_lot > Decimal::ZERO
                && self.sizing.point_value > Decimal::ZERO,
            "sizing.risk_points_per_lot and sizing.point_value must be positive",
        )?;
        ensure(
            self.paper.volume_step > Decimal::ZERO,
            "paper.volume_step must be positive",
        )?;
        ensure(
            self.instrument.bucket_seconds > 0,
            "instrument.bucket_seconds must be positive",
        )?;
        ensure(
            self.supervisor.backoff_base_secs <= self.supervisor.backoff_max_secs,
            "supervisor.backoff_base_secs must not exceed backoff_max_secs",
        )?;
        ensure(
            self.engine.poll_interval_secs > 0 && self.supervisor.check_interval_secs > 0,
            "poll and check intervals must be positive",
        )?;

        Ok(())
    }
}

use rust_decimal::Decimal;
use thiserror::Error;

/// Candle rejected by the buffer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BufferError {
    #[error("out-of-order candle: timestamp {received} is not after {last}")]
    OutOfOrder { last: i64, received: i64 },
}

/// Reasons the sizer declines to produce a volume
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingError {
    #[error("balance {balance} is at or below floor {floor}")]
    InsufficientBalance { balance: Decimal, floor: Decimal },

    #[error("no edge: kelly fraction {kelly} <= 0")]
    NoEdge { kelly: Decimal },

    #[error("computed volume {volume} is below venue minimum {min_volume}")]
    BelowMinimumVolume { volume: Decimal, min_volume: Decimal },

    #[error("invalid symbol spec: {0}")]
    InvalidSpec(String),
}

/// Failures from the connectivity layer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectivityError {
    #[error("venue unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("market is in maintenance")]
    Maintenance,
}

/// Order could not be placed as a whole
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("partial fill: {filled} of {requested}")]
    PartialFill { requested: Decimal, filled: Decimal },

    #[error("take profit {take_profit} is within {min_distance} of entry {entry}")]
    TakeProfitTooClose {
        entry: Decimal,
        take_profit: Decimal,
        min_distance: Decimal,
    },

    #[error("take profit {take_profit} is on the wrong side of entry {entry}")]
    TakeProfitWrongSide { entry: Decimal, take_profit: Decimal },

    #[error("position already open on {0}")]
    PositionAlreadyOpen(String),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
}

#[derive(Debug, Error)]
pub enum TraderError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Sizing(#[from] SizingError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("notification error: {0}")]
    Notify(String),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("gave up after {failures} consecutive failures (limit {limit})")]
    RestartLimit { failures: u32, limit: u32 },

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl From<config::ConfigError> for TraderError {
    fn from(err: config::ConfigError) -> Self {
        TraderError::Config(err.to_string())
    }
}

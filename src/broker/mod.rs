// Venue connectivity: the capability the trading core consumes
pub mod paper;
pub mod scripted;
pub mod synthetic;

pub use paper::PaperBroker;
pub use scripted::ScriptedBroker;
pub use synthetic::SyntheticCandleGenerator;

use crate::error::{ConnectivityError, ExecutionError};
use crate::models::{Candle, OrderRequest, OrderResult, Quote, SymbolSpec};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::future::Future;
use std::time::Duration;

/// Market data, account and order routing for one venue
///
/// Every call may block on the network; the core never calls these while
/// holding trading state that another task could observe.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Most recent fully closed candle, `None` when the venue has none yet
    async fn get_latest_closed_candle(&self, symbol: &str)
        -> Result<Option<Candle>, ConnectivityError>;

    /// Up to `count` most recent closed candles, oldest first
    async fn get_recent_candles(
        &self,
        symbol: &str,
        count: usize,
    ) -> Result<Vec<Candle>, ConnectivityError>;

    async fn get_account_balance(&self) -> Result<Decimal, ConnectivityError>;

    async fn get_symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, ConnectivityError>;

    async fn get_quote(&self, symbol: &str) -> Result<Quote, ConnectivityError>;

    async fn has_open_position(&self, symbol: &str) -> Result<bool, ConnectivityError>;

    /// Place an order; must honour `request.fill_mode`
    async fn submit_order(&self, request: OrderRequest) -> Result<OrderResult, ExecutionError>;

    async fn is_market_in_maintenance(&self) -> Result<bool, ConnectivityError>;
}

/// Retry a connectivity call up to `budget` attempts
///
/// Maintenance is returned immediately; retrying cannot help. Exhausting the
/// budget returns the last error for the caller to escalate.
pub async fn with_retries<T, F, Fut>(
    what: &str,
    budget: u32,
    delay: Duration,
    mut op: F,
) -> Result<T, ConnectivityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectivityError>>,
{
    let attempts = budget.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(ConnectivityError::Maintenance) => return Err(ConnectivityError::Maintenance),
            Err(e) if attempt >= attempts => {
                tracing::error!("{} failed after {} attempts: {}", what, attempt, e);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = with_retries("candle fetch", 5, Duration::from_secs(5), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ConnectivityError::Unavailable("socket closed".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(assert_ok!(result), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_returns_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = with_retries("balance", 3, Duration::from_secs(1), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ConnectivityError::Timeout(10))
        })
        .await;

        assert_eq!(result, Err(ConnectivityError::Timeout(10)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = with_retries("quote", 5, Duration::from_secs(1), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ConnectivityError::Maintenance)
        })
        .await;

        assert_eq!(assert_err!(result), ConnectivityError::Maintenance);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

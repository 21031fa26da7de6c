use super::Broker;
use crate::error::{ConnectivityError, ExecutionError};
use crate::models::{Candle, OrderRequest, OrderResult, Quote, SymbolSpec};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::{Mutex, MutexGuard};

struct Script {
    candles: Vec<Candle>,
    /// Candles already closed from the venue's point of view
    released: usize,
    auto_advance: bool,
    balance: Decimal,
    spec: SymbolSpec,
    quote: Option<Quote>,
    open_position: bool,
    maintenance: bool,
    failures_left: u32,
    reject: Option<String>,
    fill_only: Option<Decimal>,
    submitted: Vec<OrderRequest>,
    next_ticket: u64,
}

/// Replays a prepared candle sequence as a venue
///
/// Each `get_latest_closed_candle` call closes the next scripted candle unless
/// auto-advance is switched off. Failures, maintenance, rejections and partial
/// fills can be injected to drive the error paths of the trading loop.
pub struct ScriptedBroker {
    symbol: String,
    script: Mutex<Script>,
}

impl ScriptedBroker {
    pub fn new(symbol: impl Into<String>, candles: Vec<Candle>, spec: SymbolSpec, balance: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            script: Mutex::new(Script {
                candles,
                released: 0,
                auto_advance: true,
                balance,
                spec,
                quote: None,
                open_position: false,
                maintenance: false,
                failures_left: 0,
                reject: None,
                fill_only: None,
                submitted: Vec::new(),
                next_ticket: 1,
            }),
        }
    }

    /// Treat the first `count` candles as history that closed before the session
    pub fn with_history(self, count: usize) -> Self {
        {
            let mut script = self.lock_script();
            script.released = count.min(script.candles.len());
        }
        self
    }

    pub fn set_auto_advance(&self, enabled: bool) {
        self.lock_script().auto_advance = enabled;
    }

    /// Close the next `count` candles
    pub fn release(&self, count: usize) {
        let mut script = self.lock_script();
        script.released = (script.released + count).min(script.candles.len());
    }

    pub fn released(&self) -> usize {
        self.lock_script().released
    }

    pub fn is_exhausted(&self) -> bool {
        let script = self.lock_script();
        script.released >= script.candles.len()
    }

    pub fn set_quote(&self, quote: Quote) {
        self.lock_script().quote = Some(quote);
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.lock_script().balance = balance;
    }

    pub fn set_open_position(&self, open: bool) {
        self.lock_script().open_position = open;
    }

    pub fn set_maintenance(&self, active: bool) {
        self.lock_script().maintenance = active;
    }

    /// Fail the next `count` connectivity calls
    pub fn fail_next(&self, count: u32) {
        self.lock_script().failures_left = count;
    }

    pub fn reject_orders(&self, reason: Option<String>) {
        self.lock_script().reject = reason;
    }

    /// Report fills of `volume` regardless of what was requested
    pub fn fill_only(&self, volume: Option<Decimal>) {
        self.lock_script().fill_only = volume;
    }

    pub fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.lock_script().submitted.clone()
    }

    fn lock_script(&self) -> MutexGuard<'_, Script> {
        // A panicking test thread must not hide the script from the others
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checked(&self, symbol: Option<&str>) -> Result<MutexGuard<'_, Script>, ConnectivityError> {
        if let Some(symbol) = symbol {
            if symbol != self.symbol {
                return Err(ConnectivityError::Unavailable(format!("unknown symbol {}", symbol)));
            }
        }

        let mut script = self.lock_script();
        if script.maintenance {
            return Err(ConnectivityError::Maintenance);
        }
        if script.failures_left > 0 {
            script.failures_left -= 1;
            return Err(ConnectivityError::Unavailable("scripted failure".to_string()));
        }
        Ok(script)
    }
}

fn current_quote(script: &Script) -> Option<Quote> {
    if let Some(quote) = script.quote {
        return Some(quote);
    }
    let last = script.candles[..script.released].last()?;
    let half_spread = script.spec.spread / Decimal::TWO;
    Some(Quote {
        bid: last.close - half_spread,
        ask: last.close + half_spread,
    })
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn get_latest_closed_candle(
        &self,
        symbol: &str,
    ) -> Result<Option<Candle>, ConnectivityError> {
        let mut script = self.checked(Some(symbol))?;
        if script.auto_advance && script.released < script.candles.len() {
            script.released += 1;
        }
        Ok(script.candles[..script.released].last().copied())
    }

    async fn get_recent_candles(
        &self,
        symbol: &str,
        count: usize,
    ) -> Result<Vec<Candle>, ConnectivityError> {
        let script = self.checked(Some(symbol))?;
        let start = script.released.saturating_sub(count);
        Ok(script.candles[start..script.released].to_vec())
    }

    async fn get_account_balance(&self) -> Result<Decimal, ConnectivityError> {
        Ok(self.checked(None)?.balance)
    }

    async fn get_symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, ConnectivityError> {
        Ok(self.checked(Some(symbol))?.spec.clone())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, ConnectivityError> {
        let script = self.checked(Some(symbol))?;
        current_quote(&script).ok_or_else(|| ConnectivityError::Unavailable("no prices".to_string()))
    }

    async fn has_open_position(&self, symbol: &str) -> Result<bool, ConnectivityError> {
        Ok(self.checked(Some(symbol))?.open_position)
    }

    async fn submit_order(&self, request: OrderRequest) -> Result<OrderResult, ExecutionError> {
        let mut script = self.checked(Some(&request.symbol))?;
        script.submitted.push(request.clone());

        if let Some(reason) = script.reject.clone() {
            return Err(ExecutionError::Rejected(reason));
        }

        let ticket = script.next_ticket;
        script.next_ticket += 1;

        Ok(OrderResult {
            ticket,
            fill_price: request.entry_price,
            filled_volume: script.fill_only.unwrap_or(request.volume),
        })
    }

    async fn is_market_in_maintenance(&self) -> Result<bool, ConnectivityError> {
        Ok(self.lock_script().maintenance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

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

    fn candles() -> Vec<Candle> {
        (0..4)
            .map(|i| {
                let close = Decimal::from(100 + i);
                Candle::new(i * 60, close, close, close, close)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_replays_in_order() {
        let broker = ScriptedBroker::new("X", candles(), spec(), dec!(90)).with_history(2);
        assert_eq!(broker.get_recent_candles("X", 5).await.unwrap().len(), 2);

        let next = broker.get_latest_closed_candle("X").await.unwrap().unwrap();
        assert_eq!(next.timestamp, 120);

        broker.set_auto_advance(false);
        let same = broker.get_latest_closed_candle("X").await.unwrap().unwrap();
        assert_eq!(same.timestamp, 120);
        assert!(!broker.is_exhausted());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = ScriptedBroker::new("X", candles(), spec(), dec!(90));
        broker.fail_next(1);
        assert!(broker.get_account_balance().await.is_err());
        assert_eq!(broker.get_account_balance().await.unwrap(), dec!(90));

        broker.set_maintenance(true);
        assert_eq!(
            broker.get_latest_closed_candle("X").await,
            Err(ConnectivityError::Maintenance)
        );
        assert!(broker.is_market_in_maintenance().await.unwrap());
    }
}

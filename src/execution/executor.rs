use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::ExecutionError;
use crate::models::{
    Direction, FillMode, OrderRequest, PatternCandidate, SymbolSpec, TradeDecision,
};

/// Exit target for `candidate`, pulled inside the confirmation extreme by half the spread
pub fn take_profit_for(candidate: &PatternCandidate, spread: Decimal) -> Decimal {
    let half_spread = spread / Decimal::TWO;
    match candidate.direction() {
        Direction::Long => candidate.confirmation_high - half_spread,
        Direction::Short => candidate.confirmation_low + half_spread,
    }
}

/// Target must sit on the profitable side of entry and at least the stops distance away
pub fn validate_take_profit(
    direction: Direction,
    entry: Decimal,
    take_profit: Decimal,
    spec: &SymbolSpec,
) -> Result<(), ExecutionError> {
    let distance = match direction {
        Direction::Long => take_profit - entry,
        Direction::Short => entry - take_profit,
    };

    if distance <= Decimal::ZERO {
        return Err(ExecutionError::TakeProfitWrongSide { entry, take_profit });
    }

    let min_distance = spec.stops_distance();
    if distance < min_distance {
        return Err(ExecutionError::TakeProfitTooClose {
            entry,
            take_profit,
            min_distance,
        });
    }

    Ok(())
}

/// Turns an accepted candidate and a sized volume into one all-or-nothing order
///
/// A rejected order is final for the candle that produced it; nothing here retries.
pub struct TradeExecutor {
    broker: Arc<dyn Broker>,
    symbol: String,
}

impl TradeExecutor {
    pub fn new(broker: Arc<dyn Broker>, symbol: impl Into<String>) -> Self {
        Self {
            broker,
            symbol: symbol.into(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Place the order for `candidate`
    ///
    /// `trigger_timestamp` is the candle that produced the signal and becomes the
    /// decision's idempotency key.
    pub async fn submit(
        &self,
        candidate: &PatternCandidate,
        volume: Decimal,
        spec: &SymbolSpec,
        trigger_timestamp: i64,
    ) -> Result<TradeDecision, ExecutionError> {
        let direction = candidate.direction();

        if self.broker.has_open_position(&self.symbol).await? {
            return Err(ExecutionError::PositionAlreadyOpen(self.symbol.clone()));
        }

        let quote = self.broker.get_quote(&self.symbol).await?;
        let entry_price = quote.entry_for(direction);
        let take_profit_price = take_profit_for(candidate, spec.spread);

        validate_take_profit(direction, entry_price, take_profit_price, spec)?;

        let request = OrderRequest {
            symbol: self.symbol.clone(),
            direction,
            volume,
            entry_price,
            take_profit_price,
            fill_mode: FillMode::AllOrNothing,
            comment: format!("reversal@{}", candidate.extreme_timestamp),
        };

        tracing::info!(
            symbol = %self.symbol,
            "Submitting {} {} lots @ {} (tp {})",
            direction,
            volume,
            entry_price,
            take_profit_price
        );

        let result = self.broker.submit_order(request).await?;

        if result.filled_volume != volume {
            // The venue broke the fill contract; surface it, never adopt the partial size
            tracing::error!(
                "Venue reported partial fill on ticket #{}: {} of {}",
                result.ticket,
                result.filled_volume,
                volume
            );
            return Err(ExecutionError::PartialFill {
                requested: volume,
                filled: result.filled_volume,
            });
        }

        Ok(TradeDecision {
            id: Uuid::new_v4(),
            symbol: self.symbol.clone(),
            direction,
            entry_price: result.fill_price,
            volume,
            take_profit_price,
            timestamp: trigger_timestamp,
            ticket: result.ticket,
            created_at: Utc::now(),
        })
    }
}

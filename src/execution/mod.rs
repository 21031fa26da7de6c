// Candle intake and order placement
pub mod candle_buffer;
pub mod executor;

pub use candle_buffer::{CandleBuffer, CandleWindow};
pub use executor::{take_profit_for, validate_take_profit, TradeExecutor};

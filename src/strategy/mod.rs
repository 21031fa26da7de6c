// Pattern detection and signal gating
pub mod reversal;
pub mod signals;

pub use reversal::PatternDetector;
pub use signals::{validate_candle_uniformity, CandleGap, SignalFilter};

use crate::execution::CandleWindow;
use crate::models::PatternCandidate;

/// Base trait for shape scanners over a candle window
pub trait PatternScanner: Send + Sync {
    /// Look for a qualifying pattern; `None` when there is none or history is short
    fn scan(&self, window: &CandleWindow) -> Option<PatternCandidate>;

    /// Get scanner name
    fn name(&self) -> &str;

    /// Minimum candles required before a scan can produce anything
    fn min_candles_required(&self) -> usize;
}

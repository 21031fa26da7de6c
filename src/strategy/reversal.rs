use super::PatternScanner;
use crate::config::DetectorConfig;
use crate::execution::CandleWindow;
use crate::models::{Candle, PatternCandidate, PatternKind};
use rust_decimal::Decimal;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// V / inverted-V reversal detector
///
/// Works on closing prices of one full window:
/// - the extreme is the lowest close (V) or highest close (inverted V),
///   earliest bar wins ties
/// - the move into the extreme is measured from the opposite extreme of the
///   bars before it
/// - the newest candle confirms the reversal
///
/// Holds no state between scans; the result depends only on the snapshot.
#[derive(Debug, Clone)]
pub struct PatternDetector {
    config: DetectorConfig,
}

impl PatternDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn kind(&self) -> PatternKind {
        self.config.kind
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn scan_v(&self, candles: &[Candle]) -> Option<PatternCandidate> {
        let bottom_index = extreme_index(candles, |candidate, best| candidate < best)?;
        let newest = candles.len() - 1;

        // Bottom on the newest bar leaves nothing to confirm with; bottom on the
        // oldest bar leaves nothing to measure the decline from.
        if bottom_index == newest || bottom_index == 0 {
            return None;
        }

        let bottom = &candles[bottom_index];
        let bottom_price = bottom.close;
        let price_before = candles[..bottom_index].iter().map(|c| c.close).max()?;

        if price_before <= Decimal::ZERO || bottom_price <= Decimal::ZERO {
            return None;
        }

        let decline_pct = (price_before - bottom_price) / price_before * HUNDRED;
        if decline_pct < self.config.min_decline_pct {
            return None;
        }

        let confirmation = &candles[newest];
        let recovery_pct = (confirmation.close - bottom_price) / bottom_price * HUNDRED;
        if recovery_pct < self.config.min_recovery_pct {
            return None;
        }

        let bars_since_bottom = Decimal::from(newest - bottom_index);
        let velocity = (confirmation.high - bottom_price) / bars_since_bottom;

        Some(PatternCandidate {
            kind: PatternKind::V,
            extreme_index: bottom_index,
            extreme_price: bottom_price,
            extreme_timestamp: bottom.timestamp,
            decline_pct,
            recovery_pct,
            velocity,
            confirmation_range: confirmation.range(),
            confirmation_high: confirmation.high,
            confirmation_low: confirmation.low,
            confirmation_close: confirmation.close,
            confirmation_timestamp: confirmation.timestamp,
        })
    }

    fn scan_inverted_v(&self, candles: &[Candle]) -> Option<PatternCandidate> {
        let top_index = extreme_index(candles, |candidate, best| candidate > best)?;
        let newest = candles.len() - 1;

        if top_index == newest || top_index == 0 {
            return None;
        }

        let top = &candles[top_index];
        let top_price = top.close;
        let price_before = candles[..top_index].iter().map(|c| c.close).min()?;

        if price_before <= Decimal::ZERO || top_price <= Decimal::ZERO {
            return None;
        }

        // Rise into the top, mirrored from the V decline
        let decline_pct = (top_price - price_before) / price_before * HUNDRED;
        if decline_pct < self.config.min_decline_pct {
            return None;
        }

        let confirmation = &candles[newest];
        let recovery_pct = (top_price - confirmation.close) / top_price * HUNDRED;
        if recovery_pct < self.config.min_recovery_pct {
            return None;
        }

        let bars_since_top = Decimal::from(newest - top_index);
        let velocity = (top_price - confirmation.low) / bars_since_top;

        Some(PatternCandidate {
            kind: PatternKind::InvertedV,
            extreme_index: top_index,
            extreme_price: top_price,
            extreme_timestamp: top.timestamp,
            decline_pct,
            recovery_pct,
            velocity,
            confirmation_range: confirmation.range(),
            confirmation_high: confirmation.high,
            confirmation_low: confirmation.low,
            confirmation_close: confirmation.close,
            confirmation_timestamp: confirmation.timestamp,
        })
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl PatternScanner for PatternDetector {
    fn scan(&self, window: &CandleWindow) -> Option<PatternCandidate> {
        // Insufficient history is not an error, just no candidate
        if window.len() < self.min_candles_required() {
            return None;
        }

        let candles = window.candles();
        match self.config.kind {
            PatternKind::V => self.scan_v(candles),
            PatternKind::InvertedV => self.scan_inverted_v(candles),
        }
    }

    fn name(&self) -> &str {
        match self.config.kind {
            PatternKind::V => "VReversal",
            PatternKind::InvertedV => "InvertedVReversal",
        }
    }

    fn min_candles_required(&self) -> usize {
        self.config.lookback_window
    }
}

/// Index of the close that beats every earlier one under `better`
fn extreme_index(candles: &[Candle], better: impl Fn(Decimal, Decimal) -> bool) -> Option<usize> {
    let mut iter = candles.iter().enumerate();
    let (mut best_index, first) = iter.next()?;
    let mut best = first.close;

    for (i, candle) in iter {
        if better(candle.close, best) {
            best = candle.close;
            best_index = i;
        }
    }

    Some(best_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::CandleBuffer;
    use rust_decimal_macros::dec;

    fn window_from(closes: &[Decimal]) -> CandleWindow {
        let mut buffer = CandleBuffer::new(closes.len());
        for (i, close) in closes.iter().enumerate() {
            buffer
                .append(Candle::new(i as i64 * 60, *close, *close, *close, *close))
                .unwrap();
        }
        buffer.snapshot()
    }

    fn window_with_confirmation(closes: &[Decimal], high: Decimal, low: Decimal) -> CandleWindow {
        let mut buffer = CandleBuffer::new(closes.len());
        let last = closes.len() - 1;
        for (i, close) in closes.iter().enumerate() {
            let candle = if i == last {
                Candle::new(i as i64 * 60, *close, high, low, *close)
            } else {
                Candle::new(i as i64 * 60, *close, *close, *close, *close)
            };
            buffer.append(candle).unwrap();
        }
        buffer.snapshot()
    }

    fn detector(kind: PatternKind) -> PatternDetector {
        PatternDetector::new(DetectorConfig {
            kind,
            ..DetectorConfig::default()
        })
    }

    #[test]
    fn test_v_pattern_example() {
        let window = window_with_confirmation(
            &[dec!(10), dec!(9), dec!(8), dec!(8.5), dec!(8.9)],
            dec!(9.0),
            dec!(8.4),
        );

        let candidate = detector(PatternKind::V).scan(&window).unwrap();

        assert_eq!(candidate.kind, PatternKind::V);
        assert_eq!(candidate.extreme_index, 2);
        assert_eq!(candidate.extreme_price, dec!(8));
        assert_eq!(candidate.decline_pct, dec!(20));
        assert_eq!(candidate.recovery_pct, dec!(11.25));
        // (9.0 - 8) / 2 bars
        assert_eq!(candidate.velocity, dec!(0.5));
        assert_eq!(candidate.confirmation_range, dec!(0.6));
        assert_eq!(candidate.confirmation_high, dec!(9.0));
        assert_eq!(candidate.confirmation_timestamp, 240);
    }

    #[test]
    fn test_short_window_never_yields_candidate() {
        let det = detector(PatternKind::V);
        for len in 0..5 {
            let closes: Vec<Decimal> = [dec!(10), dec!(8), dec!(9), dec!(9.5)]
                .iter()
                .copied()
                .take(len)
                .collect();
            let mut buffer = CandleBuffer::new(5);
            for (i, close) in closes.iter().enumerate() {
                buffer
                    .append(Candle::new(i as i64, *close, *close, *close, *close))
                    .unwrap();
            }
            assert!(det.scan(&buffer.snapshot()).is_none(), "len {}", len);
        }
    }

    #[test]
    fn test_bottom_on_newest_bar_rejected() {
        let window = window_from(&[dec!(10), dec!(9.5), dec!(9), dec!(8.5), dec!(8)]);
        assert!(detector(PatternKind::V).scan(&window).is_none());
    }

    #[test]
    fn test_bottom_on_oldest_bar_rejected() {
        let window = window_from(&[dec!(8), dec!(8.5), dec!(9), dec!(9.5), dec!(10)]);
        assert!(detector(PatternKind::V).scan(&window).is_none());
    }

    #[test]
    fn test_tie_resolved_by_earliest_bar() {
        let window = window_from(&[dec!(10), dec!(8), dec!(9), dec!(8), dec!(9)]);
        let candidate = detector(PatternKind::V).scan(&window).unwrap();
        assert_eq!(candidate.extreme_index, 1);
        assert_eq!(candidate.extreme_timestamp, 60);
    }

    #[test]
    fn test_no_recovery_rejected() {
        // Confirmation closes at the bottom price: 0% recovery
        let window = window_from(&[dec!(10), dec!(9), dec!(8), dec!(8.5), dec!(8)]);
        assert!(detector(PatternKind::V).scan(&window).is_none());
    }

    #[test]
    fn test_decline_below_minimum_rejected() {
        let det = PatternDetector::new(DetectorConfig {
            min_decline_pct: dec!(25),
            ..DetectorConfig::default()
        });
        let window = window_from(&[dec!(10), dec!(9), dec!(8), dec!(8.5), dec!(8.9)]);
        assert!(det.scan(&window).is_none());
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let window = window_from(&[dec!(10), dec!(9), dec!(8), dec!(8.5), dec!(8.9)]);
        let det = detector(PatternKind::V);
        assert_eq!(det.scan(&window), det.scan(&window));
    }

    #[test]
    fn test_inverted_v_mirror() {
        let window = window_with_confirmation(
            &[dec!(8), dec!(9), dec!(10), dec!(9.5), dec!(9.1)],
            dec!(9.6),
            dec!(9.0),
        );

        let candidate = detector(PatternKind::InvertedV).scan(&window).unwrap();

        assert_eq!(candidate.kind, PatternKind::InvertedV);
        assert_eq!(candidate.extreme_index, 2);
        assert_eq!(candidate.extreme_price, dec!(10));
        // 8 -> 10 is a 25% rise
        assert_eq!(candidate.decline_pct, dec!(25));
        // 10 -> 9.1 is a 9% reversal
        assert_eq!(candidate.recovery_pct, dec!(9));
        // (10 - 9.0) / 2 bars
        assert_eq!(candidate.velocity, dec!(0.5));
        assert_eq!(candidate.confirmation_range, dec!(0.6));
    }

    #[test]
    fn test_inverted_v_ignores_v_shape() {
        let window = window_from(&[dec!(10), dec!(9), dec!(8), dec!(8.5), dec!(8.9)]);
        // Highest close is the oldest bar
        assert!(detector(PatternKind::InvertedV).scan(&window).is_none());
    }

    #[test]
    fn test_scanner_metadata() {
        let det = detector(PatternKind::V);
        assert_eq!(det.name(), "VReversal");
        assert_eq!(det.min_candles_required(), 5);
    }
}

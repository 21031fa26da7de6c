use crate::config::FilterConfig;
use crate::models::{Candle, PatternCandidate};

/// Threshold gates deciding whether a detected reversal is tradable
///
/// Weak recoveries and slow reversals are dropped; wide confirmation candles are
/// dropped because the take-profit placed off them is unreliable.
/// Boundaries are inclusive.
#[derive(Debug, Clone)]
pub struct SignalFilter {
    config: FilterConfig,
}

impl SignalFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn accept(&self, candidate: &PatternCandidate) -> bool {
        self.rejection_reason(candidate).is_none()
    }

    /// First failed gate, for logging
    pub fn rejection_reason(&self, candidate: &PatternCandidate) -> Option<String> {
        if candidate.recovery_pct < self.config.recovery_pct_threshold {
            return Some(format!(
                "recovery {:.4}% < {}%",
                candidate.recovery_pct, self.config.recovery_pct_threshold
            ));
        }

        if candidate.velocity < self.config.velocity_threshold {
            return Some(format!(
                "velocity {:.4} < {}",
                candidate.velocity, self.config.velocity_threshold
            ));
        }

        if candidate.confirmation_range > self.config.range_threshold {
            return Some(format!(
                "range {:.4} > {}",
                candidate.confirmation_range, self.config.range_threshold
            ));
        }

        None
    }
}

impl Default for SignalFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

/// A hole in the candle stream
#[derive(Debug, Clone, PartialEq)]
pub struct CandleGap {
    pub from: i64,
    pub to: i64,
    pub gap_secs: i64,
}

/// Find gaps between consecutive candles
///
/// # Arguments
/// * `candles` - Candles sorted by timestamp
/// * `max_gap_secs` - Largest spacing still considered continuous
///
/// # Returns
/// Every pair of neighbours spaced further apart than `max_gap_secs`
pub fn validate_candle_uniformity(candles: &[Candle], max_gap_secs: u64) -> Vec<CandleGap> {
    candles
        .windows(2)
        .filter_map(|pair| {
            let gap_secs = pair[1].timestamp - pair[0].timestamp;
            if gap_secs > max_gap_secs as i64 {
                Some(CandleGap {
                    from: pair[0].timestamp,
                    to: pair[1].timestamp,
                    gap_secs,
                })
            } else {
                None
            }
        })
        .collect()
}

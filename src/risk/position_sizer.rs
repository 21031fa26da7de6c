//! Fractional Kelly position sizing
//!
//! `kelly = p - (1 - p) / b`, clamped to [0, 1], scaled by a de-risking
//! multiplier and capped. The bankroll share is turned into lots by dividing by
//! the money one lot risks (`risk_points_per_lot * point_value`), then fitted to
//! the venue's volume grid. Volumes are only ever rounded down.

use crate::config::SizingConfig;
use crate::error::SizingError;
use crate::models::SymbolSpec;
use rust_decimal::Decimal;

/// Win probability and payoff ratio the sizer trusts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeEstimate {
    pub win_rate: Decimal,
    pub payoff_ratio: Decimal,
}

impl EdgeEstimate {
    pub fn new(win_rate: Decimal, payoff_ratio: Decimal) -> Self {
        Self {
            win_rate,
            payoff_ratio,
        }
    }

    /// Static estimate taken from configuration
    pub fn from_config(config: &SizingConfig) -> Self {
        Self::new(config.win_rate, config.payoff_ratio)
    }
}

/// Full Kelly fraction clamped to [0, 1]
pub fn kelly_fraction(win_rate: Decimal, payoff_ratio: Decimal) -> Decimal {
    if payoff_ratio <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let kelly = win_rate - (Decimal::ONE - win_rate) / payoff_ratio;
    kelly.max(Decimal::ZERO).min(Decimal::ONE)
}

/// Largest multiple of `step` not above `value`
pub fn round_down_to_step(value: Decimal, step: Decimal) -> Decimal {
    (value / step).floor() * step
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Bankroll fraction actually committed for `edge`
    pub fn applied_fraction(&self, edge: &EdgeEstimate) -> Decimal {
        let kelly = kelly_fraction(edge.win_rate, edge.payoff_ratio);
        (kelly * self.config.kelly_multiplier).min(self.config.max_kelly_fraction)
    }

    /// Volume to trade, or the reason there is no trade
    ///
    /// Never returns a volume outside `[min_volume, max_volume]` or off the step grid.
    /// A volume that would round below the venue minimum is rejected rather than
    /// bumped up to it.
    pub fn size(
        &self,
        balance: Decimal,
        edge: &EdgeEstimate,
        spec: &SymbolSpec,
    ) -> Result<Decimal, SizingError> {
        if balance <= self.config.balance_floor {
            return Err(SizingError::InsufficientBalance {
                balance,
                floor: self.config.balance_floor,
            });
        }

        if spec.volume_step <= Decimal::ZERO {
            return Err(SizingError::InvalidSpec(format!(
                "volume_step {} must be positive",
                spec.volume_step
            )));
        }
        if spec.min_volume > spec.max_volume {
            return Err(SizingError::InvalidSpec(format!(
                "min_volume {} exceeds max_volume {}",
                spec.min_volume, spec.max_volume
            )));
        }

        let kelly = kelly_fraction(edge.win_rate, edge.payoff_ratio);
        if kelly <= Decimal::ZERO {
            return Err(SizingError::NoEdge { kelly });
        }

        let fraction = self.applied_fraction(edge);
        let risk_per_lot = self.config.risk_points_per_lot * self.config.point_value;
        let raw_volume = balance * fraction / risk_per_lot;

        let volume = round_down_to_step(raw_volume.min(spec.max_volume), spec.volume_step);

        if volume < spec.min_volume || volume <= Decimal::ZERO {
            return Err(SizingError::BelowMinimumVolume {
                volume,
                min_volume: spec.min_volume,
            });
        }

        tracing::debug!(
            "Sized {} lots (balance {}, kelly {:.4}, applied {:.4})",
            volume,
            balance,
            kelly,
            fraction
        );

        Ok(volume)
    }
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self::new(SizingConfig::default())
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
            spread: dec!(1.0),
            stops_level: Decimal::ZERO,
            point: dec!(0.1),
        }
    }

    fn edge() -> EdgeEstimate {
        EdgeEstimate::new(dec!(0.8), dec!(2))
    }

    #[test]
    fn test_kelly_fraction() {
        // 0.8 - 0.2 / 2
        assert_eq!(kelly_fraction(dec!(0.8), dec!(2)), dec!(0.7));
        assert_eq!(kelly_fraction(dec!(0.3), dec!(1)), Decimal::ZERO);
        assert_eq!(kelly_fraction(dec!(1), dec!(0.5)), Decimal::ONE);
        assert_eq!(kelly_fraction(dec!(0.9), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_round_down_to_step() {
        assert_eq!(round_down_to_step(dec!(1.575), dec!(0.01)), dec!(1.57));
        assert_eq!(round_down_to_step(dec!(0.2), dec!(0.2)), dec!(0.2));
        assert_eq!(round_down_to_step(dec!(0.39), dec!(0.2)), dec!(0.2));
    }

    #[test]
    fn test_size_typical_balance() {
        let sizer = PositionSizer::default();
        // 90 * (0.7 * 0.25) / (10 * 1) = 1.575 -> 1.57
        let volume = sizer.size(dec!(90), &edge(), &spec()).unwrap();
        assert_eq!(volume, dec!(1.57));
    }

    #[test]
    fn test_size_clamped_to_max_volume() {
        let sizer = PositionSizer::default();
        let volume = sizer.size(dec!(100000), &edge(), &spec()).unwrap();
        assert_eq!(volume, dec!(50));
    }

    #[test]
    fn test_max_volume_off_grid_rounds_down() {
        let sizer = PositionSizer::default();
        let mut spec = spec();
        spec.max_volume = dec!(49.995);
        let volume = sizer.size(dec!(100000), &edge(), &spec).unwrap();
        assert_eq!(volume, dec!(49.99));
    }

    #[test]
    fn test_below_minimum_is_rejected_not_floored() {
        let sizer = PositionSizer::default();
        // 5 * 0.175 / 10 = 0.0875 -> 0.08 < 0.1
        let result = sizer.size(dec!(5), &edge(), &spec());
        assert_eq!(
            result,
            Err(SizingError::BelowMinimumVolume {
                volume: dec!(0.08),
                min_volume: dec!(0.1)
            })
        );
    }

    #[test]
    fn test_no_edge_means_no_trade() {
        let sizer = PositionSizer::default();
        let result = sizer.size(dec!(1000), &EdgeEstimate::new(dec!(0.3), dec!(1)), &spec());
        assert!(matches!(result, Err(SizingError::NoEdge { .. })));
    }

    #[test]
    fn test_balance_at_floor_rejected() {
        let sizer = PositionSizer::new(SizingConfig {
            balance_floor: dec!(50),
            ..SizingConfig::default()
        });
        assert!(matches!(
            sizer.size(dec!(50), &edge(), &spec()),
            Err(SizingError::InsufficientBalance { .. })
        ));
        assert!(matches!(
            sizer.size(Decimal::ZERO, &edge(), &spec()),
            Err(SizingError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_applied_fraction_capped() {
        let sizer = PositionSizer::new(SizingConfig {
            kelly_multiplier: dec!(1),
            max_kelly_fraction: dec!(0.5),
            ..SizingConfig::default()
        });
        assert_eq!(sizer.applied_fraction(&edge()), dec!(0.5));
    }

    #[test]
    fn test_volume_always_on_grid_and_in_bounds() {
        let sizer = PositionSizer::default();
        let spec = spec();
        for balance in [7, 13, 90, 250, 999, 5000, 31337, 1_000_000] {
            if let Ok(volume) = sizer.size(Decimal::from(balance), &edge(), &spec) {
                assert!(volume >= spec.min_volume && volume <= spec.max_volume);
                assert_eq!(round_down_to_step(volume, spec.volume_step), volume);
            }
        }
    }

    #[test]
    fn test_invalid_spec() {
        let sizer = PositionSizer::default();
        let mut spec = spec();
        spec.volume_step = Decimal::ZERO;
        assert!(matches!(
            sizer.size(dec!(90), &edge(), &spec),
            Err(SizingError::InvalidSpec(_))
        ));
    }
}

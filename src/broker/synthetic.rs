use crate::models::Candle;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::VecDeque;

/// Chance per candle that a sharp dip-and-rebound starts
const DIP_PROBABILITY: f64 = 0.05;

/// Random-walk candle source for the paper venue
///
/// Mostly noise, with occasional sharp dips followed by a rebound so that
/// V shapes show up in a live paper session.
pub struct SyntheticCandleGenerator {
    rng: StdRng,
    price: f64,
    volatility: f64,
    scripted: VecDeque<f64>,
}

impl SyntheticCandleGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64, start_price: Decimal, volatility: Decimal) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            price: start_price.to_f64().unwrap_or(1000.0),
            volatility: volatility.to_f64().unwrap_or(1.0).max(0.0001),
            scripted: VecDeque::new(),
        }
    }

    /// Next closed candle for bucket `timestamp`
    pub fn next_candle(&mut self, timestamp: i64) -> Candle {
        let open = self.price;
        let drift = self.next_drift();
        let close = (open + drift).max(self.volatility);

        let upper_wick = self.rng.gen_range(0.0..0.5) * self.volatility;
        let lower_wick = self.rng.gen_range(0.0..0.5) * self.volatility;
        let high = open.max(close) + upper_wick;
        let low = (open.min(close) - lower_wick).max(0.0);

        self.price = close;

        Candle::new(
            timestamp,
            to_price(open),
            to_price(high),
            to_price(low),
            to_price(close),
        )
    }

    /// Generate `count` consecutive candles starting at `start_timestamp`
    pub fn generate(&mut self, count: usize, start_timestamp: i64, bucket_seconds: i64) -> Vec<Candle> {
        (0..count)
            .map(|i| self.next_candle(start_timestamp + i as i64 * bucket_seconds))
            .collect()
    }

    fn next_drift(&mut self) -> f64 {
        if let Some(drift) = self.scripted.pop_front() {
            return drift;
        }

        if self.rng.gen_bool(DIP_PROBABILITY) {
            let depth = self.volatility * self.rng.gen_range(2.0..4.0);
            self.scripted.extend([-depth * 0.5, depth * 0.9, depth * 0.8]);
            return -depth;
        }

        self.rng.gen_range(-1.0..1.0) * self.volatility
    }
}

fn to_price(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default().round_dp(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_same_seed_same_candles() {
        let mut a = SyntheticCandleGenerator::new(7, dec!(8000), dec!(1.5));
        let mut b = SyntheticCandleGenerator::new(7, dec!(8000), dec!(1.5));
        assert_eq!(a.generate(50, 0, 60), b.generate(50, 0, 60));
    }

    #[test]
    fn test_candles_are_well_formed() {
        let mut gen = SyntheticCandleGenerator::new(1, dec!(8000), dec!(1.5));
        let candles = gen.generate(500, 0, 60);

        for pair in candles.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, 60);
            assert_eq!(pair[1].open, pair[0].close);
        }
        for candle in &candles {
            assert!(candle.high >= candle.open.max(candle.close));
            assert!(candle.low <= candle.open.min(candle.close));
        }
    }
}

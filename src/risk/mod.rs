// Risk management module
pub mod position_sizer;

pub use position_sizer::{kelly_fraction, round_down_to_step, EdgeEstimate, PositionSizer};

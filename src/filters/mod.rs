pub mod butterworth;
pub mod complementary;
pub mod kalman;
pub mod orientation;

use crate::config::{FusionConfig, PositionStrategy};

pub use butterworth::{apply_zero_phase, design, ComplementaryPair, FilterDesign, FilterKind};
pub use complementary::LowPassComplementaryPosition;
pub use kalman::{KalmanPosition, PositionFusion, PositionTick};
pub use orientation::{BatchComplementary, OnlineComplementary, OrientationFusion, OrientationRun};

/// Position strategy selected by configuration.
pub fn position_from_config(config: &FusionConfig) -> Box<dyn PositionFusion> {
    match config.position_strategy {
        PositionStrategy::Kalman => Box::new(KalmanPosition::from_config(config)),
        PositionStrategy::LowPassComplementary => Box::new(LowPassComplementaryPosition::from_config(config)),
    }
}

use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::error::FusionResult;
use crate::filters::kalman::{PositionFusion, PositionTick};
use crate::types::PositionState;

/// First-order blend of the (world-frame) ranging fix with planar
/// acceleration. No covariance; cheaper stand-in for the Kalman strategy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LowPassComplementaryPosition {
    alpha_pos: f64,
    position: (f64, f64),
    velocity: (f64, f64),
    has_output: bool,
}

impl LowPassComplementaryPosition {
    pub fn new(alpha_pos: f64) -> Self {
        Self {
            alpha_pos,
            position: (0.0, 0.0),
            velocity: (0.0, 0.0),
            has_output: false,
        }
    }

    pub fn from_config(config: &FusionConfig) -> Self {
        Self::new(config.alpha_pos)
    }

    pub fn alpha_pos(&self) -> f64 {
        self.alpha_pos
    }

    /// `alpha_pos * fix + (1 - alpha_pos) * accel`, per axis.
    pub fn blend(&self, fix: (f64, f64), accel: (f64, f64)) -> (f64, f64) {
        let a = self.alpha_pos;
        (a * fix.0 + (1.0 - a) * accel.0, a * fix.1 + (1.0 - a) * accel.1)
    }
}

impl PositionFusion for LowPassComplementaryPosition {
    fn tick(&mut self, accel: (f64, f64), fix: Option<(f64, f64)>, dt: f64) -> FusionResult<PositionTick> {
        match fix {
            Some(z) => {
                let next = self.blend(z, accel);
                self.velocity = if self.has_output && dt > 0.0 {
                    ((next.0 - self.position.0) / dt, (next.1 - self.position.1) / dt)
                } else {
                    (0.0, 0.0)
                };
                self.position = next;
                self.has_output = true;
            }
            // Nothing absolute this tick: hold
            None => self.velocity = (0.0, 0.0),
        }
        Ok(PositionTick { state: self.state(), innovation: None })
    }

    fn state(&self) -> PositionState {
        PositionState {
            position: self.position,
            velocity: self.velocity,
            covariance: None,
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.alpha_pos);
    }

    fn clone_box(&self) -> Box<dyn PositionFusion> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_blend_weights() {
        let mut filter = LowPassComplementaryPosition::new(0.9);
        let out = filter.tick((9.81, -9.81), Some((2.0, 3.0)), 0.1).unwrap();
        assert_abs_diff_eq!(out.state.position.0, 0.9 * 2.0 + 0.1 * 9.81, epsilon = 1e-12);
        assert_abs_diff_eq!(out.state.position.1, 0.9 * 3.0 - 0.1 * 9.81, epsilon = 1e-12);
        assert_eq!(out.state.velocity, (0.0, 0.0));
        assert_eq!(out.state.covariance, None);
    }

    #[test]
    fn test_velocity_from_successive_outputs() {
        let mut filter = LowPassComplementaryPosition::new(1.0);
        filter.tick((0.0, 0.0), Some((1.0, 1.0)), 0.1).unwrap();
        let out = filter.tick((0.0, 0.0), Some((1.5, 0.8)), 0.1).unwrap();
        assert_abs_diff_eq!(out.state.velocity.0, 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(out.state.velocity.1, -2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_holds_without_fix() {
        let mut filter = LowPassComplementaryPosition::new(0.9);
        filter.tick((0.0, 0.0), Some((4.0, -1.0)), 0.1).unwrap();
        let held = filter.state().position;
        let out = filter.tick((5.0, 5.0), None, 0.1).unwrap();
        assert_eq!(out.state.position, held);
        assert_eq!(out.state.velocity, (0.0, 0.0));
    }

    #[test]
    fn test_reset() {
        let mut filter = LowPassComplementaryPosition::new(0.7);
        filter.tick((1.0, 1.0), Some((1.0, 1.0)), 0.1).unwrap();
        filter.reset();
        assert_eq!(filter.state(), PositionState::default());
        assert_eq!(filter.alpha_pos(), 0.7);
    }
}

//! Planar constant-velocity Kalman filter for UWB + accelerometer fusion
//!
//! State Vector (4D):
//! [0-1]: Position (px, py) in the world frame (meters)
//! [2-3]: Velocity (vx, vy) in the world frame (m/s)
//!
//! Acceleration is a control input (drives velocity directly in predict);
//! ranging fixes are sparse absolute corrections of position.

use std::fmt::Debug;

use log::debug;
use nalgebra::Matrix2x4;

use crate::config::FusionConfig;
use crate::error::{FusionError, FusionResult};
use crate::types::{FixNoise, FixVec, KalmanGain, ObservationMat, PositionState, StateMat4, StateVec4};

/// Result of one position tick.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionTick {
    pub state: PositionState,
    /// Fix residual before correction, when a fix was applied.
    pub innovation: Option<(f64, f64)>,
}

/// A position strategy: one call per sample tick.
pub trait PositionFusion: Debug + Send {
    /// `accel` is the planar acceleration in m/s²; `fix` is already in the
    /// world frame.
    fn tick(&mut self, accel: (f64, f64), fix: Option<(f64, f64)>, dt: f64) -> FusionResult<PositionTick>;

    fn state(&self) -> PositionState;

    fn reset(&mut self);

    fn clone_box(&self) -> Box<dyn PositionFusion>;
}

impl Clone for Box<dyn PositionFusion> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

#[derive(Clone, Debug)]
pub struct KalmanPosition {
    /// State vector [px, py, vx, vy]
    x: StateVec4,
    /// Covariance
    p: StateMat4,
    initial_p: StateMat4,

    /// Process noise (diagonal)
    q: StateMat4,
    /// Fix measurement noise
    r: FixNoise,
    h: ObservationMat,
    singular_epsilon: f64,

    predicts: u64,
    updates: u64,
}

impl KalmanPosition {
    pub fn new(process_noise: [f64; 4], measurement_noise: [[f64; 2]; 2], singular_epsilon: f64) -> Self {
        let r = FixNoise::new(
            measurement_noise[0][0],
            measurement_noise[0][1],
            measurement_noise[1][0],
            measurement_noise[1][1],
        );
        Self {
            x: StateVec4::zeros(),
            p: StateMat4::identity(),
            initial_p: StateMat4::identity(),
            q: StateMat4::from_diagonal(&StateVec4::from(process_noise)),
            r,
            h: Matrix2x4::new(
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0,
            ),
            singular_epsilon,
            predicts: 0,
            updates: 0,
        }
    }

    pub fn from_config(config: &FusionConfig) -> Self {
        Self::new(config.process_noise, config.measurement_noise, config.singular_epsilon)
    }

    /// Replace the start-of-session covariance (identity by default).
    pub fn with_initial_covariance(mut self, p0: StateMat4) -> Self {
        self.p = p0;
        self.initial_p = p0;
        self
    }

    /// F(dt): identity with position integrating velocity.
    pub fn transition(dt: f64) -> StateMat4 {
        let mut f = StateMat4::identity();
        f[(0, 2)] = dt;
        f[(1, 3)] = dt;
        f
    }

    pub fn state_vector(&self) -> &StateVec4 {
        &self.x
    }

    pub fn covariance(&self) -> &StateMat4 {
        &self.p
    }

    pub fn update_count(&self) -> u64 {
        self.updates
    }

    /// x ← F x, then acceleration drives velocity; P ← F P Fᵀ + Q.
    pub fn predict(&mut self, accel: (f64, f64), dt: f64) {
        let f = Self::transition(dt);
        self.x = f * self.x;
        self.x[2] += accel.0 * dt;
        self.x[3] += accel.1 * dt;
        self.p = f * self.p * f.transpose() + self.q;
        self.predicts += 1;
    }

    /// Absolute fix correction. Returns the innovation; leaves the state
    /// untouched on `NumericalInstability`.
    pub fn update(&mut self, z: (f64, f64)) -> FusionResult<FixVec> {
        let innovation = FixVec::new(z.0, z.1) - self.h * self.x;
        let s: FixNoise = self.h * self.p * self.h.transpose() + self.r;

        let determinant = s.determinant();
        if !(determinant.is_finite() && determinant.abs() >= self.singular_epsilon) {
            return Err(FusionError::NumericalInstability { determinant });
        }
        let s_inv = s
            .try_inverse()
            .ok_or(FusionError::NumericalInstability { determinant })?;

        let k: KalmanGain = self.p * self.h.transpose() * s_inv;
        self.x += k * innovation;
        self.p = (StateMat4::identity() - k * self.h) * self.p;
        self.updates += 1;

        debug!(
            "[KF] fix update #{}: innovation=({:.3}, {:.3}) trace(P)={:.4}",
            self.updates,
            innovation[0],
            innovation[1],
            self.p.trace()
        );
        Ok(innovation)
    }
}

impl PositionFusion for KalmanPosition {
    fn tick(&mut self, accel: (f64, f64), fix: Option<(f64, f64)>, dt: f64) -> FusionResult<PositionTick> {
        self.predict(accel, dt);
        let innovation = match fix {
            Some(z) => {
                let y = self.update(z)?;
                Some((y[0], y[1]))
            }
            None => None,
        };
        Ok(PositionTick { state: self.state(), innovation })
    }

    fn state(&self) -> PositionState {
        let p = &self.p;
        PositionState {
            position: (self.x[0], self.x[1]),
            velocity: (self.x[2], self.x[3]),
            covariance: Some(std::array::from_fn(|i| std::array::from_fn(|j| p[(i, j)]))),
        }
    }

    fn reset(&mut self) {
        self.x = StateVec4::zeros();
        self.p = self.initial_p;
        self.predicts = 0;
        self.updates = 0;
    }

    fn clone_box(&self) -> Box<dyn PositionFusion> {
        Box::new(self.clone())
    }
}

//! Linear algebra type system for the position estimator
//!
//! Compile-time dimension checking for the planar constant-velocity
//! Kalman model driven by accelerometer control input.

use nalgebra::{Matrix3, SMatrix, SVector};

// ===== State Dimensions =====
pub const STATE_DIM: usize = 4; // [px, py, vx, vy]

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_FIX: usize = 2; // (x, y) absolute ranging fix

// ===== Kalman Filter Types =====
pub type StateVec4 = SVector<f64, STATE_DIM>;
pub type StateMat4 = SMatrix<f64, STATE_DIM, STATE_DIM>;

pub type FixVec = SVector<f64, MEASURE_DIM_FIX>;
pub type FixNoise = SMatrix<f64, MEASURE_DIM_FIX, MEASURE_DIM_FIX>;

pub type ObservationMat = SMatrix<f64, MEASURE_DIM_FIX, STATE_DIM>; // 2×4
pub type KalmanGain = SMatrix<f64, STATE_DIM, MEASURE_DIM_FIX>; // 4×2

// ===== Planar projective transform =====
pub type HomographyMat = Matrix3<f64>;

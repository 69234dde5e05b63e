pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// Absolute position fix from the ranging subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub x: f64,
    pub y: f64,
    /// Ranging quality factor reported by the tag (0-100).
    pub quality: Option<f64>,
}

/// One tick of raw sensor data. Accelerometer and gyroscope are always
/// present; magnetometer and fix may be missing on any given sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub timestamp: f64,
    pub accel: [f64; 3],
    pub gyro: [f64; 3],
    /// `[mx, my]` or `[mx, my, mz]`
    pub mag: Option<Vec<f64>>,
    pub fix: Option<PositionFix>,
}

impl SensorSample {
    pub fn new(timestamp: f64, accel: [f64; 3], gyro: [f64; 3]) -> Self {
        Self {
            timestamp,
            accel,
            gyro,
            mag: None,
            fix: None,
        }
    }

    pub fn with_mag(mut self, mag: &[f64]) -> Self {
        self.mag = Some(mag.to_vec());
        self
    }

    pub fn with_fix(mut self, x: f64, y: f64, quality: Option<f64>) -> Self {
        self.fix = Some(PositionFix { x, y, quality });
        self
    }

    /// Horizontal magnetic components, if at least two are present.
    pub fn mag_xy(&self) -> Option<(f64, f64)> {
        match self.mag.as_deref() {
            Some([mx, my, ..]) => Some((*mx, *my)),
            _ => None,
        }
    }
}

/// Ground-truth pose from an external motion-capture system, when the
/// run recorded one. Position in metres, yaw in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferencePose {
    pub position: Option<(f64, f64)>,
    pub yaw: Option<f64>,
}

impl ReferencePose {
    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.yaw.is_none()
    }
}

/// Roll/pitch/yaw in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OrientationState {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl OrientationState {
    /// Yaw folded into (-180, 180].
    pub fn yaw_wrapped(&self) -> f64 {
        wrap_degrees(self.yaw)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub position: (f64, f64),
    pub velocity: (f64, f64),
    /// Row-major 4×4 covariance; only tracked by the Kalman strategy.
    pub covariance: Option<[[f64; 4]; 4]>,
}

impl PositionState {
    pub fn covariance_trace(&self) -> Option<f64> {
        self.covariance
            .map(|p| (0..4).map(|i| p[i][i]).sum())
    }
}

/// Per-sample output handed to storage/rendering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusedPose {
    pub timestamp: f64,
    pub orientation: OrientationState,
    pub position: PositionState,
}

pub fn wrap_degrees(angle: f64) -> f64 {
    let mut wrapped = angle % 360.0;
    if wrapped > 180.0 {
        wrapped -= 360.0;
    } else if wrapped <= -180.0 {
        wrapped += 360.0;
    }
    wrapped
}

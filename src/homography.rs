//! Planar projective mapping of raw ranging coordinates into the world frame.

use crate::config::HomographyConfig;
use crate::error::{FusionError, FusionResult};
use crate::types::HomographyMat;
use nalgebra::Vector3;

/// Below this the projected point is at infinity.
const MIN_W: f64 = 1e-12;

#[derive(Clone, Debug, PartialEq)]
pub struct Homography {
    matrix: HomographyMat,
    output_scale: f64,
}

impl Homography {
    pub fn new(matrix: [[f64; 3]; 3], output_scale: f64) -> Self {
        Self {
            matrix: HomographyMat::from_fn(|i, j| matrix[i][j]),
            output_scale,
        }
    }

    pub fn from_config(config: &HomographyConfig) -> Self {
        Self::new(config.matrix, config.output_scale)
    }

    pub fn identity() -> Self {
        Self {
            matrix: HomographyMat::identity(),
            output_scale: 1.0,
        }
    }

    pub fn matrix(&self) -> &HomographyMat {
        &self.matrix
    }

    /// `H·[x, y, 1]`, perspective divide, then `output_scale`.
    pub fn apply(&self, x: f64, y: f64) -> FusionResult<(f64, f64)> {
        let p = self.matrix * Vector3::new(x, y, 1.0);
        let w = p[2];
        if !(w.is_finite() && w.abs() >= MIN_W) {
            return Err(FusionError::MalformedSample(format!(
                "fix ({x}, {y}) projects to w={w:e}"
            )));
        }
        Ok((p[0] / w * self.output_scale, p[1] / w * self.output_scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_identity() {
        let (x, y) = Homography::identity().apply(1.5, -2.0).unwrap();
        assert_eq!((x, y), (1.5, -2.0));
    }

    #[test]
    fn test_recorded_calibration() {
        let h = Homography::new(
            [
                [0.9806, 0.0487, -2036.3],
                [-0.0347, 1.0527, -2511.9],
                [-1.8418e-06, 1.0074e-05, 1.0],
            ],
            0.001,
        );
        let (raw_x, raw_y) = (3000.0, 4000.0);
        let w = -1.8418e-06 * raw_x + 1.0074e-05 * raw_y + 1.0;
        let expected_x = (0.9806 * raw_x + 0.0487 * raw_y - 2036.3) / w * 0.001;
        let expected_y = (-0.0347 * raw_x + 1.0527 * raw_y - 2511.9) / w * 0.001;

        let (x, y) = h.apply(raw_x, raw_y).unwrap();
        assert_abs_diff_eq!(x, expected_x, epsilon = 1e-12);
        assert_abs_diff_eq!(y, expected_y, epsilon = 1e-12);
        // Roughly a metre-scale world frame
        assert!(x.abs() < 5.0 && y.abs() < 5.0);
    }

    #[test]
    fn test_point_at_infinity() {
        let h = Homography::new([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]], 1.0);
        assert!(matches!(h.apply(0.0, 3.0), Err(FusionError::MalformedSample(_))));
    }
}

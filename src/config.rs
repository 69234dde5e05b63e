use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};

// ─── Strategy selectors ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrientationStrategy {
    /// Zero-phase low/high-pass pair over the whole recorded sequence.
    BatchComplementary,
    /// Per-sample recursive blend; the only strategy usable while streaming.
    OnlineComplementary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStrategy {
    Kalman,
    LowPassComplementary,
}

// ─── Units ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccelUnit {
    G,
    MetersPerSecSq,
}

impl AccelUnit {
    pub fn to_mps2(self, value: f64, gravity: f64) -> f64 {
        match self {
            AccelUnit::G => value * gravity,
            AccelUnit::MetersPerSecSq => value,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GyroUnit {
    DegPerSec,
    RadPerSec,
}

impl GyroUnit {
    pub fn to_deg_per_sec(self, value: f64) -> f64 {
        match self {
            GyroUnit::DegPerSec => value,
            GyroUnit::RadPerSec => value.to_degrees(),
        }
    }
}

// ─── Homography ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HomographyConfig {
    /// Row-major 3×3 planar projective transform.
    pub matrix: [[f64; 3]; 3],
    /// Applied after the perspective divide (0.001 for mm → m).
    #[serde(default = "default_output_scale")]
    pub output_scale: f64,
}

fn default_output_scale() -> f64 {
    1.0
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    // ── Timing ──
    pub sample_rate_hz: f64,
    pub use_sample_timestamps: bool,
    pub max_dt: f64,

    // ── Filter bank ──
    pub filter_order: usize,
    pub cutoff_hz: f64,

    // ── Orientation ──
    pub orientation_strategy: OrientationStrategy,
    pub alpha: f64,
    pub alpha_yaw: f64,
    pub yaw_gyro_weight: f64,
    pub yaw_mag_weight: f64,
    pub initial_yaw_deg: f64,
    pub max_tilt_deg: f64,
    pub min_horizontal_field: f64,

    // ── Position ──
    pub position_strategy: PositionStrategy,
    /// Diagonal of Q for [px, py, vx, vy].
    pub process_noise: [f64; 4],
    /// R for the (x, y) ranging fix.
    pub measurement_noise: [[f64; 2]; 2],
    pub singular_epsilon: f64,
    pub alpha_pos: f64,
    pub min_fix_quality: f64,
    pub homography: Option<HomographyConfig>,

    // ── Units ──
    pub accel_unit: AccelUnit,
    pub gyro_unit: GyroUnit,
    pub gravity: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 10.0,
            use_sample_timestamps: false,
            max_dt: 1.0,
            filter_order: 2,
            cutoff_hz: 0.1,
            orientation_strategy: OrientationStrategy::BatchComplementary,
            alpha: 0.96,
            alpha_yaw: 0.85,
            yaw_gyro_weight: 0.98,
            yaw_mag_weight: 0.02,
            initial_yaw_deg: 0.0,
            max_tilt_deg: 88.0,
            min_horizontal_field: 1e-6,
            position_strategy: PositionStrategy::Kalman,
            process_noise: [0.1; 4],
            measurement_noise: [[1.0, 0.0], [0.0, 1.0]],
            singular_epsilon: 1e-12,
            alpha_pos: 0.9,
            min_fix_quality: 0.0,
            homography: None,
            accel_unit: AccelUnit::G,
            gyro_unit: GyroUnit::DegPerSec,
            gravity: 9.81,
        }
    }
}

impl FusionConfig {
    /// Defaults for streaming: the recursive orientation strategy.
    pub fn online() -> Self {
        Self {
            orientation_strategy: OrientationStrategy::OnlineComplementary,
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: FusionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Nominal tick period.
    pub fn dt(&self) -> f64 {
        1.0 / self.sample_rate_hz
    }

    pub fn validate(&self) -> FusionResult<()> {
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(invalid(format!("sample_rate_hz must be positive, got {}", self.sample_rate_hz)));
        }
        if self.filter_order == 0 {
            return Err(invalid("filter_order must be at least 1".to_string()));
        }
        if !(self.max_dt > 0.0) {
            return Err(invalid(format!("max_dt must be positive, got {}", self.max_dt)));
        }
        for (name, value) in [
            ("alpha", self.alpha),
            ("alpha_yaw", self.alpha_yaw),
            ("alpha_pos", self.alpha_pos),
            ("yaw_gyro_weight", self.yaw_gyro_weight),
            ("yaw_mag_weight", self.yaw_mag_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{name} must lie in [0, 1], got {value}")));
            }
        }
        if !(self.max_tilt_deg > 0.0 && self.max_tilt_deg <= 90.0) {
            return Err(invalid(format!("max_tilt_deg must lie in (0, 90], got {}", self.max_tilt_deg)));
        }
        if self.process_noise.iter().any(|q| !(*q >= 0.0)) {
            return Err(invalid("process_noise entries must be non-negative".to_string()));
        }
        let r = self.measurement_noise;
        let det = r[0][0] * r[1][1] - r[0][1] * r[1][0];
        if !(r[0][0] > 0.0 && det > 0.0) {
            return Err(invalid("measurement_noise must be positive definite".to_string()));
        }
        if !(self.gravity > 0.0) {
            return Err(invalid(format!("gravity must be positive, got {}", self.gravity)));
        }
        Ok(())
    }
}

fn invalid(message: String) -> FusionError {
    FusionError::InvalidConfig(message)
}

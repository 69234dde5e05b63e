//! Roll/pitch/yaw estimation from accelerometer tilt, integrated gyro rate
//! and magnetometer heading.
//!
//! Two strategies share the same inputs:
//! - [`BatchComplementary`] low-passes the absolute angles and high-passes the
//!   integrated gyro angles over a whole recorded run (zero-phase), then sums.
//! - [`OnlineComplementary`] blends per sample with fixed weights and keeps
//!   its state between calls.
//!
//! All angles are degrees, all rates deg/s.

use log::{debug, warn};
use ndarray::Array1;
use crate::config::{FusionConfig, GyroUnit, OrientationStrategy};
use crate::error::{FusionError, FusionResult};
use crate::filters::butterworth::{apply_zero_phase, ComplementaryPair};
use crate::types::{OrientationState, SensorSample};

/// Roll and pitch from the gravity direction.
///
/// Fails when the accelerometer reads (near) zero or when either angle
/// reaches `max_tilt_deg`, where the formula loses resolution.
pub fn accel_tilt(accel: [f64; 3], index: usize, max_tilt_deg: f64) -> FusionResult<(f64, f64)> {
    let [ax, ay, az] = accel;
    let norm = (ax * ax + ay * ay + az * az).sqrt();
    if !(norm.is_finite() && norm > f64::EPSILON) {
        return Err(degenerate(index, format!("accelerometer magnitude {norm} gives no tilt reference")));
    }

    let roll = ay.atan2((ax * ax + az * az).sqrt()).to_degrees();
    let pitch = (-ax).atan2((ay * ay + az * az).sqrt()).to_degrees();
    if roll.abs() >= max_tilt_deg || pitch.abs() >= max_tilt_deg {
        return Err(degenerate(
            index,
            format!("tilt roll={roll:.1} pitch={pitch:.1} at or beyond ±{max_tilt_deg}"),
        ));
    }
    Ok((roll, pitch))
}

/// Heading from the horizontal magnetic components.
pub fn mag_heading(mx: f64, my: f64, index: usize, min_horizontal_field: f64) -> FusionResult<f64> {
    let horizontal = mx.hypot(my);
    if !(horizontal.is_finite() && horizontal > min_horizontal_field) {
        return Err(degenerate(
            index,
            format!("horizontal magnetic field {horizontal:e} too weak for heading"),
        ));
    }
    Ok(my.atan2(mx).to_degrees())
}

fn degenerate(index: usize, reason: String) -> FusionError {
    FusionError::DegenerateOrientation { index, reason }
}

/// Result of fusing a whole sequence.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrientationRun {
    pub states: Vec<OrientationState>,
    /// One `DegenerateOrientation` per affected sample.
    pub degenerate: Vec<FusionError>,
}

// ─── Batch strategy ──────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct BatchComplementary {
    filters: ComplementaryPair,
    yaw_gyro_weight: f64,
    yaw_mag_weight: f64,
    initial_yaw_deg: f64,
    max_tilt_deg: f64,
    min_horizontal_field: f64,
    gyro_unit: GyroUnit,
}

impl BatchComplementary {
    pub fn new(config: &FusionConfig) -> FusionResult<Self> {
        Ok(Self::with_filters(ComplementaryPair::from_config(config)?, config))
    }

    pub fn with_filters(filters: ComplementaryPair, config: &FusionConfig) -> Self {
        Self {
            filters,
            yaw_gyro_weight: config.yaw_gyro_weight,
            yaw_mag_weight: config.yaw_mag_weight,
            initial_yaw_deg: config.initial_yaw_deg,
            max_tilt_deg: config.max_tilt_deg,
            min_horizontal_field: config.min_horizontal_field,
            gyro_unit: config.gyro_unit,
        }
    }

    pub fn filters(&self) -> &ComplementaryPair {
        &self.filters
    }

    /// `dts[i]` is the integration step ending at sample `i`.
    pub fn fuse(&self, samples: &[SensorSample], dts: &[f64]) -> FusionResult<OrientationRun> {
        let n = samples.len();
        if dts.len() != n {
            return Err(FusionError::InvalidConfig(format!(
                "{} integration steps for {} samples",
                dts.len(),
                n
            )));
        }
        let required = self.filters.min_len();
        if n < required {
            return Err(FusionError::InsufficientData { len: n, required: required - 1 });
        }

        let mut degenerate = Vec::new();
        let mut roll_abs = Vec::with_capacity(n);
        let mut pitch_abs = Vec::with_capacity(n);
        let mut mag_yaw = Vec::with_capacity(n);
        let mut gyro_x = Array1::<f64>::zeros(n);
        let mut gyro_y = Array1::<f64>::zeros(n);
        let mut gyro_z = Array1::<f64>::zeros(n);
        let mut integrated = [0.0, 0.0, self.initial_yaw_deg];

        for (i, (sample, dt)) in samples.iter().zip(dts).enumerate() {
            let mut reasons = Vec::new();
            match accel_tilt(sample.accel, i, self.max_tilt_deg) {
                Ok((roll, pitch)) => {
                    roll_abs.push(Some(roll));
                    pitch_abs.push(Some(pitch));
                }
                Err(err) => {
                    roll_abs.push(None);
                    pitch_abs.push(None);
                    reasons.push(err);
                }
            }

            match sample.mag_xy() {
                Some((mx, my)) => match mag_heading(mx, my, i, self.min_horizontal_field) {
                    Ok(heading) => mag_yaw.push(Some(heading)),
                    Err(err) => {
                        mag_yaw.push(None);
                        reasons.push(err);
                    }
                },
                None => mag_yaw.push(None),
            }

            for (axis, rate) in sample.gyro.iter().enumerate() {
                integrated[axis] += self.gyro_unit.to_deg_per_sec(*rate) * dt;
            }
            gyro_x[i] = integrated[0];
            gyro_y[i] = integrated[1];
            gyro_z[i] = integrated[2];

            if let Some(err) = merge_reasons(i, reasons) {
                debug!("{err}");
                degenerate.push(err);
            }
        }

        if !degenerate.is_empty() {
            warn!("{} of {} samples have degenerate orientation references", degenerate.len(), n);
        }

        let roll = self.blend_tilt(&roll_abs, &gyro_x)?;
        let pitch = self.blend_tilt(&pitch_abs, &gyro_y)?;
        let yaw = match fill_gaps(&mag_yaw).map(unwrap_degrees) {
            Some(heading) => {
                let heading_lp = apply_zero_phase(&self.filters.lowpass, heading.view())?;
                &gyro_z * self.yaw_gyro_weight + &heading_lp * self.yaw_mag_weight
            }
            // No usable magnetometer: gyro-only yaw
            None => gyro_z,
        };

        let states = (0..n)
            .map(|i| OrientationState { roll: roll[i], pitch: pitch[i], yaw: yaw[i] })
            .collect();
        Ok(OrientationRun { states, degenerate })
    }

    fn blend_tilt(&self, absolute: &[Option<f64>], integrated: &Array1<f64>) -> FusionResult<Array1<f64>> {
        let gyro_hp = apply_zero_phase(&self.filters.highpass, integrated.view())?;
        match fill_gaps(absolute) {
            Some(tilt) => Ok(apply_zero_phase(&self.filters.lowpass, tilt.view())? + gyro_hp),
            None => Ok(gyro_hp),
        }
    }
}

/// Hold the last valid value over gaps; leading gaps take the first valid
/// value. `None` when nothing is valid.
fn fill_gaps(values: &[Option<f64>]) -> Option<Array1<f64>> {
    let first = values.iter().flatten().next().copied()?;
    let mut held = first;
    Some(Array1::from_iter(values.iter().map(|v| {
        if let Some(v) = v {
            held = *v;
        }
        held
    })))
}

/// Remove ±360° jumps so a heading near ±180° filters as one continuous
/// angle instead of averaging towards zero.
fn unwrap_degrees(mut angles: Array1<f64>) -> Array1<f64> {
    let mut offset = 0.0;
    let mut previous: Option<f64> = None;
    for angle in angles.iter_mut() {
        let raw = *angle;
        if let Some(prev) = previous {
            let step = raw - prev;
            if step > 180.0 {
                offset -= 360.0;
            } else if step < -180.0 {
                offset += 360.0;
            }
        }
        previous = Some(raw);
        *angle = raw + offset;
    }
    angles
}

fn merge_reasons(index: usize, reasons: Vec<FusionError>) -> Option<FusionError> {
    if reasons.len() <= 1 {
        return reasons.into_iter().next();
    }
    let joined = reasons
        .iter()
        .map(|err| match err {
            FusionError::DegenerateOrientation { reason, .. } => reason.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ");
    Some(degenerate(index, joined))
}

// ─── Online strategy ─────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct OnlineComplementary {
    alpha: f64,
    alpha_yaw: f64,
    initial_yaw_deg: f64,
    max_tilt_deg: f64,
    min_horizontal_field: f64,
    gyro_unit: GyroUnit,

    state: OrientationState,
    integrated: [f64; 3],
    ticks: usize,
}

impl OnlineComplementary {
    pub fn new(config: &FusionConfig) -> Self {
        Self {
            alpha: config.alpha,
            alpha_yaw: config.alpha_yaw,
            initial_yaw_deg: config.initial_yaw_deg,
            max_tilt_deg: config.max_tilt_deg,
            min_horizontal_field: config.min_horizontal_field,
            gyro_unit: config.gyro_unit,
            state: OrientationState::default(),
            integrated: [0.0, 0.0, config.initial_yaw_deg],
            ticks: 0,
        }
    }

    pub fn state(&self) -> OrientationState {
        self.state
    }

    /// Running integrated-gyro angles per axis.
    pub fn integrated_gyro(&self) -> [f64; 3] {
        self.integrated
    }

    pub fn reset(&mut self) {
        self.state = OrientationState::default();
        self.integrated = [0.0, 0.0, self.initial_yaw_deg];
        self.ticks = 0;
    }

    /// Advance one sample.
    ///
    /// On `DegenerateOrientation` the affected angles keep their previous
    /// value, the rest of the state still advances, and [`Self::state`]
    /// holds the output for this tick.
    pub fn step(&mut self, sample: &SensorSample, dt: f64) -> FusionResult<OrientationState> {
        let index = self.ticks;
        self.ticks += 1;

        let rates = sample.gyro.map(|r| self.gyro_unit.to_deg_per_sec(r));
        for (angle, rate) in self.integrated.iter_mut().zip(rates) {
            *angle += rate * dt;
        }

        let mut reasons = Vec::new();
        match accel_tilt(sample.accel, index, self.max_tilt_deg) {
            Ok((roll, pitch)) => {
                self.state.roll = self.alpha * (self.state.roll + rates[0] * dt) + (1.0 - self.alpha) * roll;
                self.state.pitch = self.alpha * (self.state.pitch + rates[1] * dt) + (1.0 - self.alpha) * pitch;
            }
            Err(err) => reasons.push(err),
        }

        match sample.mag_xy() {
            Some((mx, my)) => match mag_heading(mx, my, index, self.min_horizontal_field) {
                Ok(heading) => {
                    self.state.yaw = self.alpha_yaw * self.integrated[2] + (1.0 - self.alpha_yaw) * heading;
                }
                Err(err) => reasons.push(err),
            },
            None => self.state.yaw = self.integrated[2],
        }

        match merge_reasons(index, reasons) {
            Some(err) => Err(err),
            None => Ok(self.state),
        }
    }

    /// Step through a whole sequence from a fresh state.
    pub fn fuse(&mut self, samples: &[SensorSample], dts: &[f64]) -> OrientationRun {
        self.reset();
        let mut run = OrientationRun::default();
        for (sample, dt) in samples.iter().zip(dts) {
            if let Err(err) = self.step(sample, *dt) {
                run.degenerate.push(err);
            }
            run.states.push(self.state);
        }
        run
    }
}

// ─── Strategy selection ──────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum OrientationFusion {
    Batch(BatchComplementary),
    Online(OnlineComplementary),
}

impl OrientationFusion {
    pub fn from_config(config: &FusionConfig) -> FusionResult<Self> {
        Ok(match config.orientation_strategy {
            OrientationStrategy::BatchComplementary => Self::Batch(BatchComplementary::new(config)?),
            OrientationStrategy::OnlineComplementary => Self::Online(OnlineComplementary::new(config)),
        })
    }

    pub fn fuse_sequence(&mut self, samples: &[SensorSample], dts: &[f64]) -> FusionResult<OrientationRun> {
        match self {
            Self::Batch(batch) => batch.fuse(samples, dts),
            Self::Online(online) => Ok(online.fuse(samples, dts)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn level(n: usize) -> Vec<SensorSample> {
        (0..n)
            .map(|i| SensorSample::new(i as f64 * 0.1, [0.0, 0.0, 1.0], [0.0; 3]).with_mag(&[0.3, 0.0, -0.4]))
            .collect()
    }

    #[test]
    fn test_accel_tilt() {
        let (roll, pitch) = accel_tilt([0.0, 0.0, 1.0], 0, 88.0).unwrap();
        assert_abs_diff_eq!(roll, 0.0);
        assert_abs_diff_eq!(pitch, 0.0);

        let s = 45f64.to_radians().sin();
        let (roll, pitch) = accel_tilt([0.0, s, s], 0, 88.0).unwrap();
        assert_abs_diff_eq!(roll, 45.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pitch, 0.0, epsilon = 1e-9);

        let (_, pitch) = accel_tilt([-0.5, 0.0, 0.75f64.sqrt()], 0, 88.0).unwrap();
        assert_abs_diff_eq!(pitch, 30.0, epsilon = 1e-9);
    }

    #[test]
    fn test_tilt_degenerate_cases() {
        let err = accel_tilt([1.0, 0.0, 0.001], 7, 88.0).unwrap_err();
        assert!(matches!(err, FusionError::DegenerateOrientation { index: 7, .. }));
        assert!(accel_tilt([0.0, 0.0, 0.0], 0, 88.0).is_err());
    }

    #[test]
    fn test_mag_heading() {
        assert_abs_diff_eq!(mag_heading(1.0, 1.0, 0, 1e-6).unwrap(), 45.0, epsilon = 1e-12);
        assert_abs_diff_eq!(mag_heading(-1.0, 0.0, 0, 1e-6).unwrap(), 180.0, epsilon = 1e-12);
        assert!(matches!(
            mag_heading(0.0, 0.0, 3, 1e-6),
            Err(FusionError::DegenerateOrientation { index: 3, .. })
        ));
    }

    #[test]
    fn test_static_level_batch() {
        let config = FusionConfig::default();
        let batch = BatchComplementary::new(&config).unwrap();
        let samples = level(100);
        let run = batch.fuse(&samples, &vec![0.1; 100]).unwrap();
        assert_eq!(run.states.len(), 100);
        assert!(run.degenerate.is_empty());
        for state in &run.states {
            assert_abs_diff_eq!(state.roll, 0.0, epsilon = 1.0);
            assert_abs_diff_eq!(state.pitch, 0.0, epsilon = 1.0);
            // 0.98 * 0 + 0.02 * 0 (mag points along +x)
            assert_abs_diff_eq!(state.yaw, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_static_level_online_any_alpha() {
        for alpha in [0.0, 0.5, 0.96, 1.0] {
            let config = FusionConfig { alpha, ..FusionConfig::online() };
            let mut online = OnlineComplementary::new(&config);
            for sample in level(50) {
                let state = online.step(&sample, 0.1).unwrap();
                assert_abs_diff_eq!(state.roll, 0.0, epsilon = 1.0);
                assert_abs_diff_eq!(state.pitch, 0.0, epsilon = 1.0);
            }
        }
    }

    #[test]
    fn test_batch_tilt_tracks_accelerometer() {
        // Constant 20° roll with a still gyro: low-pass keeps it, high-pass of zero adds nothing
        let s = 20f64.to_radians();
        let samples: Vec<_> = (0..80)
            .map(|i| SensorSample::new(i as f64 * 0.1, [0.0, s.sin(), s.cos()], [0.0; 3]))
            .collect();
        let batch = BatchComplementary::new(&FusionConfig::default()).unwrap();
        let run = batch.fuse(&samples, &vec![0.1; 80]).unwrap();
        for state in &run.states {
            assert_abs_diff_eq!(state.roll, 20.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_batch_yaw_weights() {
        // Gyro turning at 1 deg/s, magnetometer fixed at 90°
        let samples: Vec<_> = (0..100)
            .map(|i| SensorSample::new(i as f64 * 0.1, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]).with_mag(&[0.0, 0.4]))
            .collect();
        let batch = BatchComplementary::new(&FusionConfig::default()).unwrap();
        let run = batch.fuse(&samples, &vec![0.1; 100]).unwrap();
        for (i, state) in run.states.iter().enumerate() {
            let gyro_yaw = 0.1 * (i + 1) as f64;
            assert_abs_diff_eq!(state.yaw, 0.98 * gyro_yaw + 0.02 * 90.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_batch_heading_across_wrap() {
        // Magnetometer pointing along -x, jittering either side of ±180°
        let jitter = 0.4 * 0.1f64.to_radians().tan();
        let samples: Vec<_> = (0..100)
            .map(|i| {
                let my = if i % 2 == 0 { jitter } else { -jitter };
                SensorSample::new(i as f64 * 0.1, [0.0, 0.0, 1.0], [0.0; 3]).with_mag(&[-0.4, my])
            })
            .collect();
        let batch = BatchComplementary::new(&FusionConfig::default()).unwrap();
        let run = batch.fuse(&samples, &vec![0.1; 100]).unwrap();
        for state in &run.states {
            assert_abs_diff_eq!(state.yaw, 0.02 * 180.0, epsilon = 0.01);
        }
    }

    #[test]
    fn test_unwrap_degrees() {
        let unwrapped = unwrap_degrees(Array1::from(vec![170.0, -170.0, -150.0, 175.0, -5.0]));
        assert_eq!(unwrapped.to_vec(), vec![170.0, 190.0, 210.0, 175.0, -5.0]);
    }

    #[test]
    fn test_batch_without_magnetometer_uses_gyro_yaw() {
        let samples: Vec<_> = (0..40)
            .map(|i| SensorSample::new(i as f64 * 0.1, [0.0, 0.0, 1.0], [0.0, 0.0, 2.0]))
            .collect();
        let config = FusionConfig { initial_yaw_deg: 10.0, ..FusionConfig::default() };
        let run = BatchComplementary::new(&config).unwrap().fuse(&samples, &vec![0.1; 40]).unwrap();
        assert_abs_diff_eq!(run.states[0].yaw, 10.2, epsilon = 1e-9);
        assert_abs_diff_eq!(run.states[39].yaw, 18.0, epsilon = 1e-9);
    }

    #[test]
    fn test_batch_marks_degenerate_without_nan() {
        let mut samples = level(60);
        samples[10].mag = Some(vec![0.0, 0.0, 0.5]);
        samples[20].accel = [0.0, 0.0, 0.0];
        let batch = BatchComplementary::new(&FusionConfig::default()).unwrap();
        let run = batch.fuse(&samples, &vec![0.1; 60]).unwrap();

        let marked: Vec<usize> = run
            .degenerate
            .iter()
            .filter_map(|e| match e {
                FusionError::DegenerateOrientation { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(marked, vec![10, 20]);
        assert!(run.states.iter().all(|s| s.roll.is_finite() && s.pitch.is_finite() && s.yaw.is_finite()));
        assert_abs_diff_eq!(run.states[10].yaw, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_batch_insufficient_data() {
        let batch = BatchComplementary::new(&FusionConfig::default()).unwrap();
        let samples = level(5);
        assert!(matches!(
            batch.fuse(&samples, &vec![0.1; 5]),
            Err(FusionError::InsufficientData { len: 5, .. })
        ));
    }

    #[test]
    fn test_online_blend() {
        let config = FusionConfig { alpha: 0.96, alpha_yaw: 0.85, ..FusionConfig::online() };
        let mut online = OnlineComplementary::new(&config);
        let s = 30f64.to_radians();
        let sample = SensorSample::new(0.0, [0.0, s.sin(), s.cos()], [10.0, 0.0, 5.0]).with_mag(&[1.0, 1.0]);
        let state = online.step(&sample, 0.1).unwrap();

        assert_abs_diff_eq!(state.roll, 0.96 * 1.0 + 0.04 * 30.0, epsilon = 1e-9);
        assert_abs_diff_eq!(state.pitch, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(state.yaw, 0.85 * 0.5 + 0.15 * 45.0, epsilon = 1e-9);
        assert_eq!(online.integrated_gyro(), [1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_online_rad_per_sec() {
        let config = FusionConfig { gyro_unit: GyroUnit::RadPerSec, ..FusionConfig::online() };
        let mut online = OnlineComplementary::new(&config);
        let sample = SensorSample::new(0.0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]);
        let state = online.step(&sample, 0.5).unwrap();
        assert_abs_diff_eq!(state.yaw, 0.5f64.to_degrees(), epsilon = 1e-9);
    }

    #[test]
    fn test_online_degenerate_mag_holds_yaw() {
        let mut online = OnlineComplementary::new(&FusionConfig::online());
        let good = SensorSample::new(0.0, [0.0, 0.0, 1.0], [0.0, 0.0, 3.0]).with_mag(&[0.2, 0.2]);
        let previous = online.step(&good, 0.1).unwrap();

        let bad = SensorSample::new(0.1, [0.0, 0.0, 1.0], [0.0, 0.0, 3.0]).with_mag(&[0.0, 0.0]);
        let err = online.step(&bad, 0.1).unwrap_err();
        assert!(matches!(err, FusionError::DegenerateOrientation { index: 1, .. }));
        assert_eq!(online.state().yaw, previous.yaw);

        let next = SensorSample::new(0.2, [0.0, 0.0, 1.0], [0.0, 0.0, 3.0]).with_mag(&[0.2, 0.2]);
        let state = online.step(&next, 0.1).unwrap();
        assert_abs_diff_eq!(state.yaw, 0.85 * 0.9 + 0.15 * 45.0, epsilon = 1e-9);
    }

    #[test]
    fn test_online_degenerate_tilt_holds_angles() {
        let mut online = OnlineComplementary::new(&FusionConfig::online());
        let s = 10f64.to_radians();
        let tilted = SensorSample::new(0.0, [0.0, s.sin(), s.cos()], [0.0; 3]);
        let previous = online.step(&tilted, 0.1).unwrap();

        let falling = SensorSample::new(0.1, [0.0, 0.0, 0.0], [0.0; 3]);
        assert!(online.step(&falling, 0.1).is_err());
        assert_eq!(online.state().roll, previous.roll);
        assert_eq!(online.state().pitch, previous.pitch);
    }

    #[test]
    fn test_online_fuse_restarts() {
        let mut online = OnlineComplementary::new(&FusionConfig::online());
        let samples: Vec<_> = (0..20)
            .map(|i| SensorSample::new(i as f64, [0.1, 0.2, 0.9], [1.0, -1.0, 0.5]).with_mag(&[0.3, 0.1]))
            .collect();
        let first = online.fuse(&samples, &vec![0.1; 20]);
        let second = online.fuse(&samples, &vec![0.1; 20]);
        assert_eq!(first, second);
    }
}

// sensor_fusion.rs: Pure computation layer for UWB + IMU pose fusion
//
// Everything in this module is independent of:
//   - tokio / async runtime
//   - the TCP acquisition link
//   - File I/O, CSV tables, status files
//
// It takes sensor samples in, produces fused poses and events out. One
// FusionSession owns all mutable filter state for one run; sessions share
// nothing, so independent runs can live side by side.

use log::{debug, info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::{FusionConfig, OrientationStrategy, PositionStrategy};
use crate::error::{FusionError, FusionResult};
use crate::filters::{self, BatchComplementary, ComplementaryPair, OnlineComplementary, OrientationFusion, PositionFusion};
use crate::homography::Homography;
use crate::types::{FusedPose, OrientationState, PositionState, SensorSample};

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum FusionEvent {
    /// Tilt or heading reference unusable; affected angles held.
    DegenerateOrientation(FusionError),
    /// Sample dropped before touching any state.
    SampleSkipped(FusionError),
    /// Fix present but not used this tick (predict only).
    FixRejected { quality: Option<f64>, reason: String },
    /// Fix used; the Kalman strategy reports its innovation.
    FixApplied { innovation: Option<(f64, f64)> },
}

// ─── Outputs ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct TickOutput {
    pub pose: FusedPose,
    pub events: Vec<FusionEvent>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchOutput {
    /// One pose per retained sample, in input order.
    pub poses: Vec<FusedPose>,
    pub events: Vec<FusionEvent>,
}

impl BatchOutput {
    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    pub fn orientations(&self) -> Vec<OrientationState> {
        self.poses.iter().map(|p| p.orientation).collect()
    }

    pub fn positions(&self) -> Vec<PositionState> {
        self.poses.iter().map(|p| p.position.clone()).collect()
    }

    /// n × 5 table: angle_x, angle_y, angle_z, pos_x, pos_y.
    pub fn table(&self) -> Array2<f64> {
        let mut table = Array2::<f64>::zeros((self.poses.len(), 5));
        for (mut row, pose) in table.rows_mut().into_iter().zip(&self.poses) {
            row[0] = pose.orientation.roll;
            row[1] = pose.orientation.pitch;
            row[2] = pose.orientation.yaw;
            row[3] = pose.position.position.0;
            row[4] = pose.position.position.1;
        }
        table
    }
}

// ─── Session snapshot ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
struct SessionCounters {
    ticks: u64,
    samples_skipped: u64,
    fixes_applied: u64,
    fixes_rejected: u64,
    degenerate_samples: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub ticks: u64,
    pub samples_skipped: u64,
    pub fixes_applied: u64,
    pub fixes_rejected: u64,
    pub degenerate_samples: u64,
    pub orientation_strategy: OrientationStrategy,
    pub position_strategy: PositionStrategy,
    pub pose: Option<FusedPose>,
    pub covariance_trace: Option<f64>,
}

// ─── The session ─────────────────────────────────────────────────────────────

/// The mutable part of a session, restored when a tick fails.
#[derive(Clone, Debug)]
struct Checkpoint {
    orientation: Option<OnlineComplementary>,
    position: Box<dyn PositionFusion>,
    last_timestamp: Option<f64>,
    last_pose: Option<FusedPose>,
    counters: SessionCounters,
}

#[derive(Clone, Debug)]
pub struct FusionSession {
    config: FusionConfig,
    filters: ComplementaryPair,
    orientation: OrientationFusion,
    position: Box<dyn PositionFusion>,
    homography: Option<Homography>,

    last_timestamp: Option<f64>,
    last_pose: Option<FusedPose>,
    counters: SessionCounters,
}

impl FusionSession {
    pub fn new(config: FusionConfig) -> FusionResult<Self> {
        let position = filters::position_from_config(&config);
        Self::with_position(config, position)
    }

    /// Session with a caller-supplied position strategy.
    pub fn with_position(config: FusionConfig, position: Box<dyn PositionFusion>) -> FusionResult<Self> {
        config.validate()?;
        let filters = ComplementaryPair::from_config(&config)?;
        let orientation = match config.orientation_strategy {
            OrientationStrategy::BatchComplementary => {
                OrientationFusion::Batch(BatchComplementary::with_filters(filters.clone(), &config))
            }
            OrientationStrategy::OnlineComplementary => OrientationFusion::Online(OnlineComplementary::new(&config)),
        };
        let homography = config.homography.as_ref().map(Homography::from_config);

        info!(
            "[FUSION] session: {:?}/{:?} at {} Hz, order {} cutoff {} Hz{}",
            config.orientation_strategy,
            config.position_strategy,
            config.sample_rate_hz,
            config.filter_order,
            config.cutoff_hz,
            if homography.is_some() { ", homography on" } else { "" }
        );

        Ok(Self {
            config,
            filters,
            orientation,
            position,
            homography,
            last_timestamp: None,
            last_pose: None,
            counters: SessionCounters::default(),
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn filters(&self) -> &ComplementaryPair {
        &self.filters
    }

    /// Back to start-of-session state; designs and configuration are kept.
    pub fn reset(&mut self) {
        if let OrientationFusion::Online(online) = &mut self.orientation {
            online.reset();
        }
        self.position.reset();
        self.last_timestamp = None;
        self.last_pose = None;
        self.counters = SessionCounters::default();
    }

    // ── Batch ────────────────────────────────────────────────────────────

    /// Fuse a whole recorded run. Starts from a fresh state, so calling it
    /// twice on the same input gives the same output.
    pub fn run_batch(&mut self, samples: &[SensorSample]) -> FusionResult<BatchOutput> {
        self.reset();
        let mut events = Vec::new();

        let mut kept = Vec::with_capacity(samples.len());
        let mut dts = Vec::with_capacity(samples.len());
        for sample in samples {
            match self.admit(sample) {
                Ok(dt) => {
                    kept.push(sample.clone());
                    dts.push(dt);
                }
                Err(err) => events.push(self.skip(sample, err)),
            }
        }

        let run = self.orientation.fuse_sequence(&kept, &dts)?;
        self.counters.degenerate_samples += run.degenerate.len() as u64;
        events.extend(run.degenerate.into_iter().map(FusionEvent::DegenerateOrientation));

        let mut poses = Vec::with_capacity(kept.len());
        for ((sample, dt), orientation) in kept.iter().zip(&dts).zip(run.states) {
            let fix = self.gate_fix(sample, &mut events);
            let accel = self.planar_accel(sample);
            let tick = self.position.tick(accel, fix, *dt)?;
            if fix.is_some() {
                self.counters.fixes_applied += 1;
                events.push(FusionEvent::FixApplied { innovation: tick.innovation });
            }
            self.counters.ticks += 1;
            poses.push(FusedPose { timestamp: sample.timestamp, orientation, position: tick.state });
        }
        self.last_pose = poses.last().cloned();

        info!(
            "[FUSION] batch: {} samples in, {} poses out, {} fixes applied, {} degenerate",
            samples.len(),
            poses.len(),
            self.counters.fixes_applied,
            self.counters.degenerate_samples
        );
        Ok(BatchOutput { poses, events })
    }

    // ── Online ───────────────────────────────────────────────────────────

    /// Process exactly one sample. Recoverable conditions come back as
    /// events; on a fatal error the session is left as it was before the
    /// call.
    pub fn step_online(&mut self, sample: &SensorSample) -> FusionResult<TickOutput> {
        if !matches!(self.orientation, OrientationFusion::Online(_)) {
            return Err(FusionError::InvalidConfig(
                "step_online needs the online_complementary orientation strategy".to_string(),
            ));
        }

        let saved = self.checkpoint();
        match self.advance(sample) {
            Ok(output) => Ok(output),
            Err(err) => {
                warn!("[FUSION] tick at t={:.3} failed, state rolled back: {err}", sample.timestamp);
                self.restore(saved);
                Err(err)
            }
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            orientation: match &self.orientation {
                OrientationFusion::Online(online) => Some(online.clone()),
                OrientationFusion::Batch(_) => None,
            },
            position: self.position.clone(),
            last_timestamp: self.last_timestamp,
            last_pose: self.last_pose.clone(),
            counters: self.counters,
        }
    }

    fn restore(&mut self, saved: Checkpoint) {
        if let Some(online) = saved.orientation {
            self.orientation = OrientationFusion::Online(online);
        }
        self.position = saved.position;
        self.last_timestamp = saved.last_timestamp;
        self.last_pose = saved.last_pose;
        self.counters = saved.counters;
    }

    fn advance(&mut self, sample: &SensorSample) -> FusionResult<TickOutput> {
        let mut events = Vec::new();

        let dt = match self.admit(sample) {
            Ok(dt) => dt,
            Err(err) => {
                events.push(self.skip(sample, err));
                return Ok(TickOutput { pose: self.current_pose(sample.timestamp), events });
            }
        };

        let orientation = match &mut self.orientation {
            OrientationFusion::Online(online) => match online.step(sample, dt) {
                Ok(state) => state,
                Err(err) if err.is_recoverable() => {
                    debug!("[FUSION] {err}");
                    self.counters.degenerate_samples += 1;
                    events.push(FusionEvent::DegenerateOrientation(err));
                    online.state()
                }
                Err(err) => return Err(err),
            },
            OrientationFusion::Batch(_) => {
                return Err(FusionError::InvalidConfig("batch orientation cannot step".to_string()))
            }
        };

        let fix = self.gate_fix(sample, &mut events);
        let accel = self.planar_accel(sample);
        let tick = self.position.tick(accel, fix, dt)?;
        if fix.is_some() {
            self.counters.fixes_applied += 1;
            events.push(FusionEvent::FixApplied { innovation: tick.innovation });
        }

        self.counters.ticks += 1;
        let pose = FusedPose { timestamp: sample.timestamp, orientation, position: tick.state };
        self.last_pose = Some(pose.clone());
        Ok(TickOutput { pose, events })
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn orientation_state(&self) -> OrientationState {
        match &self.orientation {
            OrientationFusion::Online(online) => online.state(),
            OrientationFusion::Batch(_) => self.last_pose.as_ref().map(|p| p.orientation).unwrap_or_default(),
        }
    }

    pub fn position_state(&self) -> PositionState {
        self.position.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            ticks: self.counters.ticks,
            samples_skipped: self.counters.samples_skipped,
            fixes_applied: self.counters.fixes_applied,
            fixes_rejected: self.counters.fixes_rejected,
            degenerate_samples: self.counters.degenerate_samples,
            orientation_strategy: self.config.orientation_strategy,
            position_strategy: self.config.position_strategy,
            pose: self.last_pose.clone(),
            covariance_trace: self.position.state().covariance_trace(),
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Validates the sample and returns its integration step. Advances the
    /// timestamp cursor only for accepted samples.
    fn admit(&mut self, sample: &SensorSample) -> FusionResult<f64> {
        if sample.accel.iter().chain(&sample.gyro).any(|v| !v.is_finite()) {
            return Err(FusionError::MalformedSample(format!(
                "non-finite inertial reading at t={}",
                sample.timestamp
            )));
        }

        let dt = if self.config.use_sample_timestamps {
            let t = sample.timestamp;
            if !t.is_finite() {
                return Err(FusionError::MalformedSample(format!("timestamp {t} is not finite")));
            }
            match self.last_timestamp {
                None => self.config.dt(),
                Some(prev) if t <= prev => {
                    return Err(FusionError::MalformedSample(format!("timestamp {t} not after {prev}")));
                }
                Some(prev) if t - prev > self.config.max_dt => {
                    // Resync so one gap does not reject every later sample
                    self.last_timestamp = Some(t);
                    return Err(FusionError::MalformedSample(format!(
                        "gap of {:.3}s exceeds max_dt {}",
                        t - prev,
                        self.config.max_dt
                    )));
                }
                Some(prev) => t - prev,
            }
        } else {
            self.config.dt()
        };

        self.last_timestamp = Some(sample.timestamp);
        Ok(dt)
    }

    fn skip(&mut self, sample: &SensorSample, err: FusionError) -> FusionEvent {
        warn!("[FUSION] skipping sample at t={}: {err}", sample.timestamp);
        self.counters.samples_skipped += 1;
        FusionEvent::SampleSkipped(err)
    }

    /// World-frame fix for this tick, or `None` if absent or rejected.
    fn gate_fix(&mut self, sample: &SensorSample, events: &mut Vec<FusionEvent>) -> Option<(f64, f64)> {
        let fix = sample.fix?;
        let min_quality = self.config.min_fix_quality;

        let verdict = if !(fix.x.is_finite() && fix.y.is_finite()) {
            Err(format!("non-finite fix ({}, {})", fix.x, fix.y))
        } else if let Some(q) = fix.quality.filter(|q| *q < min_quality) {
            Err(format!("quality {q} below {min_quality}"))
        } else {
            match &self.homography {
                Some(h) => h.apply(fix.x, fix.y).map_err(|err| err.to_string()),
                None => Ok((fix.x, fix.y)),
            }
        };

        match verdict {
            Ok(world) => Some(world),
            Err(reason) => {
                debug!("[FUSION] fix rejected at t={}: {reason}", sample.timestamp);
                self.counters.fixes_rejected += 1;
                events.push(FusionEvent::FixRejected { quality: fix.quality, reason });
                None
            }
        }
    }

    fn planar_accel(&self, sample: &SensorSample) -> (f64, f64) {
        let unit = self.config.accel_unit;
        let g = self.config.gravity;
        (unit.to_mps2(sample.accel[0], g), unit.to_mps2(sample.accel[1], g))
    }

    fn current_pose(&self, timestamp: f64) -> FusedPose {
        FusedPose {
            timestamp,
            orientation: self.orientation_state(),
            position: self.position.state(),
        }
    }
}

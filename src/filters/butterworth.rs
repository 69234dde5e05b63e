//! Butterworth filter bank with zero-phase (forward-backward) application.
//!
//! Designs follow the usual analog-prototype → frequency transform →
//! bilinear route and are stored as transfer-function coefficients. Edges
//! are handled with odd reflection padding of `3 * (order + 1)` samples and
//! steady-state initial conditions, so a constant input passes through a
//! low-pass design unchanged.

use std::f64::consts::PI;

use log::debug;
use nalgebra::{Complex, DMatrix, DVector};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::error::{FusionError, FusionResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterKind {
    Lowpass,
    Highpass,
}

/// Immutable coefficient set for one filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterDesign {
    pub kind: FilterKind,
    pub order: usize,
    pub cutoff_hz: f64,
    pub sample_rate_hz: f64,
    b: Vec<f64>,
    a: Vec<f64>,
    /// Steady-state filter delays for a unit step input.
    zi: Vec<f64>,
}

impl FilterDesign {
    pub fn numerator(&self) -> &[f64] {
        &self.b
    }

    pub fn denominator(&self) -> &[f64] {
        &self.a
    }

    /// Samples of reflection padding added on each side.
    pub fn pad_len(&self) -> usize {
        3 * self.a.len()
    }

    /// Shortest sequence `apply_zero_phase` accepts.
    pub fn min_len(&self) -> usize {
        self.pad_len() + 1
    }

    /// |H(f)| of a single forward pass.
    pub fn magnitude_response(&self, freq_hz: f64) -> f64 {
        let w = 2.0 * PI * freq_hz / self.sample_rate_hz;
        let eval = |coeffs: &[f64]| {
            coeffs
                .iter()
                .enumerate()
                .fold(Complex::new(0.0, 0.0), |acc, (k, c)| {
                    acc + Complex::from_polar(*c, -w * k as f64)
                })
        };
        (eval(self.b.as_slice()) / eval(self.a.as_slice())).norm()
    }

    /// Gain of the forward-backward pass, i.e. |H(f)|².
    pub fn zero_phase_response(&self, freq_hz: f64) -> f64 {
        self.magnitude_response(freq_hz).powi(2)
    }

    /// Direct form II transposed, delays seeded with `zi * initial`.
    fn run(&self, input: &[f64], initial: f64) -> Vec<f64> {
        let n = self.a.len() - 1;
        let mut z: Vec<f64> = self.zi.iter().map(|v| v * initial).collect();
        z.push(0.0);

        let mut output = Vec::with_capacity(input.len());
        for &x in input {
            let y = self.b[0] * x + z[0];
            for i in 0..n {
                z[i] = self.b[i + 1] * x + z[i + 1] - self.a[i + 1] * y;
            }
            output.push(y);
        }
        output
    }
}

/// Design an `order`-th order Butterworth filter.
pub fn design(
    order: usize,
    cutoff_hz: f64,
    sample_rate_hz: f64,
    kind: FilterKind,
) -> FusionResult<FilterDesign> {
    let nyquist_hz = sample_rate_hz / 2.0;
    if !(cutoff_hz > 0.0 && cutoff_hz < nyquist_hz) {
        return Err(FusionError::InvalidCutoff { cutoff_hz, nyquist_hz });
    }
    if order == 0 {
        return Err(FusionError::InvalidConfig("filter order must be at least 1".to_string()));
    }

    let one = Complex::new(1.0, 0.0);
    // Bilinear transform with a normalized sample rate of 2
    let fs2 = Complex::new(4.0, 0.0);
    let warped = 4.0 * (PI * (cutoff_hz / nyquist_hz) / 2.0).tan();

    let prototype: Vec<Complex<f64>> = (0..order)
        .map(|k| {
            let m = 2.0 * k as f64 + 1.0 - order as f64;
            -Complex::from_polar(1.0, PI * m / (2.0 * order as f64))
        })
        .collect();

    let (zeros, poles, gain) = match kind {
        FilterKind::Lowpass => {
            let poles: Vec<_> = prototype.iter().map(|p| *p * warped).collect();
            (Vec::new(), poles, warped.powi(order as i32))
        }
        FilterKind::Highpass => {
            let poles: Vec<_> = prototype.iter().map(|p| Complex::new(warped, 0.0) / *p).collect();
            let gain = 1.0 / prototype.iter().fold(one, |acc, p| acc * -*p).re;
            (vec![Complex::new(0.0, 0.0); order], poles, gain)
        }
    };

    let mut digital_zeros: Vec<_> = zeros.iter().map(|z| (fs2 + *z) / (fs2 - *z)).collect();
    let digital_poles: Vec<_> = poles.iter().map(|p| (fs2 + *p) / (fs2 - *p)).collect();
    digital_zeros.resize(digital_poles.len(), Complex::new(-1.0, 0.0));

    let num = zeros.iter().fold(one, |acc, z| acc * (fs2 - *z));
    let den = poles.iter().fold(one, |acc, p| acc * (fs2 - *p));
    let k = gain * (num / den).re;

    let b: Vec<f64> = poly(&digital_zeros).iter().map(|c| c.re * k).collect();
    let a: Vec<f64> = poly(&digital_poles).iter().map(|c| c.re).collect();
    let zi = steady_state(&b, &a)?;

    debug!(
        "Designed {:?} order {} at {:.3} Hz (fs {:.1} Hz): b={:?} a={:?}",
        kind, order, cutoff_hz, sample_rate_hz, b, a
    );

    Ok(FilterDesign {
        kind,
        order,
        cutoff_hz,
        sample_rate_hz,
        b,
        a,
        zi,
    })
}

/// Forward pass, time-reversed backward pass, same coefficients.
pub fn apply_zero_phase(design: &FilterDesign, signal: ArrayView1<f64>) -> FusionResult<Array1<f64>> {
    let n = signal.len();
    let pad = design.pad_len();
    if n <= pad {
        return Err(FusionError::InsufficientData { len: n, required: pad });
    }
    if let Some(idx) = signal.iter().position(|v| !v.is_finite()) {
        return Err(FusionError::MalformedSample(format!(
            "non-finite value at index {idx} in filter input"
        )));
    }

    let first = signal[0];
    let last = signal[n - 1];
    let mut extended = Vec::with_capacity(n + 2 * pad);
    extended.extend((1..=pad).rev().map(|i| 2.0 * first - signal[i]));
    extended.extend(signal.iter().copied());
    extended.extend((1..=pad).map(|i| 2.0 * last - signal[n - 1 - i]));

    let forward = design.run(&extended, extended[0]);
    let reversed: Vec<f64> = forward.into_iter().rev().collect();
    let mut backward = design.run(&reversed, reversed[0]);
    backward.reverse();

    Ok(Array1::from(backward[pad..pad + n].to_vec()))
}

/// Low/high-pass designs sharing order and cutoff.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComplementaryPair {
    pub lowpass: FilterDesign,
    pub highpass: FilterDesign,
}

impl ComplementaryPair {
    pub fn new(order: usize, cutoff_hz: f64, sample_rate_hz: f64) -> FusionResult<Self> {
        Ok(Self {
            lowpass: design(order, cutoff_hz, sample_rate_hz, FilterKind::Lowpass)?,
            highpass: design(order, cutoff_hz, sample_rate_hz, FilterKind::Highpass)?,
        })
    }

    pub fn from_config(config: &FusionConfig) -> FusionResult<Self> {
        Self::new(config.filter_order, config.cutoff_hz, config.sample_rate_hz)
    }

    pub fn min_len(&self) -> usize {
        self.lowpass.min_len().max(self.highpass.min_len())
    }
}

fn poly(roots: &[Complex<f64>]) -> Vec<Complex<f64>> {
    let mut coeffs = vec![Complex::new(1.0, 0.0)];
    for root in roots {
        let mut next = vec![Complex::new(0.0, 0.0); coeffs.len() + 1];
        for (i, c) in coeffs.iter().enumerate() {
            next[i] += *c;
            next[i + 1] -= *c * *root;
        }
        coeffs = next;
    }
    coeffs
}

/// Solve `(I - Aᵀ) zi = b[1..] - a[1..] * b[0]` where A is the companion
/// matrix of the denominator.
fn steady_state(b: &[f64], a: &[f64]) -> FusionResult<Vec<f64>> {
    let n = a.len() - 1;
    let mut m = DMatrix::<f64>::identity(n, n);
    for i in 0..n {
        m[(i, 0)] += a[i + 1];
        if i + 1 < n {
            m[(i, i + 1)] -= 1.0;
        }
    }
    let rhs = DVector::from_iterator(n, (0..n).map(|i| b[i + 1] - a[i + 1] * b[0]));
    let determinant = m.determinant();
    m.lu()
        .solve(&rhs)
        .map(|zi| zi.iter().copied().collect())
        .ok_or(FusionError::NumericalInstability { determinant })
}

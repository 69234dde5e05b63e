use thiserror::Error;

/// Pose fusion error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("Invalid cutoff: {cutoff_hz} Hz must lie in (0, {nyquist_hz}) Hz")]
    InvalidCutoff { cutoff_hz: f64, nyquist_hz: f64 },

    #[error("Insufficient data: {len} samples, zero-phase filtering needs more than {required}")]
    InsufficientData { len: usize, required: usize },

    #[error("Malformed sample: {0}")]
    MalformedSample(String),

    #[error("Degenerate orientation at sample {index}: {reason}")]
    DegenerateOrientation { index: usize, reason: String },

    #[error("Numerical instability: innovation covariance determinant {determinant:e}")]
    NumericalInstability { determinant: f64 },

    #[error("Acquisition disconnected: {0}")]
    AcquisitionDisconnected(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FusionError {
    /// Malformed records and degenerate orientation samples are handled by
    /// skipping or holding; everything else ends the current run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FusionError::MalformedSample(_) | FusionError::DegenerateOrientation { .. }
        )
    }
}

/// Result type for fusion operations
pub type FusionResult<T> = Result<T, FusionError>;

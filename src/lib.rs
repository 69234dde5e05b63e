//! UWB + IMU pose fusion.
//!
//! Orientation comes from accelerometer tilt, integrated gyro rate and
//! magnetometer heading (complementary filtering, batch or online). Planar
//! position comes from a Kalman filter that takes acceleration as control
//! input and UWB fixes as sparse absolute corrections.

pub mod config;
pub mod dataset;
pub mod error;
pub mod filters;
pub mod homography;
pub mod live_status;
pub mod sensor_fusion;
pub mod sensors;
pub mod types;

pub use config::FusionConfig;
pub use error::{FusionError, FusionResult};
pub use sensor_fusion::{BatchOutput, FusionEvent, FusionSession, SessionSnapshot, TickOutput};
pub use types::{FusedPose, OrientationState, PositionFix, PositionState, ReferencePose, SensorSample};

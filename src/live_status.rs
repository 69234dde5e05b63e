use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::sensor_fusion::SessionSnapshot;

/// Status file for external consumers of an online session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub connected: bool,
    // Session counters
    pub ticks: u64,
    pub samples_skipped: u64,
    pub fixes_applied: u64,
    pub fixes_rejected: u64,
    pub degenerate_samples: u64,
    // Latest pose
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
    pub pos_x: f64,
    pub pos_y: f64,
    pub vel_x: f64,
    pub vel_y: f64,
    pub covariance_trace: Option<f64>,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: 0,
            connected: false,
            ticks: 0,
            samples_skipped: 0,
            fixes_applied: 0,
            fixes_rejected: 0,
            degenerate_samples: 0,
            roll_deg: 0.0,
            pitch_deg: 0.0,
            yaw_deg: 0.0,
            pos_x: 0.0,
            pos_y: 0.0,
            vel_x: 0.0,
            vel_y: 0.0,
            covariance_trace: None,
        }
    }

    pub fn update(&mut self, snapshot: &SessionSnapshot, uptime_seconds: u64, connected: bool) {
        self.timestamp = current_timestamp();
        self.uptime_seconds = uptime_seconds;
        self.connected = connected;
        self.ticks = snapshot.ticks;
        self.samples_skipped = snapshot.samples_skipped;
        self.fixes_applied = snapshot.fixes_applied;
        self.fixes_rejected = snapshot.fixes_rejected;
        self.degenerate_samples = snapshot.degenerate_samples;
        self.covariance_trace = snapshot.covariance_trace;
        if let Some(pose) = &snapshot.pose {
            self.roll_deg = pose.orientation.roll;
            self.pitch_deg = pose.orientation.pitch;
            self.yaw_deg = pose.orientation.yaw_wrapped();
            (self.pos_x, self.pos_y) = pose.position.position;
            (self.vel_x, self.vel_y) = pose.position.velocity;
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionConfig;
    use crate::sensor_fusion::FusionSession;
    use crate::types::SensorSample;

    #[test]
    fn test_update_from_session() {
        let mut session = FusionSession::new(FusionConfig::online()).unwrap();
        let sample = SensorSample::new(0.0, [0.0, 0.0, 1.0], [0.0, 0.0, 2000.0])
            .with_mag(&[0.3, 0.0])
            .with_fix(1.0, 2.0, Some(90.0));
        session.step_online(&sample).unwrap();

        let mut status = LiveStatus::new();
        status.update(&session.snapshot(), 12, true);
        assert_eq!(status.ticks, 1);
        assert_eq!(status.fixes_applied, 1);
        assert!(status.connected);
        assert!(status.yaw_deg > -180.0 && status.yaw_deg <= 180.0);
        assert!(status.covariance_trace.is_some());
    }

    #[test]
    fn test_save_round_trip() {
        let mut status = LiveStatus::new();
        status.timestamp = 1_700_000_000.5;
        status.covariance_trace = Some(3.25);
        let path = std::env::temp_dir().join(format!("live_status_{}.json", std::process::id()));
        status.save(&path).unwrap();
        let loaded: LiveStatus = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, status);
        let _ = fs::remove_file(path);
    }
}

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use uwb_pose_fusion::config::{OrientationStrategy, PositionStrategy};
use uwb_pose_fusion::live_status::LiveStatus;
use uwb_pose_fusion::sensors;
use uwb_pose_fusion::{FusedPose, FusionConfig, FusionError, FusionEvent, FusionSession, SessionSnapshot};

#[derive(Parser, Debug)]
#[command(name = "pose_tracker")]
#[command(about = "Online UWB + IMU pose fusion over a TCP record stream", long_about = None)]
struct Args {
    /// Ranging module address (host:port)
    #[arg(long, default_value = "192.168.4.1:8080")]
    addr: String,

    /// Duration in seconds (0 = until the stream disconnects)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// JSON configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Nominal sample rate (Hz)
    #[arg(long)]
    sample_rate: Option<f64>,

    /// Position strategy (kalman, low-pass)
    #[arg(long)]
    position_strategy: Option<String>,

    /// Drop fixes below this quality factor
    #[arg(long)]
    min_fix_quality: Option<f64>,

    /// Output directory
    #[arg(long, default_value = "pose_sessions")]
    output_dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct SessionOutput {
    poses: Vec<FusedPose>,
    stats: SessionSnapshot,
    disconnect: Option<String>,
}

fn build_config(args: &Args) -> Result<FusionConfig> {
    let mut config = match &args.config {
        Some(path) => FusionConfig::from_json_file(path)?,
        None => FusionConfig::online(),
    };
    // Streaming always runs the recursive orientation filter
    config.orientation_strategy = OrientationStrategy::OnlineComplementary;

    if let Some(rate) = args.sample_rate {
        config.sample_rate_hz = rate;
    }
    if let Some(quality) = args.min_fix_quality {
        config.min_fix_quality = quality;
    }
    if let Some(strategy) = &args.position_strategy {
        config.position_strategy = match strategy.as_str() {
            "kalman" => PositionStrategy::Kalman,
            "low-pass" | "lowpass" | "complementary" => PositionStrategy::LowPassComplementary,
            other => anyhow::bail!("unknown position strategy {other:?} (kalman, low-pass)"),
        };
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = build_config(&args)?;

    info!("[{}] Pose Tracker Starting", ts_now());
    info!("  Address: {}", args.addr);
    info!("  Duration: {} seconds (0=until disconnect)", args.duration);
    info!("  Position: {:?}", config.position_strategy);
    info!("  Output Dir: {}", args.output_dir.display());

    std::fs::create_dir_all(&args.output_dir)?;

    let mut session = FusionSession::new(config)?;
    let stream = TcpStream::connect(&args.addr).await?;
    info!("[{}] Connected to {}", ts_now(), args.addr);

    let (tx, mut rx) = mpsc::channel(500);
    let reader = tokio::spawn(sensors::record_loop(stream, tx));

    let start = Utc::now();
    let mut last_status_update = Utc::now();
    let mut poses: Vec<FusedPose> = Vec::new();
    let status_path = args.output_dir.join("live_status.json");
    let mut status = LiveStatus::new();
    let mut stream_closed = false;

    loop {
        if args.duration > 0 {
            let elapsed = Utc::now().signed_duration_since(start);
            if elapsed.num_seconds() as u64 >= args.duration {
                info!("[{}] Duration reached, stopping...", ts_now());
                break;
            }
        }

        // Wake up periodically so the duration and status checks still run
        let sample = match timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Some(sample)) => Some(sample),
            Ok(None) => {
                stream_closed = true;
                break;
            }
            Err(_) => None,
        };

        if let Some(sample) = sample {
            match session.step_online(&sample) {
                Ok(tick) => {
                    for event in &tick.events {
                        match event {
                            FusionEvent::FixApplied { .. } => {}
                            other => debug!("[{}] {:?}", ts_now(), other),
                        }
                    }
                    let o = tick.pose.orientation;
                    let (px, py) = tick.pose.position.position;
                    debug!(
                        "roll={:.1} pitch={:.1} yaw={:.1} pos=({:.3}, {:.3})",
                        o.roll,
                        o.pitch,
                        o.yaw_wrapped(),
                        px,
                        py
                    );
                    poses.push(tick.pose);
                }
                Err(err) => {
                    // Session rolled back; resetting keeps the run going
                    warn!("[{}] {err}, resetting session", ts_now());
                    session.reset();
                }
            }
        }

        let now = Utc::now();
        if now.signed_duration_since(last_status_update).num_seconds() >= 2 {
            let uptime = now.signed_duration_since(start).num_seconds().max(0) as u64;
            status.update(&session.snapshot(), uptime, true);
            let _ = status.save(&status_path);
            last_status_update = now;
        }
    }

    let disconnect = if stream_closed {
        match reader.await? {
            Err(FusionError::AcquisitionDisconnected(reason)) => {
                info!("[{}] Stream ended: {}", ts_now(), reason);
                Some(reason)
            }
            Err(other) => Some(other.to_string()),
            Ok(count) => {
                debug!("reader forwarded {count} samples");
                None
            }
        }
    } else {
        // Stopped on duration; the reader may be parked on a read
        reader.abort();
        None
    };

    let snapshot = session.snapshot();
    let uptime = Utc::now().signed_duration_since(start).num_seconds().max(0) as u64;
    status.update(&snapshot, uptime, false);
    let _ = status.save(args.output_dir.join("live_status_final.json"));

    let output = SessionOutput { poses, stats: snapshot.clone(), disconnect };
    let filename = args.output_dir.join(format!("poses_{}_final.json", ts_now_clean()));
    let json = serde_json::to_string_pretty(&output)?;
    std::fs::write(&filename, json)?;
    info!("[{}] Final save: {} poses to {}", ts_now(), output.poses.len(), filename.display());

    info!("=== Final Stats ===");
    info!("Ticks: {}", snapshot.ticks);
    info!("Fixes applied/rejected: {}/{}", snapshot.fixes_applied, snapshot.fixes_rejected);
    info!("Skipped samples: {}", snapshot.samples_skipped);
    info!("Degenerate orientation samples: {}", snapshot.degenerate_samples);
    if let Some(pose) = &snapshot.pose {
        info!("Last position: ({:.3}, {:.3}) m", pose.position.position.0, pose.position.position.1);
    }

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

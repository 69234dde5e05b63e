use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use serde_json::json;
use uwb_pose_fusion::config::{OrientationStrategy, PositionStrategy};
use uwb_pose_fusion::dataset::{load_run, write_navigation_csv};
use uwb_pose_fusion::{FusionConfig, FusionEvent, FusionSession};

#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(about = "Batch UWB + IMU pose fusion over recorded runs", long_about = None)]
struct Args {
    /// Recorded run (.csv or .csv.gz)
    #[arg(long, conflicts_with = "input_dir")]
    input: Option<PathBuf>,

    /// Directory of recorded runs to replay one after another
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// JSON configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sample rate (Hz)
    #[arg(long)]
    sample_rate: Option<f64>,

    /// Complementary filter cutoff (Hz)
    #[arg(long)]
    cutoff: Option<f64>,

    /// Butterworth order
    #[arg(long)]
    order: Option<usize>,

    /// Use the recursive orientation filter instead of the zero-phase one
    #[arg(long, default_value_t = false)]
    online_orientation: bool,

    /// Use the low-pass complementary position estimator instead of the Kalman filter
    #[arg(long, default_value_t = false)]
    low_pass_position: bool,

    /// Keep the configured initial yaw even when the run records a reference yaw
    #[arg(long, default_value_t = false)]
    ignore_reference_yaw: bool,

    /// Output directory
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

fn build_config(args: &Args) -> anyhow::Result<FusionConfig> {
    let mut config = match &args.config {
        Some(path) => FusionConfig::from_json_file(path)?,
        None => FusionConfig::default(),
    };
    if let Some(rate) = args.sample_rate {
        config.sample_rate_hz = rate;
    }
    if let Some(cutoff) = args.cutoff {
        config.cutoff_hz = cutoff;
    }
    if let Some(order) = args.order {
        config.filter_order = order;
    }
    if args.online_orientation {
        config.orientation_strategy = OrientationStrategy::OnlineComplementary;
    }
    if args.low_pass_position {
        config.position_strategy = PositionStrategy::LowPassComplementary;
    }
    config.validate()?;
    Ok(config)
}

fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

fn run_once(
    path: &Path,
    navigation_path: &Path,
    config: &FusionConfig,
    seed_yaw: bool,
) -> anyhow::Result<serde_json::Value> {
    let run = load_run(path, config.sample_rate_hz)?;
    let mut config = config.clone();
    if let Some(yaw) = run.initial_yaw_deg().filter(|_| seed_yaw) {
        info!("{}: integrated yaw seeded from reference ({:.2} deg)", path.display(), yaw);
        config.initial_yaw_deg = yaw;
    }

    let mut session = FusionSession::new(config)?;
    let output = session.run_batch(&run.samples)?;
    write_navigation_csv(navigation_path, &output)?;
    let reference = run.compare(&output);

    let innovations: Vec<f64> = output
        .events
        .iter()
        .filter_map(|e| match e {
            FusionEvent::FixApplied { innovation: Some((dx, dy)) } => Some(dx.hypot(*dy)),
            _ => None,
        })
        .collect();
    let snapshot = session.snapshot();
    let last = output.poses.last();

    info!(
        "{}: {} poses -> {}",
        path.display(),
        output.len(),
        navigation_path.display()
    );
    Ok(json!({
        "input": path.display().to_string(),
        "navigation": navigation_path.display().to_string(),
        "samples": run.samples.len(),
        "poses": output.len(),
        "fixes_applied": snapshot.fixes_applied,
        "fixes_rejected": snapshot.fixes_rejected,
        "samples_skipped": snapshot.samples_skipped,
        "degenerate_samples": snapshot.degenerate_samples,
        "rms_innovation": rms(&innovations),
        "max_innovation": innovations.iter().copied().fold(0.0_f64, f64::max),
        "final_covariance_trace": snapshot.covariance_trace,
        "final_yaw_deg": last.map(|p| p.orientation.yaw_wrapped()),
        "final_position": last.map(|p| [p.position.position.0, p.position.position.1]),
        "reference_poses": reference.compared,
        "position_rmse": reference.position_rmse,
        "yaw_rmse": reference.yaw_rmse,
    }))
}

fn is_recorded_run(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    path.is_file() && (name.ends_with(".csv") || name.ends_with(".csv.gz"))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = build_config(&args)?;
    std::fs::create_dir_all(&args.output_dir)?;

    let mut results = Vec::new();
    if let Some(dir) = args.input_dir.as_ref() {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if is_recorded_run(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            let stem = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.trim_end_matches(".gz").trim_end_matches(".csv").to_string())
                .unwrap_or_default();
            let navigation = args.output_dir.join(format!("{stem}_navigation.csv"));
            match run_once(&path, &navigation, &config, !args.ignore_reference_yaw) {
                Ok(res) => results.push(res),
                Err(e) => error!("Failed {}: {:#}", path.display(), e),
            }
        }
        if results.is_empty() {
            warn!("no recorded runs replayed from {}", dir.display());
        }
    } else if let Some(input) = args.input.as_ref() {
        let navigation = args.output_dir.join("output_navigation.csv");
        results.push(run_once(input, &navigation, &config, !args.ignore_reference_yaw)?);
    } else {
        anyhow::bail!("Provide --input or --input-dir");
    }

    let summary = json!({
        "config": config,
        "runs": results,
    });
    let summary_path = args
        .output_dir
        .join(format!("replay_{}.json", Utc::now().format("%Y%m%d_%H%M%S")));
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    info!("summary written to {}", summary_path.display());
    Ok(())
}

//! Tabular batch source and navigation table output.
//!
//! Reads recorded runs as CSV with a header row, optionally gzip-compressed.
//! Column names are matched case-insensitively and the capture tool's names
//! (`ESP32_Ax`, `UWB_QF`, `Time (ms)`, ...) are accepted as aliases.
//!
//! Runs recorded alongside motion capture also carry a reference pose
//! (`xr`, `yr`, `ry`), which [`RecordedRun::compare`] scores a batch
//! output against.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use flate2::read::GzDecoder;
use log::{debug, info};
use serde::Serialize;

use crate::error::FusionError;
use crate::sensor_fusion::BatchOutput;
use crate::types::{wrap_degrees, ReferencePose, SensorSample};

pub const NAVIGATION_HEADER: &str = "angle_x,angle_y,angle_z,pos_x,pos_y";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Column {
    Seconds,
    Millis,
    X,
    Y,
    Quality,
    Ax,
    Ay,
    Az,
    Gx,
    Gy,
    Gz,
    Mx,
    My,
    Mz,
    RefX,
    RefY,
    RefYaw,
}

impl Column {
    fn from_header(name: &str) -> Option<Self> {
        let name = name.trim().trim_matches('"').to_ascii_lowercase();
        let column = match name.as_str() {
            "timestamp" | "t" | "time" => Column::Seconds,
            "time (ms)" | "time_ms" => Column::Millis,
            "x" | "esp32_x" | "uwb_x" => Column::X,
            "y" | "esp32_y" | "uwb_y" => Column::Y,
            "quality" | "uwb_qf" | "qf" => Column::Quality,
            "ax" | "esp32_ax" => Column::Ax,
            "ay" | "esp32_ay" => Column::Ay,
            "az" | "esp32_az" => Column::Az,
            "gx" | "esp32_gx" => Column::Gx,
            "gy" | "esp32_gy" => Column::Gy,
            "gz" | "esp32_gz" => Column::Gz,
            "mx" | "esp32_mx" => Column::Mx,
            "my" | "esp32_my" => Column::My,
            "mz" | "esp32_mz" => Column::Mz,
            "xr" | "robotat_x" => Column::RefX,
            "yr" | "robotat_y" => Column::RefY,
            "ry" | "robotat_yaw" => Column::RefYaw,
            _ => return None,
        };
        Some(column)
    }
}

/// Header position of each known column.
#[derive(Debug, Default)]
struct Layout {
    positions: Vec<(Column, usize)>,
}

impl Layout {
    fn from_header(header: &str) -> Self {
        let mut positions = Vec::new();
        for (idx, name) in header.split(',').enumerate() {
            if let Some(column) = Column::from_header(name) {
                if !positions.iter().any(|(c, _)| *c == column) {
                    positions.push((column, idx));
                }
            }
        }
        Self { positions }
    }

    fn index(&self, column: Column) -> Option<usize> {
        self.positions.iter().find(|(c, _)| *c == column).map(|(_, idx)| *idx)
    }

    fn require(&self, columns: &[Column]) -> Result<Vec<usize>, FusionError> {
        columns
            .iter()
            .map(|c| {
                self.index(*c)
                    .ok_or_else(|| FusionError::MalformedSample(format!("missing required column {c:?}")))
            })
            .collect()
    }
}

fn cell<'a>(cells: &[&'a str], idx: Option<usize>) -> Option<&'a str> {
    idx.and_then(|i| cells.get(i)).map(|c| c.trim()).filter(|c| !c.is_empty())
}

fn number(text: &str, row: usize) -> Result<f64, FusionError> {
    text.trim_matches('"')
        .parse::<f64>()
        .map_err(|_| FusionError::MalformedSample(format!("row {row}: {text:?} is not a number")))
}

fn optional_number(cells: &[&str], idx: Option<usize>, row: usize) -> Result<Option<f64>, FusionError> {
    match cell(cells, idx) {
        Some(text) => number(text, row).map(|v| Some(v).filter(|v| v.is_finite())),
        None => Ok(None),
    }
}

/// A recorded run: samples plus the reference pose of each row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordedRun {
    pub samples: Vec<SensorSample>,
    /// Parallel to `samples`; empty entries where nothing was recorded.
    pub reference: Vec<ReferencePose>,
}

/// Fused output scored against the recorded reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ReferenceErrors {
    /// Planar distance RMSE in metres.
    pub position_rmse: Option<f64>,
    /// Wrapped yaw difference RMSE in degrees.
    pub yaw_rmse: Option<f64>,
    /// Poses that had any reference to compare with.
    pub compared: usize,
}

impl RecordedRun {
    pub fn has_reference(&self) -> bool {
        self.reference.iter().any(|r| !r.is_empty())
    }

    /// First recorded reference yaw, used to seed the integrated gyro yaw.
    pub fn initial_yaw_deg(&self) -> Option<f64> {
        self.reference.iter().find_map(|r| r.yaw)
    }

    /// Pair each pose with the sample it came from (poses keep their
    /// sample's timestamp; skipped samples have no pose) and accumulate the
    /// error against that row's reference.
    pub fn compare(&self, output: &BatchOutput) -> ReferenceErrors {
        let mut position_sq = Vec::new();
        let mut yaw_sq = Vec::new();
        let mut compared = 0;
        let mut cursor = 0;

        for pose in &output.poses {
            let offset = match self.samples[cursor..].iter().position(|s| s.timestamp == pose.timestamp) {
                Some(offset) => offset,
                None => continue,
            };
            let reference = self.reference.get(cursor + offset).copied().unwrap_or_default();
            cursor += offset + 1;

            if let Some((x, y)) = reference.position {
                let (px, py) = pose.position.position;
                position_sq.push((px - x).powi(2) + (py - y).powi(2));
            }
            if let Some(yaw) = reference.yaw {
                yaw_sq.push(wrap_degrees(pose.orientation.yaw - yaw).powi(2));
            }
            if !reference.is_empty() {
                compared += 1;
            }
        }

        ReferenceErrors { position_rmse: rmse(&position_sq), yaw_rmse: rmse(&yaw_sq), compared }
    }
}

fn rmse(squares: &[f64]) -> Option<f64> {
    if squares.is_empty() {
        return None;
    }
    Some((squares.iter().sum::<f64>() / squares.len() as f64).sqrt())
}

/// Parse a recorded run from any buffered reader.
pub fn read_samples<R: BufRead>(reader: R, sample_rate_hz: f64) -> anyhow::Result<Vec<SensorSample>> {
    Ok(read_run(reader, sample_rate_hz)?.samples)
}

/// Parse a recorded run, keeping the motion-capture reference columns.
pub fn read_run<R: BufRead>(reader: R, sample_rate_hz: f64) -> anyhow::Result<RecordedRun> {
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(line) => line?,
        None => anyhow::bail!(FusionError::MalformedSample("empty table".to_string())),
    };
    let layout = Layout::from_header(&header);
    let inertial = layout.require(&[Column::Ax, Column::Ay, Column::Az, Column::Gx, Column::Gy, Column::Gz])?;
    debug!("table layout: {:?}", layout.positions);

    let mut samples = Vec::new();
    let mut reference = Vec::new();
    for (row, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split(',').collect();
        let row_no = row + 2;

        let mut values = [0.0; 6];
        for (value, idx) in values.iter_mut().zip(&inertial) {
            let text = cell(&cells, Some(*idx))
                .ok_or_else(|| FusionError::MalformedSample(format!("row {row_no}: empty inertial cell")))?;
            *value = number(text, row_no)?;
        }

        let index = samples.len();
        let timestamp = if let Some(t) = optional_number(&cells, layout.index(Column::Seconds), row_no)? {
            t
        } else if let Some(ms) = optional_number(&cells, layout.index(Column::Millis), row_no)? {
            ms / 1000.0
        } else {
            index as f64 / sample_rate_hz
        };

        let mut sample = SensorSample::new(timestamp, [values[0], values[1], values[2]], [values[3], values[4], values[5]]);

        let mx = optional_number(&cells, layout.index(Column::Mx), row_no)?;
        let my = optional_number(&cells, layout.index(Column::My), row_no)?;
        if let (Some(mx), Some(my)) = (mx, my) {
            match optional_number(&cells, layout.index(Column::Mz), row_no)? {
                Some(mz) => sample = sample.with_mag(&[mx, my, mz]),
                None => sample = sample.with_mag(&[mx, my]),
            }
        }

        let x = optional_number(&cells, layout.index(Column::X), row_no)?;
        let y = optional_number(&cells, layout.index(Column::Y), row_no)?;
        if let (Some(x), Some(y)) = (x, y) {
            let quality = optional_number(&cells, layout.index(Column::Quality), row_no)?;
            sample = sample.with_fix(x, y, quality);
        }

        let ref_x = optional_number(&cells, layout.index(Column::RefX), row_no)?;
        let ref_y = optional_number(&cells, layout.index(Column::RefY), row_no)?;
        reference.push(ReferencePose {
            position: ref_x.zip(ref_y),
            yaw: optional_number(&cells, layout.index(Column::RefYaw), row_no)?,
        });

        samples.push(sample);
    }
    Ok(RecordedRun { samples, reference })
}

/// Load a `.csv` or `.csv.gz` recorded run.
pub fn load_run(path: &Path, sample_rate_hz: f64) -> anyhow::Result<RecordedRun> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let run = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        read_run(BufReader::new(GzDecoder::new(file)), sample_rate_hz)
    } else {
        read_run(BufReader::new(file), sample_rate_hz)
    }
    .with_context(|| format!("reading {}", path.display()))?;

    let fixes = run.samples.iter().filter(|s| s.fix.is_some()).count();
    info!(
        "loaded {} samples ({} with fix{}) from {}",
        run.samples.len(),
        fixes,
        if run.has_reference() { ", reference pose" } else { "" },
        path.display()
    );
    Ok(run)
}

/// `angle_x,angle_y,angle_z,pos_x,pos_y`, one row per pose.
pub fn write_navigation<W: Write>(mut writer: W, output: &BatchOutput) -> anyhow::Result<()> {
    writeln!(writer, "{NAVIGATION_HEADER}")?;
    for row in output.table().rows() {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(writer, "{}", line.join(","))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_navigation_csv(path: &Path, output: &BatchOutput) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    write_navigation(BufWriter::new(file), output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FusedPose, OrientationState, PositionState};
    use std::io::Cursor;

    #[test]
    fn test_plain_columns() {
        let csv = "x,y,quality,ax,ay,az,gx,gy,gz,mx,my,mz\n\
                   1.0,2.0,80,0,0,1,0.1,0.2,0.3,0.3,0.1,-0.4\n\
                   ,,,0,0.1,0.9,0,0,0,0.3,0.1,\n";
        let samples = read_samples(Cursor::new(csv), 10.0).unwrap();
        assert_eq!(samples.len(), 2);

        let fix = samples[0].fix.unwrap();
        assert_eq!((fix.x, fix.y, fix.quality), (1.0, 2.0, Some(80.0)));
        assert_eq!(samples[0].mag, Some(vec![0.3, 0.1, -0.4]));
        assert_eq!(samples[0].gyro, [0.1, 0.2, 0.3]);

        assert_eq!(samples[1].fix, None);
        assert_eq!(samples[1].mag, Some(vec![0.3, 0.1]));
        assert_eq!(samples[1].timestamp, 0.1);
    }

    #[test]
    fn test_capture_tool_aliases() {
        let csv = "Sample,Time (ms),ESP32_X,ESP32_Y,UWB_QF,ESP32_Ax,ESP32_Ay,ESP32_Az,ESP32_Gx,ESP32_Gy,ESP32_Gz,ESP32_Mx,ESP32_My,ESP32_Mz,Robotat_X\n\
                   0,1500,2100,2600,95,0.01,0.02,0.98,1,2,3,20,-5,40,0.4\n";
        let samples = read_samples(Cursor::new(csv), 10.0).unwrap();
        let sample = &samples[0];
        assert_eq!(sample.timestamp, 1.5);
        assert_eq!(sample.accel, [0.01, 0.02, 0.98]);
        assert_eq!(sample.fix.unwrap().quality, Some(95.0));
        assert_eq!(sample.mag_xy(), Some((20.0, -5.0)));
    }

    #[test]
    fn test_reference_columns() {
        let csv = "ax,ay,az,gx,gy,gz,xr,yr,ry\n\
                   0,0,1,0,0,0,,,\n\
                   0,0,1,0,0,0,1.5,-0.5,42\n\
                   0,0,1,0,0,0,1.6,-0.4,43\n";
        let run = read_run(Cursor::new(csv), 10.0).unwrap();
        assert_eq!(run.samples.len(), 3);
        assert_eq!(run.reference.len(), 3);
        assert!(run.reference[0].is_empty());
        assert_eq!(run.reference[1], ReferencePose { position: Some((1.5, -0.5)), yaw: Some(42.0) });
        assert!(run.has_reference());
        assert_eq!(run.initial_yaw_deg(), Some(42.0));
    }

    #[test]
    fn test_compare_skips_unmatched_samples() {
        let samples: Vec<_> = (0..3).map(|i| SensorSample::new(i as f64 * 0.1, [0.0, 0.0, 1.0], [0.0; 3])).collect();
        let reference = vec![
            ReferencePose { position: Some((0.0, 0.0)), yaw: Some(10.0) },
            ReferencePose { position: Some((1.0, 1.0)), yaw: Some(20.0) },
            ReferencePose { position: Some((2.0, 2.0)), yaw: Some(179.0) },
        ];
        let run = RecordedRun { samples: samples.clone(), reference };

        let pose = |t: f64, yaw: f64, x: f64, y: f64| FusedPose {
            timestamp: t,
            orientation: OrientationState { yaw, ..Default::default() },
            position: PositionState { position: (x, y), ..Default::default() },
        };
        // The middle sample was skipped by the session
        let output = BatchOutput {
            poses: vec![pose(samples[0].timestamp, 10.0, 0.0, 3.0), pose(samples[2].timestamp, -179.0, 2.0, 6.0)],
            events: Vec::new(),
        };

        let errors = run.compare(&output);
        assert_eq!(errors.compared, 2);
        assert!((errors.position_rmse.unwrap() - 12.5f64.sqrt()).abs() < 1e-12);
        assert!((errors.yaw_rmse.unwrap() - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_compare_without_reference() {
        let csv = "ax,ay,az,gx,gy,gz\n0,0,1,0,0,0\n";
        let run = read_run(Cursor::new(csv), 10.0).unwrap();
        assert!(!run.has_reference());
        assert_eq!(run.initial_yaw_deg(), None);
        assert_eq!(run.compare(&BatchOutput::default()), ReferenceErrors::default());
    }

    #[test]
    fn test_no_fix_or_mag_columns() {
        let csv = "ax,ay,az,gx,gy,gz\n0,0,1,0,0,0\n";
        let samples = read_samples(Cursor::new(csv), 10.0).unwrap();
        assert_eq!(samples[0].fix, None);
        assert_eq!(samples[0].mag, None);
    }

    #[test]
    fn test_missing_required_column() {
        let csv = "x,y,ax,ay,az,gx,gy\n1,1,0,0,1,0,0\n";
        let err = read_samples(Cursor::new(csv), 10.0).unwrap_err();
        assert!(matches!(err.downcast_ref::<FusionError>(), Some(FusionError::MalformedSample(_))));
    }

    #[test]
    fn test_non_numeric_cell() {
        let csv = "ax,ay,az,gx,gy,gz\n0,0,one,0,0,0\n";
        let err = read_samples(Cursor::new(csv), 10.0).unwrap_err();
        assert!(err.to_string().contains("row 2"));
    }

    #[test]
    fn test_navigation_table() {
        let pose = |yaw: f64, x: f64| FusedPose {
            timestamp: 0.0,
            orientation: OrientationState { roll: 1.0, pitch: -2.0, yaw },
            position: PositionState { position: (x, 0.5), ..Default::default() },
        };
        let output = BatchOutput { poses: vec![pose(10.0, 1.0), pose(11.5, 1.25)], events: Vec::new() };

        let mut buf = Vec::new();
        write_navigation(&mut buf, &output).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec![NAVIGATION_HEADER, "1,-2,10,1,0.5", "1,-2,11.5,1.25,0.5"]);
    }
}

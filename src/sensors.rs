use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::Sender;
use tokio::time::Instant;

use crate::error::{FusionError, FusionResult};
use crate::types::SensorSample;

/// `x, y, quality, ax, ay, az, gx, gy, gz, mx, my[, mz]`
pub const MIN_RECORD_FIELDS: usize = 11;
pub const MAX_RECORD_FIELDS: usize = 12;

/// Longest line the decoder buffers; a full record is well under 256 bytes.
pub const MAX_LINE_BYTES: usize = 4096;

/// Parse one streaming record. The tag reports a fix with every record.
pub fn parse_record(line: &str, timestamp: f64) -> FusionResult<SensorSample> {
    let fields: Vec<&str> = line
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|f| !f.is_empty())
        .collect();
    if !(MIN_RECORD_FIELDS..=MAX_RECORD_FIELDS).contains(&fields.len()) {
        return Err(FusionError::MalformedSample(format!(
            "{} fields, expected {MIN_RECORD_FIELDS} or {MAX_RECORD_FIELDS}: {line:?}",
            fields.len()
        )));
    }

    let mut values = Vec::with_capacity(fields.len());
    for field in &fields {
        let value: f64 = field
            .parse()
            .map_err(|_| FusionError::MalformedSample(format!("non-numeric field {field:?} in {line:?}")))?;
        values.push(value);
    }

    Ok(SensorSample::new(timestamp, [values[3], values[4], values[5]], [values[6], values[7], values[8]])
        .with_mag(&values[9..])
        .with_fix(values[0], values[1], Some(values[2])))
}

/// Line reassembly across deliveries: a read may end mid-record or carry
/// several records.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    pending: Vec<u8>,
    /// Dropping the rest of an overlong line up to its newline.
    overflowed: bool,
    decoded: u64,
    malformed: u64,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode every line completed by `chunk`. All records of one delivery
    /// share `timestamp`.
    ///
    /// A line that grows past [`MAX_LINE_BYTES`] without a newline is
    /// discarded up to its end and counted as one malformed record.
    pub fn feed(&mut self, chunk: &[u8], timestamp: f64) -> Vec<FusionResult<SensorSample>> {
        // Bytes already buffered hold no newline
        let mut search_from = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(offset) = self.pending[search_from..].iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=search_from + offset).collect();
            search_from = 0;
            if std::mem::take(&mut self.overflowed) {
                continue;
            }
            if let Some(record) = self.decode_line(&line, timestamp) {
                out.push(record);
            }
        }

        if self.pending.len() > MAX_LINE_BYTES {
            let dropped = self.pending.len();
            self.pending.clear();
            if !self.overflowed {
                self.overflowed = true;
                self.malformed += 1;
                out.push(Err(FusionError::MalformedSample(format!(
                    "line exceeds {MAX_LINE_BYTES} bytes without a newline ({dropped} buffered)"
                ))));
            }
        }
        out
    }

    /// Flush a trailing record that never got its newline.
    pub fn finish(&mut self, timestamp: f64) -> Option<FusionResult<SensorSample>> {
        let line = std::mem::take(&mut self.pending);
        if std::mem::take(&mut self.overflowed) {
            return None;
        }
        self.decode_line(&line, timestamp)
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// (decoded, malformed) record counts so far.
    pub fn counts(&self) -> (u64, u64) {
        (self.decoded, self.malformed)
    }

    fn decode_line(&mut self, line: &[u8], timestamp: f64) -> Option<FusionResult<SensorSample>> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let record = parse_record(text, timestamp);
        match record {
            Ok(_) => self.decoded += 1,
            Err(_) => self.malformed += 1,
        }
        Some(record)
    }
}

/// Read records from `reader` and forward them to `tx`, timestamped in
/// seconds since the loop started.
///
/// Returns `Ok(count)` when the consumer hangs up and
/// `Err(AcquisitionDisconnected)` when the stream ends or fails.
pub async fn record_loop<R>(mut reader: R, tx: Sender<SensorSample>) -> FusionResult<u64>
where
    R: AsyncRead + Unpin,
{
    let start = Instant::now();
    let mut decoder = RecordDecoder::new();
    let mut buf = [0u8; 1024];
    let mut sample_count = 0u64;

    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break "stream closed by peer".to_string(),
            Ok(n) => n,
            Err(err) => break format!("read failed: {err}"),
        };

        let now = start.elapsed().as_secs_f64();
        for record in decoder.feed(&buf[..n], now) {
            match record {
                Ok(sample) => {
                    if tx.send(sample).await.is_err() {
                        info!("[uwb] consumer gone after {} samples", sample_count);
                        return Ok(sample_count);
                    }
                    sample_count += 1;
                    if sample_count % 100 == 0 {
                        debug!("[uwb] {} samples", sample_count);
                    }
                }
                Err(err) => warn!("[uwb] skipping record: {err}"),
            }
        }
    };

    if let Some(record) = decoder.finish(start.elapsed().as_secs_f64()) {
        match record {
            Ok(sample) => {
                if tx.send(sample).await.is_ok() {
                    sample_count += 1;
                }
            }
            Err(err) => warn!("[uwb] skipping trailing record: {err}"),
        }
    }

    let (_, malformed) = decoder.counts();
    warn!("[uwb] {reason} after {sample_count} samples ({malformed} malformed)");
    Err(FusionError::AcquisitionDisconnected(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const RECORD: &str = "1200.5, 3400.0, 87, 0.01, -0.02, 0.99, 0.5, -0.3, 1.2, 0.31, -0.12, 0.44";

    #[test]
    fn test_parse_full_record() {
        let sample = parse_record(RECORD, 2.5).unwrap();
        assert_eq!(sample.timestamp, 2.5);
        assert_eq!(sample.accel, [0.01, -0.02, 0.99]);
        assert_eq!(sample.gyro, [0.5, -0.3, 1.2]);
        assert_eq!(sample.mag, Some(vec![0.31, -0.12, 0.44]));
        let fix = sample.fix.unwrap();
        assert_eq!((fix.x, fix.y, fix.quality), (1200.5, 3400.0, Some(87.0)));
    }

    #[test]
    fn test_parse_whitespace_and_two_axis_mag() {
        let sample = parse_record("1 2 50 0 0 1 0 0 0 0.2 0.1", 0.0).unwrap();
        assert_eq!(sample.mag, Some(vec![0.2, 0.1]));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(parse_record("1,2,3,4,5,6,7,8,9,10", 0.0), Err(FusionError::MalformedSample(_))));
        assert!(matches!(
            parse_record("1,2,3,4,5,6,7,8,9,10,11,12,13", 0.0),
            Err(FusionError::MalformedSample(_))
        ));
        assert!(matches!(
            parse_record("1,2,3,4,5,six,7,8,9,10,11", 0.0),
            Err(FusionError::MalformedSample(_))
        ));
    }

    #[test]
    fn test_decoder_reassembles_split_lines() {
        let mut decoder = RecordDecoder::new();
        let (head, tail) = RECORD.split_at(20);

        assert!(decoder.feed(head.as_bytes(), 0.0).is_empty());
        assert_eq!(decoder.pending_bytes(), 20);

        let chunk = format!("{tail}\r\n\n{RECORD}\nbad record\n{head}");
        let out = decoder.feed(chunk.as_bytes(), 1.0);
        assert_eq!(out.len(), 3);
        assert!(out[0].is_ok());
        assert!(out[1].is_ok());
        assert!(out[2].is_err());
        assert_eq!(decoder.counts(), (2, 1));
        assert_eq!(decoder.pending_bytes(), head.len());

        assert!(decoder.finish(2.0).unwrap().is_err());
        assert!(decoder.finish(2.0).is_none());
    }

    #[test]
    fn test_decoder_caps_unterminated_line() {
        let mut decoder = RecordDecoder::new();
        let junk = [b'x'; 1024];
        let mut errors = 0;
        for _ in 0..100 {
            errors += decoder.feed(&junk, 0.0).iter().filter(|r| r.is_err()).count();
            assert!(decoder.pending_bytes() <= MAX_LINE_BYTES);
        }
        assert_eq!(errors, 1);
        assert_eq!(decoder.counts(), (0, 1));

        // The tail of the overlong line is dropped; the next record decodes
        let out = decoder.feed(format!("xxxx\n{RECORD}\n").as_bytes(), 1.0);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_ok());
        assert_eq!(decoder.counts(), (1, 1));
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_decoder_drops_overlong_trailing_line() {
        let mut decoder = RecordDecoder::new();
        decoder.feed(&vec![b'7'; MAX_LINE_BYTES + 1], 0.0);
        decoder.feed(b"1,2,3", 0.0);
        assert!(decoder.finish(1.0).is_none());
        assert_eq!(decoder.counts(), (0, 1));
    }

    #[tokio::test]
    async fn test_record_loop_reports_disconnect() {
        let stream = format!("{RECORD}\nnot,a,record\n{RECORD}\n{RECORD}");
        let (tx, mut rx) = mpsc::channel(16);

        let result = record_loop(stream.as_bytes(), tx).await;
        assert!(matches!(result, Err(FusionError::AcquisitionDisconnected(_))));

        let mut received = Vec::new();
        while let Some(sample) = rx.recv().await {
            received.push(sample);
        }
        assert_eq!(received.len(), 3);
        assert!(received.iter().all(|s| s.fix.is_some()));
    }

    #[tokio::test]
    async fn test_record_loop_stops_when_consumer_leaves() {
        let stream = format!("{RECORD}\n{RECORD}\n");
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let result = record_loop(stream.as_bytes(), tx).await;
        assert_eq!(result, Ok(0));
    }
}

//! Output formatting for CLI results

use crate::core::correlator::CaptureResult;
use clap::ValueEnum;
use std::collections::BTreeMap;

/// Output format for records printed to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// `key=value` pairs
    #[default]
    Text,
    /// One JSON object per line
    Json,
    /// Comma-separated values under a header row
    Csv,
}

/// Fixed column order for CSV records
#[derive(Debug, Clone, Default)]
pub struct Columns(Vec<String>);

impl Columns {
    /// Use `keys` as the column list
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(Into::into).collect())
    }

    /// Header row
    pub fn header(&self) -> String {
        let mut row = vec!["timestamp".to_string()];
        row.extend(self.0.iter().cloned());
        row.join(",")
    }
}

/// Format one telemetry snapshot
pub fn format_record(
    snapshot: &BTreeMap<String, String>,
    format: OutputFormat,
    columns: &Columns,
) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
    match format {
        OutputFormat::Text => {
            let fields: Vec<String> = snapshot
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("[{}] {}", timestamp, fields.join(" "))
        }
        OutputFormat::Json => serde_json::json!({
            "timestamp": timestamp.to_string(),
            "values": snapshot,
        })
        .to_string(),
        OutputFormat::Csv => {
            let mut row = vec![timestamp.to_string()];
            row.extend(
                columns
                    .0
                    .iter()
                    .map(|k| snapshot.get(k).cloned().unwrap_or_default()),
            );
            row.join(",")
        }
    }
}

/// Format the bytes captured by a request/response exchange
pub fn format_capture(capture: &CaptureResult, format: OutputFormat) -> String {
    let hex = hex_format(&capture.bytes);
    let elapsed_ms = capture.elapsed.as_millis();
    match format {
        OutputFormat::Text => {
            if capture.is_empty() {
                format!("no response ({} ms)", elapsed_ms)
            } else {
                format!("{} ({} bytes, {} ms)", hex, capture.bytes.len(), elapsed_ms)
            }
        }
        OutputFormat::Json => serde_json::json!({
            "bytes": hex::encode(&capture.bytes),
            "length": capture.bytes.len(),
            "elapsed_ms": elapsed_ms,
            "outcome": format!("{:?}", capture.outcome),
        })
        .to_string(),
        OutputFormat::Csv => format!("{},{},{}", hex::encode(&capture.bytes), capture.bytes.len(), elapsed_ms),
    }
}

fn hex_format(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::correlator::WaitOutcome;
    use bytes::Bytes;
    use std::time::Duration;

    fn snapshot() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("AccX".to_string(), "0.01".to_string());
        map.insert("AccZ".to_string(), "1.00".to_string());
        map
    }

    #[test]
    fn test_text_record() {
        let line = format_record(&snapshot(), OutputFormat::Text, &Columns::default());
        assert!(line.ends_with("AccX=0.01 AccZ=1.00"));
    }

    #[test]
    fn test_json_record() {
        let line = format_record(&snapshot(), OutputFormat::Json, &Columns::default());
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["values"]["AccZ"], "1.00");
    }

    #[test]
    fn test_csv_record_follows_columns() {
        let columns = Columns::new(["AccZ", "AngleZ", "AccX"]);
        assert_eq!(columns.header(), "timestamp,AccZ,AngleZ,AccX");
        let line = format_record(&snapshot(), OutputFormat::Csv, &columns);
        assert!(line.ends_with(",1.00,,0.01"));
    }

    #[test]
    fn test_capture_formats() {
        let capture = CaptureResult {
            bytes: Bytes::from_static(&[0xFF, 0xAA, 0x03]),
            outcome: WaitOutcome::WindowElapsed,
            elapsed: Duration::from_millis(200),
        };
        assert_eq!(
            format_capture(&capture, OutputFormat::Text),
            "FF AA 03 (3 bytes, 200 ms)"
        );
        assert_eq!(format_capture(&capture, OutputFormat::Csv), "ffaa03,3,200");

        let empty = CaptureResult {
            bytes: Bytes::new(),
            ..capture
        };
        assert_eq!(format_capture(&empty, OutputFormat::Text), "no response (200 ms)");
    }
}

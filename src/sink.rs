//! Write-only detection sinks for report persistence.
//!
//! The pipeline never talks to a database. A sink receives finished batches
//! together with caller-supplied report metadata and stores them however it
//! likes; `JsonLinesSink` appends one JSON object per line.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::consumers::BatchHandler;
use crate::detect::DetectionBatch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Light,
    Moderate,
    Severe,
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    /// Accepts the English names and the Indonesian field labels
    /// (`ringan`, `sedang`, `berat`), case-insensitively.
    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "light" | "ringan" => Ok(Severity::Light),
            "moderate" | "sedang" => Ok(Severity::Moderate),
            "severe" | "berat" => Ok(Severity::Severe),
            other => Err(anyhow!(
                "unknown severity '{}' (expected light, moderate or severe)",
                other
            )),
        }
    }
}

/// Caller-supplied context stored with each report record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub road_name: String,
    pub description: String,
    pub severity: Severity,
    /// Input file or stream the detections came from.
    pub source_name: String,
}

pub trait DetectionSink: Send {
    fn record(&mut self, batch: &DetectionBatch, metadata: &ReportMetadata) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct ReportRecord<'a> {
    recorded_at_ms: u64,
    #[serde(flatten)]
    metadata: &'a ReportMetadata,
    batch: &'a DetectionBatch,
}

/// Appends one JSON record per batch to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl JsonLinesSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open report file {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }
}

impl DetectionSink for JsonLinesSink {
    fn record(&mut self, batch: &DetectionBatch, metadata: &ReportMetadata) -> Result<()> {
        let recorded_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let record = ReportRecord {
            recorded_at_ms,
            metadata,
            batch,
        };
        serde_json::to_writer(&mut self.writer, &record).context("serialize report record")?;
        self.writer
            .write_all(b"\n")
            .with_context(|| format!("write {}", self.path.display()))?;
        self.records += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            log::warn!("report file {}: final flush failed: {}", self.path.display(), e);
        }
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<(DetectionBatch, ReportMetadata)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[(DetectionBatch, ReportMetadata)] {
        &self.records
    }
}

impl DetectionSink for MemorySink {
    fn record(&mut self, batch: &DetectionBatch, metadata: &ReportMetadata) -> Result<()> {
        self.records.push((batch.clone(), metadata.clone()));
        Ok(())
    }
}

/// Consumer that forwards batches into a sink.
///
/// Sink failures are logged and counted; they never stop the consumer.
pub struct SinkConsumer<S: DetectionSink> {
    sink: S,
    metadata: ReportMetadata,
    include_empty: bool,
    written: u64,
    failed: u64,
}

impl<S: DetectionSink> SinkConsumer<S> {
    /// Forward only batches that contain detections.
    pub fn new(sink: S, metadata: ReportMetadata) -> Self {
        Self {
            sink,
            metadata,
            include_empty: false,
            written: 0,
            failed: 0,
        }
    }

    pub fn include_empty(mut self, include: bool) -> Self {
        self.include_empty = include;
        self
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Flush and hand back the sink.
    pub fn finish(mut self) -> Result<S> {
        self.sink.flush()?;
        Ok(self.sink)
    }
}

impl<S: DetectionSink> BatchHandler for SinkConsumer<S> {
    fn handle(&mut self, batch: &DetectionBatch) {
        if batch.is_empty() && !self.include_empty {
            return;
        }
        match self.sink.record(batch, &self.metadata) {
            Ok(()) => self.written += 1,
            Err(e) => {
                self.failed += 1;
                log::warn!("report sink: frame {} not recorded: {:#}", batch.sequence, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};
    use std::time::Duration;
    use tempfile::tempdir;

    fn batch(sequence: u64, detections: usize) -> DetectionBatch {
        DetectionBatch {
            sequence,
            timestamp: Duration::from_millis(40),
            frame_width: 640,
            frame_height: 480,
            detections: (0..detections)
                .map(|_| Detection {
                    class_id: 3,
                    label: "Potholes".into(),
                    confidence: 0.8,
                    bbox: BoundingBox::new(1.0, 1.0, 5.0, 5.0),
                })
                .collect(),
        }
    }

    fn metadata() -> ReportMetadata {
        ReportMetadata {
            road_name: "Jl. Sudirman".into(),
            description: "near the bus stop".into(),
            severity: Severity::Moderate,
            source_name: "dashcam.y4m".into(),
        }
    }

    #[test]
    fn severity_parses_both_vocabularies() {
        assert_eq!("Sedang".parse::<Severity>().expect("parse"), Severity::Moderate);
        assert_eq!("severe".parse::<Severity>().expect("parse"), Severity::Severe);
        assert_eq!(" ringan ".parse::<Severity>().expect("parse"), Severity::Light);
        assert!("extreme".parse::<Severity>().is_err());
    }

    #[test]
    fn json_lines_sink_appends_flat_records() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("reports.jsonl");
        let mut sink = JsonLinesSink::open(&path).expect("open");
        sink.record(&batch(1, 1), &metadata()).expect("record");
        sink.record(&batch(2, 2), &metadata()).expect("record");
        sink.flush().expect("flush");
        assert_eq!(sink.records_written(), 2);

        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["road_name"], "Jl. Sudirman");
        assert_eq!(lines[0]["severity"], "moderate");
        assert_eq!(lines[1]["batch"]["sequence"], 2);
        assert_eq!(lines[1]["batch"]["detections"].as_array().map(|a| a.len()), Some(2));
    }

    #[test]
    fn sink_consumer_skips_empty_batches_by_default() {
        let mut consumer = SinkConsumer::new(MemorySink::new(), metadata());
        consumer.handle(&batch(0, 0));
        consumer.handle(&batch(1, 1));
        assert_eq!(consumer.written(), 1);
        let sink = consumer.finish().expect("finish");
        assert_eq!(sink.records()[0].0.sequence, 1);
        assert_eq!(sink.records()[0].1.road_name, "Jl. Sudirman");
    }
}

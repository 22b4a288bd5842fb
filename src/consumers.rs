//! Consumer threads and the stock consumers: statistics and a latest-batch table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::channel::{RecvError, Subscription};
use crate::detect::DetectionBatch;
use crate::session::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Receives every batch a consumer thread pulls off its subscription.
pub trait BatchHandler: Send {
    fn handle(&mut self, batch: &DetectionBatch);
}

impl<F: FnMut(&DetectionBatch) + Send> BatchHandler for F {
    fn handle(&mut self, batch: &DetectionBatch) {
        self(batch)
    }
}

/// Run `handler` on its own thread until the channel closes or `cancel` fires.
///
/// The subscription is dropped when the thread exits, so a producer blocked
/// on it is released. Joining returns the handler with its accumulated state.
pub fn spawn_consumer<H>(
    subscription: Subscription,
    cancel: Option<CancelToken>,
    mut handler: H,
) -> std::io::Result<JoinHandle<H>>
where
    H: BatchHandler + 'static,
{
    let name = format!("roadguard-{}", subscription.name());
    std::thread::Builder::new().name(name).spawn(move || {
        loop {
            if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                log::debug!("consumer '{}' cancelled", subscription.name());
                break;
            }
            match subscription.recv_timeout(POLL_INTERVAL) {
                Ok(batch) => handler.handle(&batch),
                Err(RecvError::Timeout) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        let dropped = subscription.dropped();
        if dropped > 0 {
            log::info!(
                "consumer '{}' finished; {} batches evicted while it lagged",
                subscription.name(),
                dropped
            );
        }
        handler
    })
}

// ----------------------------------------------------------------------------
// DetectionStats
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LabelStats {
    pub count: u64,
    pub max_confidence: f32,
}

/// Running totals over every batch seen.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionStats {
    pub batches: u64,
    pub detections: u64,
    pub per_label: BTreeMap<String, LabelStats>,
    pub last_sequence: Option<u64>,
}

impl DetectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, batch: &DetectionBatch) {
        self.batches += 1;
        self.detections += batch.detections.len() as u64;
        self.last_sequence = Some(batch.sequence);
        for det in &batch.detections {
            let entry = self.per_label.entry(det.label.clone()).or_default();
            entry.count += 1;
            entry.max_confidence = entry.max_confidence.max(det.confidence);
        }
    }

    /// One-line summary, e.g. `Potholes=3 Transverse Crack=1`.
    pub fn summary(&self) -> String {
        if self.per_label.is_empty() {
            return "no detections".to_string();
        }
        self.per_label
            .iter()
            .map(|(label, stats)| format!("{}={}", label, stats.count))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl BatchHandler for DetectionStats {
    fn handle(&mut self, batch: &DetectionBatch) {
        self.record(batch);
    }
}

// ----------------------------------------------------------------------------
// LatestDetections
// ----------------------------------------------------------------------------

/// One row of the live detections table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TableRow {
    pub label: String,
    pub confidence: f32,
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

/// Keeps only the newest batch by sequence number.
///
/// Live batches can arrive late relative to newer ones; anything with a
/// sequence number at or below the current one is discarded as stale.
#[derive(Clone, Debug, Default)]
pub struct LatestDetections {
    current: Option<Arc<DetectionBatch>>,
    stale_discarded: u64,
}

impl LatestDetections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `batch` was stale and ignored.
    pub fn offer(&mut self, batch: Arc<DetectionBatch>) -> bool {
        if let Some(current) = &self.current {
            if batch.sequence <= current.sequence {
                self.stale_discarded += 1;
                return false;
            }
        }
        self.current = Some(batch);
        true
    }

    pub fn current(&self) -> Option<&DetectionBatch> {
        self.current.as_deref()
    }

    pub fn stale_discarded(&self) -> u64 {
        self.stale_discarded
    }

    pub fn rows(&self) -> Vec<TableRow> {
        self.current
            .iter()
            .flat_map(|batch| batch.detections.iter())
            .map(|det| TableRow {
                label: det.label.clone(),
                confidence: det.confidence,
                x_min: det.bbox.x_min,
                y_min: det.bbox.y_min,
                x_max: det.bbox.x_max,
                y_max: det.bbox.y_max,
            })
            .collect()
    }
}

impl BatchHandler for LatestDetections {
    fn handle(&mut self, batch: &DetectionBatch) {
        self.offer(Arc::new(batch.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{OverflowPolicy, ResultChannel};
    use crate::detect::{BoundingBox, Detection};

    fn batch(sequence: u64, labels: &[(&str, f32)]) -> DetectionBatch {
        DetectionBatch {
            sequence,
            timestamp: Duration::ZERO,
            frame_width: 100,
            frame_height: 100,
            detections: labels
                .iter()
                .map(|(label, confidence)| Detection {
                    class_id: 0,
                    label: label.to_string(),
                    confidence: *confidence,
                    bbox: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
                })
                .collect(),
        }
    }

    #[test]
    fn stats_accumulate_per_label() {
        let mut stats = DetectionStats::new();
        stats.record(&batch(0, &[("Potholes", 0.6), ("Alligator Crack", 0.7)]));
        stats.record(&batch(1, &[("Potholes", 0.9)]));
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.detections, 3);
        assert_eq!(stats.per_label["Potholes"].count, 2);
        assert_eq!(stats.per_label["Potholes"].max_confidence, 0.9);
        assert_eq!(stats.summary(), "Alligator Crack=1 Potholes=2");
    }

    #[test]
    fn latest_discards_stale_batches() {
        let mut table = LatestDetections::new();
        assert!(table.offer(Arc::new(batch(5, &[("Potholes", 0.8)]))));
        assert!(!table.offer(Arc::new(batch(3, &[]))));
        assert!(!table.offer(Arc::new(batch(5, &[]))));
        assert_eq!(table.current().map(|b| b.sequence), Some(5));
        assert_eq!(table.stale_discarded(), 2);
        assert_eq!(table.rows().len(), 1);
        assert_eq!(table.rows()[0].label, "Potholes");
    }

    #[test]
    fn consumer_runs_until_channel_closes() {
        let channel = ResultChannel::new();
        let sub = channel.subscribe("stats", 8, OverflowPolicy::BlockProducer);
        let handle = spawn_consumer(sub, None, DetectionStats::new()).expect("spawn");
        for seq in 0..5 {
            channel.publish(batch(seq, &[("Potholes", 0.5)]));
        }
        channel.close();
        let stats = handle.join().expect("consumer thread");
        assert_eq!(stats.batches, 5);
        assert_eq!(stats.last_sequence, Some(4));
    }

    #[test]
    fn consumer_stops_on_cancel_and_unsubscribes() {
        let channel = ResultChannel::new();
        let sub = channel.subscribe("table", 2, OverflowPolicy::DropOldest);
        let cancel = CancelToken::new();
        let handle =
            spawn_consumer(sub, Some(cancel.clone()), LatestDetections::new()).expect("spawn");
        cancel.cancel();
        handle.join().expect("consumer thread");
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn closures_are_handlers() {
        let channel = ResultChannel::new();
        let sub = channel.subscribe("count", 4, OverflowPolicy::BlockProducer);
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = spawn_consumer(sub, None, move |b: &DetectionBatch| {
            let _ = tx.send(b.sequence);
        })
        .expect("spawn");
        channel.publish(batch(7, &[]));
        channel.close();
        drop(handle.join().expect("consumer thread"));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![7]);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::detect::adapter::{InferenceAdapter, ModelInput};
use crate::detect::result::{BoundingBox, RawDetection};

/// Stub adapter for tests and dry runs.
///
/// Returns the same detection list for every frame, filtered by threshold,
/// after an optional artificial latency.
pub struct StubAdapter {
    detections: Vec<RawDetection>,
    latency: Option<Duration>,
    fail_every: Option<u64>,
    calls: AtomicU64,
}

impl StubAdapter {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self {
            detections,
            latency: None,
            fail_every: None,
            calls: AtomicU64::new(0),
        }
    }

    /// Adapter that never detects anything.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Sleep this long inside every `infer` call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every `n`-th call (1-based). `n == 0` disables failures.
    pub fn with_failure_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    /// Number of `infer` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for StubAdapter {
    /// One pothole in the middle of a 640x640 model input.
    fn default() -> Self {
        Self::new(vec![RawDetection {
            class_id: 3,
            confidence: 0.87,
            bbox: BoundingBox::new(240.0, 260.0, 400.0, 380.0),
        }])
    }
}

impl InferenceAdapter for StubAdapter {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&self, input: &ModelInput<'_>, threshold: f32) -> Result<Vec<RawDetection>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let expected = input.width as usize * input.height as usize * 3;
        if input.pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected,
                input.pixels.len()
            ));
        }
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        if let Some(n) = self.fail_every {
            if call % n == 0 {
                return Err(anyhow!("stub failure on call {}", call));
            }
        }
        Ok(self
            .detections
            .iter()
            .filter(|d| d.confidence >= threshold)
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(pixels: &[u8]) -> ModelInput<'_> {
        ModelInput {
            pixels,
            width: 2,
            height: 2,
        }
    }

    #[test]
    fn filters_below_threshold_and_counts_calls() {
        let adapter = StubAdapter::new(vec![
            RawDetection {
                class_id: 0,
                confidence: 0.4,
                bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            },
            RawDetection {
                class_id: 1,
                confidence: 0.5,
                bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            },
        ]);
        let pixels = [0u8; 12];
        let out = adapter.infer(&input(&pixels), 0.5).expect("infer");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 1);
        assert_eq!(adapter.calls(), 1);
    }

    #[test]
    fn rejects_malformed_input() {
        let adapter = StubAdapter::default();
        assert!(adapter.infer(&input(&[0u8; 5]), 0.5).is_err());
    }

    #[test]
    fn fails_on_schedule() {
        let adapter = StubAdapter::empty().with_failure_every(2);
        let pixels = [0u8; 12];
        assert!(adapter.infer(&input(&pixels), 0.5).is_ok());
        assert!(adapter.infer(&input(&pixels), 0.5).is_err());
        assert!(adapter.infer(&input(&pixels), 0.5).is_ok());
    }
}

//! Per-frame orchestration: resize, infer, rescale, render.
//!
//! # Resize contract
//!
//! Frames are resampled to the model input size with area averaging: each
//! output pixel is the mean of the source pixels its footprint covers,
//! weighted by fractional overlap (the same behaviour as OpenCV's
//! `INTER_AREA` when downscaling). The model always receives RGB24 regardless
//! of the source layout. Results are reproducible for a given input.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::detect::{Detection, DetectionBatch, InferenceAdapter, ModelInput, RawDetection};
use crate::error::PipelineError;
use crate::frame::{AnnotatedFrame, Frame};
use crate::render::{self, LabelFont};

/// Output of one `FrameProcessor::process` call.
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    pub annotated: AnnotatedFrame,
    pub batch: DetectionBatch,
    pub inference_time: Duration,
}

pub struct FrameProcessor {
    adapter: Arc<dyn InferenceAdapter>,
    inference_timeout: Option<Duration>,
    font: Option<Arc<LabelFont>>,
    /// Model-resolution RGB buffer reused across frames.
    scratch: Vec<u8>,
    plan: Option<ResizePlan>,
}

impl FrameProcessor {
    pub fn new(adapter: Arc<dyn InferenceAdapter>) -> Self {
        Self {
            adapter,
            inference_timeout: None,
            font: None,
            scratch: Vec::new(),
            plan: None,
        }
    }

    /// Bound each inference call. A call that overruns surfaces as
    /// `PipelineError::InferenceTimeout`; the model call itself is not
    /// interrupted and its result is discarded when it eventually returns.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inference_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Label tags carry text when a font is set, a confidence bar otherwise.
    pub fn with_font(mut self, font: Option<Arc<LabelFont>>) -> Self {
        self.font = font;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn InferenceAdapter> {
        &self.adapter
    }

    pub fn process(
        &mut self,
        frame: &Frame,
        config: &PipelineConfig,
    ) -> Result<ProcessedFrame, PipelineError> {
        let (model_w, model_h) = config.model_input_size;
        if model_w == 0 || model_h == 0 {
            return Err(PipelineError::Config(format!(
                "model input size {}x{} must be non-zero",
                model_w, model_h
            )));
        }
        self.resize_into_scratch(frame, model_w, model_h);

        let started = Instant::now();
        let raw = match self.inference_timeout {
            Some(timeout) => {
                self.infer_with_timeout(model_w, model_h, config.confidence_threshold, timeout)?
            }
            None => {
                let input = ModelInput {
                    pixels: &self.scratch,
                    width: model_w,
                    height: model_h,
                };
                self.adapter
                    .infer(&input, config.confidence_threshold)
                    .map_err(inference_error)?
            }
        };
        let inference_time = started.elapsed();

        let detections: Vec<Detection> = raw
            .into_iter()
            .map(|r| Detection {
                class_id: r.class_id,
                label: config.label_for(r.class_id),
                confidence: r.confidence,
                bbox: r
                    .bbox
                    .rescale_clamped((model_w, model_h), (frame.width, frame.height)),
            })
            .collect();

        let annotated = render::annotate(frame, &detections, self.font.as_deref())?;
        let batch = DetectionBatch {
            sequence: frame.sequence,
            timestamp: frame.timestamp,
            frame_width: frame.width,
            frame_height: frame.height,
            detections,
        };
        Ok(ProcessedFrame {
            annotated,
            batch,
            inference_time,
        })
    }

    fn infer_with_timeout(
        &mut self,
        width: u32,
        height: u32,
        threshold: f32,
        timeout: Duration,
    ) -> Result<Vec<RawDetection>, PipelineError> {
        let (tx, rx) = mpsc::channel();
        let adapter = Arc::clone(&self.adapter);
        let pixels = std::mem::take(&mut self.scratch);
        std::thread::Builder::new()
            .name("roadguard-infer".into())
            .spawn(move || {
                let input = ModelInput {
                    pixels: &pixels,
                    width,
                    height,
                };
                let result = adapter.infer(&input, threshold);
                let _ = tx.send((pixels, result));
            })
            .map_err(|e| PipelineError::Inference(format!("failed to spawn inference thread: {e}")))?;

        match rx.recv_timeout(timeout) {
            Ok((pixels, result)) => {
                self.scratch = pixels;
                result.map_err(inference_error)
            }
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::InferenceTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Inference(
                "inference thread exited without a result".into(),
            )),
        }
    }

    fn resize_into_scratch(&mut self, frame: &Frame, dst_w: u32, dst_h: u32) {
        let key = (frame.width, frame.height, dst_w, dst_h);
        if self.plan.as_ref().map(|p| p.key) != Some(key) {
            self.plan = Some(ResizePlan::new(key));
        }
        if let Some(plan) = &self.plan {
            plan.apply(frame, &mut self.scratch);
        }
    }
}

fn inference_error(err: anyhow::Error) -> PipelineError {
    PipelineError::Inference(format!("{err:#}"))
}

// ----------------------------------------------------------------------------
// Area resampling
// ----------------------------------------------------------------------------

/// Source taps `(index, weight)` per output coordinate along one axis.
type AxisTaps = Vec<Vec<(usize, f32)>>;

struct ResizePlan {
    key: (u32, u32, u32, u32),
    x_taps: AxisTaps,
    y_taps: AxisTaps,
}

impl ResizePlan {
    fn new(key: (u32, u32, u32, u32)) -> Self {
        let (src_w, src_h, dst_w, dst_h) = key;
        Self {
            key,
            x_taps: axis_taps(src_w, dst_w),
            y_taps: axis_taps(src_h, dst_h),
        }
    }

    fn apply(&self, frame: &Frame, out: &mut Vec<u8>) {
        let (r_off, g_off, b_off) = frame.layout.rgb_offsets();
        let src = frame.pixels();
        let src_stride = frame.width as usize * 3;
        out.clear();
        out.reserve(self.x_taps.len() * self.y_taps.len() * 3);

        for y_taps in &self.y_taps {
            for x_taps in &self.x_taps {
                let mut acc = [0f32; 3];
                for &(sy, wy) in y_taps {
                    let row = sy * src_stride;
                    for &(sx, wx) in x_taps {
                        let w = wy * wx;
                        let px = row + sx * 3;
                        acc[0] += src[px + r_off] as f32 * w;
                        acc[1] += src[px + g_off] as f32 * w;
                        acc[2] += src[px + b_off] as f32 * w;
                    }
                }
                out.extend(acc.iter().map(|v| (v + 0.5).clamp(0.0, 255.0) as u8));
            }
        }
    }
}

fn axis_taps(src: u32, dst: u32) -> AxisTaps {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|i| {
            let start = i as f64 * scale;
            let end = start + scale;
            let first = start.floor() as usize;
            let last = (end.ceil() as usize).min(src as usize);
            let mut taps = Vec::with_capacity(last.saturating_sub(first));
            for j in first..last {
                let overlap = end.min(j as f64 + 1.0) - start.max(j as f64);
                if overlap > 1e-9 {
                    taps.push((j, (overlap / scale) as f32));
                }
            }
            taps
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, StubAdapter};
    use crate::frame::PixelLayout;

    fn frame(width: u32, height: u32, data: Vec<u8>, layout: PixelLayout) -> Frame {
        Frame::new(data, width, height, layout, 9, Duration::from_millis(300)).expect("frame")
    }

    fn resize(src: &Frame, w: u32, h: u32) -> Vec<u8> {
        let mut out = Vec::new();
        ResizePlan::new((src.width, src.height, w, h)).apply(src, &mut out);
        out
    }

    #[test]
    fn area_resize_averages_blocks() {
        // 2x2 -> 1x1: mean of four pixels.
        let src = frame(
            2,
            2,
            vec![0, 0, 0, 100, 100, 100, 200, 200, 200, 100, 100, 100],
            PixelLayout::Rgb24,
        );
        assert_eq!(resize(&src, 1, 1), vec![100, 100, 100]);
    }

    #[test]
    fn area_resize_handles_fractional_footprints() {
        // 3x1 -> 2x1: each output covers 1.5 source pixels.
        let src = frame(3, 1, vec![0, 0, 0, 90, 90, 90, 180, 180, 180], PixelLayout::Rgb24);
        assert_eq!(resize(&src, 2, 1), vec![30, 30, 30, 150, 150, 150]);
    }

    #[test]
    fn area_resize_converts_bgr_to_rgb() {
        let src = frame(1, 1, vec![1, 2, 3], PixelLayout::Bgr24);
        assert_eq!(resize(&src, 2, 2), vec![3, 2, 1, 3, 2, 1, 3, 2, 1, 3, 2, 1]);
    }

    #[test]
    fn taps_sum_to_one() {
        for (src, dst) in [(1920, 640), (480, 640), (7, 3), (640, 640)] {
            for taps in axis_taps(src, dst) {
                let total: f32 = taps.iter().map(|(_, w)| w).sum();
                assert!((total - 1.0).abs() < 1e-4, "{} -> {}: {}", src, dst, total);
            }
        }
    }

    #[test]
    fn process_rescales_and_labels() {
        let adapter = Arc::new(StubAdapter::new(vec![RawDetection {
            class_id: 1,
            confidence: 0.75,
            bbox: BoundingBox::new(320.0, 320.0, 640.0, 640.0),
        }]));
        let mut processor = FrameProcessor::new(adapter);
        let config = PipelineConfig::default();
        let src = frame(64, 48, vec![10; 64 * 48 * 3], PixelLayout::Rgb24);

        let out = processor.process(&src, &config).expect("process");
        assert_eq!(out.batch.sequence, 9);
        assert_eq!(out.batch.timestamp, Duration::from_millis(300));
        assert_eq!(out.batch.len(), 1);
        let det = &out.batch.detections[0];
        assert_eq!(det.label, "Transverse Crack");
        assert_eq!(det.bbox, BoundingBox::new(32.0, 24.0, 63.0, 47.0));
        assert_eq!(out.annotated.width(), 64);
        assert_eq!(out.annotated.boxes_drawn, 1);
    }

    #[test]
    fn adapter_failure_is_reported() {
        let adapter = Arc::new(StubAdapter::empty().with_failure_every(1));
        let mut processor = FrameProcessor::new(adapter);
        let src = frame(4, 4, vec![0; 48], PixelLayout::Rgb24);
        let err = processor
            .process(&src, &PipelineConfig::default())
            .expect_err("inference error");
        assert!(matches!(err, PipelineError::Inference(msg) if msg.contains("stub failure")));
    }

    #[test]
    fn slow_adapter_times_out() {
        let adapter = Arc::new(StubAdapter::default().with_latency(Duration::from_millis(300)));
        let mut processor =
            FrameProcessor::new(adapter).with_timeout(Some(Duration::from_millis(20)));
        let src = frame(4, 4, vec![0; 48], PixelLayout::Rgb24);
        let err = processor
            .process(&src, &PipelineConfig::default())
            .expect_err("timeout");
        assert_eq!(err, PipelineError::InferenceTimeout(Duration::from_millis(20)));
    }

    #[test]
    fn fast_adapter_within_timeout_succeeds() {
        let adapter = Arc::new(StubAdapter::default());
        let mut processor =
            FrameProcessor::new(adapter).with_timeout(Some(Duration::from_secs(5)));
        let src = frame(4, 4, vec![0; 48], PixelLayout::Rgb24);
        let out = processor
            .process(&src, &PipelineConfig::default())
            .expect("process");
        assert_eq!(out.batch.len(), 1);
        // Scratch buffer is handed back after the threaded call.
        assert_eq!(processor.scratch.len(), 640 * 640 * 3);
    }
}

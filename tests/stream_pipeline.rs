use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use road_guard::{
    Frame, FrameSource, JobState, LatestDetections, LiveConfig, LiveSource, NullDisplay,
    OverflowPolicy, PipelineConfig, PipelineError, PixelLayout, ResultChannel, StreamPipeline,
    StubAdapter, VideoMetadata,
};

/// Unpaced source that flags when it is dropped.
struct FloodSource {
    next: u64,
    released: Arc<AtomicBool>,
}

impl FrameSource for FloodSource {
    fn connect(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        std::thread::sleep(Duration::from_millis(1));
        let sequence = self.next;
        self.next += 1;
        let frame = Frame::new(
            vec![90; 16 * 16 * 3],
            16,
            16,
            PixelLayout::Rgb24,
            sequence,
            Duration::from_millis(sequence),
        )?;
        Ok(Some(frame))
    }

    fn metadata(&self) -> VideoMetadata {
        VideoMetadata {
            width: 16,
            height: 16,
            fps: None,
            frame_count: None,
        }
    }

    fn describe(&self) -> String {
        "flood".to_string()
    }
}

impl Drop for FloodSource {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[test]
fn slow_inference_drops_frames_without_queueing_them() {
    let released = Arc::new(AtomicBool::new(false));
    let source = FloodSource {
        next: 0,
        released: Arc::clone(&released),
    };
    let pipeline = StreamPipeline::new(
        Arc::new(StubAdapter::default().with_latency(Duration::from_millis(25))),
        ResultChannel::new(),
    );
    let handle = pipeline
        .spawn(
            Box::new(source),
            Box::new(NullDisplay::new()),
            PipelineConfig::default(),
        )
        .expect("spawn");

    std::thread::sleep(Duration::from_millis(300));
    let snapshot = pipeline.session().snapshot();
    assert_eq!(snapshot.state, JobState::Running);
    assert_eq!(snapshot.progress, 0.0);

    assert!(pipeline.session().cancel());
    let report = handle.join().expect("live thread").expect("report");

    assert_eq!(report.state, JobState::Cancelled);
    assert!(report.frames_processed >= 1);
    assert!(report.frames_dropped > 0);
    let accounted = report.frames_processed + report.frames_dropped + report.frames_failed;
    assert!(report.frames_captured >= accounted);
    assert!(report.frames_captured - accounted <= 1);
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn live_batches_arrive_in_increasing_sequence_order() {
    let results = ResultChannel::new();
    let sub = results.subscribe("table", 64, OverflowPolicy::DropOldest);
    let pipeline = StreamPipeline::new(Arc::new(StubAdapter::default()), results);
    let source = LiveSource::new(LiveConfig {
        url: "stub://cam?fps=100".to_string(),
        target_fps: 100,
        width: 32,
        height: 24,
    })
    .expect("source");
    let handle = pipeline
        .spawn(
            Box::new(source),
            Box::new(NullDisplay::new()),
            PipelineConfig::default(),
        )
        .expect("spawn");
    std::thread::sleep(Duration::from_millis(200));
    pipeline.session().cancel();
    handle.join().expect("live thread").expect("report");

    let batches = sub.drain();
    assert!(!batches.is_empty());
    assert!(batches.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let mut table = LatestDetections::new();
    for batch in batches {
        table.offer(batch);
    }
    assert_eq!(table.stale_discarded(), 0);
    assert_eq!(table.rows()[0].label, "Potholes");
}

#[test]
fn stream_read_failure_is_fatal() {
    let pipeline = StreamPipeline::new(Arc::new(StubAdapter::default()), ResultChannel::new());
    let source = LiveSource::new(LiveConfig {
        url: "stub://cam?fps=50&fail_at=0".to_string(),
        ..LiveConfig::default()
    })
    .expect("source");
    let mut display = NullDisplay::new();
    let err = pipeline
        .run(Box::new(source), &mut display, &PipelineConfig::default())
        .expect_err("source error");
    assert!(matches!(err, PipelineError::Source(_)));
    assert!(matches!(pipeline.session().state(), JobState::Failed(_)));
    assert_eq!(display.frames_shown(), 0);
}

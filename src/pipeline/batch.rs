use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::ResultChannel;
use crate::config::PipelineConfig;
use crate::detect::InferenceAdapter;
use crate::error::PipelineError;
use crate::ingest::FrameSource;
use crate::output::VideoEncoder;
use crate::processor::FrameProcessor;
use crate::render::LabelFont;
use crate::session::{CancelToken, JobOutcome, JobState, SessionState};

/// Summary of a batch job that ran to completion or was cancelled.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchReport {
    pub state: JobState,
    pub frames_processed: u64,
    pub total_frames: u64,
    pub detections: u64,
    pub elapsed: Duration,
}

/// File-to-file scheduler.
///
/// One instance runs at most one job at a time; clones share the same
/// session, so a clone started while a job runs is rejected with `Busy`.
#[derive(Clone)]
pub struct BatchPipeline {
    adapter: Arc<dyn InferenceAdapter>,
    results: ResultChannel,
    session: SessionState,
    inference_timeout: Option<Duration>,
    font: Option<Arc<LabelFont>>,
}

#[derive(Default)]
struct Progress {
    processed: u64,
    total: u64,
    detections: u64,
}

impl BatchPipeline {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, results: ResultChannel) -> Self {
        Self {
            adapter,
            results,
            session: SessionState::new(),
            inference_timeout: None,
            font: None,
        }
    }

    pub fn with_session(mut self, session: SessionState) -> Self {
        self.session = session;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inference_timeout = timeout;
        self
    }

    pub fn with_font(mut self, font: Option<Arc<LabelFont>>) -> Self {
        self.font = font;
        self
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn results(&self) -> &ResultChannel {
        &self.results
    }

    /// Process every frame of `source` into `encoder`.
    ///
    /// `Busy` and `Config` are returned before the job starts. Any other
    /// error means the job failed: the session holds `Failed(reason)` and the
    /// encoder has been finalised with the frames written so far. A cancelled
    /// job returns `Ok` with `JobState::Cancelled`.
    pub fn run(
        &self,
        source: &mut dyn FrameSource,
        encoder: &mut dyn VideoEncoder,
        config: &PipelineConfig,
    ) -> Result<BatchReport, PipelineError> {
        config.validate()?;
        let cancel = self.session.begin()?;
        let started = Instant::now();
        log::info!(
            "batch job started: {} (adapter {}, threshold {:.2})",
            source.describe(),
            self.adapter.name(),
            config.confidence_threshold
        );

        let mut progress = Progress::default();
        let driven = self.drive(source, encoder, config, &cancel, &mut progress);
        let finalised = encoder.finish();

        let outcome = match (driven, finalised) {
            (Ok(outcome), Ok(())) => outcome,
            (Ok(_), Err(e)) => JobOutcome::Failed(e),
            (Err(e), finish) => {
                if let Err(finish_err) = finish {
                    log::warn!("batch job: output finalisation also failed: {}", finish_err);
                }
                JobOutcome::Failed(e)
            }
        };
        let state = self.session.finish(outcome.clone());
        let elapsed = started.elapsed();

        match outcome {
            JobOutcome::Failed(err) => {
                log::error!(
                    "batch job failed after {}/{} frames: {}",
                    progress.processed,
                    progress.total,
                    err
                );
                Err(err)
            }
            _ => {
                log::info!(
                    "batch job {}: {}/{} frames, {} detections in {:.1}s",
                    state,
                    progress.processed,
                    progress.total,
                    progress.detections,
                    elapsed.as_secs_f64()
                );
                Ok(BatchReport {
                    state,
                    frames_processed: progress.processed,
                    total_frames: progress.total,
                    detections: progress.detections,
                    elapsed,
                })
            }
        }
    }

    fn drive(
        &self,
        source: &mut dyn FrameSource,
        encoder: &mut dyn VideoEncoder,
        config: &PipelineConfig,
        cancel: &CancelToken,
        progress: &mut Progress,
    ) -> Result<JobOutcome, PipelineError> {
        source.connect()?;
        let metadata = source.metadata();
        let total = metadata
            .frame_count
            .ok_or_else(|| PipelineError::Metadata(format!("{}: frame count unavailable", source.describe())))?;
        if total == 0 {
            return Err(PipelineError::Metadata(format!(
                "{}: container reports zero frames",
                source.describe()
            )));
        }
        if !metadata.fps.is_some_and(|fps| fps > 0.0 && fps.is_finite()) {
            return Err(PipelineError::Metadata(format!(
                "{}: frame rate unavailable",
                source.describe()
            )));
        }
        progress.total = total;
        self.session.set_progress(0, total);
        if let Some(duration) = metadata.duration_label() {
            log::info!(
                "input {}x{} @ {:.2} fps, {} frames ({})",
                metadata.width,
                metadata.height,
                metadata.fps.unwrap_or_default(),
                total,
                duration
            );
        }

        encoder.open(&metadata)?;
        let mut processor = FrameProcessor::new(Arc::clone(&self.adapter))
            .with_timeout(self.inference_timeout)
            .with_font(self.font.clone());

        loop {
            if cancel.is_cancelled() {
                log::info!(
                    "batch job cancelled after {}/{} frames",
                    progress.processed,
                    total
                );
                return Ok(JobOutcome::Cancelled);
            }
            let Some(frame) = source.next_frame()? else {
                break;
            };
            if frame.sequence != progress.processed {
                return Err(PipelineError::Source(format!(
                    "{}: expected frame {}, got {}",
                    source.describe(),
                    progress.processed,
                    frame.sequence
                )));
            }

            let out = processor.process(&frame, config)?;
            drop(frame);
            encoder.write_frame(&out.annotated)?;
            progress.detections += out.batch.len() as u64;
            self.results.publish(out.batch);

            progress.processed += 1;
            self.session.set_progress(progress.processed, total);
            log::debug!(
                "frame {}/{} in {:?}",
                progress.processed,
                total,
                out.inference_time
            );
        }

        if progress.processed != total {
            log::warn!(
                "{}: container declared {} frames, decoded {}",
                source.describe(),
                total,
                progress.processed
            );
        }
        Ok(JobOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubAdapter;
    use crate::ingest::FileSource;
    use crate::output::MemoryEncoder;

    fn pipeline() -> BatchPipeline {
        BatchPipeline::new(Arc::new(StubAdapter::default()), ResultChannel::new())
    }

    #[test]
    fn processes_every_frame_in_order() {
        let pipeline = pipeline();
        let mut source = FileSource::open("stub://clip?frames=6&width=32&height=24").expect("source");
        let mut encoder = MemoryEncoder::new();
        let report = pipeline
            .run(&mut source, &mut encoder, &PipelineConfig::default())
            .expect("run");

        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.frames_processed, 6);
        assert_eq!(report.detections, 6);
        let seqs: Vec<u64> = encoder.frames().iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, (0..6).collect::<Vec<_>>());
        assert!(encoder.is_finished());
        assert_eq!(pipeline.session().progress(), 1.0);
    }

    #[test]
    fn unknown_frame_count_fails_before_processing() {
        let pipeline = pipeline();
        let mut source =
            FileSource::open("stub://clip?frames=4&width=8&height=8&count=unknown").expect("source");
        let mut encoder = MemoryEncoder::new();
        let err = pipeline
            .run(&mut source, &mut encoder, &PipelineConfig::default())
            .expect_err("metadata error");
        assert!(matches!(err, PipelineError::Metadata(_)));
        assert!(encoder.frames().is_empty());
        assert!(matches!(pipeline.session().state(), JobState::Failed(_)));
    }

    #[test]
    fn invalid_config_is_rejected_without_state_change() {
        let pipeline = pipeline();
        let mut source = FileSource::open("stub://clip?frames=1&width=8&height=8").expect("source");
        let err = pipeline
            .run(
                &mut source,
                &mut MemoryEncoder::new(),
                &PipelineConfig::default().with_threshold(-0.1),
            )
            .expect_err("config error");
        assert!(matches!(err, PipelineError::Config(_)));
        assert_eq!(pipeline.session().state(), JobState::Idle);
    }

    #[test]
    fn inference_failure_is_fatal_and_output_is_finalised() {
        let pipeline = BatchPipeline::new(
            Arc::new(StubAdapter::default().with_failure_every(3)),
            ResultChannel::new(),
        );
        let mut source = FileSource::open("stub://clip?frames=5&width=8&height=8").expect("source");
        let mut encoder = MemoryEncoder::new();
        let err = pipeline
            .run(&mut source, &mut encoder, &PipelineConfig::default())
            .expect_err("inference error");
        assert!(matches!(err, PipelineError::Inference(_)));
        assert_eq!(encoder.frames_written(), 2);
        assert!(encoder.is_finished());
        let snap = pipeline.session().snapshot();
        assert!(matches!(snap.state, JobState::Failed(reason) if reason.starts_with("inference error")));
        assert!((snap.progress - 0.4).abs() < 1e-9);
    }

    #[test]
    fn source_and_encoder_errors_are_fatal() {
        let pipeline = pipeline();
        let mut source =
            FileSource::open("stub://clip?frames=5&width=8&height=8&fail_at=2").expect("source");
        let err = pipeline
            .run(&mut source, &mut MemoryEncoder::new(), &PipelineConfig::default())
            .expect_err("source error");
        assert!(matches!(err, PipelineError::Source(_)));

        let mut source = FileSource::open("stub://clip?frames=5&width=8&height=8").expect("source");
        let mut encoder = MemoryEncoder::new().with_failure_after(1);
        let err = pipeline
            .run(&mut source, &mut encoder, &PipelineConfig::default())
            .expect_err("encoding error");
        assert!(matches!(err, PipelineError::Encoding(_)));
    }

    #[test]
    fn pipeline_is_reusable_after_a_job_ends() {
        let pipeline = pipeline();
        for _ in 0..2 {
            let mut source = FileSource::open("stub://clip?frames=2&width=8&height=8").expect("source");
            let report = pipeline
                .run(&mut source, &mut MemoryEncoder::new(), &PipelineConfig::default())
                .expect("run");
            assert_eq!(report.state, JobState::Completed);
        }
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::POLL_INTERVAL;
use crate::channel::ResultChannel;
use crate::config::PipelineConfig;
use crate::detect::InferenceAdapter;
use crate::error::PipelineError;
use crate::frame::{CellRead, LatestFrameCell};
use crate::ingest::FrameSource;
use crate::output::LiveDisplay;
use crate::processor::FrameProcessor;
use crate::render::LabelFont;
use crate::session::{CancelToken, JobOutcome, JobState, SessionState};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Counters of a live job that stopped on cancellation.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamReport {
    pub state: JobState,
    pub frames_captured: u64,
    pub frames_processed: u64,
    /// Superseded in the latest-frame cell before inference reached them.
    pub frames_dropped: u64,
    /// Inference failed or timed out; the frame was skipped.
    pub frames_failed: u64,
}

/// Live scheduler.
///
/// A capture thread keeps at most one undelivered frame in a
/// `LatestFrameCell`; the calling thread runs inference on whatever is newest
/// when it becomes free. Memory stays bounded to one pending frame plus the
/// one being processed, whatever the source rate.
#[derive(Clone)]
pub struct StreamPipeline {
    adapter: Arc<dyn InferenceAdapter>,
    results: ResultChannel,
    session: SessionState,
    inference_timeout: Option<Duration>,
    font: Option<Arc<LabelFont>>,
}

#[derive(Default)]
struct Counters {
    processed: u64,
    failed: u64,
}

impl StreamPipeline {
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

    /// Run a live job on the calling thread until cancelled or a fatal error.
    ///
    /// A live job never completes on its own: a source that ends is a failure.
    /// The source is dropped before this returns.
    pub fn run(
        &self,
        source: Box<dyn FrameSource>,
        display: &mut dyn LiveDisplay,
        config: &PipelineConfig,
    ) -> Result<StreamReport, PipelineError> {
        config.validate()?;
        let cancel = self.session.begin()?;
        self.execute(source, display, config, &cancel)
    }

    /// Like [`run`](Self::run) but on a new thread.
    ///
    /// `Busy` and `Config` are returned here, before any thread exists.
    pub fn spawn(
        &self,
        source: Box<dyn FrameSource>,
        mut display: Box<dyn LiveDisplay>,
        config: PipelineConfig,
    ) -> Result<JoinHandle<Result<StreamReport, PipelineError>>, PipelineError> {
        config.validate()?;
        let cancel = self.session.begin()?;
        let pipeline = self.clone();
        let spawned = std::thread::Builder::new()
            .name("roadguard-live".to_string())
            .spawn({
                let cancel = cancel.clone();
                move || pipeline.execute(source, display.as_mut(), &config, &cancel)
            });
        match spawned {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let err = PipelineError::Source(format!("failed to spawn live thread: {}", e));
                self.session.finish(JobOutcome::Failed(err.clone()));
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        mut source: Box<dyn FrameSource>,
        display: &mut dyn LiveDisplay,
        config: &PipelineConfig,
        cancel: &CancelToken,
    ) -> Result<StreamReport, PipelineError> {
        log::info!(
            "live job started: {} (adapter {}, threshold {:.2})",
            source.describe(),
            self.adapter.name(),
            config.confidence_threshold
        );
        if self.results.has_blocking_subscribers() {
            log::warn!("live job: a blocking result subscriber can stall inference");
        }
        if let Err(e) = source.connect() {
            return Err(self.fail(e, display));
        }

        let cell = Arc::new(LatestFrameCell::new());
        let stop = Arc::new(AtomicBool::new(false));
        let capture = match spawn_capture(source, Arc::clone(&cell), Arc::clone(&stop)) {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(e, display)),
        };

        let mut counters = Counters::default();
        let outcome = self.process_loop(&cell, display, config, cancel, &mut counters);

        stop.store(true, Ordering::SeqCst);
        cell.close();
        if capture.join().is_err() {
            log::error!("live job: capture thread panicked");
        }
        let closed = display.close();

        let outcome = match (outcome, closed) {
            (Ok(()), Ok(())) => JobOutcome::Cancelled,
            (Ok(()), Err(e)) => JobOutcome::Failed(e),
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    log::warn!("live job: display close also failed: {}", close_err);
                }
                JobOutcome::Failed(e)
            }
        };

        let stats = cell.stats();
        self.session
            .record_stream(counters.processed, stats.superseded, counters.failed);
        let state = self.session.finish(outcome.clone());
        match outcome {
            JobOutcome::Failed(err) => {
                log::error!(
                    "live job failed after {} frames: {}",
                    counters.processed,
                    err
                );
                Err(err)
            }
            _ => {
                log::info!(
                    "live job {}: captured {}, processed {}, dropped {}, failed {}",
                    state,
                    stats.captured,
                    counters.processed,
                    stats.superseded,
                    counters.failed
                );
                Ok(StreamReport {
                    state,
                    frames_captured: stats.captured,
                    frames_processed: counters.processed,
                    frames_dropped: stats.superseded,
                    frames_failed: counters.failed,
                })
            }
        }
    }

    /// Returns `Ok(())` when cancelled, `Err` on a fatal error.
    fn process_loop(
        &self,
        cell: &LatestFrameCell,
        display: &mut dyn LiveDisplay,
        config: &PipelineConfig,
        cancel: &CancelToken,
        counters: &mut Counters,
    ) -> Result<(), PipelineError> {
        let mut processor = FrameProcessor::new(Arc::clone(&self.adapter))
            .with_timeout(self.inference_timeout)
            .with_font(self.font.clone());
        let mut last_health = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let frame = match cell.take_timeout(POLL_INTERVAL) {
                CellRead::Frame(frame) => frame,
                CellRead::Empty => continue,
                CellRead::Failed(err) => return Err(err),
                CellRead::Closed => return Ok(()),
            };

            match processor.process(&frame, config) {
                Ok(out) => {
                    display.show(&out.annotated)?;
                    self.results.publish(out.batch);
                    counters.processed += 1;
                }
                Err(err) if err.is_frame_local() => {
                    counters.failed += 1;
                    log::warn!("live frame {} skipped: {}", frame.sequence, err);
                }
                Err(err) => return Err(err),
            }

            let stats = cell.stats();
            self.session
                .record_stream(counters.processed, stats.superseded, counters.failed);
            if last_health.elapsed() >= HEALTH_LOG_INTERVAL {
                log::info!(
                    "live: captured {}, processed {}, dropped {}, failed {}, last frame {:?} ago",
                    stats.captured,
                    counters.processed,
                    stats.superseded,
                    counters.failed,
                    cell.since_last_put().unwrap_or_default()
                );
                last_health = Instant::now();
            }
        }
    }

    /// Fail a job that never reached its processing loop.
    fn fail(&self, err: PipelineError, display: &mut dyn LiveDisplay) -> PipelineError {
        if let Err(close_err) = display.close() {
            log::warn!("live job: display close failed: {}", close_err);
        }
        self.session.finish(JobOutcome::Failed(err.clone()));
        log::error!("live job failed: {}", err);
        err
    }
}

/// Move `source` onto a capture thread that feeds `cell` until `stop` is set,
/// the cell is closed, or the source fails. The source is dropped when the
/// thread exits.
fn spawn_capture(
    mut source: Box<dyn FrameSource>,
    cell: Arc<LatestFrameCell>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, PipelineError> {
    std::thread::Builder::new()
        .name("roadguard-capture".to_string())
        .spawn(move || {
            let label = source.describe();
            let mut warned_unhealthy = false;
            while !stop.load(Ordering::SeqCst) && !cell.is_closed() {
                match source.next_frame() {
                    Ok(Some(frame)) => {
                        cell.put(frame);
                        let healthy = source.is_healthy();
                        if !healthy && !warned_unhealthy {
                            log::warn!("{}: frames arriving late", label);
                        }
                        warned_unhealthy = !healthy;
                    }
                    Ok(None) => {
                        cell.fail(PipelineError::Source(format!("{}: live source ended", label)));
                        break;
                    }
                    Err(err) => {
                        cell.fail(err);
                        break;
                    }
                }
            }
            drop(source);
            log::debug!("{}: capture stopped", label);
        })
        .map_err(|e| PipelineError::Source(format!("failed to spawn capture thread: {}", e)))
}

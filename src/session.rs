//! Job lifecycle, progress and cancellation for one pipeline instance.
//!
//! `SessionState` is the only mutable cell shared between a running job and
//! the caller polling it. The job thread is the single writer of progress and
//! counters; any thread may read a snapshot or request cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::error::PipelineError;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed(_) | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Idle => f.write_str("idle"),
            JobState::Running => f.write_str("running"),
            JobState::Completed => f.write_str("completed"),
            JobState::Failed(reason) => write!(f, "failed: {}", reason),
            JobState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal outcome reported by a job when it stops.
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed(PipelineError),
    Cancelled,
}

/// Cooperative cancellation flag. Cheap to clone; all clones share the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Point-in-time copy of the session for polling.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: JobState,
    /// `frames_processed / total` in batch mode; 0 in live mode.
    pub progress: f64,
    pub frames_processed: u64,
    /// Live frames superseded in the latest-frame cell.
    pub frames_dropped: u64,
    /// Live frames whose inference failed and were skipped.
    pub frames_failed: u64,
    pub total_frames: Option<u64>,
}

struct Inner {
    state: JobState,
    progress: f64,
    frames_processed: u64,
    frames_dropped: u64,
    frames_failed: u64,
    total_frames: Option<u64>,
    cancel: CancelToken,
}

impl Inner {
    fn clear_counters(&mut self) {
        self.progress = 0.0;
        self.frames_processed = 0;
        self.frames_dropped = 0;
        self.frames_failed = 0;
        self.total_frames = None;
    }
}

#[derive(Clone)]
pub struct SessionState {
    inner: Arc<Mutex<Inner>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: JobState::Idle,
                progress: 0.0,
                frames_processed: 0,
                frames_dropped: 0,
                frames_failed: 0,
                total_frames: None,
                cancel: CancelToken::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a job: any previous terminal state goes back to `Idle`, then to
    /// `Running` with zeroed progress and a fresh cancellation token.
    ///
    /// Fails with `Busy`, leaving everything untouched, if a job is running.
    pub fn begin(&self) -> Result<CancelToken, PipelineError> {
        let mut inner = self.lock();
        if inner.state == JobState::Running {
            return Err(PipelineError::Busy);
        }
        inner.state = JobState::Idle;
        inner.clear_counters();
        inner.cancel = CancelToken::new();
        inner.state = JobState::Running;
        Ok(inner.cancel.clone())
    }

    /// Request cancellation of the running job. Returns false when idle or finished.
    pub fn cancel(&self) -> bool {
        let inner = self.lock();
        if inner.state != JobState::Running {
            return false;
        }
        inner.cancel.cancel();
        true
    }

    /// Token of the current (or most recent) job.
    pub fn cancel_token(&self) -> CancelToken {
        self.lock().cancel.clone()
    }

    pub fn set_total(&self, total: Option<u64>) {
        self.lock().total_frames = total;
    }

    /// Record batch progress after `processed` of `total` frames.
    pub fn set_progress(&self, processed: u64, total: u64) {
        let mut inner = self.lock();
        if inner.state != JobState::Running {
            return;
        }
        inner.frames_processed = processed;
        inner.total_frames = Some(total);
        inner.progress = if total == 0 {
            0.0
        } else {
            (processed as f64 / total as f64).min(1.0)
        };
    }

    /// Record live counters.
    pub fn record_stream(&self, processed: u64, dropped: u64, failed: u64) {
        let mut inner = self.lock();
        if inner.state != JobState::Running {
            return;
        }
        inner.frames_processed = processed;
        inner.frames_dropped = dropped;
        inner.frames_failed = failed;
    }

    /// Move a running job to its terminal state. Ignored unless `Running`.
    pub fn finish(&self, outcome: JobOutcome) -> JobState {
        let mut inner = self.lock();
        if inner.state != JobState::Running {
            return inner.state.clone();
        }
        inner.state = match outcome {
            JobOutcome::Completed => {
                inner.progress = 1.0;
                JobState::Completed
            }
            JobOutcome::Failed(err) => JobState::Failed(err.to_string()),
            JobOutcome::Cancelled => JobState::Cancelled,
        };
        inner.state.clone()
    }

    /// Return a finished session to `Idle`.
    pub fn reset(&self) -> Result<(), PipelineError> {
        let mut inner = self.lock();
        if inner.state == JobState::Running {
            return Err(PipelineError::Busy);
        }
        inner.state = JobState::Idle;
        inner.clear_counters();
        Ok(())
    }

    pub fn state(&self) -> JobState {
        self.lock().state.clone()
    }

    pub fn progress(&self) -> f64 {
        self.lock().progress
    }

    pub fn is_running(&self) -> bool {
        self.lock().state == JobState::Running
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock();
        SessionSnapshot {
            state: inner.state.clone(),
            progress: inner.progress,
            frames_processed: inner.frames_processed,
            frames_dropped: inner.frames_dropped,
            frames_failed: inner.frames_failed,
            total_frames: inner.total_frames,
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

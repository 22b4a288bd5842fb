//! Job schedulers over the shared `FrameProcessor` contract.
//!
//! - [`BatchPipeline`]: every decoded frame, strictly in order, into a
//!   `VideoEncoder`; progress is `processed / total`.
//! - [`StreamPipeline`]: live frames through a single-slot latest-frame cell;
//!   frames that arrive while inference is busy are superseded and counted.
//!
//! Both check their `CancelToken` before each frame and never interrupt an
//! inference call already in flight. Detection batches go to the shared
//! `ResultChannel`; rejected starts (`Busy`, `Config`) leave the session
//! untouched.

mod batch;
mod stream;

pub use batch::{BatchPipeline, BatchReport};
pub use stream::{StreamPipeline, StreamReport};

use std::time::Duration;

/// How long a waiting loop sleeps before re-checking cancellation.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

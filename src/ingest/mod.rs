//! Frame ingestion sources.
//!
//! - `FileSource`: finite clips for batch mode (`stub://`, `.y4m`, and
//!   anything FFmpeg decodes with feature `ingest-file-ffmpeg`)
//! - `LiveSource`: camera and network streams for live mode (`stub://`, and
//!   FFmpeg URLs with feature `ingest-live-ffmpeg`)
//!
//! `stub://` sources synthesise frames so every pipeline can run without a
//! codec library or a camera. Query parameters shape the clip:
//! `stub://name?frames=N&width=W&height=H&fps=F`.

pub(crate) mod color;
#[cfg(any(feature = "ingest-file-ffmpeg", feature = "ingest-live-ffmpeg"))]
pub(crate) mod ffmpeg;
pub mod file;
pub mod live;
mod synthetic;
pub(crate) mod y4m;

pub use file::FileSource;
pub use live::{LiveConfig, LiveSource};

use crate::error::PipelineError;
use crate::frame::Frame;

/// Container-level facts about a source.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    /// Native frame rate, if the container declares one.
    pub fps: Option<f64>,
    /// Total frames, if known up front. Always `None` for live streams.
    pub frame_count: Option<u64>,
}

impl VideoMetadata {
    /// Clip length as `m:ss`, or `None` without both count and rate.
    pub fn duration_label(&self) -> Option<String> {
        let fps = self.fps.filter(|f| *f > 0.0)?;
        let secs = (self.frame_count? as f64 / fps).floor() as u64;
        Some(format!("{}:{:02}", secs / 60, secs % 60))
    }
}

/// Ordered producer of frames.
///
/// Sequence numbers start at 0 and increase by one per returned frame.
/// `Ok(None)` is end of stream. Errors are fatal to the job using the source.
/// Dropping the source releases the underlying handle.
pub trait FrameSource: Send {
    fn connect(&mut self) -> Result<(), PipelineError>;

    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError>;

    fn metadata(&self) -> VideoMetadata;

    /// Path or URL for logs.
    fn describe(&self) -> String;

    fn is_healthy(&self) -> bool {
        true
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn connect(&mut self) -> Result<(), PipelineError> {
        (**self).connect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        (**self).next_frame()
    }

    fn metadata(&self) -> VideoMetadata {
        (**self).metadata()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }
}

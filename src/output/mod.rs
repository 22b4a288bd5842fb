//! Annotated-frame outputs: file encoders and live display surfaces.

#[cfg(feature = "output-ffmpeg")]
mod ffmpeg;
mod y4m;

#[cfg(feature = "output-ffmpeg")]
pub use ffmpeg::FfmpegEncoder;
pub use y4m::Y4mEncoder;

use std::path::Path;

use crate::error::PipelineError;
use crate::frame::AnnotatedFrame;
use crate::ingest::VideoMetadata;

/// Writes annotated frames into a video container in call order.
pub trait VideoEncoder: Send {
    /// Prepare the container for frames of `metadata`'s size and rate.
    fn open(&mut self, metadata: &VideoMetadata) -> Result<(), PipelineError>;

    fn write_frame(&mut self, frame: &AnnotatedFrame) -> Result<(), PipelineError>;

    /// Finalise the container. Safe to call more than once; later calls are no-ops.
    fn finish(&mut self) -> Result<(), PipelineError>;

    fn frames_written(&self) -> u64;
}

impl<E: VideoEncoder + ?Sized> VideoEncoder for Box<E> {
    fn open(&mut self, metadata: &VideoMetadata) -> Result<(), PipelineError> {
        (**self).open(metadata)
    }

    fn write_frame(&mut self, frame: &AnnotatedFrame) -> Result<(), PipelineError> {
        (**self).write_frame(frame)
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        (**self).finish()
    }

    fn frames_written(&self) -> u64 {
        (**self).frames_written()
    }
}

/// Container chosen for an output path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// `.y4m`, or any extension not listed below.
    Y4m,
    /// `.mp4`, `.mkv`, `.avi` through FFmpeg.
    Ffmpeg,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("mp4" | "mkv" | "avi") => OutputFormat::Ffmpeg,
            _ => OutputFormat::Y4m,
        }
    }
}

/// Encoder for `path`, picked by extension. Nothing is written until `open`.
pub fn create_encoder(path: &Path) -> Result<Box<dyn VideoEncoder>, PipelineError> {
    match OutputFormat::from_path(path) {
        OutputFormat::Y4m => Ok(Box::new(Y4mEncoder::create(path)?)),
        #[cfg(feature = "output-ffmpeg")]
        OutputFormat::Ffmpeg => Ok(Box::new(FfmpegEncoder::create(path)?)),
        #[cfg(not(feature = "output-ffmpeg"))]
        OutputFormat::Ffmpeg => Err(PipelineError::Config(format!(
            "cannot write {}: compressed outputs need the output-ffmpeg feature; use .y4m",
            path.display()
        ))),
    }
}

/// Live preview surface.
pub trait LiveDisplay: Send {
    fn show(&mut self, frame: &AnnotatedFrame) -> Result<(), PipelineError>;

    fn close(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Display that discards frames, counting them.
#[derive(Debug, Default)]
pub struct NullDisplay {
    shown: u64,
    closed: bool,
}

impl NullDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_shown(&self) -> u64 {
        self.shown
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl LiveDisplay for NullDisplay {
    fn show(&mut self, _frame: &AnnotatedFrame) -> Result<(), PipelineError> {
        self.shown += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        self.closed = true;
        Ok(())
    }
}

/// Display that records every shown frame through a `VideoEncoder`.
///
/// The encoder is opened on the first frame using that frame's size and the
/// rate given at construction.
pub struct RecordingDisplay<E: VideoEncoder> {
    encoder: E,
    fps: f64,
    opened: bool,
}

impl<E: VideoEncoder> RecordingDisplay<E> {
    pub fn new(encoder: E, fps: f64) -> Self {
        Self {
            encoder,
            fps,
            opened: false,
        }
    }

    pub fn into_inner(self) -> E {
        self.encoder
    }

    pub fn frames_recorded(&self) -> u64 {
        self.encoder.frames_written()
    }
}

impl<E: VideoEncoder> LiveDisplay for RecordingDisplay<E> {
    fn show(&mut self, frame: &AnnotatedFrame) -> Result<(), PipelineError> {
        if !self.opened {
            self.encoder.open(&VideoMetadata {
                width: frame.width(),
                height: frame.height(),
                fps: Some(self.fps),
                frame_count: None,
            })?;
            self.opened = true;
        }
        self.encoder.write_frame(frame)
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        if self.opened {
            self.encoder.finish()?;
        }
        Ok(())
    }
}

/// Frame record kept by `MemoryEncoder`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub boxes: usize,
}

/// In-memory encoder that records what would have been written.
#[derive(Debug, Default)]
pub struct MemoryEncoder {
    metadata: Option<VideoMetadata>,
    frames: Vec<EncodedFrame>,
    finish_calls: u32,
    fail_after: Option<u64>,
}

impl MemoryEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every write once `n` frames have been written.
    pub fn with_failure_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn metadata(&self) -> Option<&VideoMetadata> {
        self.metadata.as_ref()
    }

    pub fn frames(&self) -> &[EncodedFrame] {
        &self.frames
    }

    pub fn is_finished(&self) -> bool {
        self.finish_calls > 0
    }
}

impl VideoEncoder for MemoryEncoder {
    fn open(&mut self, metadata: &VideoMetadata) -> Result<(), PipelineError> {
        self.metadata = Some(*metadata);
        Ok(())
    }

    fn write_frame(&mut self, frame: &AnnotatedFrame) -> Result<(), PipelineError> {
        if self.metadata.is_none() {
            return Err(PipelineError::Encoding("write before open".into()));
        }
        if self.is_finished() {
            return Err(PipelineError::Encoding("write after finish".into()));
        }
        if self
            .fail_after
            .is_some_and(|n| self.frames.len() as u64 >= n)
        {
            return Err(PipelineError::Encoding("simulated write failure".into()));
        }
        self.frames.push(EncodedFrame {
            sequence: frame.sequence(),
            width: frame.width(),
            height: frame.height(),
            boxes: frame.boxes_drawn,
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        self.finish_calls += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, PixelLayout};
    use std::time::Duration;

    fn annotated(sequence: u64) -> AnnotatedFrame {
        AnnotatedFrame {
            frame: Frame::new(vec![0; 12], 2, 2, PixelLayout::Rgb24, sequence, Duration::ZERO)
                .expect("frame"),
            boxes_drawn: 1,
        }
    }

    #[test]
    fn recording_display_opens_encoder_on_first_frame() {
        let mut display = RecordingDisplay::new(MemoryEncoder::new(), 15.0);
        display.show(&annotated(4)).expect("show");
        display.show(&annotated(7)).expect("show");
        display.close().expect("close");

        let encoder = display.into_inner();
        let meta = encoder.metadata().expect("opened");
        assert_eq!((meta.width, meta.height, meta.fps), (2, 2, Some(15.0)));
        let seqs: Vec<u64> = encoder.frames().iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![4, 7]);
        assert!(encoder.is_finished());
    }

    #[test]
    fn output_format_follows_extension() {
        assert_eq!(OutputFormat::from_path(Path::new("clip_detected.y4m")), OutputFormat::Y4m);
        assert_eq!(OutputFormat::from_path(Path::new("RDD_Prediction.MP4")), OutputFormat::Ffmpeg);
        assert_eq!(OutputFormat::from_path(Path::new("out/run.mkv")), OutputFormat::Ffmpeg);
        assert_eq!(OutputFormat::from_path(Path::new("no_extension")), OutputFormat::Y4m);
    }

    #[cfg(not(feature = "output-ffmpeg"))]
    #[test]
    fn compressed_output_without_ffmpeg_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.mp4");
        assert!(matches!(create_encoder(&path), Err(PipelineError::Config(_))));
        assert!(!path.exists());
        assert!(create_encoder(&dir.path().join("out.y4m")).is_ok());
    }

    #[test]
    fn boxed_encoder_records_through_display() {
        let boxed: Box<dyn VideoEncoder> = Box::new(MemoryEncoder::new());
        let mut display = RecordingDisplay::new(boxed, 10.0);
        display.show(&annotated(0)).expect("show");
        display.show(&annotated(1)).expect("show");
        display.close().expect("close");
        assert_eq!(display.frames_recorded(), 2);
    }

    #[test]
    fn memory_encoder_enforces_lifecycle() {
        let mut encoder = MemoryEncoder::new().with_failure_after(1);
        assert!(encoder.write_frame(&annotated(0)).is_err());
        encoder.open(&VideoMetadata::default()).expect("open");
        encoder.write_frame(&annotated(0)).expect("first write");
        assert!(matches!(
            encoder.write_frame(&annotated(1)),
            Err(PipelineError::Encoding(_))
        ));
        encoder.finish().expect("finish");
        encoder.finish().expect("finish again");
        assert_eq!(encoder.frames_written(), 1);
    }
}

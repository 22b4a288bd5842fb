//! Finite clip source for batch mode.
//!
//! Backends:
//! - `stub://` synthetic clips (default 30 frames of 640x480 at 30 fps)
//! - `.y4m` files, decoded natively
//! - anything else through FFmpeg (feature `ingest-file-ffmpeg`)
//!
//! Only local paths are accepted; network URLs belong to `LiveSource`.

use std::path::Path;

use crate::error::PipelineError;
use crate::frame::Frame;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::ffmpeg::FfmpegSource;
use super::synthetic::{StubSpec, SyntheticClip};
use super::y4m::Y4mReader;
use super::{FrameSource, VideoMetadata};

pub struct FileSource {
    location: String,
    backend: FileBackend,
    connected: bool,
}

enum FileBackend {
    Synthetic(SyntheticClip),
    Y4m(Y4mReader),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegSource),
}

impl FileSource {
    pub fn open(location: &str) -> Result<Self, PipelineError> {
        if !is_local_file_path(location) {
            return Err(PipelineError::Source(format!(
                "file mode only supports local paths and stub:// clips, got '{}'",
                location
            )));
        }
        let backend = if location.starts_with("stub://") {
            FileBackend::Synthetic(SyntheticClip::new(StubSpec::parse(
                location,
                stub_defaults(),
            )?))
        } else if has_extension(location, "y4m") {
            FileBackend::Y4m(Y4mReader::open(Path::new(location))?)
        } else {
            open_ffmpeg(location)?
        };
        Ok(Self {
            location: location.to_string(),
            backend,
            connected: false,
        })
    }

    /// Frames returned so far.
    pub fn frames_read(&self) -> u64 {
        match &self.backend {
            FileBackend::Synthetic(clip) => clip.produced(),
            FileBackend::Y4m(reader) => reader.frames_read(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.frames_read(),
        }
    }
}

impl FrameSource for FileSource {
    fn connect(&mut self) -> Result<(), PipelineError> {
        let kind = match &self.backend {
            FileBackend::Synthetic(_) => "synthetic",
            FileBackend::Y4m(_) => "y4m",
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(_) => "ffmpeg",
        };
        self.connected = true;
        log::info!("FileSource: opened {} ({})", self.location, kind);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        if !self.connected {
            return Err(PipelineError::Source(format!(
                "{} read before connect",
                self.location
            )));
        }
        match &mut self.backend {
            FileBackend::Synthetic(clip) => clip.next_frame(),
            FileBackend::Y4m(reader) => reader.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
        }
    }

    fn metadata(&self) -> VideoMetadata {
        match &self.backend {
            FileBackend::Synthetic(clip) => clip.metadata(false),
            FileBackend::Y4m(reader) => reader.metadata(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.metadata(),
        }
    }

    fn describe(&self) -> String {
        self.location.clone()
    }
}

impl Drop for FileSource {
    fn drop(&mut self) {
        if self.connected {
            log::debug!(
                "FileSource: closed {} after {} frames",
                self.location,
                self.frames_read()
            );
        }
    }
}

fn stub_defaults() -> StubSpec {
    StubSpec {
        name: "clip".to_string(),
        frames: Some(30),
        width: 640,
        height: 480,
        fps: 30.0,
        count_known: true,
        fail_at: None,
    }
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_ffmpeg(location: &str) -> Result<FileBackend, PipelineError> {
    Ok(FileBackend::Ffmpeg(FfmpegSource::open(location)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_ffmpeg(location: &str) -> Result<FileBackend, PipelineError> {
    Err(PipelineError::Source(format!(
        "cannot decode '{}': only .y4m and stub:// clips are supported without the ingest-file-ffmpeg feature",
        location
    )))
}

fn has_extension(location: &str, ext: &str) -> bool {
    Path::new(location)
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

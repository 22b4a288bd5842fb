use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::frame::AnnotatedFrame;
use crate::ingest::color::{rgb_to_yuv444, ChromaLayout, ColorRange};
use crate::ingest::y4m::{rate_to_ratio, Y4mHeader};
use crate::ingest::VideoMetadata;

use super::VideoEncoder;

/// YUV4MPEG2 writer (4:4:4, full range) at the source frame rate.
///
/// Each frame is self-delimited, so a file finished after a cancelled or
/// failed job is a valid, shorter clip. The file is only created by `open`;
/// a job that fails before its first frame leaves nothing on disk.
pub struct Y4mEncoder {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    header: Option<Y4mHeader>,
    planes: Vec<u8>,
    frames_written: u64,
    finished: bool,
}

impl Y4mEncoder {
    /// Target `path`; an existing file there is truncated on `open`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() || path.is_dir() {
            return Err(PipelineError::Encoding(format!(
                "{} is not a file path",
                path.display()
            )));
        }
        Ok(Self {
            path,
            writer: None,
            header: None,
            planes: Vec::new(),
            frames_written: 0,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, PipelineError> {
        self.writer
            .as_mut()
            .ok_or_else(|| PipelineError::Encoding(format!("{} is not open", self.path.display())))
    }
}

impl VideoEncoder for Y4mEncoder {
    fn open(&mut self, metadata: &VideoMetadata) -> Result<(), PipelineError> {
        if self.header.is_some() {
            return Err(PipelineError::Encoding("encoder opened twice".into()));
        }
        if self.finished {
            return Err(PipelineError::Encoding(format!(
                "{} is already finished",
                self.path.display()
            )));
        }
        let fps = metadata
            .fps
            .filter(|f| *f > 0.0)
            .ok_or_else(|| PipelineError::Encoding("output frame rate is unknown".into()))?;
        let (fps_num, fps_den) = rate_to_ratio(fps);
        let header = Y4mHeader {
            width: metadata.width,
            height: metadata.height,
            fps_num,
            fps_den,
            layout: ChromaLayout::Yuv444,
            range: ColorRange::Full,
        };
        let line = header.to_line();
        let file = File::create(&self.path).map_err(|e| {
            PipelineError::Encoding(format!("failed to create {}: {}", self.path.display(), e))
        })?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(line.as_bytes())
            .map_err(PipelineError::encoding)?;
        self.writer = Some(writer);
        log::debug!("Y4mEncoder: {} <- {}", self.path.display(), line.trim_end());
        self.header = Some(header);
        Ok(())
    }

    fn write_frame(&mut self, frame: &AnnotatedFrame) -> Result<(), PipelineError> {
        let (width, height) = match &self.header {
            Some(h) => (h.width, h.height),
            None => return Err(PipelineError::Encoding("write before open".into())),
        };
        if frame.width() != width || frame.height() != height {
            return Err(PipelineError::Encoding(format!(
                "frame {} is {}x{}, container is {}x{}",
                frame.sequence(),
                frame.width(),
                frame.height(),
                width,
                height
            )));
        }
        let mut planes = std::mem::take(&mut self.planes);
        rgb_to_yuv444(frame.frame.pixels(), frame.frame.layout.rgb_offsets(), &mut planes);
        let result = self.writer().and_then(|w| {
            w.write_all(b"FRAME\n")
                .and_then(|_| w.write_all(&planes))
                .map_err(PipelineError::encoding)
        });
        self.planes = planes;
        result?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let Some(writer) = self.writer.take() else {
            log::debug!("Y4mEncoder: {} was never opened", self.path.display());
            return Ok(());
        };
        let file = writer
            .into_inner()
            .map_err(|e| PipelineError::Encoding(format!("flush {}: {}", self.path.display(), e.error())))?;
        file.sync_all().map_err(PipelineError::encoding)?;
        log::info!(
            "Y4mEncoder: finalised {} ({} frames)",
            self.path.display(),
            self.frames_written
        );
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Drop for Y4mEncoder {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                log::warn!("Y4mEncoder: finalising {} on drop failed: {}", self.path.display(), e);
            }
        }
    }
}

//! FFmpeg-backed encoder for `.mp4`/`.mkv` outputs (MPEG-4 Part 2, YUV 4:2:0).
//!
//! Frames are converted from RGB24/BGR24 through a swscale context, stamped
//! with consecutive pts at the source rate, and every packet the encoder
//! produces is written before the next frame is sent. `finish` flushes the
//! encoder and writes the trailer, so a cancelled job still leaves a
//! playable file.

use std::path::{Path, PathBuf};

use ffmpeg_next as ffmpeg;

use crate::error::PipelineError;
use crate::frame::{AnnotatedFrame, PixelLayout};
use crate::ingest::y4m::rate_to_ratio;
use crate::ingest::VideoMetadata;

use super::VideoEncoder;

/// Target bits per pixel per frame; mpeg4's default bitrate is far too low
/// for dashcam resolutions.
const BITS_PER_PIXEL: f64 = 0.2;

struct Session {
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    width: u32,
    height: u32,
    scaler: Option<(PixelLayout, ffmpeg::software::scaling::context::Context)>,
    packet: ffmpeg::Packet,
}

pub struct FfmpegEncoder {
    path: PathBuf,
    session: Option<Session>,
    next_pts: i64,
    frames_written: u64,
    finished: bool,
}

impl FfmpegEncoder {
    /// Target `path`; the container format follows its extension. Nothing is
    /// written until `open`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() || path.is_dir() {
            return Err(PipelineError::Encoding(format!(
                "{} is not a file path",
                path.display()
            )));
        }
        ffmpeg::init().map_err(|e| ffmpeg_error("initialize ffmpeg", e))?;
        Ok(Self {
            path,
            session: None,
            next_pts: 0,
            frames_written: 0,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn start(&self, metadata: &VideoMetadata, fps: f64) -> Result<Session, PipelineError> {
        let mut output = ffmpeg::format::output(&self.path)
            .map_err(|e| ffmpeg_error(&format!("create {}", self.path.display()), e))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| PipelineError::Encoding("ffmpeg: mpeg4 encoder unavailable".into()))?;
        let mut stream = output
            .add_stream(codec)
            .map_err(|e| ffmpeg_error("add video stream", e))?;
        let stream_index = stream.index();

        let (fps_num, fps_den) = rate_to_ratio(fps);
        let rate = ffmpeg::Rational::new(fps_num as i32, fps_den as i32);
        let encoder_time_base = rate.invert();

        let mut context = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| ffmpeg_error("create video encoder", e))?;
        context.set_width(metadata.width);
        context.set_height(metadata.height);
        context.set_format(ffmpeg::format::Pixel::YUV420P);
        context.set_time_base(encoder_time_base);
        context.set_frame_rate(Some(rate));
        let bit_rate = metadata.width as f64 * metadata.height as f64 * fps * BITS_PER_PIXEL;
        context.set_bit_rate(bit_rate as usize);
        if global_header {
            context.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = context
            .open_as(codec)
            .map_err(|e| ffmpeg_error("open mpeg4 encoder", e))?;
        stream.set_parameters(&encoder);
        stream.set_time_base(encoder_time_base);

        output
            .write_header()
            .map_err(|e| ffmpeg_error("write container header", e))?;
        // The muxer may pick its own stream time base while writing the header.
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| PipelineError::Encoding("ffmpeg: output stream vanished".into()))?;

        Ok(Session {
            output,
            encoder,
            stream_index,
            encoder_time_base,
            stream_time_base,
            width: metadata.width,
            height: metadata.height,
            scaler: None,
            packet: ffmpeg::Packet::empty(),
        })
    }
}

impl Session {
    fn scaler(
        &mut self,
        layout: PixelLayout,
    ) -> Result<&mut ffmpeg::software::scaling::context::Context, PipelineError> {
        if self.scaler.as_ref().map(|(l, _)| *l) != Some(layout) {
            let format = match layout {
                PixelLayout::Rgb24 => ffmpeg::format::Pixel::RGB24,
                PixelLayout::Bgr24 => ffmpeg::format::Pixel::BGR24,
            };
            let context = ffmpeg::software::scaling::context::Context::get(
                format,
                self.width,
                self.height,
                ffmpeg::format::Pixel::YUV420P,
                self.width,
                self.height,
                ffmpeg::software::scaling::flag::Flags::BILINEAR,
            )
            .map_err(|e| ffmpeg_error("create scaler", e))?;
            self.scaler = Some((layout, context));
        }
        self.scaler
            .as_mut()
            .map(|(_, context)| context)
            .ok_or_else(|| PipelineError::Encoding("ffmpeg: scaler unavailable".into()))
    }

    /// Write every packet the encoder has ready.
    fn drain(&mut self) -> Result<(), PipelineError> {
        while self.encoder.receive_packet(&mut self.packet).is_ok() {
            self.packet.set_stream(self.stream_index);
            self.packet
                .rescale_ts(self.encoder_time_base, self.stream_time_base);
            self.packet
                .write_interleaved(&mut self.output)
                .map_err(|e| ffmpeg_error("write packet", e))?;
        }
        Ok(())
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn open(&mut self, metadata: &VideoMetadata) -> Result<(), PipelineError> {
        if self.session.is_some() {
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
            .filter(|f| *f > 0.0 && f.is_finite())
            .ok_or_else(|| PipelineError::Encoding("output frame rate is unknown".into()))?;
        // 4:2:0 needs even dimensions.
        if metadata.width % 2 != 0 || metadata.height % 2 != 0 {
            return Err(PipelineError::Encoding(format!(
                "mpeg4 output needs even dimensions, got {}x{}",
                metadata.width, metadata.height
            )));
        }
        let session = self.start(metadata, fps)?;
        log::debug!(
            "FfmpegEncoder: {} <- mpeg4 {}x{} @ {:.2} fps",
            self.path.display(),
            metadata.width,
            metadata.height,
            fps
        );
        self.session = Some(session);
        Ok(())
    }

    fn write_frame(&mut self, frame: &AnnotatedFrame) -> Result<(), PipelineError> {
        let Some(session) = self.session.as_mut() else {
            return Err(PipelineError::Encoding(format!(
                "{} is not open",
                self.path.display()
            )));
        };
        if frame.width() != session.width || frame.height() != session.height {
            return Err(PipelineError::Encoding(format!(
                "frame {} is {}x{}, container is {}x{}",
                frame.sequence(),
                frame.width(),
                frame.height(),
                session.width,
                session.height
            )));
        }

        let layout = frame.frame.layout;
        let format = match layout {
            PixelLayout::Rgb24 => ffmpeg::format::Pixel::RGB24,
            PixelLayout::Bgr24 => ffmpeg::format::Pixel::BGR24,
        };
        let mut packed = ffmpeg::frame::Video::new(format, session.width, session.height);
        copy_rows(frame.frame.pixels(), &mut packed, session.width as usize * 3)?;

        let mut yuv = ffmpeg::frame::Video::empty();
        session
            .scaler(layout)?
            .run(&packed, &mut yuv)
            .map_err(|e| ffmpeg_error("scale frame to YUV", e))?;
        yuv.set_pts(Some(self.next_pts));
        session
            .encoder
            .send_frame(&yuv)
            .map_err(|e| ffmpeg_error("encode frame", e))?;
        session.drain()?;

        self.next_pts += 1;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let Some(mut session) = self.session.take() else {
            log::debug!("FfmpegEncoder: {} was never opened", self.path.display());
            return Ok(());
        };
        session
            .encoder
            .send_eof()
            .map_err(|e| ffmpeg_error("flush encoder", e))?;
        session.drain()?;
        session
            .output
            .write_trailer()
            .map_err(|e| ffmpeg_error("write container trailer", e))?;
        log::info!(
            "FfmpegEncoder: finalised {} ({} frames)",
            self.path.display(),
            self.frames_written
        );
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                log::warn!(
                    "FfmpegEncoder: finalising {} on drop failed: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

fn ffmpeg_error(context: &str, err: ffmpeg::Error) -> PipelineError {
    PipelineError::Encoding(format!("ffmpeg: {}: {}", context, err))
}

/// Copy tightly packed rows into a frame whose rows may be padded.
fn copy_rows(
    pixels: &[u8],
    frame: &mut ffmpeg::frame::Video,
    row_bytes: usize,
) -> Result<(), PipelineError> {
    let stride = frame.stride(0);
    let plane = frame.data_mut(0);
    for (row, line) in pixels.chunks_exact(row_bytes).enumerate() {
        let start = row * stride;
        let target = plane.get_mut(start..start + row_bytes).ok_or_else(|| {
            PipelineError::Encoding("ffmpeg frame row is out of bounds".into())
        })?;
        target.copy_from_slice(line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use std::time::Duration;
    use tempfile::tempdir;

    fn annotated(sequence: u64) -> AnnotatedFrame {
        AnnotatedFrame {
            frame: Frame::new(
                vec![(sequence * 20) as u8; 32 * 24 * 3],
                32,
                24,
                PixelLayout::Rgb24,
                sequence,
                Duration::ZERO,
            )
            .expect("frame"),
            boxes_drawn: 0,
        }
    }

    fn meta() -> VideoMetadata {
        VideoMetadata {
            width: 32,
            height: 24,
            fps: Some(25.0),
            frame_count: Some(6),
        }
    }

    #[test]
    fn mp4_written_then_finished_holds_every_frame() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.mp4");
        let mut encoder = FfmpegEncoder::create(&path).expect("create");
        encoder.open(&meta()).expect("open");
        for i in 0..6 {
            encoder.write_frame(&annotated(i)).expect("write");
        }
        encoder.finish().expect("finish");
        encoder.finish().expect("finish is idempotent");
        assert_eq!(encoder.frames_written(), 6);
        assert!(std::fs::metadata(&path).expect("output").len() > 0);

        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            use crate::ingest::{FileSource, FrameSource};
            let mut source =
                FileSource::open(path.to_str().expect("utf8 path")).expect("reopen");
            source.connect().expect("connect");
            let mut frames = 0;
            while let Some(frame) = source.next_frame().expect("frame") {
                assert_eq!((frame.width, frame.height), (32, 24));
                frames += 1;
            }
            assert_eq!(frames, 6);
        }
    }

    #[test]
    fn unopened_encoder_leaves_no_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("never.mkv");
        let mut encoder = FfmpegEncoder::create(&path).expect("create");
        assert!(encoder.write_frame(&annotated(0)).is_err());
        assert!(encoder
            .open(&VideoMetadata {
                width: 31,
                ..meta()
            })
            .is_err());
        encoder.finish().expect("finish");
        assert!(!path.exists());
    }
}

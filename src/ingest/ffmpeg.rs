//! FFmpeg-backed decoder shared by file and live sources.
//!
//! Decoded frames are converted to RGB24 through a swscale context. Pending
//! decoder output is drained before the next packet is read, and the decoder
//! is flushed at end of input so trailing frames are not lost.

use std::time::Duration;

use ffmpeg_next as ffmpeg;

use crate::error::PipelineError;
use crate::frame::{Frame, PixelLayout};

use super::synthetic::frame_timestamp;
use super::VideoMetadata;

pub(crate) struct FfmpegSource {
    location: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    time_base: f64,
    metadata: VideoMetadata,
    decoded: ffmpeg::frame::Video,
    rgb: ffmpeg::frame::Video,
    next_sequence: u64,
    eof_sent: bool,
}

impl FfmpegSource {
    pub(crate) fn open(location: &str) -> Result<Self, PipelineError> {
        ffmpeg::init().map_err(|e| ffmpeg_error("initialize ffmpeg", e))?;
        let input = ffmpeg::format::input(&location)
            .map_err(|e| ffmpeg_error(&format!("open '{}'", location), e))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| PipelineError::Source(format!("'{}' has no video track", location)))?;
        let stream_index = stream.index();
        let time_base = f64::from(stream.time_base());
        let avg_rate = stream.avg_frame_rate();
        let fps = (avg_rate.numerator() > 0 && avg_rate.denominator() > 0)
            .then(|| f64::from(avg_rate));
        let frame_count = u64::try_from(stream.frames()).ok().filter(|n| *n > 0);

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| ffmpeg_error("load video decoder parameters", e))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| ffmpeg_error("open video decoder", e))?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| ffmpeg_error("create scaler", e))?;

        let metadata = VideoMetadata {
            width: decoder.width(),
            height: decoder.height(),
            fps,
            frame_count,
        };
        Ok(Self {
            location: location.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            time_base,
            metadata,
            decoded: ffmpeg::frame::Video::empty(),
            rgb: ffmpeg::frame::Video::empty(),
            next_sequence: 0,
            eof_sent: false,
        })
    }

    pub(crate) fn metadata(&self) -> VideoMetadata {
        self.metadata
    }

    pub(crate) fn frames_read(&self) -> u64 {
        self.next_sequence
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return self.convert().map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let wanted = self.stream_index;
            let mut packets = self.input.packets();
            let packet = loop {
                match packets.next() {
                    Some((stream, packet)) if stream.index() == wanted => break Some(packet),
                    Some(_) => continue,
                    None => break None,
                }
            };
            match packet {
                Some(packet) => self
                    .decoder
                    .send_packet(&packet)
                    .map_err(|e| ffmpeg_error(&format!("decode '{}'", self.location), e))?,
                None => {
                    self.decoder
                        .send_eof()
                        .map_err(|e| ffmpeg_error("flush decoder", e))?;
                    self.eof_sent = true;
                }
            }
        }
    }

    fn convert(&mut self) -> Result<Frame, PipelineError> {
        self.scaler
            .run(&self.decoded, &mut self.rgb)
            .map_err(|e| ffmpeg_error("scale frame to RGB", e))?;
        let (pixels, width, height) = frame_to_pixels(&self.rgb)?;

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let timestamp = match (self.decoded.timestamp(), self.metadata.fps) {
            (Some(pts), _) if pts >= 0 && self.time_base > 0.0 => {
                Duration::from_secs_f64(pts as f64 * self.time_base)
            }
            (_, Some(fps)) => frame_timestamp(sequence, fps),
            _ => Duration::ZERO,
        };
        Frame::new(pixels, width, height, PixelLayout::Rgb24, sequence, timestamp)
    }
}

fn ffmpeg_error(context: &str, err: ffmpeg::Error) -> PipelineError {
    PipelineError::Source(format!("ffmpeg: {}: {}", context, err))
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32), PipelineError> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let plane = data.get(..row_bytes * height as usize).ok_or_else(|| {
            PipelineError::Source("ffmpeg frame plane is shorter than its dimensions".into())
        })?;
        return Ok((plane.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let line = data.get(start..start + row_bytes).ok_or_else(|| {
            PipelineError::Source("ffmpeg frame row is out of bounds".into())
        })?;
        pixels.extend_from_slice(line);
    }
    Ok((pixels, width, height))
}

//! YUV4MPEG2 container: header codec and frame reader.
//!
//! Stream layout: one header line `YUV4MPEG2 W<w> H<h> F<n>:<d> ...\n`, then
//! per frame a `FRAME[ params]\n` line followed by the raw Y, U and V planes.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PipelineError;
use crate::frame::{Frame, PixelLayout};

use super::color::{yuv_to_rgb, ChromaLayout, ColorRange};
use super::VideoMetadata;

pub(crate) const MAGIC: &str = "YUV4MPEG2";
const FRAME_TAG: &[u8] = b"FRAME";
const MAX_LINE: usize = 1024;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Y4mHeader {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub layout: ChromaLayout,
    pub range: ColorRange,
}

impl Y4mHeader {
    pub(crate) fn parse(line: &str) -> Result<Self, PipelineError> {
        let mut tokens = line.trim_end().split(' ');
        if tokens.next() != Some(MAGIC) {
            return Err(PipelineError::Source("not a YUV4MPEG2 stream".into()));
        }
        let mut width = None;
        let mut height = None;
        let mut rate = None;
        // Absent C tag means 4:2:0 per the format's conventions.
        let mut layout = ChromaLayout::Yuv420;
        let mut range = ColorRange::Limited;

        for token in tokens.filter(|t| !t.is_empty()) {
            let mut chars = token.chars();
            let tag = chars.next();
            let value = chars.as_str();
            match tag {
                Some('W') => width = value.parse::<u32>().ok(),
                Some('H') => height = value.parse::<u32>().ok(),
                Some('F') => {
                    rate = value.split_once(':').and_then(|(n, d)| {
                        Some((n.parse::<u32>().ok()?, d.parse::<u32>().ok()?))
                    })
                }
                Some('C') => {
                    layout = match value {
                        "444" => ChromaLayout::Yuv444,
                        v if v.starts_with("420") => ChromaLayout::Yuv420,
                        other => {
                            return Err(PipelineError::Source(format!(
                                "unsupported y4m colourspace C{}",
                                other
                            )))
                        }
                    }
                }
                Some('X') if value == "COLORRANGE=FULL" => range = ColorRange::Full,
                _ => {}
            }
        }

        let width = width.filter(|w| *w > 0);
        let height = height.filter(|h| *h > 0);
        match (width, height) {
            (Some(width), Some(height)) => {
                let (fps_num, fps_den) = rate.unwrap_or((0, 0));
                Ok(Self {
                    width,
                    height,
                    fps_num,
                    fps_den,
                    layout,
                    range,
                })
            }
            _ => Err(PipelineError::Source(
                "y4m header is missing frame dimensions".into(),
            )),
        }
    }

    pub(crate) fn to_line(&self) -> String {
        let colour = match self.layout {
            ChromaLayout::Yuv444 => "444",
            ChromaLayout::Yuv420 => "420jpeg",
        };
        let range = match self.range {
            ColorRange::Full => "FULL",
            ColorRange::Limited => "LIMITED",
        };
        format!(
            "{} W{} H{} F{}:{} Ip A1:1 C{} XCOLORRANGE={}\n",
            MAGIC, self.width, self.height, self.fps_num, self.fps_den, colour, range
        )
    }

    pub(crate) fn fps(&self) -> Option<f64> {
        (self.fps_num > 0 && self.fps_den > 0).then(|| self.fps_num as f64 / self.fps_den as f64)
    }

    pub(crate) fn frame_len(&self) -> Result<usize, PipelineError> {
        self.layout
            .frame_len(self.width as usize, self.height as usize)
            .ok_or_else(|| PipelineError::Source("y4m frame size overflows".into()))
    }
}

/// Express a frame rate as the rational a y4m `F` tag needs.
pub(crate) fn rate_to_ratio(fps: f64) -> (u32, u32) {
    if !(fps > 0.0 && fps.is_finite()) {
        return (0, 0);
    }
    if (fps - fps.round()).abs() < 1e-3 {
        return (fps.round() as u32, 1);
    }
    let ntsc = fps * 1.001;
    if (ntsc - ntsc.round()).abs() < 1e-3 {
        return (ntsc.round() as u32 * 1000, 1001);
    }
    ((fps * 1000.0).round() as u32, 1000)
}

/// Native reader for `.y4m` files.
pub(crate) struct Y4mReader {
    path: PathBuf,
    reader: BufReader<File>,
    header: Y4mHeader,
    frame_count: Option<u64>,
    planes: Vec<u8>,
    next_sequence: u64,
    ended: bool,
}

impl Y4mReader {
    pub(crate) fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path)
            .map_err(|e| PipelineError::Source(format!("failed to open {}: {}", path.display(), e)))?;
        let file_len = file.metadata().map(|m| m.len()).map_err(PipelineError::source_failure)?;
        let mut reader = BufReader::new(file);

        let line = read_line(&mut reader)?
            .ok_or_else(|| PipelineError::Source(format!("{} is empty", path.display())))?;
        let header_len = line.len() as u64;
        let header = Y4mHeader::parse(&String::from_utf8_lossy(&line))?;

        // Exact only when every frame carries a bare FRAME tag.
        let per_frame = header
            .frame_len()?
            .checked_add(FRAME_TAG.len() + 1)
            .ok_or_else(|| PipelineError::Source("y4m frame size overflows".into()))?
            as u64;
        let payload = file_len.saturating_sub(header_len);
        let frame_count = (payload % per_frame == 0).then_some(payload / per_frame);

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            header,
            frame_count,
            planes: Vec::new(),
            next_sequence: 0,
            ended: false,
        })
    }

    pub(crate) fn metadata(&self) -> VideoMetadata {
        VideoMetadata {
            width: self.header.width,
            height: self.header.height,
            fps: self.header.fps(),
            frame_count: self.frame_count,
        }
    }

    pub(crate) fn frames_read(&self) -> u64 {
        self.next_sequence
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        if self.ended {
            return Ok(None);
        }
        let Some(tag) = read_line(&mut self.reader)? else {
            self.ended = true;
            return Ok(None);
        };
        if !tag.starts_with(FRAME_TAG) {
            return Err(PipelineError::Source(format!(
                "{}: expected FRAME marker before frame {}",
                self.path.display(),
                self.next_sequence
            )));
        }

        self.planes.resize(self.header.frame_len()?, 0);
        self.reader.read_exact(&mut self.planes).map_err(|e| {
            PipelineError::Source(format!(
                "{}: truncated frame {}: {}",
                self.path.display(),
                self.next_sequence,
                e
            ))
        })?;

        let rgb = yuv_to_rgb(
            &self.planes,
            self.header.width as usize,
            self.header.height as usize,
            self.header.layout,
            self.header.range,
        )?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let timestamp = match self.header.fps() {
            Some(fps) => super::synthetic::frame_timestamp(sequence, fps),
            None => Duration::ZERO,
        };
        Frame::new(
            rgb,
            self.header.width,
            self.header.height,
            PixelLayout::Rgb24,
            sequence,
            timestamp,
        )
        .map(Some)
    }
}

/// One `\n`-terminated line including the terminator; `None` at clean EOF.
fn read_line(reader: &mut BufReader<File>) -> Result<Option<Vec<u8>>, PipelineError> {
    let mut line = Vec::new();
    let read = reader
        .by_ref()
        .take(MAX_LINE as u64)
        .read_until(b'\n', &mut line)
        .map_err(PipelineError::source_failure)?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        return Err(PipelineError::Source(
            "y4m stream has an unterminated header line".into(),
        ));
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn header_round_trips() {
        let header = Y4mHeader {
            width: 640,
            height: 480,
            fps_num: 30000,
            fps_den: 1001,
            layout: ChromaLayout::Yuv444,
            range: ColorRange::Full,
        };
        let parsed = Y4mHeader::parse(&header.to_line()).expect("parse");
        assert_eq!(parsed, header);
        assert!((parsed.fps().expect("fps") - 29.97).abs() < 0.01);
    }

    #[test]
    fn header_defaults_to_420_limited() {
        let parsed = Y4mHeader::parse("YUV4MPEG2 W4 H2 F25:1 Ip\n").expect("parse");
        assert_eq!(parsed.layout, ChromaLayout::Yuv420);
        assert_eq!(parsed.range, ColorRange::Limited);
        assert_eq!(parsed.frame_len(), Ok(8 + 2 + 2));
        assert!(Y4mHeader::parse("YUV4MPEG2 H2 F25:1\n").is_err());
        assert!(Y4mHeader::parse("YUV4MPEG2 W4 H2 C422\n").is_err());
    }

    #[test]
    fn rate_ratios() {
        assert_eq!(rate_to_ratio(30.0), (30, 1));
        assert_eq!(rate_to_ratio(29.97), (30000, 1001));
        assert_eq!(rate_to_ratio(12.5), (12500, 1000));
        assert_eq!(rate_to_ratio(0.0), (0, 0));
    }

    fn write_clip(frames: usize, trailing: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(b"YUV4MPEG2 W2 H2 F10:1 C420jpeg XCOLORRANGE=FULL\n")
            .expect("header");
        for i in 0..frames {
            file.write_all(b"FRAME\n").expect("tag");
            file.write_all(&[i as u8 * 10; 4]).expect("luma");
            file.write_all(&[128, 128]).expect("chroma");
        }
        file.write_all(trailing).expect("trailing");
        file.flush().expect("flush");
        file
    }

    #[test]
    fn reads_frames_and_counts_from_length() {
        let file = write_clip(3, b"");
        let mut reader = Y4mReader::open(file.path()).expect("open");
        let meta = reader.metadata();
        assert_eq!(meta.frame_count, Some(3));
        assert_eq!(meta.fps, Some(10.0));

        let mut grey = Vec::new();
        while let Some(frame) = reader.next_frame().expect("frame") {
            assert_eq!((frame.width, frame.height), (2, 2));
            grey.push(frame.pixels()[0]);
        }
        assert_eq!(grey, vec![0, 10, 20]);
        assert_eq!(reader.frames_read(), 3);
    }

    #[test]
    fn oversized_header_is_a_source_error() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(b"YUV4MPEG2 W4294967295 H4294967295 F30:1 C444\nFRAME\n")
            .expect("header");
        file.flush().expect("flush");
        match Y4mReader::open(file.path()) {
            Err(PipelineError::Source(msg)) => assert!(msg.contains("overflows"), "{}", msg),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("oversized header accepted"),
        }
    }

    #[test]
    fn partial_trailing_frame_hides_count_and_fails_on_read() {
        let file = write_clip(2, b"FRAME\n\x01\x02");
        let mut reader = Y4mReader::open(file.path()).expect("open");
        assert_eq!(reader.metadata().frame_count, None);
        assert!(reader.next_frame().expect("frame 0").is_some());
        assert!(reader.next_frame().expect("frame 1").is_some());
        assert!(matches!(reader.next_frame(), Err(PipelineError::Source(_))));
    }
}

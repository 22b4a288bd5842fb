use std::time::Duration;

use crate::error::PipelineError;
use crate::frame::{Frame, PixelLayout};

use super::VideoMetadata;

/// Parsed `stub://name?key=value&...` URL.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct StubSpec {
    pub name: String,
    /// `None` runs forever (live cameras).
    pub frames: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// `count=unknown` hides the frame count from metadata.
    pub count_known: bool,
    /// Fail with a source error instead of producing this sequence number.
    pub fail_at: Option<u64>,
}

impl StubSpec {
    pub(crate) fn parse(url: &str, defaults: StubSpec) -> Result<Self, PipelineError> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| PipelineError::Source(format!("not a stub url: {}", url)))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut spec = StubSpec {
            name: if name.is_empty() {
                defaults.name.clone()
            } else {
                name.to_string()
            },
            ..defaults
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| bad_param(url, pair))?;
            match key {
                "frames" => spec.frames = Some(parse_num(url, pair, value)?),
                "width" => spec.width = parse_num(url, pair, value)?,
                "height" => spec.height = parse_num(url, pair, value)?,
                "fps" => spec.fps = parse_num(url, pair, value)?,
                "count" if value == "unknown" => spec.count_known = false,
                "fail_at" => spec.fail_at = Some(parse_num(url, pair, value)?),
                _ => return Err(bad_param(url, pair)),
            }
        }

        if spec.width == 0 || spec.height == 0 {
            return Err(PipelineError::Source(format!(
                "{}: width and height must be non-zero",
                url
            )));
        }
        if !(spec.fps > 0.0 && spec.fps.is_finite()) {
            return Err(PipelineError::Source(format!("{}: fps must be positive", url)));
        }
        Ok(spec)
    }
}

fn parse_num<T: std::str::FromStr>(url: &str, pair: &str, value: &str) -> Result<T, PipelineError> {
    value.parse().map_err(|_| bad_param(url, pair))
}

fn bad_param(url: &str, pair: &str) -> PipelineError {
    PipelineError::Source(format!("{}: bad stub parameter '{}'", url, pair))
}

/// Deterministic frame generator behind every `stub://` source.
pub(crate) struct SyntheticClip {
    spec: StubSpec,
    next_sequence: u64,
}

impl SyntheticClip {
    pub(crate) fn new(spec: StubSpec) -> Self {
        Self {
            spec,
            next_sequence: 0,
        }
    }

    pub(crate) fn spec(&self) -> &StubSpec {
        &self.spec
    }

    pub(crate) fn produced(&self) -> u64 {
        self.next_sequence
    }

    pub(crate) fn metadata(&self, live: bool) -> VideoMetadata {
        VideoMetadata {
            width: self.spec.width,
            height: self.spec.height,
            fps: Some(self.spec.fps),
            frame_count: if live || !self.spec.count_known {
                None
            } else {
                self.spec.frames
            },
        }
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        let sequence = self.next_sequence;
        if self.spec.frames.is_some_and(|total| sequence >= total) {
            return Ok(None);
        }
        if self.spec.fail_at == Some(sequence) {
            return Err(PipelineError::Source(format!(
                "stub://{}: simulated read failure at frame {}",
                self.spec.name, sequence
            )));
        }
        self.next_sequence += 1;

        let timestamp = frame_timestamp(sequence, self.spec.fps);
        let frame = Frame::new(
            self.render(sequence),
            self.spec.width,
            self.spec.height,
            PixelLayout::Rgb24,
            sequence,
            timestamp,
        )?;
        Ok(Some(frame))
    }

    /// Asphalt-grey gradient with a band that drifts one step per frame.
    fn render(&self, sequence: u64) -> Vec<u8> {
        let (w, h) = (self.spec.width as usize, self.spec.height as usize);
        let band = (sequence as usize * 4) % w.max(1);
        let mut pixels = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            let shade = 70 + (y * 60 / h.max(1)) as u8;
            for x in 0..w {
                if x.abs_diff(band) < 3 {
                    pixels.extend_from_slice(&[20, 20, 20]);
                } else {
                    pixels.extend_from_slice(&[shade, shade, shade.saturating_add(6)]);
                }
            }
        }
        pixels
    }
}

/// Presentation time of frame `sequence` at a constant rate.
pub(crate) fn frame_timestamp(sequence: u64, fps: f64) -> Duration {
    Duration::from_nanos((sequence as f64 * 1e9 / fps).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> StubSpec {
        StubSpec {
            name: "clip".into(),
            frames: Some(30),
            width: 640,
            height: 480,
            fps: 30.0,
            count_known: true,
            fail_at: None,
        }
    }

    #[test]
    fn parses_query_overrides() {
        let spec = StubSpec::parse("stub://road?frames=10&width=32&height=16&fps=25", defaults())
            .expect("parse");
        assert_eq!(spec.name, "road");
        assert_eq!(spec.frames, Some(10));
        assert_eq!((spec.width, spec.height), (32, 16));
        assert_eq!(spec.fps, 25.0);
    }

    #[test]
    fn rejects_unknown_and_invalid_params() {
        assert!(StubSpec::parse("stub://x?colour=red", defaults()).is_err());
        assert!(StubSpec::parse("stub://x?width=0", defaults()).is_err());
        assert!(StubSpec::parse("stub://x?fps=-1", defaults()).is_err());
        assert!(StubSpec::parse("rtsp://x", defaults()).is_err());
    }

    #[test]
    fn clip_produces_ordered_frames_then_ends() {
        let spec = StubSpec::parse("stub://x?frames=3&width=8&height=4&fps=10", defaults())
            .expect("parse");
        let mut clip = SyntheticClip::new(spec);
        let mut seen = Vec::new();
        while let Some(frame) = clip.next_frame().expect("frame") {
            assert_eq!(frame.byte_len(), 8 * 4 * 3);
            seen.push((frame.sequence, frame.timestamp));
        }
        assert_eq!(
            seen,
            vec![
                (0, Duration::ZERO),
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200)),
            ]
        );
        assert_eq!(clip.metadata(false).frame_count, Some(3));
        assert_eq!(clip.metadata(true).frame_count, None);
    }

    #[test]
    fn fail_at_surfaces_source_error() {
        let spec = StubSpec::parse("stub://x?frames=5&width=2&height=2&fail_at=1", defaults())
            .expect("parse");
        let mut clip = SyntheticClip::new(spec);
        assert!(clip.next_frame().expect("first").is_some());
        assert!(matches!(clip.next_frame(), Err(PipelineError::Source(_))));
    }
}

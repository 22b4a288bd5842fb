//! Live stream source.
//!
//! `stub://` URLs synthesise a camera paced at the configured frame rate.
//! Other URLs (rtsp://, http://, device paths) are decoded with FFmpeg when
//! built with `ingest-live-ffmpeg`.
//!
//! A live source has no frame count. Returning `None` means the stream ended,
//! which the stream pipeline treats as a failure.

use std::time::{Duration, Instant};

use crate::config::LiveSettings;
use crate::error::PipelineError;
use crate::frame::Frame;

#[cfg(feature = "ingest-live-ffmpeg")]
use super::ffmpeg::FfmpegSource;
use super::synthetic::{StubSpec, SyntheticClip};
use super::{FrameSource, VideoMetadata};

#[derive(Clone, Debug)]
pub struct LiveConfig {
    pub url: String,
    /// Capture rate for synthetic cameras.
    pub target_fps: u32,
    /// Frame width for synthetic cameras.
    pub width: u32,
    /// Frame height for synthetic cameras.
    pub height: u32,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            target_fps: 30,
            width: 1280,
            height: 720,
        }
    }
}

impl From<&LiveSettings> for LiveConfig {
    fn from(settings: &LiveSettings) -> Self {
        Self {
            url: settings.url.clone(),
            target_fps: settings.target_fps,
            width: settings.width,
            height: settings.height,
        }
    }
}

pub struct LiveSource {
    config: LiveConfig,
    backend: LiveBackend,
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

enum LiveBackend {
    Synthetic(SyntheticClip),
    #[cfg(feature = "ingest-live-ffmpeg")]
    Ffmpeg(Option<FfmpegSource>),
}

impl LiveSource {
    pub fn new(config: LiveConfig) -> Result<Self, PipelineError> {
        let backend = if config.url.starts_with("stub://") {
            let defaults = StubSpec {
                name: "camera".to_string(),
                frames: None,
                width: config.width,
                height: config.height,
                fps: config.target_fps.max(1) as f64,
                count_known: false,
                fail_at: None,
            };
            LiveBackend::Synthetic(SyntheticClip::new(StubSpec::parse(&config.url, defaults)?))
        } else {
            network_backend(&config.url)?
        };
        Ok(Self {
            config,
            backend,
            connected_at: None,
            last_frame_at: None,
            last_error: None,
        })
    }

    /// Frames are considered stale after six frame intervals, with a 2 s floor.
    fn health_grace(&self) -> Duration {
        let fps = self.config.target_fps.max(1);
        Duration::from_millis(((1000 / fps) * 6).max(2_000) as u64)
    }

    fn record(&mut self, result: Result<Option<Frame>, PipelineError>) -> Result<Option<Frame>, PipelineError> {
        match &result {
            Ok(Some(_)) => self.last_frame_at = Some(Instant::now()),
            Ok(None) => self.last_error = Some("stream ended".to_string()),
            Err(e) => self.last_error = Some(e.to_string()),
        }
        result
    }
}

impl FrameSource for LiveSource {
    fn connect(&mut self) -> Result<(), PipelineError> {
        match &mut self.backend {
            LiveBackend::Synthetic(_) => {
                log::info!("LiveSource: connected to {} (synthetic)", self.config.url);
            }
            #[cfg(feature = "ingest-live-ffmpeg")]
            LiveBackend::Ffmpeg(slot) => {
                if slot.is_none() {
                    *slot = Some(FfmpegSource::open(&self.config.url)?);
                }
                log::info!("LiveSource: connected to {} (ffmpeg)", self.config.url);
            }
        }
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        let Some(connected_at) = self.connected_at else {
            return Err(PipelineError::Source(format!(
                "{} read before connect",
                self.config.url
            )));
        };
        let result = match &mut self.backend {
            LiveBackend::Synthetic(clip) => {
                // Pace synthetic capture at the clip's own rate.
                let due = connected_at
                    + Duration::from_secs_f64(clip.produced() as f64 / clip.spec().fps);
                let now = Instant::now();
                if due > now {
                    std::thread::sleep(due - now);
                }
                clip.next_frame()
            }
            #[cfg(feature = "ingest-live-ffmpeg")]
            LiveBackend::Ffmpeg(Some(source)) => source.next_frame(),
            #[cfg(feature = "ingest-live-ffmpeg")]
            LiveBackend::Ffmpeg(None) => Err(PipelineError::Source("stream not open".into())),
        };
        self.record(result)
    }

    fn metadata(&self) -> VideoMetadata {
        match &self.backend {
            LiveBackend::Synthetic(clip) => clip.metadata(true),
            #[cfg(feature = "ingest-live-ffmpeg")]
            LiveBackend::Ffmpeg(Some(source)) => VideoMetadata {
                frame_count: None,
                ..source.metadata()
            },
            #[cfg(feature = "ingest-live-ffmpeg")]
            LiveBackend::Ffmpeg(None) => VideoMetadata {
                width: self.config.width,
                height: self.config.height,
                fps: None,
                frame_count: None,
            },
        }
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        match self.last_frame_at {
            Some(at) => at.elapsed() <= self.health_grace(),
            None => connected_at.elapsed() <= Duration::from_secs(5),
        }
    }
}

impl Drop for LiveSource {
    fn drop(&mut self) {
        if self.connected_at.is_some() {
            log::info!("LiveSource: disconnected from {}", self.config.url);
        }
    }
}

#[cfg(feature = "ingest-live-ffmpeg")]
fn network_backend(_url: &str) -> Result<LiveBackend, PipelineError> {
    Ok(LiveBackend::Ffmpeg(None))
}

#[cfg(not(feature = "ingest-live-ffmpeg"))]
fn network_backend(url: &str) -> Result<LiveBackend, PipelineError> {
    Err(PipelineError::Source(format!(
        "live stream '{}' requires the ingest-live-ffmpeg feature",
        url
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(url: &str) -> LiveSource {
        LiveSource::new(LiveConfig {
            url: url.to_string(),
            target_fps: 100,
            width: 8,
            height: 6,
        })
        .expect("stub source")
    }

    #[test]
    fn synthetic_camera_has_no_frame_count() {
        let source = stub("stub://cam");
        let meta = source.metadata();
        assert_eq!((meta.width, meta.height), (8, 6));
        assert_eq!(meta.frame_count, None);
        assert_eq!(meta.fps, Some(100.0));
    }

    #[test]
    fn synthetic_camera_is_paced() {
        let mut source = stub("stub://cam?fps=50");
        source.connect().expect("connect");
        let started = Instant::now();
        for _ in 0..4 {
            assert!(source.next_frame().expect("frame").is_some());
        }
        // Frames 0..3 are due at 0, 20, 40 and 60 ms.
        assert!(started.elapsed() >= Duration::from_millis(55));
        assert!(source.is_healthy());
    }

    #[test]
    fn ended_stream_is_unhealthy() {
        let mut source = stub("stub://cam?frames=1&fps=1000");
        source.connect().expect("connect");
        assert!(source.next_frame().expect("frame").is_some());
        assert!(source.next_frame().expect("end").is_none());
        assert!(!source.is_healthy());
    }

    #[cfg(not(feature = "ingest-live-ffmpeg"))]
    #[test]
    fn network_url_requires_ffmpeg_feature() {
        assert!(LiveSource::new(LiveConfig {
            url: "rtsp://10.0.0.2/stream".into(),
            ..LiveConfig::default()
        })
        .is_err());
    }
}

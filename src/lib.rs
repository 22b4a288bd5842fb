//! Road Guard
//!
//! Road-damage detection over recorded video files and live camera streams.
//!
//! # Architecture
//!
//! Both job kinds share one per-frame contract and differ only in scheduling:
//!
//! 1. **Ingest**: a `FrameSource` yields decoded frames with a sequence number
//!    and timestamp (`stub://` synthetic clips, Y4M files, or ffmpeg when built
//!    with the `ingest-*-ffmpeg` features).
//! 2. **Process**: `FrameProcessor` resizes each frame to the model input,
//!    calls the `InferenceAdapter`, maps boxes back to frame coordinates and
//!    draws them.
//! 3. **Schedule**: `BatchPipeline` handles every frame in order into a
//!    `VideoEncoder`; `StreamPipeline` keeps only the newest live frame and
//!    counts the ones it supersedes.
//! 4. **Fan out**: each frame's `DetectionBatch` is published on a
//!    `ResultChannel`; consumers (stats, latest table, report sinks) read at
//!    their own pace under a per-subscriber overflow policy.
//!
//! # Module Structure
//!
//! - `frame`: frames, annotated frames, the latest-frame cell
//! - `ingest`: frame sources and container metadata
//! - `detect`: inference adapters, detection types, NMS
//! - `processor` / `render`: the per-frame contract and box drawing
//! - `pipeline`: batch and live schedulers
//! - `session`: job state, progress, cancellation
//! - `channel` / `consumers` / `sink`: result fan-out and persistence
//! - `output`: encoders and live displays
//! - `config`: file and environment configuration

pub mod channel;
pub mod config;
pub mod consumers;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod output;
pub mod pipeline;
pub mod processor;
pub mod render;
pub mod session;
pub mod sink;
pub mod ui;

pub use channel::{OverflowPolicy, RecvError, ResultChannel, Subscription};
pub use config::{LiveSettings, PipelineConfig, RoadGuardConfig};
pub use consumers::{spawn_consumer, BatchHandler, DetectionStats, LatestDetections};
pub use detect::{
    open_adapter, BoundingBox, Detection, DetectionBatch, InferenceAdapter, ModelInput,
    RawDetection, StubAdapter,
};
pub use error::PipelineError;
pub use frame::{AnnotatedFrame, Frame, LatestFrameCell, PixelLayout};
pub use ingest::{FileSource, FrameSource, LiveConfig, LiveSource, VideoMetadata};
#[cfg(feature = "output-ffmpeg")]
pub use output::FfmpegEncoder;
pub use output::{
    create_encoder, LiveDisplay, MemoryEncoder, NullDisplay, OutputFormat, RecordingDisplay,
    VideoEncoder, Y4mEncoder,
};
pub use pipeline::{BatchPipeline, BatchReport, StreamPipeline, StreamReport};
pub use processor::{FrameProcessor, ProcessedFrame};
pub use render::LabelFont;
pub use session::{CancelToken, JobState, SessionSnapshot, SessionState};
pub use sink::{DetectionSink, JsonLinesSink, ReportMetadata, Severity, SinkConsumer};

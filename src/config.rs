use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;
use crate::render::LabelFont;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MODEL_INPUT_SIZE: (u32, u32) = (640, 640);
pub const DEFAULT_CLASS_LABELS: [&str; 4] = [
    "Longitudinal Crack",
    "Transverse Crack",
    "Alligator Crack",
    "Potholes",
];
const DEFAULT_LIVE_URL: &str = "stub://camera";
const DEFAULT_LIVE_FPS: u32 = 30;
const DEFAULT_LIVE_WIDTH: u32 = 1280;
const DEFAULT_LIVE_HEIGHT: u32 = 720;
const DEFAULT_RESULT_CAPACITY: usize = 32;

// ----------------------------------------------------------------------------
// PipelineConfig
// ----------------------------------------------------------------------------

/// Per-run detection settings. Immutable for the duration of one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Detections strictly below this confidence are excluded by the adapter.
    pub confidence_threshold: f32,
    /// Model input resolution as (width, height).
    pub model_input_size: (u32, u32),
    /// Class table indexed by `class_id`.
    pub class_labels: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            model_input_size: DEFAULT_MODEL_INPUT_SIZE,
            class_labels: DEFAULT_CLASS_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PipelineConfig {
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PipelineError::Config(format!(
                "confidence threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        let (w, h) = self.model_input_size;
        if w == 0 || h == 0 {
            return Err(PipelineError::Config(format!(
                "model input size {}x{} must be non-zero",
                w, h
            )));
        }
        if self.class_labels.is_empty() {
            return Err(PipelineError::Config("class label table is empty".into()));
        }
        Ok(())
    }

    /// Label for `class_id`; ids outside the table map to `"class <id>"`.
    pub fn label_for(&self, class_id: u32) -> String {
        self.class_labels
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| format!("class {}", class_id))
    }
}

// ----------------------------------------------------------------------------
// RoadGuardConfig: file + environment loader
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct RoadGuardConfigFile {
    model_path: Option<PathBuf>,
    font_path: Option<PathBuf>,
    detection: Option<DetectionConfigFile>,
    live: Option<LiveConfigFile>,
    inference_timeout_ms: Option<u64>,
    result_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    confidence_threshold: Option<f32>,
    model_input_width: Option<u32>,
    model_input_height: Option<u32>,
    class_labels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct LiveConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RoadGuardConfig {
    pub pipeline: PipelineConfig,
    /// ONNX model file. `None` means the stub adapter must be requested explicitly.
    pub model_path: Option<PathBuf>,
    /// TrueType/OpenType font for label text; boxes get a confidence bar without one.
    pub font_path: Option<PathBuf>,
    pub live: LiveSettings,
    pub inference_timeout: Option<Duration>,
    /// Per-subscriber capacity of the result channel.
    pub result_capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for RoadGuardConfig {
    fn default() -> Self {
        Self::from_file(RoadGuardConfigFile::default())
    }
}

impl RoadGuardConfig {
    /// Load from the file named by `ROADGUARD_CONFIG` (if set), apply
    /// `ROADGUARD_*` overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROADGUARD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RoadGuardConfigFile) -> Self {
        let defaults = PipelineConfig::default();
        let detection = file.detection.unwrap_or_default();
        let pipeline = PipelineConfig {
            confidence_threshold: detection
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            model_input_size: (
                detection
                    .model_input_width
                    .unwrap_or(defaults.model_input_size.0),
                detection
                    .model_input_height
                    .unwrap_or(defaults.model_input_size.1),
            ),
            class_labels: detection.class_labels.unwrap_or(defaults.class_labels),
        };
        let live = file.live.unwrap_or_default();
        let live = LiveSettings {
            url: live.url.unwrap_or_else(|| DEFAULT_LIVE_URL.to_string()),
            target_fps: live.target_fps.unwrap_or(DEFAULT_LIVE_FPS),
            width: live.width.unwrap_or(DEFAULT_LIVE_WIDTH),
            height: live.height.unwrap_or(DEFAULT_LIVE_HEIGHT),
        };
        Self {
            pipeline,
            model_path: file.model_path,
            font_path: file.font_path,
            live,
            inference_timeout: file
                .inference_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            result_capacity: file.result_capacity.unwrap_or(DEFAULT_RESULT_CAPACITY),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var("ROADGUARD_CONFIDENCE") {
            self.pipeline.confidence_threshold = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROADGUARD_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Ok(path) = std::env::var("ROADGUARD_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.model_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("ROADGUARD_FONT") {
            if !path.trim().is_empty() {
                self.font_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(labels) = std::env::var("ROADGUARD_CLASS_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.pipeline.class_labels = parsed;
            }
        }
        if let Ok(url) = std::env::var("ROADGUARD_LIVE_URL") {
            if !url.trim().is_empty() {
                self.live.url = url;
            }
        }
        if let Ok(raw) = std::env::var("ROADGUARD_INFERENCE_TIMEOUT_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                anyhow!("ROADGUARD_INFERENCE_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.inference_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Ok(raw) = std::env::var("ROADGUARD_RESULT_CAPACITY") {
            self.result_capacity = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROADGUARD_RESULT_CAPACITY must be a positive integer"))?;
        }
        Ok(())
    }

    /// Read and parse the configured label font.
    ///
    /// A missing or unreadable font is not fatal: rendering falls back to
    /// confidence bars and a warning is logged.
    pub fn label_font(&self) -> Option<Arc<LabelFont>> {
        let path = self.font_path.as_deref()?;
        match LabelFont::load(path) {
            Ok(font) => {
                log::info!("label font loaded from {}", path.display());
                Some(Arc::new(font))
            }
            Err(e) => {
                log::warn!("{}; labels fall back to confidence bars", e);
                None
            }
        }
    }

    fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        if self.result_capacity == 0 {
            return Err(anyhow!("result capacity must be greater than zero"));
        }
        if self.live.target_fps == 0 {
            return Err(anyhow!("live target fps must be greater than zero"));
        }
        if self.live.width == 0 || self.live.height == 0 {
            return Err(anyhow!(
                "live resolution {}x{} must be non-zero",
                self.live.width,
                self.live.height
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<RoadGuardConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

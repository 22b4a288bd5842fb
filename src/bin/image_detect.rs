//! image_detect - run detection on a single still image
//!
//! Writes the annotated image next to the input (or to `--output`) and prints
//! the detection batch as JSON on stdout. With `--report`, the batch is also
//! appended to a JSON-lines report file with the given road metadata.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

use road_guard::{
    open_adapter, DetectionSink, Frame, FrameProcessor, JsonLinesSink, PixelLayout,
    ReportMetadata, RoadGuardConfig, Severity,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Input image (PNG or JPEG).
    input: PathBuf,
    /// Annotated output image (default: <input stem>_detected.png).
    #[arg(long, short)]
    output: Option<PathBuf>,
    /// Confidence threshold in [0, 1]; overrides ROADGUARD_CONFIDENCE.
    #[arg(long)]
    confidence: Option<f32>,
    /// ONNX model path; overrides ROADGUARD_MODEL_PATH.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Use the stub adapter when no model is configured.
    #[arg(long)]
    stub: bool,
    /// Append the detection record to this JSON-lines file.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    /// Road name stored with the report record.
    #[arg(long, default_value = "")]
    road: String,
    /// Free-text description stored with the report record.
    #[arg(long, default_value = "")]
    description: String,
    /// Damage severity stored with the report record (light|moderate|severe).
    #[arg(long, default_value = "light")]
    severity: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = RoadGuardConfig::load()?;
    if let Some(confidence) = args.confidence {
        cfg.pipeline.confidence_threshold = confidence;
    }
    if let Some(model) = &args.model {
        cfg.model_path = Some(model.clone());
    }
    cfg.pipeline.validate()?;
    let severity: Severity = args.severity.parse()?;

    let adapter = open_adapter(
        cfg.model_path.as_deref(),
        cfg.pipeline.model_input_size,
        args.stub,
    )?;

    let image = image::open(&args.input)
        .with_context(|| format!("failed to read image {}", args.input.display()))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    let frame = Frame::new(
        image.into_raw(),
        width,
        height,
        PixelLayout::Rgb24,
        0,
        Duration::ZERO,
    )?;

    let mut processor = FrameProcessor::new(adapter)
        .with_timeout(cfg.inference_timeout)
        .with_font(cfg.label_font());
    let processed = processor.process(&frame, &cfg.pipeline)?;
    log::info!(
        "{}: {} detection(s) in {:?}",
        args.input.display(),
        processed.batch.len(),
        processed.inference_time
    );

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.input));
    let annotated = image::RgbImage::from_raw(width, height, processed.annotated.frame.into_pixels())
        .ok_or_else(|| anyhow!("annotated frame does not match {}x{}", width, height))?;
    annotated
        .save(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    log::info!("annotated image written to {}", output.display());

    if let Some(path) = &args.report {
        let metadata = ReportMetadata {
            road_name: args.road.clone(),
            description: args.description.clone(),
            severity,
            source_name: args.input.display().to_string(),
        };
        let mut sink = JsonLinesSink::open(path)?;
        sink.record(&processed.batch, &metadata)?;
        sink.flush()?;
        log::info!("report record appended to {}", path.display());
    }

    println!("{}", serde_json::to_string_pretty(&processed.batch)?);
    Ok(())
}

fn default_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    input.with_file_name(format!("{}_detected.png", stem))
}

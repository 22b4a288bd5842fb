//! video_detect - annotate every frame of a recorded video
//!
//! Reads a video file (or a `stub://` clip), runs road-damage detection on
//! every frame in order, and writes an annotated video with the same frame
//! count: Y4M by default, MP4/MKV when the output path asks for it and the
//! `output-ffmpeg` feature is enabled. Ctrl-C cancels the job; frames already
//! written stay valid.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use road_guard::ui::{Ui, UiMode};
use road_guard::{
    create_encoder, open_adapter, spawn_consumer, BatchPipeline, DetectionStats, FileSource,
    JobState, JsonLinesSink, OverflowPolicy, ReportMetadata, ResultChannel, RoadGuardConfig,
    Severity, SinkConsumer,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Input video file or stub:// clip.
    input: String,
    /// Output path; .mp4/.mkv/.avi need the output-ffmpeg feature
    /// (default: <input stem>_detected.y4m).
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
    /// Append detection records to this JSON-lines file.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    /// Road name stored with report records.
    #[arg(long, default_value = "")]
    road: String,
    /// Free-text description stored with report records.
    #[arg(long, default_value = "")]
    description: String,
    /// Damage severity stored with report records (light|moderate|severe).
    #[arg(long, default_value = "light")]
    severity: String,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, value_enum, default_value_t = UiMode::Auto, value_name = "MODE")]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = Ui::new(args.ui, is_tty, !stdout_is_tty);

    let mut cfg = RoadGuardConfig::load()?;
    if let Some(confidence) = args.confidence {
        cfg.pipeline.confidence_threshold = confidence;
    }
    if let Some(model) = &args.model {
        cfg.model_path = Some(model.clone());
    }
    cfg.pipeline.validate()?;
    let severity: Severity = args.severity.parse()?;

    let step = ui.job("Load model");
    let adapter = open_adapter(
        cfg.model_path.as_deref(),
        cfg.pipeline.model_input_size,
        args.stub,
    )?;
    step.done();

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.input));
    let source = FileSource::open(&args.input)?;
    let encoder = create_encoder(&output)?;

    let results = ResultChannel::new();
    let stats = spawn_consumer(
        results.subscribe("stats", cfg.result_capacity, OverflowPolicy::BlockProducer),
        None,
        DetectionStats::new(),
    )?;
    let report = match &args.report {
        Some(path) => {
            let metadata = ReportMetadata {
                road_name: args.road.clone(),
                description: args.description.clone(),
                severity,
                source_name: args.input.clone(),
            };
            let consumer = SinkConsumer::new(JsonLinesSink::open(path)?, metadata);
            Some(spawn_consumer(
                results.subscribe("report", cfg.result_capacity, OverflowPolicy::BlockProducer),
                None,
                consumer,
            )?)
        }
        None => None,
    };

    let pipeline = BatchPipeline::new(adapter, results.clone())
        .with_timeout(cfg.inference_timeout)
        .with_font(cfg.label_font());
    let session = pipeline.session().clone();
    ctrlc::set_handler(move || {
        if session.cancel() {
            log::info!("cancellation requested; finishing the current frame");
        }
    })
    .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;

    let job = std::thread::Builder::new()
        .name("roadguard-batch".to_string())
        .spawn({
            let pipeline = pipeline.clone();
            let pipeline_cfg = cfg.pipeline.clone();
            move || {
                let mut source = source;
                let mut encoder = encoder;
                pipeline.run(&mut source, encoder.as_mut(), &pipeline_cfg)
            }
        })?;

    let mut progress = ui.job("Detect");
    while !job.is_finished() {
        progress.update(&pipeline.session().snapshot());
        std::thread::sleep(Duration::from_millis(100));
    }
    let outcome = job
        .join()
        .map_err(|_| anyhow!("batch thread panicked"))?;
    let snapshot = pipeline.session().snapshot();
    progress.update(&snapshot);
    progress.finish(&snapshot.state);

    results.close();
    let stats = stats.join().map_err(|_| anyhow!("stats consumer panicked"))?;
    if let Some(handle) = report {
        let consumer = handle
            .join()
            .map_err(|_| anyhow!("report consumer panicked"))?;
        let (written, failed) = (consumer.written(), consumer.failed());
        let sink = consumer.finish()?;
        log::info!(
            "{} report records appended to {} ({} failed)",
            written,
            sink.path().display(),
            failed
        );
    }

    let report = outcome?;
    println!(
        "{}: {}/{} frames, {} detections [{}] -> {}",
        report.state,
        report.frames_processed,
        report.total_frames,
        stats.detections,
        stats.summary(),
        output.display()
    );
    if report.state != JobState::Completed {
        log::warn!("output holds only the frames processed before cancellation");
    }
    Ok(())
}

fn default_output(input: &str) -> PathBuf {
    let stem = Path::new(input)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty() && !input.contains("://"))
        .unwrap_or("roadguard");
    PathBuf::from(format!("{}_detected.y4m", stem))
}

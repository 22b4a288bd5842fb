//! live_detect - road-damage detection on a live camera stream
//!
//! Connects to the configured stream (`ROADGUARD_LIVE_URL` or `--url`), runs
//! detection on the newest frame whenever the model is free, and keeps a
//! table of the latest detections. Runs until Ctrl-C, `--duration`, or a
//! stream failure.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use road_guard::ui::{Ui, UiMode};
use road_guard::{
    create_encoder, open_adapter, spawn_consumer, DetectionStats, LatestDetections, LiveConfig,
    LiveDisplay, LiveSource, NullDisplay, OverflowPolicy, RecordingDisplay, ResultChannel,
    RoadGuardConfig, StreamPipeline,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Stream URL (rtsp://, http://, device path, or stub://); overrides ROADGUARD_LIVE_URL.
    #[arg(long)]
    url: Option<String>,
    /// Confidence threshold in [0, 1]; overrides ROADGUARD_CONFIDENCE.
    #[arg(long)]
    confidence: Option<f32>,
    /// ONNX model path; overrides ROADGUARD_MODEL_PATH.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Use the stub adapter when no model is configured.
    #[arg(long)]
    stub: bool,
    /// Record the annotated preview here (.y4m, or .mp4/.mkv with output-ffmpeg).
    #[arg(long, value_name = "PATH")]
    record: Option<PathBuf>,
    /// Stop after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    duration: Option<u64>,
    /// Interval between detection table updates.
    #[arg(long, default_value_t = 2, value_name = "SECONDS")]
    table_interval: u64,
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
    if let Some(url) = &args.url {
        cfg.live.url = url.clone();
    }
    if let Some(confidence) = args.confidence {
        cfg.pipeline.confidence_threshold = confidence;
    }
    if let Some(model) = &args.model {
        cfg.model_path = Some(model.clone());
    }
    cfg.pipeline.validate()?;

    let step = ui.job("Load model");
    let adapter = open_adapter(
        cfg.model_path.as_deref(),
        cfg.pipeline.model_input_size,
        args.stub,
    )?;
    step.done();

    let source = LiveSource::new(LiveConfig::from(&cfg.live))?;
    let display: Box<dyn LiveDisplay> = match &args.record {
        Some(path) => Box::new(RecordingDisplay::new(
            create_encoder(path)?,
            cfg.live.target_fps.max(1) as f64,
        )),
        None => Box::new(NullDisplay::new()),
    };

    let results = ResultChannel::new();
    let table = results.subscribe("table", cfg.result_capacity, OverflowPolicy::DropOldest);
    let stats = spawn_consumer(
        results.subscribe("stats", cfg.result_capacity, OverflowPolicy::DropOldest),
        None,
        DetectionStats::new(),
    )?;

    let pipeline = StreamPipeline::new(adapter, results.clone())
        .with_timeout(cfg.inference_timeout)
            .with_font(cfg.label_font());
    let session = pipeline.session().clone();
    ctrlc::set_handler(move || {
        if session.cancel() {
            log::info!("cancellation requested; stopping live job");
        }
    })
    .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;

    let job = pipeline.spawn(Box::new(source), display, cfg.pipeline.clone())?;
    let started = Instant::now();
    let table_interval = Duration::from_secs(args.table_interval.max(1));
    let mut last_table = Instant::now();
    let mut latest = LatestDetections::new();
    let mut progress = ui.job("Live");

    while !job.is_finished() {
        for batch in table.drain() {
            latest.offer(batch);
        }
        progress.update(&pipeline.session().snapshot());
        if last_table.elapsed() >= table_interval {
            print_table(&latest);
            last_table = Instant::now();
        }
        if args
            .duration
            .is_some_and(|secs| started.elapsed() >= Duration::from_secs(secs))
        {
            pipeline.session().cancel();
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let outcome = job.join().map_err(|_| anyhow!("live thread panicked"))?;
    progress.finish(&pipeline.session().state());
    results.close();
    drop(table);
    let stats = stats.join().map_err(|_| anyhow!("stats consumer panicked"))?;

    let report = outcome?;
    println!(
        "{}: captured {}, processed {}, dropped {}, failed {}; {} detections [{}]",
        report.state,
        report.frames_captured,
        report.frames_processed,
        report.frames_dropped,
        report.frames_failed,
        stats.detections,
        stats.summary()
    );
    if latest.stale_discarded() > 0 {
        log::debug!("{} stale batches discarded", latest.stale_discarded());
    }
    Ok(())
}

fn print_table(latest: &LatestDetections) {
    let Some(batch) = latest.current() else {
        return;
    };
    println!(
        "frame {} @ {:.1}s: {} detection(s)",
        batch.sequence,
        batch.timestamp.as_secs_f64(),
        batch.len()
    );
    for row in latest.rows() {
        println!(
            "  {:<20} {:>5.2}  ({:.0}, {:.0}) - ({:.0}, {:.0})",
            row.label, row.confidence, row.x_min, row.y_min, row.x_max, row.y_max
        );
    }
}

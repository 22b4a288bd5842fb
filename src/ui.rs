//! Terminal progress for the binaries.
//!
//! Everything goes to stderr so stdout stays free for results. One type,
//! [`JobProgress`], covers both short setup steps (a spinner finished with
//! [`JobProgress::done`]) and jobs fed from [`SessionSnapshot`]s. Without a
//! terminal, or with `--ui plain`, the same calls print one line per event.

use std::time::{Duration, Instant};

use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::session::{JobState, SessionSnapshot};

const TICK: Duration = Duration::from_millis(120);
const BAR_TEMPLATE: &str = "{msg} [{bar:30}] {pos}/{len} frames ({eta})";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum UiMode {
    /// Animated output when stderr is a terminal and stdout is not piped.
    #[default]
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Copy, Debug)]
pub struct Ui {
    animated: bool,
}

impl Ui {
    /// `stdout_piped` keeps `auto` quiet when results are being redirected.
    pub fn new(mode: UiMode, stderr_is_tty: bool, stdout_piped: bool) -> Self {
        let animated = stderr_is_tty
            && match mode {
                UiMode::Auto => !stdout_piped,
                UiMode::Pretty => true,
                UiMode::Plain => false,
            };
        Self { animated }
    }

    /// Progress for `name`: a spinner until the first sized snapshot turns
    /// it into a bar.
    pub fn job(&self, name: &str) -> JobProgress {
        let bar = self.animated.then(|| {
            let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
            bar.set_style(spinner_style());
            bar.set_message(name.to_string());
            bar.enable_steady_tick(TICK);
            bar
        });
        if bar.is_none() {
            eprintln!("==> {}", name);
        }
        JobProgress {
            name: name.to_string(),
            bar,
            started: Instant::now(),
            sized: false,
            last_decile: None,
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub struct JobProgress {
    name: String,
    bar: Option<ProgressBar>,
    started: Instant,
    sized: bool,
    /// Last 10% step printed in plain mode.
    last_decile: Option<u64>,
}

impl JobProgress {
    pub fn update(&mut self, snapshot: &SessionSnapshot) {
        match (&self.bar, snapshot.total_frames) {
            (Some(bar), Some(total)) => {
                if !self.sized {
                    bar.set_length(total);
                    bar.set_style(
                        ProgressStyle::with_template(BAR_TEMPLATE)
                            .unwrap_or_else(|_| ProgressStyle::default_bar()),
                    );
                    self.sized = true;
                }
                bar.set_position(snapshot.frames_processed);
            }
            (Some(bar), None) => bar.set_message(format!(
                "{}: processed {}, dropped {}, failed {}",
                self.name, snapshot.frames_processed, snapshot.frames_dropped, snapshot.frames_failed
            )),
            // Live jobs have no total; plain mode reports them only at finish.
            (None, None) => {}
            (None, Some(_)) => {
                let decile = (snapshot.progress * 10.0).floor() as u64;
                if self.last_decile != Some(decile) {
                    self.last_decile = Some(decile);
                    eprintln!(
                        "{}: {:>3.0}% ({} frames)",
                        self.name,
                        snapshot.progress * 100.0,
                        snapshot.frames_processed
                    );
                }
            }
        }
    }

    /// Close a setup step with its wall time.
    pub fn done(self) {
        let line = format!("✔ {} in {}", self.name, elapsed_label(self.started.elapsed()));
        self.close(line);
    }

    /// Close a job with its terminal state.
    pub fn finish(self, state: &JobState) {
        let line = match state {
            JobState::Completed => format!(
                "✔ {} in {}",
                self.name,
                elapsed_label(self.started.elapsed())
            ),
            other => format!("✘ {} ({})", self.name, other),
        };
        self.close(line);
    }

    fn close(self, line: String) {
        match self.bar {
            Some(bar) => bar.finish_with_message(line),
            None => eprintln!("{line}"),
        }
    }
}

fn elapsed_label(elapsed: Duration) -> String {
    match elapsed.as_millis() {
        ms @ 0..=999 => format!("{ms}ms"),
        _ => format!("{:.1}s", elapsed.as_secs_f64()),
    }
}

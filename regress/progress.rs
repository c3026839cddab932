use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;
use std::sync::Mutex;

/// Stages reported during a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunStage {
    StoreBuild,
    Regression,
    Reconstruction,
}

impl RunStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::StoreBuild => "slice store construction",
            Self::Regression => "location regression",
            Self::Reconstruction => "volume reconstruction",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress. Called from worker threads during
/// pooled regression, so it takes `&self`.
pub trait RunProgressObserver: Sync {
    fn on_stage_start(&self, stage: RunStage, total_units: usize) {
        let _ = (stage, total_units);
    }
    fn on_stage_advance(&self, stage: RunStage, completed_units: usize) {
        let _ = (stage, completed_units);
    }
    fn on_stage_finish(&self, stage: RunStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopRunProgress;

impl RunProgressObserver for NoopRunProgress {}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());

    pb
}

/// Terminal progress bars, one per stage. Hidden when stderr is not a terminal.
#[derive(Default)]
pub struct ConsoleProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_bar(&self, f: impl FnOnce(&mut Option<ProgressBar>)) {
        let mut guard = self.bar.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard);
    }
}

impl RunProgressObserver for ConsoleProgress {
    fn on_stage_start(&self, stage: RunStage, total_units: usize) {
        self.with_bar(|bar| {
            if let Some(previous) = bar.take() {
                previous.finish_and_clear();
            }
            *bar = Some(create_progress_bar(total_units as u64, stage.describe()));
        });
    }

    fn on_stage_advance(&self, _stage: RunStage, completed_units: usize) {
        self.with_bar(|bar| {
            if let Some(bar) = bar.as_ref() {
                bar.set_position(completed_units as u64);
            }
        });
    }

    fn on_stage_finish(&self, stage: RunStage) {
        self.with_bar(|bar| {
            if let Some(bar) = bar.take() {
                bar.finish_with_message(format!("{stage} complete"));
            }
        });
    }
}

//! Console presentation of startup stages.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::error::RelayError;
use crate::lifecycle::{StartupObserver, StartupStage};
use crate::source::DeviceInfo;

/// How startup stages are drawn on stderr.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ui {
    spinners: bool,
}

impl Ui {
    /// `--ui auto|plain|pretty`. Spinners need a terminal whatever the flag says.
    pub fn from_args(ui_flag: Option<&str>, is_tty: bool) -> Self {
        Self {
            spinners: is_tty && ui_flag != Some("plain"),
        }
    }

    fn begin(&self, stage: StartupStage) -> StageLine {
        let title = format!("[{}/{}] {}", stage.step(), StartupStage::COUNT, stage.label());
        let spinner = self.spinners.then(|| {
            let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
            bar.set_style(
                ProgressStyle::with_template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.set_message(format!("{title}…"));
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });
        if spinner.is_none() {
            eprintln!("==> {}", title);
        }
        StageLine {
            title,
            started: Instant::now(),
            spinner,
        }
    }
}

/// One in-flight stage; `finish` prints its outcome.
struct StageLine {
    title: String,
    started: Instant,
    spinner: Option<ProgressBar>,
}

impl StageLine {
    fn finish(self, outcome: Option<&RelayError>) {
        let elapsed = format_duration(self.started.elapsed());
        let line = match outcome {
            Some(err) => format!("✘ {} ({}): {}", self.title, elapsed, err),
            None => format!("✔ {} ({})", self.title, elapsed),
        };
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(line),
            None => eprintln!("{line}"),
        }
    }
}

/// Shows one stage at a time and prints the bound camera's identification.
pub struct StartupProgress<'a> {
    ui: &'a Ui,
    current: Option<StageLine>,
}

impl<'a> StartupProgress<'a> {
    pub fn new(ui: &'a Ui) -> Self {
        Self { ui, current: None }
    }

    fn complete_current(&mut self) {
        if let Some(line) = self.current.take() {
            line.finish(None);
        }
    }
}

impl StartupObserver for StartupProgress<'_> {
    fn stage_started(&mut self, stage: StartupStage) {
        self.complete_current();
        self.current = Some(self.ui.begin(stage));
    }

    fn device_connected(&mut self, info: &DeviceInfo) {
        self.complete_current();
        println!("\n{}\n", info);
    }

    fn startup_finished(&mut self) {
        self.complete_current();
    }

    fn startup_failed(&mut self, _stage: StartupStage, err: &RelayError) {
        if let Some(line) = self.current.take() {
            line.finish(Some(err));
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;

    #[test]
    fn spinners_only_on_a_terminal() {
        assert!(!Ui::from_args(Some("pretty"), false).spinners);
        assert!(!Ui::from_args(Some("plain"), true).spinners);
        assert!(Ui::from_args(Some("auto"), true).spinners);
        assert!(Ui::from_args(None, true).spinners);
    }

    #[test]
    fn stage_titles_show_their_position() {
        let ui = Ui::from_args(Some("plain"), false);
        let line = ui.begin(StartupStage::ConfigureCamera);
        assert_eq!(line.title, "[3/4] configure camera");
        line.finish(None);
    }

    #[test]
    fn failure_closes_the_open_stage() {
        let ui = Ui::from_args(Some("plain"), false);
        let mut progress = StartupProgress::new(&ui);
        progress.stage_started(StartupStage::BuildPipeline);
        progress.stage_started(StartupStage::ConnectCamera);
        progress.startup_failed(
            StartupStage::ConnectCamera,
            &RelayError::Source(SourceError::NoDeviceFound("bus empty".to_string())),
        );
        assert!(progress.current.is_none());
    }

    #[test]
    fn durations_switch_units_at_one_second() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}

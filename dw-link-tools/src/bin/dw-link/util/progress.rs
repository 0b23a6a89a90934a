use std::time::Duration;

use colored::Colorize;
use dw_link::flashing::ProgressEvent;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;

use super::logging;

const TICK_CHARS: &str = "⠁⠁⠉⠙⠚⠒⠂⠂⠒⠲⠴⠤⠄⠄⠤⠠⠠⠤⠦⠖⠒⠐⠐⠒⠓⠋⠉⠈⠈✔";

/// One progress bar, shown idle until its phase starts.
pub struct ProgressBarGroup {
    message: &'static str,
    bar: Option<ProgressBar>,
}

impl ProgressBarGroup {
    pub fn new(message: &'static str) -> Self {
        Self { message, bar: None }
    }

    fn idle() -> ProgressStyle {
        ProgressStyle::with_template("{msg:.green.bold} {spinner} {percent:>3}% [{bar:20}]")
            .expect("Error in progress bar creation. This is a bug, please report it.")
            .tick_chars(TICK_CHARS)
            .progress_chars("--")
    }

    fn active() -> ProgressStyle {
        ProgressStyle::with_template(
            "{msg:.green.bold} {spinner} {percent:>3}% [{bar:20}] {bytes:>10} @ {bytes_per_sec:>12} (ETA {eta})",
        )
        .expect("Error in progress bar creation. This is a bug, please report it.")
        .tick_chars(TICK_CHARS)
        .progress_chars("##-")
    }

    fn finished() -> ProgressStyle {
        ProgressStyle::with_template(
            "{msg:.green.bold} {spinner} {percent:>3}% [{bar:20}] {bytes:>10} @ {bytes_per_sec:>12} (took {elapsed})",
        )
        .expect("Error in progress bar creation. This is a bug, please report it.")
        .tick_chars(TICK_CHARS)
        .progress_chars("##")
    }

    fn add(&mut self, bar: ProgressBar) {
        bar.set_message(self.message);
        bar.set_style(Self::idle());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.reset_elapsed();

        self.bar = Some(bar);
    }

    fn start(&mut self, length: u64) {
        if let Some(bar) = &self.bar {
            bar.set_length(length);
            bar.reset_elapsed();
            bar.set_style(Self::active());
        }
    }

    fn inc(&mut self, size: u64) {
        if let Some(bar) = &self.bar {
            bar.inc(size);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = &self.bar {
            bar.set_style(Self::finished());
            bar.finish();
        }
    }

    fn abandon(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }
}

struct ProgressBars {
    program: ProgressBarGroup,
    verify: ProgressBarGroup,
}

/// Upload and verify bars driven by the session's [`ProgressEvent`]s.
pub struct CliProgressBars {
    multi_progress: MultiProgress,
    progress_bars: Mutex<ProgressBars>,
}

impl CliProgressBars {
    pub fn new() -> Self {
        let multi_progress = MultiProgress::new();
        logging::set_progress_bar(multi_progress.clone());

        Self {
            multi_progress,
            progress_bars: Mutex::new(ProgressBars {
                program: ProgressBarGroup::new("  Uploading"),
                verify: ProgressBarGroup::new("  Verifying"),
            }),
        }
    }

    pub fn handle(&self, event: ProgressEvent) {
        let mut guard = self.progress_bars.lock();
        let bars = &mut *guard;

        match event {
            ProgressEvent::Identified(info) => {
                logging::println(format!(
                    "{} {}.{}, device signature {}",
                    "Bootloader".green().bold(),
                    info.major,
                    info.minor,
                    info.signature,
                ));
                bars.program.add(self.multi_progress.add(ProgressBar::new(0)));
                bars.verify.add(self.multi_progress.add(ProgressBar::new(0)));
            }
            ProgressEvent::StartedProgramming { total } => bars.program.start(total as u64),
            ProgressEvent::PageProgrammed { size, .. } => bars.program.inc(size as u64),
            ProgressEvent::FinishedProgramming => bars.program.finish(),
            ProgressEvent::StartedVerifying { total } => bars.verify.start(total as u64),
            ProgressEvent::PageVerified { size, .. } => bars.verify.inc(size as u64),
            ProgressEvent::VerifyMismatch(mismatch) => {
                bars.verify.abandon();
                logging::eprintln(format!(
                    "{} at {:#06x}: expected {:#04x}, read {:#04x}",
                    "Verify mismatch".red().bold(),
                    mismatch.address,
                    mismatch.expected,
                    mismatch.observed,
                ));
            }
            ProgressEvent::FinishedVerifying => bars.verify.finish(),
            ProgressEvent::FirmwareMessage(text) => {
                logging::println(format!("{} {text}", "Device".cyan().bold()));
            }
            ProgressEvent::UnsupportedSignature(signature) => {
                bars.program.abandon();
                bars.verify.abandon();
                logging::eprintln(format!(
                    "{} {signature}",
                    "Unsupported device signature".red().bold()
                ));
            }
            ProgressEvent::Synchronized
            | ProgressEvent::LeftProgrammingMode
            | ProgressEvent::AdapterAlive(_) => {}
        }
    }
}

impl Drop for CliProgressBars {
    fn drop(&mut self) {
        let mut bars = self.progress_bars.lock();
        bars.program.abandon();
        bars.verify.abandon();
        logging::clear_progress_bar();
    }
}

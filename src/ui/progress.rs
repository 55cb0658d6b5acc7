//! Progress indicators with CI fallback

use super::context::UiContext;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    /// Start the spinner with a message
    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(message);
        } else {
            println!("{} {}", style("[OK]").green(), message);
        }
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.error(message);
        } else {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }
}

/// Per-stage progress of a sync run
///
/// An indicatif bar in interactive terminals, one line per stage otherwise.
pub struct SyncProgress {
    bar: Option<ProgressBar>,
    done: u64,
    total: u64,
}

impl SyncProgress {
    pub fn new(ctx: &UiContext, total: u64) -> Self {
        let bar = ctx.use_fancy_output().then(|| {
            let bar = ProgressBar::new(total);
            let template = ProgressStyle::default_bar()
                .template("  {spinner:.magenta} Syncing  {bar:24.magenta/dim} {pos}/{len} {msg:.dim}  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                .progress_chars("━╸─");
            bar.set_style(template);
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });
        Self {
            bar,
            done: 0,
            total,
        }
    }

    /// Set the number of stages once it is known
    pub fn set_total(&mut self, total: u64) {
        self.total = total;
        if let Some(bar) = &self.bar {
            bar.set_length(total);
        }
    }

    /// Record one finished stage
    pub fn stage_done(&mut self, stage: &str, outcome: &str, failed: bool) {
        self.done += 1;
        match &self.bar {
            Some(bar) => {
                bar.inc(1);
                if failed {
                    bar.println(format!("  {} {} {}", style("✗").red(), stage, style(outcome).dim()));
                } else {
                    bar.set_message(format!("{} {}", stage, outcome));
                }
            }
            None => {
                let tag = if failed {
                    style("[FAIL]").red()
                } else {
                    style("[OK]").green()
                };
                println!("  {} ({}/{}) {} {}", tag, self.done, self.total, stage, outcome);
            }
        }
    }

    /// Finish and clear the bar
    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

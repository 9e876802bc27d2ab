//! Progress indicators for gantry runs.
//!
//! Bridges the engine's [`ProgressCallback`] to an indicatif bar. Finished
//! resources are printed above the bar as they complete.

use colored::Colorize;
use declarative::{Action, ProgressCallback, ResourceKind};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::ui;

pub struct RunProgress {
    bar: ProgressBar,
}

impl RunProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self { bar }
    }

    fn advance(&self) {
        // Deletions of undeclared resources are not part of the initial total
        if self.bar.length().is_some_and(|len| self.bar.position() >= len) {
            self.bar.inc_length(1);
        }
        self.bar.inc(1);
    }
}

impl ProgressCallback for RunProgress {
    fn on_run_start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.enable_steady_tick(Duration::from_millis(100));
    }

    fn on_resource_start(&self, name: &str, kind: ResourceKind) {
        self.bar.set_message(format!("{name} ({kind})"));
    }

    fn on_resource_complete(&self, name: &str, action: Option<Action>, error: Option<&str>) {
        let line = match (action, error) {
            (_, Some(error)) => format!("  {} {:<24} {}", "✗".red(), name, error.red()),
            (Some(action), None) => format!(
                "  {} {:<24} {}",
                ui::action_symbol(action),
                name,
                action.to_string().dimmed()
            ),
            (None, None) => format!("  {} {}", "✓".green(), name),
        };
        self.bar.println(line);
        self.advance();
    }

    fn on_resource_skipped(&self, name: &str, reason: &str) {
        self.bar
            .println(format!("  {} {:<24} {}", "⊘".yellow(), name, reason.dimmed()));
        self.advance();
    }

    fn on_run_complete(&self) {
        self.bar.finish_and_clear();
    }
}

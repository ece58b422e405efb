//! Progress reporting for backup runs
//!
//! Provides a live status line using indicatif plus the start/end banners.

use crate::pipeline::{DirOutcome, RunReport};
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner-based status display for a running backup
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Print a header at the start of the run
pub fn print_header(device: &str, strategy: &str, directories: usize, incremental: bool) {
    println!();
    println!(
        "{} {}",
        style("tapeback").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Device:").bold(), device);
    println!("  {} {}", style("Strategy:").bold(), strategy);
    println!("  {} {}", style("Directories:").bold(), directories);
    println!(
        "  {} {}",
        style("Mode:").bold(),
        if incremental { "incremental" } else { "full" }
    );
    println!();
}

/// Print a summary of the run results
pub fn print_summary(report: &RunReport) {
    let duration_secs = report.duration.as_secs_f64();

    println!();
    if report.completed {
        println!("{}", style("Backup Complete").green().bold());
    } else {
        println!("{}", style("Backup Interrupted").yellow().bold());
    }
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {}",
        style("Written:").bold(),
        report.written_count()
    );
    println!(
        "  {} {}",
        style("Skipped:").bold(),
        report.skipped_count()
    );
    if report.failed_count() > 0 {
        println!(
            "  {} {}",
            style("Failed:").yellow().bold(),
            report.failed_count()
        );
    }
    if report.bytes_written > 0 {
        println!(
            "  {} {}",
            style("Transferred:").bold(),
            format_size(report.bytes_written, BINARY)
        );
    }
    println!("  {} {:.1}s", style("Duration:").bold(), duration_secs);
    println!();

    for (path, outcome) in &report.outcomes {
        match outcome {
            DirOutcome::Written { position } => println!(
                "  {} {} (file marker {})",
                style("✓").green(),
                path.display(),
                position
            ),
            DirOutcome::Skipped => println!(
                "  {} {} (no changes)",
                style("-").dim(),
                path.display()
            ),
            DirOutcome::Failed { reason } => println!(
                "  {} {}: {}",
                style("✗").red(),
                path.display(),
                reason
            ),
        }
    }
    println!();
}

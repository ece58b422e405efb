//! tapeback - Tape Backup Pipeline
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tapeback::config::{BackupArgs, BackupConfig, CliArgs, Command, DeviceArgs};
use tapeback::device::{MtTapeControl, TapeControl};
use tapeback::pipeline::Pipeline;
use tapeback::progress::{print_header, print_summary, ProgressReporter};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command finished cleanly
fn run() -> Result<bool> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    let verbose = matches!(&args.command, Command::Backup(b) if b.verbose);
    setup_logging(verbose)?;

    match args.command {
        Command::Backup(args) => run_backup(args),
        Command::Rewind(dev) => {
            tape(&dev).rewind().context("Rewind failed")?;
            Ok(true)
        }
        Command::Status(dev) => {
            print!("{}", tape(&dev).status().context("Status query failed")?);
            Ok(true)
        }
        Command::Position(dev) => {
            let position = tape(&dev)
                .current_position()
                .context("Position query failed")?;
            println!("{position}");
            Ok(true)
        }
        Command::Seek { block, device } => {
            tape(&device).seek_block(block).context("Seek failed")?;
            Ok(true)
        }
        Command::Skip { count, device } => {
            tape(&device)
                .skip_file_markers(count)
                .context("Skip failed")?;
            Ok(true)
        }
    }
}

fn tape(dev: &DeviceArgs) -> MtTapeControl {
    MtTapeControl::new(dev.device.clone())
}

/// Returns whether every directory was backed up (or skipped) cleanly
fn run_backup(args: BackupArgs) -> Result<bool> {
    // Validate and create config
    let directories = args.directories.clone();
    let config = BackupConfig::from_args(args).context("Invalid configuration")?;

    // Print header
    if config.show_progress {
        print_header(
            &config.device_path.display().to_string(),
            &config.strategy.to_string(),
            directories.len(),
            config.incremental,
        );
    }

    // Fail fast when the drive has no usable medium
    MtTapeControl::new(config.device_path.clone())
        .ensure_ready()
        .context("Tape device is not ready")?;

    let pipeline = Pipeline::new(config.clone());

    // Setup signal handler for graceful shutdown
    let cancel = pipeline.cancel_token();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        cancel.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    // Create progress reporter
    let progress = if config.show_progress {
        Some(ProgressReporter::new())
    } else {
        None
    };

    if let Some(ref p) = progress {
        p.set_status("Backing up...");
    }

    // Run the backup
    let report = pipeline.run(&directories).context("Backup failed")?;

    // Finish progress
    if let Some(ref p) = progress {
        if report.completed {
            p.finish("Backup completed");
        } else {
            p.finish("Backup interrupted");
        }
    }

    // Print summary
    if config.show_progress {
        print_summary(&report);
    }

    if !report.completed {
        info!("Backup was interrupted before completion");
    }

    if report.any_failed() {
        info!(failed = report.failed_count(), "Backup finished with failures");
    }

    Ok(report.completed && !report.any_failed())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("tapeback=debug,warn")
    } else {
        EnvFilter::new("tapeback=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}

//! Configuration types for tapeback
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation
//! - The backup strategy selection

use crate::error::ConfigError;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fmt;
use std::path::PathBuf;

/// Maximum reasonable number of concurrent archive jobs
const MAX_CONCURRENT: usize = 64;

/// Minimum block size accepted for tar / relay / raw-copy invocations
const MIN_BLOCK_SIZE: u32 = 512;

/// How archives travel from the source directories to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// Stream tar output straight through the relay to the device,
    /// one directory at a time. No intermediate archive files.
    Direct,

    /// Stage archives on local disk, then write them through the
    /// flow-controlled relay (mbuffer).
    Tar,

    /// Stage archives on local disk, then write them with a raw copy
    /// (dd). Only sensible when local disk outruns the drive.
    Dd,
}

impl Strategy {
    /// Whether this strategy stages archive files before writing
    pub fn is_staged(self) -> bool {
        matches!(self, Strategy::Tar | Strategy::Dd)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Direct => write!(f, "direct"),
            Strategy::Tar => write!(f, "tar"),
            Strategy::Dd => write!(f, "dd"),
        }
    }
}

/// Back up directory trees to a linear-access tape device
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tapeback",
    version,
    about = "Back up directory trees to a linear-access tape device",
    long_about = "Backs up directories to tape, full or incremental.\n\n\
                  Archives are generated concurrently but always reach the drive in the\n\
                  order the directories were given, so restores can seek by file marker.\n\
                  Per-directory backup history is kept as JSON snapshots.",
    after_help = "EXAMPLES:\n    \
        tapeback backup /data/projects /data/home -d /dev/nst0\n    \
        tapeback backup /data/projects -i --job nightly --strategy tar -c 4\n    \
        tapeback position\n    \
        tapeback skip -2\n    \
        tapeback rewind"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Back up directories to tape
    Backup(BackupArgs),

    /// Rewind the tape to the beginning of the medium
    Rewind(DeviceArgs),

    /// Print the drive's raw status report
    Status(DeviceArgs),

    /// Print the current file-marker position
    Position(DeviceArgs),

    /// Seek to an absolute block position
    Seek {
        /// Target block
        block: u64,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Skip forward (positive) or backward (negative) by file markers
    Skip {
        /// Marker count; negative skips backward
        #[arg(allow_hyphen_values = true)]
        count: i64,

        #[command(flatten)]
        device: DeviceArgs,
    },
}

/// Device selection shared by the tape navigation commands
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Tape device path
    #[arg(short = 'd', long, default_value = "/dev/nst0", value_name = "DEVICE")]
    pub device: PathBuf,
}

/// Arguments for the backup command
#[derive(Args, Debug, Clone)]
pub struct BackupArgs {
    /// Directories to back up, in the order they should reach the tape
    #[arg(value_name = "DIR", required = true)]
    pub directories: Vec<PathBuf>,

    /// Tape device path
    #[arg(short = 'd', long, default_value = "/dev/nst0", value_name = "DEVICE")]
    pub device: PathBuf,

    /// Block size in bytes for tar, relay, and raw-copy invocations
    #[arg(short = 'b', long, default_value = "524288", value_name = "BYTES")]
    pub block_size: u32,

    /// Directory where staged archives are written (defaults to the system temp dir)
    #[arg(long, value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Directory where backup history snapshots are stored
    #[arg(long, default_value = "snapshots", value_name = "DIR")]
    pub snapshot_dir: PathBuf,

    /// Tape label recorded in each backup generation
    #[arg(short = 'l', long, value_name = "LABEL")]
    pub label: Option<String>,

    /// Job name used to namespace history snapshots
    #[arg(short = 'j', long, value_name = "JOB")]
    pub job: Option<String>,

    /// Backup strategy
    #[arg(long, value_enum, default_value_t = Strategy::Direct)]
    pub strategy: Strategy,

    /// Incremental backup: only archive files changed since the recorded history
    #[arg(short = 'i', long)]
    pub incremental: bool,

    /// Maximum number of archives generated concurrently (staged strategies)
    #[arg(short = 'c', long = "concurrent", default_value = "2", value_name = "NUM")]
    pub max_concurrent_tars: usize,

    /// Relay buffer size in GiB
    #[arg(long, default_value = "6", value_name = "GIB")]
    pub buffer_gib: u32,

    /// Relay buffer fill percentage before draining to the device begins
    #[arg(long, default_value = "40", value_name = "PERCENT")]
    pub fill_percent: u8,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose output (show per-file scan warnings)
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Tape device path
    pub device_path: PathBuf,

    /// Block size for tar, relay, and raw-copy invocations
    pub block_size: u32,

    /// Where staged archives are written
    pub staging_dir: PathBuf,

    /// Where history snapshots are stored
    pub snapshot_dir: PathBuf,

    /// Tape label recorded in generations
    pub label: Option<String>,

    /// Job name prefixed to snapshot file names
    pub job: Option<String>,

    /// Selected backup strategy
    pub strategy: Strategy,

    /// Incremental mode
    pub incremental: bool,

    /// Concurrency bound for archive generation
    pub max_concurrent_tars: usize,

    /// Relay buffer size in GiB
    pub buffer_gib: u32,

    /// Relay fill percentage
    pub fill_percent: u8,

    /// Show progress indicator
    pub show_progress: bool,

    /// Verbose logging
    pub verbose: bool,
}

impl BackupConfig {
    /// Create and validate configuration from CLI arguments
    ///
    /// Source directories are validated separately by the pipeline so
    /// library callers can construct a config without touching disk layout.
    pub fn from_args(args: BackupArgs) -> Result<Self, ConfigError> {
        if args.directories.is_empty() {
            return Err(ConfigError::NoDirectories);
        }

        if args.max_concurrent_tars == 0 || args.max_concurrent_tars > MAX_CONCURRENT {
            return Err(ConfigError::InvalidConcurrency {
                count: args.max_concurrent_tars,
                max: MAX_CONCURRENT,
            });
        }

        if args.block_size < MIN_BLOCK_SIZE {
            return Err(ConfigError::InvalidBlockSize {
                size: args.block_size,
                min: MIN_BLOCK_SIZE,
            });
        }

        if args.fill_percent == 0 || args.fill_percent > 100 {
            return Err(ConfigError::InvalidFillPercent {
                percent: args.fill_percent,
            });
        }

        if args.buffer_gib == 0 {
            return Err(ConfigError::InvalidBufferSize {
                gib: args.buffer_gib,
            });
        }

        let staging_dir = args.staging_dir.unwrap_or_else(std::env::temp_dir);
        if !staging_dir.is_dir() {
            return Err(ConfigError::MissingStagingDir { path: staging_dir });
        }

        // The snapshot dir is created on demand - a fresh machine has none
        std::fs::create_dir_all(&args.snapshot_dir).map_err(|e| {
            ConfigError::SnapshotDirUnusable {
                path: args.snapshot_dir.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            device_path: args.device,
            block_size: args.block_size,
            staging_dir,
            snapshot_dir: args.snapshot_dir,
            label: args.label,
            job: args.job,
            strategy: args.strategy,
            incremental: args.incremental,
            max_concurrent_tars: args.max_concurrent_tars,
            buffer_gib: args.buffer_gib,
            fill_percent: args.fill_percent,
            show_progress: !args.quiet,
            verbose: args.verbose,
        })
    }

    /// Validate that every source directory exists
    pub fn validate_directories(&self, directories: &[PathBuf]) -> Result<(), ConfigError> {
        if directories.is_empty() {
            return Err(ConfigError::NoDirectories);
        }
        for dir in directories {
            if !dir.is_dir() {
                return Err(ConfigError::MissingDirectory { path: dir.clone() });
            }
        }
        Ok(())
    }
}

//! Error types for tapeback
//!
//! This module defines the error hierarchy that covers:
//! - Directory scanning errors
//! - Snapshot metadata persistence errors
//! - Tape device control errors
//! - External tool (tar / mbuffer / dd) errors
//! - Configuration and CLI errors
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Errors should be actionable - include context about what to do
//! - Per-file scan errors are recovered locally and never surface here

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the tapeback application
#[derive(Error, Debug)]
pub enum BackupError {
    /// Directory scanning errors
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    /// Snapshot metadata errors
    #[error("Metadata error: {0}")]
    Meta(#[from] MetaError),

    /// Tape device errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// External tool errors
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel closed unexpectedly
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

/// Directory scanning errors
///
/// Only the root of a scan can fail; individual entries that vanish or
/// cannot be read mid-scan are logged and excluded from the snapshot.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The directory to scan does not exist or cannot be opened
    #[error("Cannot scan '{path}': {reason}")]
    RootUnreadable { path: PathBuf, reason: String },
}

/// Snapshot metadata persistence errors
#[derive(Error, Debug)]
pub enum MetaError {
    /// Failed to read or write a history document
    #[error("Failed to access history '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// History document is not valid JSON
    #[error("Corrupt history document '{path}': {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Tried to record a tape position with no generation to attach it to
    #[error("No backup generation recorded for '{directory}'")]
    NoGeneration { directory: PathBuf },
}

/// Tape device control errors
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Drive reported it is not ready (no medium, door open, ...)
    #[error("Tape device '{device}' is not ready")]
    NotReady { device: PathBuf },

    /// A device control command exited non-zero
    #[error("Device command 'mt {command}' failed: {reason}")]
    CommandFailed { command: String, reason: String },

    /// Could not determine the current medium position from drive status
    #[error("Cannot determine tape position from drive status")]
    PositionUnavailable,

    /// Failed to invoke the device control binary at all
    #[error("Failed to run device control command: {0}")]
    Io(#[from] std::io::Error),
}

/// External archiving / transfer tool errors
#[derive(Error, Debug)]
pub enum ToolError {
    /// Could not spawn the tool process
    #[error("Failed to spawn '{tool}': {reason}")]
    SpawnFailed { tool: String, reason: String },

    /// Archiving tool exited non-zero
    #[error("Archive creation failed for '{archive}' (exit code {code:?})")]
    ArchiveFailed {
        archive: PathBuf,
        code: Option<i32>,
    },

    /// Transfer tool exited non-zero; the medium position afterwards is
    /// no longer trustworthy
    #[error("Transfer to device failed for '{archive}' (exit code {code:?})")]
    TransferFailed {
        archive: PathBuf,
        code: Option<i32>,
    },

    /// I/O error wiring process pipes
    #[error("Tool I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid concurrency setting
    #[error("Invalid concurrent archive count {count}: must be between 1 and {max}")]
    InvalidConcurrency { count: usize, max: usize },

    /// Invalid block size
    #[error("Invalid block size {size}: must be at least {min}")]
    InvalidBlockSize { size: u32, min: u32 },

    /// Invalid relay fill percentage
    #[error("Invalid fill percentage {percent}: must be between 1 and 100")]
    InvalidFillPercent { percent: u8 },

    /// Invalid relay buffer size
    #[error("Invalid buffer size {gib} GiB: must be at least 1")]
    InvalidBufferSize { gib: u32 },

    /// A source directory does not exist
    #[error("Source directory '{path}' does not exist or is not a directory")]
    MissingDirectory { path: PathBuf },

    /// The archive staging directory does not exist
    #[error("Staging directory '{path}' does not exist")]
    MissingStagingDir { path: PathBuf },

    /// Snapshot directory could not be created
    #[error("Cannot create snapshot directory '{path}': {reason}")]
    SnapshotDirUnusable { path: PathBuf, reason: String },

    /// No source directories given
    #[error("No source directories specified")]
    NoDirectories,
}

/// A pipeline worker thread panicked
#[derive(Error, Debug)]
#[error("Worker thread {id} panicked")]
pub struct WorkerJoinError {
    pub id: usize,
}

/// Result type alias for BackupError
pub type Result<T> = std::result::Result<T, BackupError>;

/// Result type alias for ScanError
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Result type alias for MetaError
pub type MetaResult<T> = std::result::Result<T, MetaError>;

/// Result type alias for DeviceError
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Result type alias for ToolError
pub type ToolResult<T> = std::result::Result<T, ToolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let dev_err = DeviceError::PositionUnavailable;
        let backup_err: BackupError = dev_err.into();
        assert!(matches!(backup_err, BackupError::Device(_)));
    }

    #[test]
    fn test_tool_error_display() {
        let err = ToolError::ArchiveFailed {
            archive: PathBuf::from("/stage/data.tar"),
            code: Some(2),
        };
        let msg = err.to_string();
        assert!(msg.contains("/stage/data.tar"));
        assert!(msg.contains('2'));
    }
}

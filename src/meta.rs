//! Backup history persistence
//!
//! Each (directory, job) pair owns one JSON document in the snapshot
//! directory: an ordered array of backup generations, oldest first. A
//! generation is immutable once written, except for the single later
//! mutation that fills in its tape position right before the archive is
//! handed to the transfer tool.

use crate::error::{MetaError, MetaResult};
use crate::scan::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Whether a generation captured the whole tree or only changed files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Full,
    Incremental,
}

/// One recorded backup pass over a single directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupGeneration {
    /// Full or incremental
    #[serde(rename = "type")]
    pub kind: GenerationKind,

    /// Tape label this generation was written under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Job name this generation belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,

    /// When the source tree was scanned
    pub timestamp: DateTime<Utc>,

    /// The files captured by this generation (full snapshot or changed subset)
    pub files: Snapshot,

    /// File-marker position on the medium where this generation starts.
    /// Recorded by the writer immediately before the transfer begins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tape_position: Option<u64>,

    /// False when a transfer failure made the recorded position untrustworthy
    #[serde(default = "default_reliable")]
    pub position_reliable: bool,
}

fn default_reliable() -> bool {
    true
}

impl BackupGeneration {
    /// Build a fresh generation with no tape position yet
    pub fn new(
        kind: GenerationKind,
        label: Option<String>,
        job: Option<String>,
        files: Snapshot,
    ) -> Self {
        Self {
            kind,
            label,
            job,
            timestamp: Utc::now(),
            files,
            tape_position: None,
            position_reliable: true,
        }
    }
}

/// Ordered backup generations for one (directory, job) pair
pub type BackupHistory = Vec<BackupGeneration>;

/// Reads and writes per-directory history documents
#[derive(Debug, Clone)]
pub struct MetadataStore {
    /// Directory holding the history documents
    snapshot_dir: PathBuf,

    /// Optional job name prefixed to document file names
    job: Option<String>,
}

impl MetadataStore {
    /// Create a store rooted at the given snapshot directory
    pub fn new(snapshot_dir: impl Into<PathBuf>, job: Option<String>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            job,
        }
    }

    /// Path of the history document for a source directory
    ///
    /// The document is keyed by the directory's final path component,
    /// optionally prefixed with the job name: `[job_]<name>_backup.json`.
    pub fn history_path(&self, directory: &Path) -> PathBuf {
        let dir_name = directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        let file_name = match &self.job {
            Some(job) => format!("{job}_{dir_name}_backup.json"),
            None => format!("{dir_name}_backup.json"),
        };
        self.snapshot_dir.join(file_name)
    }

    /// Load the history for a directory; missing documents yield an empty
    /// history so a first backup needs no special casing.
    pub fn load_history(&self, directory: &Path) -> MetaResult<BackupHistory> {
        let path = self.history_path(directory);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No prior backup history");
                return Ok(BackupHistory::new());
            }
            Err(e) => return Err(MetaError::Io { path, source: e }),
        };
        serde_json::from_slice(&data).map_err(|e| MetaError::Corrupt { path, source: e })
    }

    /// Persist the full history document for a directory
    pub fn save_history(&self, directory: &Path, history: &BackupHistory) -> MetaResult<()> {
        let path = self.history_path(directory);
        let data = serde_json::to_vec(history)?;
        std::fs::write(&path, data).map_err(|e| MetaError::Io { path, source: e })
    }

    /// Record the medium position for the most recent generation.
    ///
    /// This is the single post-write mutation a generation receives. The
    /// `reliable` flag is cleared when a transfer failure means the true
    /// device position is no longer known.
    pub fn record_position(
        &self,
        directory: &Path,
        position: u64,
        reliable: bool,
    ) -> MetaResult<()> {
        let mut history = self.load_history(directory)?;
        let last = history.last_mut().ok_or_else(|| MetaError::NoGeneration {
            directory: directory.to_path_buf(),
        })?;
        last.tape_position = Some(position);
        last.position_reliable = reliable;
        self.save_history(directory, &history)
    }
}

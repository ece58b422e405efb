//! Directory tree scanning
//!
//! Produces a point-in-time snapshot of a directory tree: every regular
//! file with its modification time and size, every symlink with its target
//! and whether it currently resolves. Symlinks are never followed, so
//! recursive link loops cannot occur.
//!
//! A scan never partially fails because of one bad entry. Files that
//! vanish mid-scan and unreadable link targets are logged as warnings and
//! the scan continues; only an unreadable scan root is an error.

use crate::error::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::warn;
use walkdir::WalkDir;

/// Recorded attributes of one filesystem entry
///
/// This is the unit of change detection: two snapshots of the same path
/// compare equal exactly when nothing relevant to backup has changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileState {
    /// Regular file: modification time (nanoseconds since epoch) and size
    File { mtime: i64, size: u64 },

    /// Symlink: target path and whether it currently resolves
    Symlink {
        target: Option<PathBuf>,
        valid: bool,
    },
}

/// A complete snapshot of one directory tree
pub type Snapshot = BTreeMap<PathBuf, FileState>;

/// Walk a directory tree and snapshot every file and symlink in it.
///
/// Directories themselves are not recorded; they are implied by the file
/// paths and recreated by the extraction tool on restore.
pub fn scan(directory: &Path) -> ScanResult<Snapshot> {
    if !directory.is_dir() {
        return Err(ScanError::RootUnreadable {
            path: directory.to_path_buf(),
            reason: "not a directory".into(),
        });
    }

    let mut snapshot = Snapshot::new();

    for entry in WalkDir::new(directory).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                // Subtree went away or became unreadable mid-scan
                warn!(error = %e, "Skipping unreadable entry during scan");
                continue;
            }
        };

        let file_type = entry.file_type();
        let path = entry.path();

        if file_type.is_symlink() {
            snapshot.insert(path.to_path_buf(), scan_symlink(path));
        } else if file_type.is_file() {
            match entry.metadata() {
                Ok(meta) => {
                    // Full timestamp resolution: a same-size rewrite within
                    // one second must still register as a change
                    let mtime = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_nanos() as i64)
                        .unwrap_or(0);
                    snapshot.insert(
                        path.to_path_buf(),
                        FileState::File {
                            mtime,
                            size: meta.len(),
                        },
                    );
                }
                Err(e) => {
                    // File disappeared between readdir and stat
                    warn!(path = %path.display(), error = %e, "File vanished during scan");
                }
            }
        }
        // Directories and special files are not part of the snapshot
    }

    Ok(snapshot)
}

/// Record a symlink's target and validity; unreadable targets become an
/// invalid entry rather than a scan failure.
fn scan_symlink(path: &Path) -> FileState {
    match std::fs::read_link(path) {
        Ok(target) => FileState::Symlink {
            // exists() follows the link, which is exactly the validity check
            valid: path.exists(),
            target: Some(target),
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Error reading symlink");
            FileState::Symlink {
                target: None,
                valid: false,
            }
        }
    }
}

//! Incremental change detection
//!
//! Decides what a backup pass needs to re-archive. The recorded history of
//! a directory is folded into one combined view (later generations override
//! earlier ones per path), then a fresh scan is diffed against that view.
//!
//! Deletions are deliberately not detected: a path present in history but
//! absent from the current tree is simply ignored. Pruning removed files
//! from tracked state is out of scope for this engine.

use crate::error::Result;
use crate::meta::{BackupGeneration, GenerationKind, MetadataStore};
use crate::scan::{self, FileState, Snapshot};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Outcome of preparing a backup pass for one directory
#[derive(Debug)]
pub enum Prepared {
    /// Incremental pass found nothing to archive
    NoChanges,

    /// A new generation was recorded; these files must be archived
    Generation(BackupGeneration),
}

/// Computes change sets and prepares new backup generations
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    store: MetadataStore,
    label: Option<String>,
    job: Option<String>,
}

impl ChangeDetector {
    pub fn new(store: MetadataStore, label: Option<String>, job: Option<String>) -> Self {
        Self { store, label, job }
    }

    /// Fold a history into the latest-known state per path.
    ///
    /// Later generations win: a file changed in generation 1 and again in
    /// generation 2 is represented by generation 2's attributes only.
    pub fn combined_state(history: &[BackupGeneration]) -> Snapshot {
        let mut combined = Snapshot::new();
        for generation in history {
            for (path, state) in &generation.files {
                combined.insert(path.clone(), state.clone());
            }
        }
        combined
    }

    /// Paths in `snapshot` that are new or differ from the combined history.
    ///
    /// A path counts as changed when it is absent from history, when file
    /// attributes (mtime, size) differ, or when symlink attributes (target,
    /// validity) differ. `FileState` equality covers all three cases,
    /// including a path switching between file and symlink.
    pub fn changed_files(
        snapshot: &Snapshot,
        history: &[BackupGeneration],
    ) -> BTreeSet<PathBuf> {
        let combined = Self::combined_state(history);
        snapshot
            .iter()
            .filter(|(path, state)| combined.get(*path) != Some(state))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Scan a directory, decide whether a backup is needed, and persist the
    /// new generation (without a tape position) when it is.
    ///
    /// A full pass replaces the stored history outright, resetting the
    /// baseline that subsequent incrementals diff against. An incremental
    /// pass appends a generation holding only the changed subset.
    pub fn prepare(&self, directory: &Path, incremental: bool) -> Result<Prepared> {
        let history = self.store.load_history(directory)?;
        let snapshot = scan::scan(directory)?;

        let generation = if incremental {
            let changed = Self::changed_files(&snapshot, &history);
            if changed.is_empty() {
                info!(directory = %directory.display(), "No changes, skipping backup");
                return Ok(Prepared::NoChanges);
            }
            debug!(
                directory = %directory.display(),
                changed = changed.len(),
                total = snapshot.len(),
                "Incremental change set computed"
            );

            let files: Snapshot = snapshot
                .into_iter()
                .filter(|(path, _)| changed.contains(path))
                .collect();
            BackupGeneration::new(
                GenerationKind::Incremental,
                self.label.clone(),
                self.job.clone(),
                files,
            )
        } else {
            BackupGeneration::new(
                GenerationKind::Full,
                self.label.clone(),
                self.job.clone(),
                snapshot,
            )
        };

        let new_history = if incremental {
            let mut h = history;
            h.push(generation.clone());
            h
        } else {
            // Full backup resets the baseline
            vec![generation.clone()]
        };
        self.store.save_history(directory, &new_history)?;

        Ok(Prepared::Generation(generation))
    }
}

//! Backup pipeline orchestration
//!
//! Drives the full backup of an ordered list of source directories:
//!
//! ```text
//! directories ──> producer pool ──> ordering buffer ──> tape writer
//!                 (scan + diff +     (strict input       (position +
//!                  tar, bounded)      order)              mbuffer/dd)
//! ```
//!
//! The staged strategies (`tar`, `dd`) run the three stages concurrently.
//! The direct strategy bypasses staging entirely and processes directories
//! strictly sequentially, streaming tar output through the relay; with one
//! active stream there is nothing to reorder.
//!
//! All pipeline state is owned by one [`Pipeline`] value - there are no
//! process-wide globals, and cancellation is an explicit token threaded
//! through every stage.

pub mod buffer;
mod producer;
mod writer;

pub use buffer::{OrderingBuffer, ReadyArchive};

use crate::changes::{ChangeDetector, Prepared};
use crate::config::{BackupConfig, Strategy};
use crate::device::{MtTapeControl, TapeControl};
use crate::error::{BackupError, Result};
use crate::meta::MetadataStore;
use crate::tools::{Archiver, DdCopy, MbufferRelay, TarArchiver, Transfer};
use producer::{Producer, ProducerContext};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use writer::{TapeWriter, WriterContext, WriterStats};

/// A source directory with its position in the original input list.
///
/// The index defines the order archives must reach the device.
#[derive(Debug, Clone)]
pub struct SourceDirectory {
    pub index: u32,
    pub path: PathBuf,
}

/// Final result for one source directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirOutcome {
    /// Archive written to tape at this file-marker position
    Written { position: u64 },

    /// Incremental pass found no changes
    Skipped,

    /// Archive generation or transfer failed
    Failed { reason: String },
}

impl DirOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, DirOutcome::Failed { .. })
    }
}

/// One-outcome-per-directory table shared by producers and the writer.
///
/// Exactly one of the stages resolves each slot: producers record skips
/// and generation failures, the writer records writes and transfer
/// failures.
pub(crate) struct OutcomeTable {
    slots: Mutex<Vec<Option<DirOutcome>>>,
}

impl OutcomeTable {
    fn new(count: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; count]),
        }
    }

    fn set(&self, index: u32, outcome: DirOutcome) {
        let mut slots = self.slots.lock().expect("outcome table poisoned");
        let slot = &mut slots[index as usize];
        debug_assert!(slot.is_none(), "outcome resolved twice for index {index}");
        *slot = Some(outcome);
    }

    pub fn set_written(&self, index: u32, position: u64) {
        self.set(index, DirOutcome::Written { position });
    }

    pub fn set_skipped(&self, index: u32) {
        self.set(index, DirOutcome::Skipped);
    }

    pub fn set_failed(&self, index: u32, reason: impl Into<String>) {
        self.set(
            index,
            DirOutcome::Failed {
                reason: reason.into(),
            },
        );
    }

    fn into_outcomes(self) -> Vec<Option<DirOutcome>> {
        self.slots.into_inner().expect("outcome table poisoned")
    }
}

/// Result of a completed (or interrupted) pipeline run
#[derive(Debug)]
pub struct RunReport {
    /// Per-directory outcomes, in input order
    pub outcomes: Vec<(PathBuf, DirOutcome)>,

    /// Total archive bytes handed to the transfer tool (staged strategies)
    pub bytes_written: u64,

    /// Wall-clock duration of the run
    pub duration: Duration,

    /// Whether the run finished without interruption
    pub completed: bool,
}

impl RunReport {
    pub fn written_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DirOutcome::Written { .. }))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DirOutcome::Skipped))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_failed()).count()
    }

    /// True when any directory failed - drives the process exit status
    pub fn any_failed(&self) -> bool {
        self.failed_count() > 0
    }
}

/// The backup pipeline orchestrator
pub struct Pipeline {
    config: Arc<BackupConfig>,
    archiver: Arc<dyn Archiver>,
    transfer: Arc<dyn Transfer>,
    device: Arc<dyn TapeControl>,
    cancelled: Arc<AtomicBool>,
}

impl Pipeline {
    /// Build a pipeline with the production collaborators selected by the
    /// configured strategy.
    pub fn new(config: BackupConfig) -> Self {
        let transfer: Arc<dyn Transfer> = match config.strategy {
            Strategy::Dd => Arc::new(DdCopy {
                block_size: config.block_size,
            }),
            Strategy::Direct | Strategy::Tar => Arc::new(MbufferRelay {
                buffer_gib: config.buffer_gib,
                fill_percent: config.fill_percent,
                block_size: config.block_size,
            }),
        };
        let device = Arc::new(MtTapeControl::new(config.device_path.clone()));

        Self::with_collaborators(config, Arc::new(TarArchiver), transfer, device)
    }

    /// Build a pipeline with explicit collaborators (tests inject fakes here)
    pub fn with_collaborators(
        config: BackupConfig,
        archiver: Arc<dyn Archiver>,
        transfer: Arc<dyn Transfer>,
        device: Arc<dyn TapeControl>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            archiver,
            transfer,
            device,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancellation token; flipping it stops the pipeline cooperatively
    /// (signal handlers store `true` here).
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn metadata_store(&self) -> MetadataStore {
        MetadataStore::new(self.config.snapshot_dir.clone(), self.config.job.clone())
    }

    fn change_detector(&self) -> ChangeDetector {
        ChangeDetector::new(
            self.metadata_store(),
            self.config.label.clone(),
            self.config.job.clone(),
        )
    }

    /// Run a backup over the given directories, in order.
    pub fn run(&self, directories: &[PathBuf]) -> Result<RunReport> {
        self.config.validate_directories(directories)?;

        let dirs: Vec<SourceDirectory> = directories
            .iter()
            .enumerate()
            .map(|(index, path)| SourceDirectory {
                index: index as u32,
                path: path.clone(),
            })
            .collect();

        info!(
            directories = dirs.len(),
            strategy = %self.config.strategy,
            incremental = self.config.incremental,
            device = %self.config.device_path.display(),
            "Starting backup run"
        );

        if self.config.strategy.is_staged() {
            self.run_staged(dirs)
        } else {
            self.run_direct(dirs)
        }
    }

    /// Staged strategies: bounded producer pool, ordering buffer, one writer
    fn run_staged(&self, dirs: Vec<SourceDirectory>) -> Result<RunReport> {
        let start = Instant::now();
        let dirs = Arc::new(dirs);
        let buffer = Arc::new(OrderingBuffer::new(
            dirs.len() as u32,
            Arc::clone(&self.cancelled),
        ));
        let outcomes = Arc::new(OutcomeTable::new(dirs.len()));
        let stats = Arc::new(WriterStats::default());

        // Fixed work queue: every directory is enqueued up front, then the
        // sender side closes so workers drain and exit
        let (work_tx, work_rx) = crossbeam_channel::bounded(dirs.len());
        for dir in dirs.iter() {
            work_tx
                .send(dir.clone())
                .map_err(|_| BackupError::ChannelClosed)?;
        }
        drop(work_tx);

        let ctx = Arc::new(ProducerContext {
            config: Arc::clone(&self.config),
            detector: self.change_detector(),
            archiver: Arc::clone(&self.archiver),
            buffer: Arc::clone(&buffer),
            outcomes: Arc::clone(&outcomes),
            cancelled: Arc::clone(&self.cancelled),
        });

        let pool_size = self.config.max_concurrent_tars.min(dirs.len());
        let mut producers = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            producers.push(Producer::spawn(id, work_rx.clone(), Arc::clone(&ctx))?);
        }
        drop(work_rx);
        debug!(count = pool_size, "Producer pool spawned");

        let tape_writer = TapeWriter::spawn(WriterContext {
            config: Arc::clone(&self.config),
            dirs: Arc::clone(&dirs),
            buffer: Arc::clone(&buffer),
            transfer: Arc::clone(&self.transfer),
            device: Arc::clone(&self.device),
            store: self.metadata_store(),
            outcomes: Arc::clone(&outcomes),
            stats: Arc::clone(&stats),
        })?;

        for producer in producers {
            if let Err(e) = producer.join() {
                warn!(error = %e, "Producer failed to join cleanly");
            }
        }
        drop(ctx);
        buffer.producers_finished();

        if let Err(e) = tape_writer.join() {
            warn!(error = %e, "Writer failed to join cleanly");
        }

        let completed = !self.cancelled.load(Ordering::SeqCst);
        if !completed {
            self.cleanup_archives(&buffer);
        }

        let outcomes = Arc::try_unwrap(outcomes)
            .map_err(|_| BackupError::ChannelClosed)?
            .into_outcomes();
        let report = assemble_report(
            &dirs,
            outcomes,
            stats.bytes_written.load(Ordering::Relaxed),
            start.elapsed(),
            completed,
        );

        info!(
            written = report.written_count(),
            skipped = report.skipped_count(),
            failed = report.failed_count(),
            duration_secs = report.duration.as_secs(),
            completed,
            "Backup run finished"
        );
        Ok(report)
    }

    /// Direct strategy: one directory at a time, tar streamed straight
    /// through the relay. Position is recorded immediately before each
    /// stream starts.
    fn run_direct(&self, dirs: Vec<SourceDirectory>) -> Result<RunReport> {
        let start = Instant::now();
        let detector = self.change_detector();
        let store = self.metadata_store();
        let mut outcomes: Vec<Option<DirOutcome>> = vec![None; dirs.len()];

        for dir in &dirs {
            if self.cancelled.load(Ordering::Relaxed) {
                outcomes[dir.index as usize] = Some(DirOutcome::Failed {
                    reason: "interrupted".into(),
                });
                continue;
            }
            outcomes[dir.index as usize] = Some(self.stream_directory(dir, &detector, &store));
        }

        let completed = !self.cancelled.load(Ordering::SeqCst);
        let report = assemble_report(&dirs, outcomes, 0, start.elapsed(), completed);
        info!(
            written = report.written_count(),
            skipped = report.skipped_count(),
            failed = report.failed_count(),
            duration_secs = report.duration.as_secs(),
            completed,
            "Backup run finished"
        );
        Ok(report)
    }

    /// Stream one directory's archive to the device (direct strategy)
    fn stream_directory(
        &self,
        dir: &SourceDirectory,
        detector: &ChangeDetector,
        store: &MetadataStore,
    ) -> DirOutcome {
        let generation = match detector.prepare(&dir.path, self.config.incremental) {
            Ok(Prepared::NoChanges) => return DirOutcome::Skipped,
            Ok(Prepared::Generation(generation)) => generation,
            Err(e) => {
                warn!(directory = %dir.path.display(), error = %e, "Backup preparation failed");
                return DirOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let file_list = match producer::write_file_list(&generation, &self.config.staging_dir) {
            Ok(list) => list,
            Err(e) => {
                return DirOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        let position = match self.device.current_position() {
            Ok(p) => p,
            Err(e) => {
                warn!(directory = %dir.path.display(), error = %e, "Cannot read tape position");
                return DirOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };
        if let Err(e) = store.record_position(&dir.path, position, true) {
            return DirOutcome::Failed {
                reason: e.to_string(),
            };
        }

        info!(
            directory = %dir.path.display(),
            position,
            files = generation.files.len(),
            "Streaming directory to tape"
        );

        let stream = match self
            .archiver
            .stream(file_list.path(), self.config.block_size)
        {
            Ok(stream) => stream,
            Err(e) => {
                return DirOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        match stream.pipe_to(self.transfer.as_ref(), &self.config.device_path) {
            Ok(()) => DirOutcome::Written { position },
            Err(e) => {
                warn!(
                    directory = %dir.path.display(),
                    error = %e,
                    "Stream transfer failed; recorded position is unreliable"
                );
                if let Err(me) = store.record_position(&dir.path, position, false) {
                    warn!(directory = %dir.path.display(), error = %me, "Failed to flag unreliable position");
                }
                DirOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Remove every staged archive still tracked anywhere in the buffer.
    ///
    /// Runs on cancellation so an interrupted run leaves no partial
    /// archives on the staging disk.
    fn cleanup_archives(&self, buffer: &OrderingBuffer) {
        for archive in buffer.outstanding_archives() {
            match std::fs::remove_file(&archive) {
                Ok(()) => debug!(archive = %archive.display(), "Removed staged archive"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(archive = %archive.display(), error = %e, "Failed to remove staged archive")
                }
            }
        }
    }
}

/// Pair outcomes with their directories; unresolved slots (cancellation
/// tear-down) become failures so the report always covers every input.
fn assemble_report(
    dirs: &[SourceDirectory],
    outcomes: Vec<Option<DirOutcome>>,
    bytes_written: u64,
    duration: Duration,
    completed: bool,
) -> RunReport {
    let outcomes = dirs
        .iter()
        .zip(outcomes)
        .map(|(dir, outcome)| {
            (
                dir.path.clone(),
                outcome.unwrap_or(DirOutcome::Failed {
                    reason: "interrupted".into(),
                }),
            )
        })
        .collect();

    RunReport {
        outcomes,
        bytes_written,
        duration,
        completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(index: u32, path: &str) -> SourceDirectory {
        SourceDirectory {
            index,
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn test_outcome_table_resolves_each_slot() {
        let table = OutcomeTable::new(3);
        table.set_written(0, 5);
        table.set_skipped(1);
        table.set_failed(2, "tar exited 2");

        let outcomes = table.into_outcomes();
        assert_eq!(outcomes[0], Some(DirOutcome::Written { position: 5 }));
        assert_eq!(outcomes[1], Some(DirOutcome::Skipped));
        assert!(outcomes[2].as_ref().unwrap().is_failed());
    }

    #[test]
    fn test_report_counts() {
        let dirs = vec![dir(0, "/d/a"), dir(1, "/d/b"), dir(2, "/d/c")];
        let outcomes = vec![
            Some(DirOutcome::Written { position: 1 }),
            Some(DirOutcome::Skipped),
            None, // unresolved slot becomes a failure
        ];
        let report = assemble_report(&dirs, outcomes, 100, Duration::from_secs(1), false);

        assert_eq!(report.written_count(), 1);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.failed_count(), 1);
        assert!(report.any_failed());
        assert!(!report.completed);
    }
}

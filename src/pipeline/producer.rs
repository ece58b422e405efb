//! Archive producer workers
//!
//! A fixed pool of workers drains source directories from a bounded work
//! queue. Each worker decides via the change detector whether a directory
//! needs archiving at all, stages the archive with the external archiving
//! tool when it does, and reports the result to the ordering buffer.
//!
//! The pool size is the concurrency bound: at most `max_concurrent_tars`
//! archives are ever being generated at once, with no per-directory thread
//! spawning or semaphore juggling.
//!
//! Every directory resolves its ordering slot exactly once on every path
//! through this module: `archive_ready` on success, `retire` on skip,
//! failure, or cancellation. That guarantee is what makes a writer stall
//! structurally impossible.

use crate::changes::{ChangeDetector, Prepared};
use crate::config::BackupConfig;
use crate::error::{BackupError, WorkerJoinError};
use crate::meta::BackupGeneration;
use crate::pipeline::buffer::OrderingBuffer;
use crate::pipeline::{OutcomeTable, SourceDirectory};
use crate::tools::Archiver;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Everything a producer worker needs, shared across the pool
pub(crate) struct ProducerContext {
    pub config: Arc<BackupConfig>,
    pub detector: ChangeDetector,
    pub archiver: Arc<dyn Archiver>,
    pub buffer: Arc<OrderingBuffer>,
    pub outcomes: Arc<OutcomeTable>,
    pub cancelled: Arc<AtomicBool>,
}

/// A producer worker thread
pub(crate) struct Producer {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Producer {
    /// Spawn a worker consuming from the shared work queue
    pub fn spawn(
        id: usize,
        work_rx: crossbeam_channel::Receiver<SourceDirectory>,
        ctx: Arc<ProducerContext>,
    ) -> Result<Self, BackupError> {
        let handle = thread::Builder::new()
            .name(format!("producer-{id}"))
            .spawn(move || producer_loop(id, work_rx, ctx))
            .map_err(BackupError::Io)?;

        Ok(Self {
            id,
            handle: Some(handle),
        })
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), WorkerJoinError> {
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| WorkerJoinError { id: self.id })?;
        }
        Ok(())
    }
}

/// Main worker loop: drain the queue until it closes
fn producer_loop(
    id: usize,
    work_rx: crossbeam_channel::Receiver<SourceDirectory>,
    ctx: Arc<ProducerContext>,
) {
    debug!(producer = id, "Producer starting");

    while let Ok(dir) = work_rx.recv() {
        if ctx.cancelled.load(Ordering::Relaxed) {
            // Keep the ordering sequence consistent even while bailing out
            ctx.buffer.retire(dir.index);
            ctx.outcomes.set_failed(dir.index, "interrupted");
            continue;
        }

        process_directory(id, &dir, &ctx);
    }

    debug!(producer = id, "Producer finished");
}

/// Resolve one source directory: skip, stage an archive, or fail
fn process_directory(id: usize, dir: &SourceDirectory, ctx: &ProducerContext) {
    match ctx.detector.prepare(&dir.path, ctx.config.incremental) {
        Ok(Prepared::NoChanges) => {
            ctx.outcomes.set_skipped(dir.index);
            ctx.buffer.retire(dir.index);
        }
        Ok(Prepared::Generation(generation)) => {
            match stage_archive(dir, &generation, ctx) {
                Ok(archive) => {
                    info!(
                        producer = id,
                        directory = %dir.path.display(),
                        archive = %archive.display(),
                        files = generation.files.len(),
                        "Archive staged"
                    );
                    ctx.buffer.archive_ready(dir.index, archive);
                }
                Err(e) => {
                    // One bad directory never aborts its siblings
                    warn!(
                        producer = id,
                        directory = %dir.path.display(),
                        error = %e,
                        "Archive generation failed"
                    );
                    ctx.outcomes.set_failed(dir.index, e.to_string());
                    ctx.buffer.retire(dir.index);
                }
            }
        }
        Err(e) => {
            warn!(
                producer = id,
                directory = %dir.path.display(),
                error = %e,
                "Backup preparation failed"
            );
            ctx.outcomes.set_failed(dir.index, e.to_string());
            ctx.buffer.retire(dir.index);
        }
    }
}

/// Run the archiving tool against the generation's file list
fn stage_archive(
    dir: &SourceDirectory,
    generation: &BackupGeneration,
    ctx: &ProducerContext,
) -> Result<PathBuf, BackupError> {
    let file_list = write_file_list(generation, &ctx.config.staging_dir)?;
    let archive = staged_archive_path(&ctx.config.staging_dir, dir);

    if let Err(e) = ctx
        .archiver
        .create(&archive, file_list.path(), ctx.config.block_size)
    {
        // The tool may have left a partial archive behind
        if archive.exists() {
            if let Err(rm) = std::fs::remove_file(&archive) {
                warn!(archive = %archive.display(), error = %rm, "Failed to remove partial archive");
            }
        }
        return Err(e.into());
    }

    Ok(archive)
}

/// Write the generation's file paths to a temp list for `tar -T`.
///
/// The returned handle keeps the file alive; it is deleted on drop once the
/// archiving tool has consumed it.
pub(crate) fn write_file_list(
    generation: &BackupGeneration,
    staging_dir: &std::path::Path,
) -> Result<tempfile::NamedTempFile, BackupError> {
    let mut list = tempfile::NamedTempFile::new_in(staging_dir)?;
    for path in generation.files.keys() {
        writeln!(list, "{}", path.display())?;
    }
    list.flush()?;
    Ok(list)
}

/// Staged archive path: index prefix keeps same-named directories apart
/// and makes staging-dir listings read in write order.
fn staged_archive_path(staging_dir: &std::path::Path, dir: &SourceDirectory) -> PathBuf {
    let name = dir
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    staging_dir.join(format!("{:04}_{}.tar", dir.index, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::GenerationKind;
    use crate::scan::{FileState, Snapshot};

    #[test]
    fn test_staged_archive_path_includes_index() {
        let dir = SourceDirectory {
            index: 7,
            path: PathBuf::from("/data/projects"),
        };
        let path = staged_archive_path(std::path::Path::new("/stage"), &dir);
        assert_eq!(path, PathBuf::from("/stage/0007_projects.tar"));
    }

    #[test]
    fn test_file_list_contains_all_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let mut files = Snapshot::new();
        files.insert(
            PathBuf::from("/data/a/one.txt"),
            FileState::File { mtime: 1, size: 1 },
        );
        files.insert(
            PathBuf::from("/data/a/two.txt"),
            FileState::File { mtime: 2, size: 2 },
        );
        let generation = BackupGeneration::new(GenerationKind::Full, None, None, files);

        let list = write_file_list(&generation, tmp.path()).unwrap();
        let contents = std::fs::read_to_string(list.path()).unwrap();
        assert_eq!(contents, "/data/a/one.txt\n/data/a/two.txt\n");
    }
}

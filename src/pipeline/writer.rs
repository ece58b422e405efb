//! Tape writer - the single serial consumer
//!
//! One thread drains the ordering buffer and streams each archive to the
//! device through the configured transfer tool. Device exclusivity is
//! structural: no other thread ever invokes a transfer.
//!
//! Immediately before each transfer the writer queries the drive for its
//! current file-marker position and persists it into the directory's
//! newest generation. That position is what restores seek to, so it must
//! reflect the medium state at write time, never at generation time.

use crate::config::BackupConfig;
use crate::device::TapeControl;
use crate::error::WorkerJoinError;
use crate::meta::MetadataStore;
use crate::pipeline::buffer::OrderingBuffer;
use crate::pipeline::{OutcomeTable, SourceDirectory};
use crate::tools::Transfer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Counters the writer exposes for the final summary
#[derive(Debug, Default)]
pub(crate) struct WriterStats {
    /// Archives written to the device
    pub archives_written: AtomicU64,

    /// Total archive bytes handed to the transfer tool
    pub bytes_written: AtomicU64,
}

/// Everything the writer thread needs
pub(crate) struct WriterContext {
    pub config: Arc<BackupConfig>,
    pub dirs: Arc<Vec<SourceDirectory>>,
    pub buffer: Arc<OrderingBuffer>,
    pub transfer: Arc<dyn Transfer>,
    pub device: Arc<dyn TapeControl>,
    pub store: MetadataStore,
    pub outcomes: Arc<OutcomeTable>,
    pub stats: Arc<WriterStats>,
}

/// The writer thread wrapper
pub(crate) struct TapeWriter {
    handle: Option<JoinHandle<()>>,
}

impl TapeWriter {
    pub fn spawn(ctx: WriterContext) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name("tape-writer".into())
            .spawn(move || writer_loop(ctx))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    pub fn join(mut self) -> Result<(), WorkerJoinError> {
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| WorkerJoinError { id: 0 })?;
        }
        Ok(())
    }
}

/// Drain the ordering buffer until all producers are done and every
/// released archive has been handled.
fn writer_loop(ctx: WriterContext) {
    while let Some(ready) = ctx.buffer.next_to_write() {
        let dir = &ctx.dirs[ready.index as usize];
        write_archive(&ctx, dir, &ready.archive);
    }
    info!(
        archives = ctx.stats.archives_written.load(Ordering::Relaxed),
        bytes = ctx.stats.bytes_written.load(Ordering::Relaxed),
        "Tape writer drained"
    );
}

/// Write one archive: record position, transfer, clean up
fn write_archive(ctx: &WriterContext, dir: &SourceDirectory, archive: &std::path::Path) {
    // Position is read here, at write time, not when the archive was
    // generated - producers running ahead must not influence it
    let position = match ctx.device.current_position() {
        Ok(p) => p,
        Err(e) => {
            warn!(
                directory = %dir.path.display(),
                error = %e,
                "Cannot read tape position; not writing this archive"
            );
            ctx.outcomes.set_failed(dir.index, e.to_string());
            return;
        }
    };

    if let Err(e) = ctx.store.record_position(&dir.path, position, true) {
        warn!(
            directory = %dir.path.display(),
            error = %e,
            "Cannot persist tape position; not writing this archive"
        );
        ctx.outcomes.set_failed(dir.index, e.to_string());
        return;
    }

    let bytes = std::fs::metadata(archive).map(|m| m.len()).unwrap_or(0);
    info!(
        directory = %dir.path.display(),
        archive = %archive.display(),
        position,
        "Writing archive to tape"
    );

    match ctx
        .transfer
        .write_archive(archive, &ctx.config.device_path)
    {
        Ok(()) => {
            if let Err(e) = std::fs::remove_file(archive) {
                warn!(archive = %archive.display(), error = %e, "Failed to remove written archive");
            }
            ctx.stats.archives_written.fetch_add(1, Ordering::Relaxed);
            ctx.stats.bytes_written.fetch_add(bytes, Ordering::Relaxed);
            ctx.outcomes.set_written(dir.index, position);
        }
        Err(e) => {
            // The drive's true position is unknown after a failed transfer;
            // keep going with later archives but flag this generation so a
            // restore does not trust a bad seek target. The staged archive
            // stays on disk for the operator.
            warn!(
                directory = %dir.path.display(),
                archive = %archive.display(),
                error = %e,
                "Transfer failed; recorded position is unreliable"
            );
            if let Err(me) = ctx.store.record_position(&dir.path, position, false) {
                warn!(directory = %dir.path.display(), error = %me, "Failed to flag unreliable position");
            }
            ctx.outcomes.set_failed(dir.index, e.to_string());
        }
    }
}

//! End-to-end pipeline tests
//!
//! These run the real pipeline against fake external tools: the archiver,
//! transfer, and tape drive are in-process fakes with controllable timing
//! and failure injection, so no tape hardware (or tar/mbuffer binaries) is
//! needed. The source trees and history snapshots are real files in temp
//! directories.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tapeback::config::{BackupConfig, Strategy};
use tapeback::device::TapeControl;
use tapeback::error::{DeviceResult, ToolError, ToolResult};
use tapeback::meta::MetadataStore;
use tapeback::pipeline::{DirOutcome, Pipeline};
use tapeback::tools::{ArchiveStream, Archiver, Transfer};
use tempfile::TempDir;

/// Fake archiver: writes a small file where the archive should go.
/// Per-directory delays and failures are keyed by source directory name.
#[derive(Default)]
struct FakeArchiver {
    active: AtomicUsize,
    max_active: AtomicUsize,
    delays: Mutex<HashMap<String, Duration>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeArchiver {
    fn delay(&self, dir_name: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(dir_name.to_string(), delay);
    }

    fn fail_for(&self, dir_name: &str) {
        self.failing.lock().unwrap().insert(dir_name.to_string());
    }
}

impl Archiver for FakeArchiver {
    fn create(&self, archive: &Path, _file_list: &Path, _block_size: u32) -> ToolResult<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let name = archive.file_name().unwrap().to_string_lossy().into_owned();
        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| name.contains(k.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let result = if self.failing.lock().unwrap().iter().any(|k| name.contains(k)) {
            Err(ToolError::ArchiveFailed {
                archive: archive.to_path_buf(),
                code: Some(2),
            })
        } else {
            std::fs::write(archive, b"fake archive bytes").map_err(ToolError::from)
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn stream(&self, _file_list: &Path, _block_size: u32) -> ToolResult<ArchiveStream> {
        Ok(ArchiveStream::new(
            Box::new(std::io::Cursor::new(b"fake archive bytes".to_vec())),
            Box::new(|| Ok(())),
        ))
    }
}

/// Fake transfer: records device writes in order and advances the shared
/// position counter by one file marker per successful write, the way a
/// real drive does.
#[derive(Default)]
struct FakeTransfer {
    order: Mutex<Vec<String>>,
    position: Arc<AtomicU64>,
    failing: Mutex<HashSet<String>>,
}

impl FakeTransfer {
    fn with_position(position: Arc<AtomicU64>) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    fn fail_for(&self, dir_name: &str) {
        self.failing.lock().unwrap().insert(dir_name.to_string());
    }

    fn written(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

impl Transfer for FakeTransfer {
    fn write_archive(&self, archive: &Path, _device: &Path) -> ToolResult<()> {
        let name = archive.file_name().unwrap().to_string_lossy().into_owned();
        if self.failing.lock().unwrap().iter().any(|k| name.contains(k)) {
            return Err(ToolError::TransferFailed {
                archive: archive.to_path_buf(),
                code: Some(1),
            });
        }
        self.order.lock().unwrap().push(name);
        self.position.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_stream(&self, mut input: Box<dyn Read + Send>, _device: &Path) -> ToolResult<()> {
        let mut sink = Vec::new();
        input.read_to_end(&mut sink)?;
        self.order.lock().unwrap().push("<stream>".to_string());
        self.position.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fake drive: position comes from the counter the transfer advances
struct FakeTape {
    position: Arc<AtomicU64>,
}

impl TapeControl for FakeTape {
    fn status(&self) -> DeviceResult<String> {
        Ok(format!(
            "File number={}, block number=0, partition=0.\nONLINE",
            self.position.load(Ordering::SeqCst)
        ))
    }

    fn rewind(&self) -> DeviceResult<()> {
        self.position.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn seek_block(&self, _block: u64) -> DeviceResult<()> {
        Ok(())
    }

    fn skip_file_markers(&self, _count: i64) -> DeviceResult<()> {
        Ok(())
    }

    fn current_position(&self) -> DeviceResult<u64> {
        Ok(self.position.load(Ordering::SeqCst))
    }
}

/// Temp workspace with source directories, staging, and snapshot storage
struct Fixture {
    tmp: TempDir,
    dirs: Vec<PathBuf>,
}

impl Fixture {
    fn new(dir_names: &[&str]) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("staging")).unwrap();
        std::fs::create_dir(tmp.path().join("snapshots")).unwrap();

        let dirs = dir_names
            .iter()
            .map(|name| {
                let dir = tmp.path().join("src").join(name);
                std::fs::create_dir_all(&dir).unwrap();
                std::fs::write(dir.join("data.txt"), format!("contents of {name}")).unwrap();
                dir
            })
            .collect();

        Self { tmp, dirs }
    }

    fn config(&self, strategy: Strategy, incremental: bool, concurrency: usize) -> BackupConfig {
        BackupConfig {
            device_path: self.tmp.path().join("fake-tape"),
            block_size: 524_288,
            staging_dir: self.tmp.path().join("staging"),
            snapshot_dir: self.tmp.path().join("snapshots"),
            label: Some("LTO9-001".into()),
            job: None,
            strategy,
            incremental,
            max_concurrent_tars: concurrency,
            buffer_gib: 1,
            fill_percent: 40,
            show_progress: false,
            verbose: false,
        }
    }

    fn store(&self) -> MetadataStore {
        MetadataStore::new(self.tmp.path().join("snapshots"), None)
    }

    fn staged_archives(&self) -> Vec<PathBuf> {
        let mut archives: Vec<PathBuf> = std::fs::read_dir(self.tmp.path().join("staging"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "tar"))
            .collect();
        archives.sort();
        archives
    }
}

struct Harness {
    fixture: Fixture,
    archiver: Arc<FakeArchiver>,
    transfer: Arc<FakeTransfer>,
    position: Arc<AtomicU64>,
}

impl Harness {
    fn new(dir_names: &[&str]) -> Self {
        let position = Arc::new(AtomicU64::new(0));
        Self {
            fixture: Fixture::new(dir_names),
            archiver: Arc::new(FakeArchiver::default()),
            transfer: Arc::new(FakeTransfer::with_position(Arc::clone(&position))),
            position,
        }
    }

    fn pipeline(&self, strategy: Strategy, incremental: bool, concurrency: usize) -> Pipeline {
        Pipeline::with_collaborators(
            self.fixture.config(strategy, incremental, concurrency),
            Arc::clone(&self.archiver) as Arc<dyn Archiver>,
            Arc::clone(&self.transfer) as Arc<dyn Transfer>,
            Arc::new(FakeTape {
                position: Arc::clone(&self.position),
            }),
        )
    }
}

#[test]
fn test_archives_reach_device_in_input_order() {
    let h = Harness::new(&["alpha", "bravo", "charlie"]);

    // The first directory takes longest, so producers finish in reverse
    // input order; the device must still see input order
    h.archiver.delay("alpha", Duration::from_millis(60));
    h.archiver.delay("bravo", Duration::from_millis(30));

    let pipeline = h.pipeline(Strategy::Tar, false, 3);
    let report = pipeline.run(&h.fixture.dirs).unwrap();

    assert!(report.completed);
    assert_eq!(report.written_count(), 3);
    assert_eq!(
        h.transfer.written(),
        vec!["0000_alpha.tar", "0001_bravo.tar", "0002_charlie.tar"]
    );
}

#[test]
fn test_positions_are_write_time_and_strictly_increasing() {
    let h = Harness::new(&["alpha", "bravo", "charlie"]);
    h.archiver.delay("alpha", Duration::from_millis(40));

    let pipeline = h.pipeline(Strategy::Tar, false, 3);
    let report = pipeline.run(&h.fixture.dirs).unwrap();

    // One file marker per archive, in order, starting at the initial
    // drive position
    let positions: Vec<u64> = report
        .outcomes
        .iter()
        .map(|(_, o)| match o {
            DirOutcome::Written { position } => *position,
            other => panic!("expected written outcome, got {other:?}"),
        })
        .collect();
    assert_eq!(positions, vec![0, 1, 2]);

    // The same positions are persisted in each directory's history
    let store = h.fixture.store();
    for (dir, expected) in h.fixture.dirs.iter().zip(&positions) {
        let history = store.load_history(dir).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tape_position, Some(*expected));
        assert!(history[0].position_reliable);
    }
}

#[test]
fn test_concurrency_bound_is_respected() {
    let names = ["a1", "a2", "a3", "a4", "a5", "a6"];
    let h = Harness::new(&names);
    for name in names {
        h.archiver.delay(name, Duration::from_millis(20));
    }

    let pipeline = h.pipeline(Strategy::Tar, false, 2);
    let report = pipeline.run(&h.fixture.dirs).unwrap();

    assert_eq!(report.written_count(), 6);
    assert!(
        h.archiver.max_active.load(Ordering::SeqCst) <= 2,
        "more archives in flight than the configured bound"
    );
}

#[test]
fn test_failed_archive_does_not_block_later_directories() {
    let h = Harness::new(&["alpha", "bravo", "charlie"]);
    h.archiver.fail_for("bravo");

    let pipeline = h.pipeline(Strategy::Tar, false, 2);
    let report = pipeline.run(&h.fixture.dirs).unwrap();

    assert!(report.completed);
    assert_eq!(report.written_count(), 2);
    assert_eq!(report.failed_count(), 1);
    assert!(report.outcomes[1].1.is_failed());
    assert_eq!(
        h.transfer.written(),
        vec!["0000_alpha.tar", "0002_charlie.tar"]
    );
}

#[test]
fn test_unchanged_directories_are_skipped_without_stalling() {
    let h = Harness::new(&["alpha", "bravo", "charlie"]);

    // First incremental pass archives everything (no prior history)
    let report = h.pipeline(Strategy::Tar, true, 2).run(&h.fixture.dirs).unwrap();
    assert_eq!(report.written_count(), 3);

    // Nothing changed: everything skips, nothing reaches the device
    let report = h.pipeline(Strategy::Tar, true, 2).run(&h.fixture.dirs).unwrap();
    assert_eq!(report.skipped_count(), 3);
    assert_eq!(report.written_count(), 0);
    assert_eq!(h.transfer.written().len(), 3);

    // Change only the last directory: the two skipped slots ahead of it
    // must not stall its write
    std::fs::write(
        h.fixture.dirs[2].join("data.txt"),
        "contents of charlie, revised and longer",
    )
    .unwrap();
    let report = h.pipeline(Strategy::Tar, true, 2).run(&h.fixture.dirs).unwrap();
    assert_eq!(report.skipped_count(), 2);
    assert_eq!(report.written_count(), 1);
    assert_eq!(h.transfer.written().last().unwrap(), "0002_charlie.tar");
}

#[test]
fn test_failed_transfer_flags_unreliable_position_and_keeps_archive() {
    let h = Harness::new(&["alpha", "bravo", "charlie"]);
    h.transfer.fail_for("bravo");

    let pipeline = h.pipeline(Strategy::Tar, false, 2);
    let report = pipeline.run(&h.fixture.dirs).unwrap();

    assert_eq!(report.written_count(), 2);
    assert_eq!(report.failed_count(), 1);

    // The failed directory's generation keeps its position but is flagged
    let history = h.fixture.store().load_history(&h.fixture.dirs[1]).unwrap();
    assert_eq!(history[0].tape_position, Some(1));
    assert!(!history[0].position_reliable);

    // Later directories still reach the device
    assert_eq!(
        h.transfer.written(),
        vec!["0000_alpha.tar", "0002_charlie.tar"]
    );

    // The failed archive stays on disk for the operator; written ones are
    // cleaned up
    assert_eq!(
        h.fixture.staged_archives(),
        vec![h.fixture.tmp.path().join("staging").join("0001_bravo.tar")]
    );
}

#[test]
fn test_staging_is_empty_after_clean_run() {
    let h = Harness::new(&["alpha", "bravo"]);

    let report = h.pipeline(Strategy::Tar, false, 2).run(&h.fixture.dirs).unwrap();

    assert_eq!(report.written_count(), 2);
    assert!(h.fixture.staged_archives().is_empty());
}

#[test]
fn test_direct_strategy_streams_sequentially() {
    let h = Harness::new(&["alpha", "bravo"]);

    let report = h.pipeline(Strategy::Direct, false, 2).run(&h.fixture.dirs).unwrap();

    assert!(report.completed);
    assert_eq!(report.written_count(), 2);
    assert_eq!(h.transfer.written(), vec!["<stream>", "<stream>"]);

    // Positions are recorded before each stream, one marker apart
    let store = h.fixture.store();
    assert_eq!(
        store.load_history(&h.fixture.dirs[0]).unwrap()[0].tape_position,
        Some(0)
    );
    assert_eq!(
        store.load_history(&h.fixture.dirs[1]).unwrap()[0].tape_position,
        Some(1)
    );

    // Direct strategy never stages archives
    assert!(h.fixture.staged_archives().is_empty());
}

#[test]
fn test_cancellation_removes_staged_archives() {
    let names = ["alpha", "bravo", "charlie", "delta"];
    let h = Harness::new(&names);
    for name in names {
        h.archiver.delay(name, Duration::from_millis(150));
    }

    let pipeline = h.pipeline(Strategy::Tar, false, 2);

    // Interrupt while the first two archives are still being generated
    let cancel = pipeline.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(80));
        cancel.store(true, Ordering::SeqCst);
    });

    let report = pipeline.run(&h.fixture.dirs).unwrap();
    canceller.join().unwrap();

    assert!(!report.completed);
    assert_eq!(report.written_count(), 0);
    assert_eq!(report.failed_count(), names.len());
    assert!(h.transfer.written().is_empty());

    // No partial output left behind, whatever stage each archive reached
    assert!(h.fixture.staged_archives().is_empty());
}

#[test]
fn test_missing_source_directory_fails_validation() {
    let h = Harness::new(&["alpha"]);
    let missing = h.fixture.tmp.path().join("src").join("missing");

    let pipeline = h.pipeline(Strategy::Tar, false, 2);
    let err = pipeline.run(&[missing]).unwrap_err();
    assert!(err.to_string().contains("does not exist"));
}

#[test]
fn test_full_backup_resets_incremental_baseline() {
    let h = Harness::new(&["alpha"]);

    // Incremental, then full, then incremental with no changes
    h.pipeline(Strategy::Tar, true, 1).run(&h.fixture.dirs).unwrap();
    h.pipeline(Strategy::Tar, false, 1).run(&h.fixture.dirs).unwrap();

    let history = h.fixture.store().load_history(&h.fixture.dirs[0]).unwrap();
    assert_eq!(history.len(), 1, "full backup should replace prior history");

    let report = h.pipeline(Strategy::Tar, true, 1).run(&h.fixture.dirs).unwrap();
    assert_eq!(report.skipped_count(), 1);
}

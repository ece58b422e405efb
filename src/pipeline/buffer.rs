//! Ordering buffer between archive producers and the tape writer
//!
//! Producers finish in whatever order scheduling allows, but archives must
//! reach the drive in exactly the order their source directories were
//! supplied. This buffer reconciles the two: an archive is released to the
//! writer only when its index is the oldest still expected, and indices
//! whose directory was skipped or failed are retired so the sequence can
//! never stall waiting for an archive that will never materialize.
//!
//! All queue state lives under one mutex with one condvar; the queues are
//! interdependent, so guarding them separately would invite lock-ordering
//! hazards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{trace, warn};

/// An archive released to the writer, in submission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyArchive {
    /// Position of the source directory in the original input list
    pub index: u32,

    /// Staged archive file
    pub archive: PathBuf,
}

/// Combined queue state, always mutated under the one monitor lock
#[derive(Debug)]
struct BufferState {
    /// Indices still expected, in submission order
    pending: VecDeque<u32>,

    /// Completed archives not yet released (out-of-order completions park here)
    generated: HashMap<u32, PathBuf>,

    /// Indices retired without an archive (skipped or failed directories)
    retired: HashSet<u32>,

    /// Archives released to the writer, oldest first
    ready: VecDeque<ReadyArchive>,

    /// No further completions or retirements will arrive
    producers_done: bool,
}

impl BufferState {
    /// Release everything that is now in order.
    ///
    /// While the head of the pending queue has either a parked archive
    /// (move it to ready) or a retirement (drop it), pop the head and
    /// continue. Stops at the first index still being generated.
    fn advance(&mut self) {
        while let Some(&head) = self.pending.front() {
            if self.retired.remove(&head) {
                trace!(index = head, "Retired slot released");
                self.pending.pop_front();
            } else if let Some(archive) = self.generated.remove(&head) {
                trace!(index = head, archive = %archive.display(), "Archive released in order");
                self.ready.push_back(ReadyArchive {
                    index: head,
                    archive,
                });
                self.pending.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Monitor releasing archives to the writer in submission order
pub struct OrderingBuffer {
    state: Mutex<BufferState>,
    cond: Condvar,
    cancelled: Arc<AtomicBool>,
}

impl OrderingBuffer {
    /// Create a buffer expecting indices `0..count` in order
    pub fn new(count: u32, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            state: Mutex::new(BufferState {
                pending: (0..count).collect(),
                generated: HashMap::new(),
                retired: HashSet::new(),
                ready: VecDeque::new(),
                producers_done: false,
            }),
            cond: Condvar::new(),
            cancelled,
        }
    }

    /// A producer finished generating the archive for `index`
    pub fn archive_ready(&self, index: u32, archive: PathBuf) {
        let mut state = self.state.lock().expect("ordering buffer poisoned");
        state.generated.insert(index, archive);
        state.advance();
        self.cond.notify_all();
    }

    /// Retire `index` with no archive (directory skipped or failed).
    ///
    /// Required so a no-change or failed directory never blocks the
    /// directories queued after it.
    pub fn retire(&self, index: u32) {
        let mut state = self.state.lock().expect("ordering buffer poisoned");
        state.retired.insert(index);
        state.advance();
        self.cond.notify_all();
    }

    /// Signal that no further completions or retirements will arrive
    pub fn producers_finished(&self) {
        let mut state = self.state.lock().expect("ordering buffer poisoned");
        state.producers_done = true;
        self.cond.notify_all();
    }

    /// Block until the next in-order archive is available.
    ///
    /// Returns `None` once all work is drained, or promptly after
    /// cancellation. The wait wakes on every producer event; the timeout
    /// only bounds how long a cancellation can go unnoticed.
    pub fn next_to_write(&self) -> Option<ReadyArchive> {
        let mut state = self.state.lock().expect("ordering buffer poisoned");
        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                return None;
            }
            if let Some(ready) = state.ready.pop_front() {
                return Some(ready);
            }
            if state.producers_done {
                if !state.pending.is_empty() {
                    // Every producer retires or completes its index; reaching
                    // here means one exited without doing either
                    warn!(
                        remaining = state.pending.len(),
                        "Pending slots left with no producer to fill them"
                    );
                }
                return None;
            }
            let (guard, _timeout) = self
                .cond
                .wait_timeout(state, Duration::from_millis(100))
                .expect("ordering buffer poisoned");
            state = guard;
        }
    }

    /// All staged archive files currently tracked by the buffer.
    ///
    /// Used by cancellation cleanup to remove partial output regardless of
    /// which stage an archive had reached.
    pub fn outstanding_archives(&self) -> Vec<PathBuf> {
        let state = self.state.lock().expect("ordering buffer poisoned");
        state
            .generated
            .values()
            .cloned()
            .chain(state.ready.iter().map(|r| r.archive.clone()))
            .collect()
    }

    /// True when every expected index has been released or retired
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock().expect("ordering buffer poisoned");
        state.pending.is_empty() && state.ready.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn buffer(count: u32) -> OrderingBuffer {
        OrderingBuffer::new(count, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_in_order_release() {
        let buf = buffer(2);
        buf.archive_ready(0, PathBuf::from("/s/a.tar"));
        buf.archive_ready(1, PathBuf::from("/s/b.tar"));
        buf.producers_finished();

        assert_eq!(buf.next_to_write().unwrap().index, 0);
        assert_eq!(buf.next_to_write().unwrap().index, 1);
        assert_eq!(buf.next_to_write(), None);
        assert!(buf.is_drained());
    }

    #[test]
    fn test_out_of_order_completion_released_in_order() {
        let buf = buffer(3);

        // Index 2 finishes first; nothing can be released yet
        buf.archive_ready(2, PathBuf::from("/s/c.tar"));
        buf.archive_ready(1, PathBuf::from("/s/b.tar"));
        assert!(!buf.is_drained());

        buf.archive_ready(0, PathBuf::from("/s/a.tar"));
        buf.producers_finished();

        let order: Vec<u32> = std::iter::from_fn(|| buf.next_to_write())
            .map(|r| r.index)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_retired_head_does_not_stall() {
        let buf = buffer(3);
        buf.archive_ready(1, PathBuf::from("/s/b.tar"));
        buf.archive_ready(2, PathBuf::from("/s/c.tar"));

        // Head is skipped; both later archives must flow
        buf.retire(0);
        buf.producers_finished();

        let order: Vec<u32> = std::iter::from_fn(|| buf.next_to_write())
            .map(|r| r.index)
            .collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_retired_last_slot_drains() {
        let buf = buffer(2);
        buf.archive_ready(0, PathBuf::from("/s/a.tar"));
        buf.retire(1);
        buf.producers_finished();

        assert_eq!(buf.next_to_write().unwrap().index, 0);
        assert_eq!(buf.next_to_write(), None);
        assert!(buf.is_drained());
    }

    #[test]
    fn test_writer_blocks_until_head_arrives() {
        let buf = Arc::new(buffer(2));
        let writer_buf = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            let first = writer_buf.next_to_write().unwrap();
            let second = writer_buf.next_to_write().unwrap();
            (first.index, second.index)
        });

        // Complete out of order with a delay so the writer really waits
        buf.archive_ready(1, PathBuf::from("/s/b.tar"));
        thread::sleep(Duration::from_millis(20));
        buf.archive_ready(0, PathBuf::from("/s/a.tar"));
        buf.producers_finished();

        assert_eq!(handle.join().unwrap(), (0, 1));
    }

    #[test]
    fn test_cancellation_wakes_writer() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let buf = Arc::new(OrderingBuffer::new(4, Arc::clone(&cancelled)));

        let writer_buf = Arc::clone(&buf);
        let handle = thread::spawn(move || writer_buf.next_to_write());

        cancelled.store(true, Ordering::SeqCst);
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn test_outstanding_archives_tracks_both_stages() {
        let buf = buffer(3);
        buf.archive_ready(0, PathBuf::from("/s/a.tar")); // released to ready
        buf.archive_ready(2, PathBuf::from("/s/c.tar")); // parked out of order

        let mut outstanding = buf.outstanding_archives();
        outstanding.sort();
        assert_eq!(
            outstanding,
            vec![PathBuf::from("/s/a.tar"), PathBuf::from("/s/c.tar")]
        );
    }
}

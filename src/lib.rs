//! tapeback - Tape Backup Pipeline
//!
//! Backs up directory trees to a linear-access tape device, full or
//! incremental, with archive generation running concurrently while the
//! device is written strictly serially and strictly in input order.
//!
//! # Features
//!
//! - **Order-Preserving Pipeline**: Archives are generated by a bounded
//!   worker pool but always reach the drive in the order the directories
//!   were given, so restores can seek directly by file marker.
//!
//! - **Incremental Backups**: Per-directory history snapshots (JSON) let
//!   each run archive only the files that changed since the recorded
//!   generations.
//!
//! - **Flow-Controlled Writes**: Staged archives reach the device through
//!   an mbuffer relay that waits for a fill percentage before draining,
//!   keeping the drive streaming instead of shoe-shining.
//!
//! - **Three Strategies**: Stream tar output straight to the device
//!   (direct), stage archives and relay them (tar), or stage and raw-copy
//!   them (dd).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Source Directories                           │
//! │              (ordered list from the command line)                │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Producer Worker Pool                          │
//! │  ┌──────────┐  ┌──────────┐           ┌──────────┐              │
//! │  │Producer 1│  │Producer 2│    ...    │Producer N│              │
//! │  │ scan+tar │  │ scan+tar │           │ scan+tar │              │
//! │  └────┬─────┘  └────┬─────┘           └────┬─────┘              │
//! │       │             │                      │                    │
//! │       └─────────────┼──────────────────────┘                    │
//! │                     ▼                                           │
//! │           ┌──────────────────────────┐                          │
//! │           │     Ordering Buffer      │                          │
//! │           │  releases archives in    │                          │
//! │           │  submission order only   │                          │
//! │           └───────────┬──────────────┘                          │
//! │                       ▼                                         │
//! │           ┌──────────────────────────┐                          │
//! │           │       Tape Writer        │                          │
//! │           │  - position before write │                          │
//! │           │  - mbuffer / dd transfer │                          │
//! │           └──────────────────────────┘                          │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//!                    ┌──────────────────┐
//!                    │   Tape Device    │
//!                    │   (/dev/nst0)    │
//!                    └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Full backup of two directories, streamed directly
//! tapeback backup /data/projects /data/home -d /dev/nst0
//!
//! # Incremental nightly run with staged archives, 4 concurrent tars
//! tapeback backup /data/projects -i --job nightly --strategy tar -c 4
//!
//! # Reposition the medium before a restore
//! tapeback position
//! tapeback skip -2
//! ```

pub mod changes;
pub mod config;
pub mod device;
pub mod error;
pub mod meta;
pub mod pipeline;
pub mod progress;
pub mod scan;
pub mod tools;

pub use config::{BackupConfig, CliArgs, Strategy};
pub use error::{BackupError, Result};
pub use pipeline::{DirOutcome, Pipeline, RunReport};

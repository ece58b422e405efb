//! External archiving and transfer tools
//!
//! The pipeline never touches tape bytes itself. Archives are built by
//! `tar` against an explicit file list (required for incremental subsets),
//! and reach the device either through `mbuffer` (a flow-controlled relay
//! that only starts draining once its buffer hits a fill percentage, to
//! avoid start/stop thrashing on the drive) or through a plain `dd` copy.
//!
//! Both tools sit behind traits so the pipeline tests can inject fakes
//! with controllable timing and failures.

use crate::error::{ToolError, ToolResult};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Builds archives from an explicit list of files
pub trait Archiver: Send + Sync {
    /// Create an archive file from the paths listed in `file_list`
    fn create(&self, archive: &Path, file_list: &Path, block_size: u32) -> ToolResult<()>;

    /// Start producing an archive as a byte stream (direct strategy)
    fn stream(&self, file_list: &Path, block_size: u32) -> ToolResult<ArchiveStream>;
}

/// Moves archive bytes onto the device
pub trait Transfer: Send + Sync {
    /// Write a staged archive file to the device
    fn write_archive(&self, archive: &Path, device: &Path) -> ToolResult<()>;

    /// Write an archive byte stream to the device (direct strategy)
    fn write_stream(&self, input: Box<dyn Read + Send>, device: &Path) -> ToolResult<()>;
}

/// An in-flight archive byte stream plus its completion check
pub struct ArchiveStream {
    reader: Box<dyn Read + Send>,
    finish: Box<dyn FnOnce() -> ToolResult<()> + Send>,
}

impl ArchiveStream {
    pub fn new(
        reader: Box<dyn Read + Send>,
        finish: Box<dyn FnOnce() -> ToolResult<()> + Send>,
    ) -> Self {
        Self { reader, finish }
    }

    /// Drain this stream into a transfer, then surface any producer failure.
    ///
    /// The transfer error wins if both sides fail: a broken pipe on the
    /// producer side is usually just fallout from the device write dying.
    pub fn pipe_to(self, transfer: &dyn Transfer, device: &Path) -> ToolResult<()> {
        let transfer_result = transfer.write_stream(self.reader, device);
        let finish_result = (self.finish)();
        transfer_result.and(finish_result)
    }
}

/// Production archiver invoking `tar`
#[derive(Debug, Clone, Default)]
pub struct TarArchiver;

impl TarArchiver {
    /// tar's `-b` is a blocking factor in 512-byte records
    fn blocking_factor(block_size: u32) -> u32 {
        (block_size / 512).max(1)
    }

    fn base_args(target: &str, file_list: &Path, block_size: u32) -> Vec<String> {
        vec![
            "-cf".into(),
            target.into(),
            "-T".into(),
            file_list.display().to_string(),
            "-b".into(),
            Self::blocking_factor(block_size).to_string(),
        ]
    }
}

impl Archiver for TarArchiver {
    fn create(&self, archive: &Path, file_list: &Path, block_size: u32) -> ToolResult<()> {
        let args = Self::base_args(&archive.display().to_string(), file_list, block_size);
        debug!(archive = %archive.display(), "Running tar");

        let status = Command::new("tar")
            .args(&args)
            .stdout(Stdio::null())
            .status()
            .map_err(|e| ToolError::SpawnFailed {
                tool: "tar".into(),
                reason: e.to_string(),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(ToolError::ArchiveFailed {
                archive: archive.to_path_buf(),
                code: status.code(),
            })
        }
    }

    fn stream(&self, file_list: &Path, block_size: u32) -> ToolResult<ArchiveStream> {
        let args = Self::base_args("-", file_list, block_size);
        debug!(file_list = %file_list.display(), "Streaming tar to stdout");

        let mut child = Command::new("tar")
            .args(&args)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| ToolError::SpawnFailed {
                tool: "tar".into(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ToolError::SpawnFailed {
            tool: "tar".into(),
            reason: "stdout pipe missing".into(),
        })?;

        let file_list = file_list.to_path_buf();
        Ok(ArchiveStream::new(
            Box::new(stdout),
            Box::new(move || {
                let status = child.wait()?;
                if status.success() {
                    Ok(())
                } else {
                    Err(ToolError::ArchiveFailed {
                        archive: file_list,
                        code: status.code(),
                    })
                }
            }),
        ))
    }
}

/// Flow-controlled relay through `mbuffer`
///
/// The fill percentage gates when draining toward the device begins, so a
/// slow producer side does not make the drive start and stop repeatedly.
#[derive(Debug, Clone)]
pub struct MbufferRelay {
    /// Total buffer size in GiB
    pub buffer_gib: u32,

    /// Required buffer occupancy before draining starts
    pub fill_percent: u8,

    /// Block size handed to the relay
    pub block_size: u32,
}

impl MbufferRelay {
    fn args(&self, device: &Path) -> Vec<String> {
        vec![
            "-q".into(),
            "-P".into(),
            self.fill_percent.to_string(),
            "-m".into(),
            format!("{}G", self.buffer_gib),
            "-s".into(),
            self.block_size.to_string(),
            "-o".into(),
            device.display().to_string(),
        ]
    }

    fn run(&self, stdin: Stdio, device: &Path, archive: PathBuf) -> ToolResult<()> {
        let status = Command::new("mbuffer")
            .args(self.args(device))
            .stdin(stdin)
            .status()
            .map_err(|e| ToolError::SpawnFailed {
                tool: "mbuffer".into(),
                reason: e.to_string(),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(ToolError::TransferFailed {
                archive,
                code: status.code(),
            })
        }
    }
}

impl Transfer for MbufferRelay {
    fn write_archive(&self, archive: &Path, device: &Path) -> ToolResult<()> {
        debug!(archive = %archive.display(), device = %device.display(), "Relaying archive via mbuffer");
        let input = File::open(archive)?;
        self.run(Stdio::from(input), device, archive.to_path_buf())
    }

    fn write_stream(&self, mut input: Box<dyn Read + Send>, device: &Path) -> ToolResult<()> {
        let mut child = Command::new("mbuffer")
            .args(self.args(device))
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| ToolError::SpawnFailed {
                tool: "mbuffer".into(),
                reason: e.to_string(),
            })?;

        // Feed the relay from this thread; EOF on drop of the pipe
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = std::io::copy(&mut input, &mut stdin) {
                warn!(error = %e, "Stream into relay ended early");
            }
        }

        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(ToolError::TransferFailed {
                archive: PathBuf::from("<stream>"),
                code: status.code(),
            })
        }
    }
}

/// Raw copy through `dd`, no flow control
///
/// Only appropriate when the staging disk is at least as fast as the drive.
#[derive(Debug, Clone)]
pub struct DdCopy {
    /// Block size for the copy
    pub block_size: u32,
}

impl Transfer for DdCopy {
    fn write_archive(&self, archive: &Path, device: &Path) -> ToolResult<()> {
        debug!(archive = %archive.display(), device = %device.display(), "Copying archive via dd");
        let status = Command::new("dd")
            .arg(format!("if={}", archive.display()))
            .arg(format!("of={}", device.display()))
            .arg(format!("bs={}", self.block_size))
            .stderr(Stdio::null())
            .status()
            .map_err(|e| ToolError::SpawnFailed {
                tool: "dd".into(),
                reason: e.to_string(),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(ToolError::TransferFailed {
                archive: archive.to_path_buf(),
                code: status.code(),
            })
        }
    }

    fn write_stream(&self, mut input: Box<dyn Read + Send>, device: &Path) -> ToolResult<()> {
        let mut child = Command::new("dd")
            .arg(format!("of={}", device.display()))
            .arg(format!("bs={}", self.block_size))
            .stdin(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ToolError::SpawnFailed {
                tool: "dd".into(),
                reason: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = std::io::copy(&mut input, &mut stdin) {
                warn!(error = %e, "Stream into dd ended early");
            }
        }

        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(ToolError::TransferFailed {
                archive: PathBuf::from("<stream>"),
                code: status.code(),
            })
        }
    }
}

//! Tape device control
//!
//! Thin wrapper around the `mt` utility. The pipeline only needs a handful
//! of operations: query status, read the current file-marker position, and
//! reposition the medium. The actual ioctls stay in `mt`; this module
//! parses its output and exposes a trait so tests can substitute a fake
//! drive.

use crate::error::{DeviceError, DeviceResult};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Operations the pipeline needs from a tape drive
///
/// `current_position` is the load-bearing call: the writer reads it
/// immediately before every transfer so the recorded generation can be
/// seeked to during restore.
pub trait TapeControl: Send + Sync {
    /// Raw drive status text, for readiness checks and display
    fn status(&self) -> DeviceResult<String>;

    /// Rewind to the beginning of the medium
    fn rewind(&self) -> DeviceResult<()>;

    /// Seek to an absolute block position
    fn seek_block(&self, block: u64) -> DeviceResult<()>;

    /// Skip forward (positive) or backward (negative) by file markers
    fn skip_file_markers(&self, count: i64) -> DeviceResult<()>;

    /// Current position as a file number from the beginning of the medium
    fn current_position(&self) -> DeviceResult<u64>;
}

/// Production implementation shelling out to `mt -f <device>`
#[derive(Debug, Clone)]
pub struct MtTapeControl {
    device_path: PathBuf,
}

impl MtTapeControl {
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
        }
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    /// Run one mt subcommand and capture stdout
    fn run(&self, args: &[String]) -> DeviceResult<String> {
        let output = Command::new("mt")
            .arg("-f")
            .arg(&self.device_path)
            .args(args)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeviceError::CommandFailed {
                command: args.join(" "),
                reason: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Check the drive reports an online medium
    pub fn is_ready(&self) -> DeviceResult<bool> {
        let status = self.status()?;
        Ok(status.contains("ONLINE"))
    }

    /// Fail fast when the drive has no usable medium
    pub fn ensure_ready(&self) -> DeviceResult<()> {
        if self.is_ready()? {
            Ok(())
        } else {
            Err(DeviceError::NotReady {
                device: self.device_path.clone(),
            })
        }
    }
}

impl TapeControl for MtTapeControl {
    fn status(&self) -> DeviceResult<String> {
        self.run(&["status".into()])
    }

    fn rewind(&self) -> DeviceResult<()> {
        info!(device = %self.device_path.display(), "Rewinding tape");
        self.run(&["rewind".into()]).map(|_| ())
    }

    fn seek_block(&self, block: u64) -> DeviceResult<()> {
        debug!(device = %self.device_path.display(), block, "Seeking to block");
        self.run(&["seek".into(), block.to_string()]).map(|_| ())
    }

    fn skip_file_markers(&self, count: i64) -> DeviceResult<()> {
        if count == 0 {
            return Ok(());
        }

        let current = self.current_position()? as i64;
        let target = current + count;
        debug!(
            device = %self.device_path.display(),
            current,
            count,
            "Skipping file markers"
        );

        if target <= 0 {
            return self.rewind();
        }
        if count > 0 {
            self.run(&["fsf".into(), count.to_string()]).map(|_| ())
        } else {
            // bsf lands before the marker; step over it to sit at the start
            // of the target file
            self.run(&["bsf".into(), (-count + 1).to_string()])?;
            self.run(&["fsf".into(), "1".into()]).map(|_| ())
        }
    }

    fn current_position(&self) -> DeviceResult<u64> {
        let status = self.status()?;
        parse_file_number(&status).ok_or(DeviceError::PositionUnavailable)
    }
}

/// Extract the file number from `mt status` output.
///
/// Drives report a line like `File number=3, block number=0, partition=0.`;
/// the file number counts markers from the beginning of the medium.
pub fn parse_file_number(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.contains("File number"))?;
    let value = line.split('=').nth(1)?;
    value.split(',').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_STATUS: &str = "SCSI 2 tape drive:\n\
        File number=3, block number=0, partition=0.\n\
        Tape block size 0 bytes. Density code 0x5a (LTO-9).\n\
        Soft error count since last status=0\n\
        General status bits on (81010000):\n EOF ONLINE IM_REP_EN\n";

    #[test]
    fn test_parse_file_number() {
        assert_eq!(parse_file_number(SAMPLE_STATUS), Some(3));
    }

    #[test]
    fn test_parse_file_number_zero() {
        let status = "File number=0, block number=0, partition=0.";
        assert_eq!(parse_file_number(status), Some(0));
    }

    #[test]
    fn test_parse_file_number_missing() {
        assert_eq!(parse_file_number("no position info here"), None);
        assert_eq!(parse_file_number(""), None);
    }
}

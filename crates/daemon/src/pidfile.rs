//! PID file handling for single-instance detection and `termgate stop`.
//!
//! The file holds the daemon's PID as decimal text followed by a newline.
//! A file naming a process that no longer exists, or holding garbage, is
//! stale and gets removed on read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// A PID file at a fixed location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Refers to the PID file at `path`. Nothing is touched on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records the current process, creating parent directories.
    pub fn write(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{}\n", std::process::id()))
    }

    /// Returns the PID of the live process named by the file, if any.
    ///
    /// Stale files are removed.
    pub fn running_pid(&self) -> Option<u32> {
        let contents = fs::read_to_string(&self.path).ok()?;

        match contents.trim().parse::<u32>() {
            Ok(pid) if is_process_running(pid) => Some(pid),
            _ => {
                tracing::debug!(path = %self.path.display(), "Removing stale PID file");
                self.remove();
                None
            }
        }
    }

    /// Deletes the file. A missing file is not an error.
    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove PID file"),
        }
    }
}

/// Checks for a process with the given PID using `kill(pid, 0)`.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // The process exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

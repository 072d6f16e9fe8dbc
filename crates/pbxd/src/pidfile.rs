//! PID and log file handling for the daemon process.
//!
//! Both files live in `<state dir>/pbx/`, falling back to `/tmp/pbx/` when
//! the platform has no state directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

/// Directory name under the state directory
const STATE_SUBDIR: &str = "pbx";

/// Returns the directory holding the PID and log files.
pub fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(STATE_SUBDIR)
}

/// Returns the path of the daemon log file.
pub fn log_file_path() -> PathBuf {
    state_dir().join("pbxd.log")
}

/// Checks if a process with the given PID is running.
pub fn is_process_running(pid: u32) -> bool {
    // Linux-only, like the rest of the daemon's process handling
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// A PID file recording the running daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates a handle for the PID file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the handle for the default location.
    pub fn default_location() -> Self {
        Self::new(state_dir().join("pbxd.pid"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the recorded PID, if the file exists and parses.
    pub fn read(&self) -> Option<u32> {
        let contents = fs::read_to_string(&self.path).ok()?;
        contents.trim().parse().ok()
    }

    /// Records the current process, creating parent directories.
    pub fn write(&self) -> io::Result<()> {
        self.write_pid(process::id())
    }

    fn write_pid(&self, pid: u32) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, pid.to_string())
    }

    /// Removes the file. A missing file is not an error.
    pub fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }

    /// Returns the PID of a running daemon.
    ///
    /// A file naming a process that no longer exists is stale and is
    /// removed.
    pub fn running_pid(&self) -> Option<u32> {
        let pid = self.read()?;
        if is_process_running(pid) {
            return Some(pid);
        }
        self.remove();
        None
    }
}

//! System-wide single-instance lock.
//!
//! Uses an exclusive, non-blocking `flock` on a lock file in the system temp
//! dir. Contention is a fatal startup error, not a wait. Pid and start time
//! are written into the file for observability only; the lock itself is the
//! advisory flock.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance appears to be running (lock held at {path})")]
    Held { path: PathBuf },

    #[error("failed to open lock file {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct GlobalLock {
    path: PathBuf,
    file: File,
}

impl GlobalLock {
    /// Acquire the global lock for the given application name. The lock file
    /// lives in the system temp dir as `<app_name>.lock`.
    pub fn acquire(app_name: &str) -> Result<Self, LockError> {
        let path = std::env::temp_dir().join(format!("{app_name}.lock"));
        Self::acquire_at(&path)
    }

    /// Acquire the global lock at a specific lock file path.
    pub fn acquire_at(path: &Path) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(LockError::Held {
                path: path.to_path_buf(),
            });
        }

        // Best-effort metadata for a human inspecting the lock file.
        let _ = file.set_len(0);
        let mut file = file;
        let _ = writeln!(
            file,
            "pid={}\nstart={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        let _ = file.sync_all();

        debug!(path = %path.display(), "Acquired global process lock");

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Releasing global process lock");
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        // Removal is best-effort; the lock is advisory via flock.
        let _ = std::fs::remove_file(&self.path);
    }
}

//! Advisory lock guarding the embedding cache.
//!
//! Uses flock() on a lock file in the base directory.
//! - `watch`: acquires the lock on startup and holds it for its lifetime
//! - `index`, `search`, `clear`: acquire it for the duration of the command
//! - `stats`: only reads the cache and never locks

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed in the base directory
const LOCK_FILE_NAME: &str = "noteindex.lock";

/// Exclusive hold on a base directory's embedding cache, released on drop.
pub struct IndexLock {
    file: File,
    path: PathBuf,
}

impl IndexLock {
    /// Acquire the lock without waiting. Fails with `WouldBlock` naming the
    /// lock file when another noteindex process already holds it.
    pub fn try_acquire(base_path: &Path) -> io::Result<Self> {
        let path = base_path.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !flock_exclusive(&file)? {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!(
                    "embedding cache is in use by another noteindex process (lock {})",
                    path.display()
                ),
            ));
        }

        log::debug!("acquired {}", path.display());
        Ok(IndexLock { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Returns `Ok(false)` when the lock is held elsewhere.
#[cfg(unix)]
fn flock_exclusive(file: &File) -> io::Result<bool> {
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => Ok(false),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> io::Result<bool> {
    Ok(true)
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        log::debug!("released {}", self.path.display());
    }
}

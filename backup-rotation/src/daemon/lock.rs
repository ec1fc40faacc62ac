//! Advisory lock scoped to one backup destination.
//!
//! Two runs against the same destination would both plan the same next
//! backup. Every mutating command holds this lock for its whole
//! plan, sync and purge sequence; it is released when the guard drops,
//! including on error paths and panics.

use crate::{Result, RotationError};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock file name inside the destination. Never mistaken for a backup.
pub const LOCK_FILE_NAME: &str = ".backup-rotation.lock";

/// Held exclusive `flock` on `<dest>/.backup-rotation.lock`.
pub struct DestinationLock {
    path: PathBuf,
    lock: Flock<File>,
}

impl DestinationLock {
    /// Take the lock without waiting. Fails with `Locked` if another
    /// process holds it.
    pub fn acquire(dest: &Path) -> Result<Self> {
        let path = dest.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                RotationError::Locked(path.clone())
            } else {
                RotationError::from(errno)
            }
        })?;

        lock.set_len(0)?;
        (&*lock).write_all(format!("{}\n", std::process::id()).as_bytes())?;

        debug!(path = %path.display(), "Acquired destination lock");
        Ok(Self { path, lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for DestinationLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationLock")
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        // The flock itself is released when `self.lock` drops.
        if let Err(e) = self.lock.set_len(0) {
            debug!(path = %self.path.display(), error = %e, "Failed to clear lock file");
        }
        debug!(path = %self.path.display(), "Released destination lock");
    }
}

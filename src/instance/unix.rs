//! Advisory `flock` lock file

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use tracing::debug;

use crate::error::InstanceError;

/// Exclusive lock held on `<lock_dir>/<name>.lock`
#[derive(Debug)]
pub(super) struct PlatformLock {
    file: File,
    path: PathBuf,
}

impl PlatformLock {
    /// Try to take the lock without blocking
    ///
    /// `Ok(None)` means another process holds it.
    pub(super) fn acquire(lock_dir: &Path, name: &str) -> Result<Option<Self>, InstanceError> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{name}.lock"));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| InstanceError::lock(name, format!("{}: {e}", path.display())))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(e) if e == Errno::EWOULDBLOCK => {
                debug!("lock {} is held by another process", path.display());
                return Ok(None);
            }
            Err(e) => return Err(InstanceError::lock(name, e.to_string())),
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Some(Self { file, path }))
    }

    /// Drop the lock, leaving the file in place
    ///
    /// Unlinking would let a process still waiting on the old inode and a
    /// newcomer creating a fresh file both believe they own the lock.
    pub(super) fn release(self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            debug!("failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

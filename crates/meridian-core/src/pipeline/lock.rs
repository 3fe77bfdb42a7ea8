use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::consts::LOCK_EXTENSION;
use crate::error::Result;

/// Path of the claim file guarding `output`: `<output>.lock`.
pub fn lock_path_for(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".");
    name.push(LOCK_EXTENSION);
    PathBuf::from(name)
}

/// An exclusive, non-blocking claim on an output path.
///
/// Backed by an OS file lock on `<output>.lock`, so it also excludes other
/// processes sharing the filesystem. Dropping the claim releases the lock
/// but leaves the lock file in place; [`OutputClaim::complete`] removes it
/// once the output exists.
#[derive(Debug)]
pub struct OutputClaim {
    lock_path: PathBuf,
    file: File,
}

impl OutputClaim {
    /// Try to claim `output`. Returns `Ok(None)` when another holder has it.
    pub fn try_acquire(output: &Path) -> Result<Option<Self>> {
        let lock_path = lock_path_for(output);
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        match file.try_lock() {
            Ok(()) => {
                debug!(lock = %lock_path.display(), "Output claimed");
                Ok(Some(Self { lock_path, file }))
            }
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(e)) => Err(e.into()),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Release a claim whose output has been written.
    ///
    /// The lock file is unlinked before the lock is dropped. A worker that
    /// still acquires the unlinked file afterwards finds the output present
    /// and skips it.
    pub fn complete(self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

impl Drop for OutputClaim {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

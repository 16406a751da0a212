//! Cross-process session lock.
//!
//! Every `tethercam` process that drives the camera (`capture`, `monitor`)
//! shares one lock file next to the state file.  Holding an exclusive lock on
//! it is what entitles a process to touch the camera and to write the state
//! file; the in-process admission mutex in the recovery coordinator only
//! orders requests within one process.
//!
//! The lock is an OS advisory lock (`flock` on Unix, `LockFileEx` on
//! Windows) taken through [`fs2`].  It is tied to the open file handle, so it
//! is released when the guard drops or the process dies, and two handles
//! opened by the same process exclude each other just like two processes do.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, info};

/// How often a waiting capture re-checks the lock.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("cannot open session lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot lock session lock file {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Handle on the lock file; cheap to keep, holds nothing until acquired.
#[derive(Debug, Clone)]
pub struct SessionLock {
    path: PathBuf,
}

/// Proof of exclusive ownership.  Dropping it releases the lock.
#[derive(Debug)]
#[must_use = "the session lock is released as soon as the guard is dropped"]
pub struct SessionLockGuard {
    // Closing the handle releases the OS lock.
    _file: File,
    path: PathBuf,
}

impl SessionLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The lock file belonging to the state file at `state_path`.
    pub fn beside(state_path: &Path) -> Self {
        Self::new(state_path.with_extension("lock"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the lock if nobody holds it.
    ///
    /// Returns `Ok(None)` when another handle (in this or another process)
    /// owns it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] when the lock file cannot be created or the OS
    /// refuses the lock for a reason other than contention.
    pub fn try_acquire(&self) -> Result<Option<SessionLockGuard>, LockError> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("acquired session lock {}", self.path.display());
                Ok(Some(SessionLockGuard {
                    _file: file,
                    path: self.path.clone(),
                }))
            }
            Err(e) if is_contended(&e) => Ok(None),
            Err(source) => Err(LockError::Lock {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Waits until the lock is free, then takes it.
    ///
    /// Waiting polls instead of blocking a thread so the caller can abandon
    /// the wait by dropping the future.
    ///
    /// # Errors
    ///
    /// Same as [`SessionLock::try_acquire`].
    pub async fn acquire(&self) -> Result<SessionLockGuard, LockError> {
        let mut announced = false;
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            if !announced {
                info!("another tethercam process is using the camera; waiting for it to finish");
                announced = true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn open(&self) -> Result<File, LockError> {
        let open_err = |source: io::Error| LockError::Open {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_err)?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(open_err)
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        debug!("released session lock {}", self.path.display());
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_lock() -> SessionLock {
        SessionLock::new(
            std::env::temp_dir()
                .join(format!("tethercam_lock_{}", uuid::Uuid::new_v4()))
                .join("state.lock"),
        )
    }

    fn cleanup(lock: &SessionLock) {
        if let Some(dir) = lock.path().parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_beside_swaps_state_extension() {
        let lock = SessionLock::beside(Path::new("/var/lib/tethercam/state.json"));
        assert_eq!(lock.path(), Path::new("/var/lib/tethercam/state.lock"));
    }

    #[test]
    fn test_second_handle_cannot_take_held_lock() {
        // Arrange
        let lock = temp_lock();
        let other = SessionLock::new(lock.path());
        let held = lock.try_acquire().expect("try").expect("free");

        // Act
        let contended = other.try_acquire().expect("try");

        // Assert
        assert!(contended.is_none());
        drop(held);
        assert!(other.try_acquire().expect("try").is_some());
        cleanup(&lock);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        // Arrange
        let lock = temp_lock();
        let held = lock.try_acquire().expect("try").expect("free");
        let waiter = SessionLock::new(lock.path());

        // Act
        let pending = tokio::spawn(async move { waiter.acquire().await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        let still_waiting = !pending.is_finished();
        drop(held);
        let acquired = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("acquired after release")
            .expect("join");

        // Assert
        assert!(still_waiting);
        assert!(acquired.is_ok());
        cleanup(&lock);
    }
}

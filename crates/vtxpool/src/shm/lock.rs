//! Named advisory locks backed by files under `/dev/shm`.
//!
//! Every mutation of a shared segment happens while the corresponding lock
//! is held. Guards release on drop, so early returns can never leak a held
//! lock. Lock ordering is pool lock before record lock, never the reverse.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::{PoolError, Result};

pub const SHM_DIR: &str = "/dev/shm";

/// Hard bound on non-blocking lock attempts, 10ms apart (one minute total).
pub const MAX_LOCK_RETRIES: u32 = 6000;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// A lock file under `/dev/shm`, shared by name across processes.
#[derive(Debug)]
pub struct NamedLock {
    file: File,
    name: String,
}

impl NamedLock {
    /// Opens (creating if needed) the lock file for `name`. The file is
    /// world-writable so that unrelated users can coordinate on it.
    pub fn open(name: &str) -> Result<Self> {
        let old_umask = unsafe { libc::umask(0) };
        let result = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o666)
            .open(Self::path(name));
        unsafe {
            libc::umask(old_umask);
        }

        let file = result.map_err(|source| PoolError::Lock {
            name: name.to_string(),
            source,
        })?;

        Ok(NamedLock {
            file,
            name: name.to_string(),
        })
    }

    pub fn path(name: &str) -> PathBuf {
        PathBuf::from(SHM_DIR).join(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the lock, blocking indefinitely. Pool and record access
    /// goes through this; only the allocation rate-limit lock is bounded.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        loop {
            let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(LockGuard { lock: self });
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(PoolError::Lock {
                name: self.name.clone(),
                source: err,
            });
        }
    }

    /// Acquires the lock with a bounded number of non-blocking attempts.
    /// Exhausting the budget yields [`PoolError::LockTimeout`] instead of
    /// hanging the caller forever on a wedged peer.
    pub fn lock_bounded(&self, max_retries: u32) -> Result<LockGuard<'_>> {
        for _ in 0..max_retries {
            let rc = unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB)
            };
            if rc == 0 {
                return Ok(LockGuard { lock: self });
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                _ => {
                    return Err(PoolError::Lock {
                        name: self.name.clone(),
                        source: err,
                    })
                }
            }
        }
        Err(PoolError::LockTimeout {
            name: self.name.clone(),
        })
    }

    /// Removes the lock file. Missing files are fine.
    pub fn unlink(name: &str) -> Result<()> {
        match std::fs::remove_file(Self::path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PoolError::Lock {
                name: name.to_string(),
                source,
            }),
        }
    }
}

/// Holds the advisory lock until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a NamedLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let rc = unsafe { libc::flock(self.lock.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!(
                name = %self.lock.name,
                error = %std::io::Error::last_os_error(),
                "failed to release advisory lock"
            );
        }
    }
}

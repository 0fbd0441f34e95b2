// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Cross-process mutual exclusion around a transport segment.
//!
//! Acquisition never blocks longer than the caller's timeout. Failing to get
//! the lock is a normal outcome ("try again next tick") and is reported as
//! `false`, not as an error.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::SharedMemoryError;

/// Poll interval of the non-blocking file lock loop.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A named lock shared by every process attached to one segment.
pub trait InterprocessMutex: Send + Sync {
    /// Try to acquire the lock, waiting at most `timeout`.
    fn try_lock(&self, timeout: Duration) -> bool;

    /// Release a lock obtained with [`try_lock`](Self::try_lock).
    fn release(&self);

    /// Give up the underlying handle. Safe to call more than once; the mutex
    /// can no longer be acquired afterwards.
    fn close(&self);

    /// Number of successful acquisitions so far.
    fn acquisition_count(&self) -> u64;
}

/// Releases the mutex when dropped.
pub struct InterprocessLockGuard<'a> {
    mutex: &'a dyn InterprocessMutex,
}

impl<'a> InterprocessLockGuard<'a> {
    /// Acquire `mutex` within `timeout`, or `None`.
    pub fn acquire(mutex: &'a dyn InterprocessMutex, timeout: Duration) -> Option<Self> {
        if mutex.try_lock(timeout) {
            Some(Self { mutex })
        } else {
            None
        }
    }
}

impl Drop for InterprocessLockGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

enum FileLockState {
    Unlocked(File),
    Locked(Flock<File>),
    Closed,
}

/// Advisory `flock(2)` lock on a lock file.
///
/// The lock belongs to the open file description, so two handles opened in
/// the same process exclude each other just like two processes do. The OS
/// drops the lock if the holder exits.
pub struct FileLockMutex {
    path: PathBuf,
    state: Mutex<FileLockState>,
    acquisitions: AtomicU64,
}

impl FileLockMutex {
    /// Open (creating if needed) the lock file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SharedMemoryError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SharedMemoryError::LockFileFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        }

        let file = open_lock_file(&path)?;

        Ok(Self {
            path,
            state: Mutex::new(FileLockState::Unlocked(file)),
            acquisitions: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> MutexGuard<'_, FileLockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_lock_file(path: &Path) -> Result<File, SharedMemoryError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o666)
        .open(path)
        .map_err(|e| SharedMemoryError::LockFileFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

impl InterprocessMutex for FileLockMutex {
    fn try_lock(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut state = self.state();
                match std::mem::replace(&mut *state, FileLockState::Closed) {
                    FileLockState::Unlocked(file) => {
                        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                            Ok(lock) => {
                                *state = FileLockState::Locked(lock);
                                self.acquisitions.fetch_add(1, Ordering::Relaxed);
                                return true;
                            }
                            Err((file, Errno::EWOULDBLOCK)) => {
                                *state = FileLockState::Unlocked(file);
                            }
                            Err((file, errno)) => {
                                *state = FileLockState::Unlocked(file);
                                tracing::warn!(
                                    path = %self.path.display(),
                                    error = %errno,
                                    "flock failed"
                                );
                                return false;
                            }
                        }
                    }
                    // held through this handle by another thread
                    locked @ FileLockState::Locked(_) => *state = locked,
                    FileLockState::Closed => return false,
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn release(&self) {
        let mut state = self.state();
        match std::mem::replace(&mut *state, FileLockState::Closed) {
            FileLockState::Locked(lock) => match lock.unlock() {
                Ok(file) => *state = FileLockState::Unlocked(file),
                Err((lock, errno)) => {
                    tracing::error!(
                        path = %self.path.display(),
                        error = %errno,
                        "Failed to release file lock, reopening lock file"
                    );
                    // closing the descriptor drops the lock
                    drop(lock);
                    if let Ok(file) = open_lock_file(&self.path) {
                        *state = FileLockState::Unlocked(file);
                    }
                }
            },
            other => *state = other,
        }
    }

    fn close(&self) {
        *self.state() = FileLockState::Closed;
    }

    fn acquisition_count(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct LocalLockState {
    locked: bool,
    closed: bool,
}

/// In-process lock for transports that live on the heap.
#[derive(Debug, Default)]
pub struct LocalMutex {
    state: Mutex<LocalLockState>,
    released: Condvar,
    acquisitions: AtomicU64,
}

impl LocalMutex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InterprocessMutex for LocalMutex {
    fn try_lock(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut state, _) = self
            .released
            .wait_timeout_while(state, timeout, |s| s.locked && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        if state.closed || state.locked {
            return false;
        }
        state.locked = true;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.locked = false;
        self.released.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.locked = false;
        self.released.notify_all();
    }

    fn acquisition_count(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_local_mutex_timeout() {
        let mutex = LocalMutex::new();
        assert!(mutex.try_lock(Duration::from_millis(1)));

        let start = Instant::now();
        assert!(!mutex.try_lock(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));

        mutex.release();
        assert!(mutex.try_lock(Duration::ZERO));
        assert_eq!(mutex.acquisition_count(), 2);
    }

    #[test]
    fn test_local_mutex_wakes_waiter() {
        let mutex = Arc::new(LocalMutex::new());
        assert!(mutex.try_lock(Duration::ZERO));

        let waiter = {
            let mutex = Arc::clone(&mutex);
            std::thread::spawn(move || mutex.try_lock(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(10));
        mutex.release();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_local_mutex_close_is_idempotent() {
        let mutex = LocalMutex::new();
        mutex.close();
        mutex.close();
        assert!(!mutex.try_lock(Duration::from_millis(1)));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let mutex = LocalMutex::new();
        {
            let guard = InterprocessLockGuard::acquire(&mutex, Duration::ZERO);
            assert!(guard.is_some());
            assert!(InterprocessLockGuard::acquire(&mutex, Duration::ZERO).is_none());
        }
        assert!(InterprocessLockGuard::acquire(&mutex, Duration::ZERO).is_some());
    }

    #[test]
    fn test_file_lock_excludes_second_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.lock");

        let first = FileLockMutex::open(&path).unwrap();
        let second = FileLockMutex::open(&path).unwrap();

        assert!(first.try_lock(Duration::from_millis(1)));
        assert!(!second.try_lock(Duration::from_millis(5)));

        first.release();
        assert!(second.try_lock(Duration::from_millis(5)));
        second.release();
        assert_eq!(first.acquisition_count(), 1);
        assert_eq!(second.acquisition_count(), 1);
    }

    #[test]
    fn test_file_lock_serializes_threads_on_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mutex = Arc::new(FileLockMutex::open(dir.path().join("shared.lock")).unwrap());
        assert!(mutex.try_lock(Duration::ZERO));
        assert!(!mutex.try_lock(Duration::from_millis(2)));

        let waiter = {
            let mutex = Arc::clone(&mutex);
            std::thread::spawn(move || mutex.try_lock(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(10));
        mutex.release();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_file_lock_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("x.lock");
        let mutex = FileLockMutex::open(&path).unwrap();
        assert!(path.exists());

        assert!(mutex.try_lock(Duration::ZERO));
        mutex.close();
        mutex.close();
        assert!(!mutex.try_lock(Duration::ZERO));

        // closing dropped the lock
        let other = FileLockMutex::open(&path).unwrap();
        assert!(other.try_lock(Duration::ZERO));
    }
}

//! Advisory file locks for the registry and the token pool
//!
//! A lock is a kernel `flock` on a persistent lock file. The kernel drops it
//! when the owning process exits, however it exits, so a crashed holder never
//! blocks anyone and there is nothing to break by hand. The file also records
//! who holds the lock (pid, hostname, time) for diagnostics. Waiting is
//! always bounded.

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::{CoordinatorError, IoResultExt, Result};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Metadata stored in a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    pub process_id: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockMetadata {
    pub fn current() -> Self {
        Self {
            process_id: std::process::id(),
            hostname: get_hostname(),
            acquired_at: Utc::now(),
        }
    }

    /// Recorded by a process on this host that no longer runs
    fn is_orphaned(&self) -> bool {
        self.hostname == get_hostname() && !is_process_running(self.process_id)
    }
}

/// Get current hostname
pub fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// RAII guard for an exclusive advisory lock
///
/// Dropping the guard closes the file, which releases the `flock`. The lock
/// file itself stays in place; removing it would let a waiter that already
/// opened the old inode lock a file nobody else can see.
pub struct FileLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

impl FileLock {
    /// Acquire the lock, waiting at most `timeout`
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<FileLock> {
        let started = Instant::now();
        let mut delay = INITIAL_RETRY_DELAY;

        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }

            if started.elapsed() >= timeout {
                return Err(CoordinatorError::lock_timeout(path, started.elapsed()));
            }

            tokio::time::sleep(delay.min(timeout.saturating_sub(started.elapsed()))).await;
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    /// Blocking variant for contexts that cannot await
    pub fn acquire_blocking(path: &Path, timeout: Duration) -> Result<FileLock> {
        let started = Instant::now();
        let mut delay = INITIAL_RETRY_DELAY;

        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }

            if started.elapsed() >= timeout {
                return Err(CoordinatorError::lock_timeout(path, started.elapsed()));
            }

            std::thread::sleep(delay.min(timeout.saturating_sub(started.elapsed())));
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    /// Single non-blocking attempt; `Ok(None)` means another holder has it
    pub fn try_acquire(path: &Path) -> Result<Option<FileLock>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_path(path)?;

        let locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EAGAIN => {
                return Ok(None)
            }
            Err((_, errno)) => {
                return Err(CoordinatorError::io(path, std::io::Error::from(errno)))
            }
        };

        if let Some(previous) = Self::holder(path).filter(LockMetadata::is_orphaned) {
            debug!(
                "Reclaimed lock {} left by exited process {}",
                path.display(),
                previous.process_id
            );
        }

        let json = serde_json::to_vec(&LockMetadata::current())?;
        let mut writer: &File = &locked;
        writer.set_len(0).with_path(path)?;
        writer.write_all(&json).with_path(path)?;
        trace!("Acquired lock {}", path.display());

        Ok(Some(FileLock {
            path: path.to_path_buf(),
            _file: locked,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Metadata of the most recent holder of the lock at `path`
    ///
    /// The lock may have been released since; only a failed
    /// [`try_acquire`](Self::try_acquire) proves it is still held.
    pub fn holder(path: &Path) -> Option<LockMetadata> {
        std::fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        debug!("Released lock {}", self.path.display());
    }
}

/// Check if a process with given PID is running
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }

    // Signal 0 performs the permission and existence checks without delivering anything
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Zombies still answer signal 0 until reaped; treat them as dead
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            // The state field follows the parenthesised command name
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next().map(|s| s == "Z"))
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    tracing::warn!("Process detection not supported on this platform");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn write_orphaned_metadata(path: &Path) {
        let metadata = LockMetadata {
            process_id: dead_pid(),
            hostname: get_hostname(),
            acquired_at: Utc::now(),
        };
        std::fs::write(path, serde_json::to_vec(&metadata).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_acquire_and_release_on_drop() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("registry.lock");

        {
            let lock = FileLock::acquire(&path, Duration::from_secs(1))
                .await
                .unwrap();
            assert!(lock.path().exists());
            let holder = FileLock::holder(&path).unwrap();
            assert_eq!(holder.process_id, std::process::id());
            assert!(FileLock::try_acquire(&path).unwrap().is_none());
        }

        // The file stays; only the kernel lock goes away
        assert!(path.exists());
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("registry.lock");

        let _held = FileLock::acquire(&path, Duration::from_secs(1))
            .await
            .unwrap();

        let started = Instant::now();
        let err = FileLock::acquire(&path, Duration::from_millis(150))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::LockTimeout);
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("pool.lock");

        let held = FileLock::acquire(&path, Duration::from_secs(1))
            .await
            .unwrap();

        let waiter_path = path.clone();
        let waiter = tokio::spawn(async move {
            FileLock::acquire(&waiter_path, Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let acquired = waiter.await.unwrap();
        assert!(acquired.is_ok());
    }

    #[test]
    fn test_lock_left_by_dead_process_is_reclaimed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("registry.lock");
        write_orphaned_metadata(&path);

        let lock = FileLock::acquire_blocking(&path, Duration::from_secs(1)).unwrap();
        let holder = FileLock::holder(lock.path()).unwrap();
        assert_eq!(holder.process_id, std::process::id());
    }

    #[test]
    fn test_held_lock_is_respected_whatever_the_metadata_says() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("registry.lock");

        let held = FileLock::try_acquire(&path).unwrap().unwrap();
        // A holder whose recorded pid looks dead still owns the kernel lock
        write_orphaned_metadata(&path);

        assert!(FileLock::try_acquire(&path).unwrap().is_none());
        drop(held);
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_contenders_on_orphaned_lock_never_overlap() {
        const CONTENDERS: usize = 8;
        const ROUNDS: usize = 50;

        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("tokens.lock");

        for _ in 0..ROUNDS {
            write_orphaned_metadata(&path);

            let barrier = Arc::new(Barrier::new(CONTENDERS));
            let holders = Arc::new(AtomicUsize::new(0));
            let overlaps = Arc::new(AtomicUsize::new(0));
            let acquired = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..CONTENDERS)
                .map(|_| {
                    let (path, barrier) = (path.clone(), Arc::clone(&barrier));
                    let (holders, overlaps, acquired) =
                        (Arc::clone(&holders), Arc::clone(&overlaps), Arc::clone(&acquired));
                    std::thread::spawn(move || {
                        barrier.wait();
                        if let Some(lock) = FileLock::try_acquire(&path).unwrap() {
                            if holders.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            acquired.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(2));
                            holders.fetch_sub(1, Ordering::SeqCst);
                            drop(lock);
                        }
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }

            assert_eq!(overlaps.load(Ordering::SeqCst), 0);
            assert!(acquired.load(Ordering::SeqCst) >= 1);
        }
    }

    #[test]
    fn test_is_process_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(0));
        assert!(!is_process_running(dead_pid()));
    }
}

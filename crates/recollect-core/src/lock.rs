//! Fail-fast advisory locking per store path.
//!
//! The store path is the locking unit. A holder owns an OS lock on
//! `<store>.lock`; the kernel drops it when the holder exits or crashes, so a
//! dead process can never wedge the store.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::db::is_in_memory;
use crate::error::{Error, Result};

/// Lock timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Default wait for callers that may block (0 = single attempt).
    pub timeout_ms: u64,
    /// Delay between attempts while waiting.
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            poll_interval_ms: 10,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Held lock resource; released when dropped.
pub struct LockHandle {
    lock_path: PathBuf,
    _resource: Box<dyn Send + Sync>,
}

impl LockHandle {
    pub fn new(lock_path: PathBuf, resource: impl Send + Sync + 'static) -> Self {
        Self {
            lock_path,
            _resource: Box::new(resource),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

/// Single non-blocking acquisition attempt.
pub trait LockBackend: Send + Sync {
    /// Returns `Ok(None)` when another holder owns the lock.
    fn try_lock(&self, lock_path: &Path) -> Result<Option<LockHandle>>;
}

/// OS advisory lock on a sidecar file (`flock` on unix).
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLockBackend;

impl LockBackend for FileLockBackend {
    fn try_lock(&self, lock_path: &Path) -> Result<Option<LockHandle>> {
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        if !try_lock_file(&file)? {
            return Ok(None);
        }

        // Holder pid, for diagnostics only
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;

        Ok(Some(LockHandle::new(lock_path.to_path_buf(), file)))
    }
}

#[cfg(unix)]
fn try_lock_file(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => Ok(false),
        _ => Err(err.into()),
    }
}

#[cfg(not(unix))]
fn try_lock_file(file: &File) -> Result<bool> {
    match file.try_lock() {
        Ok(()) => Ok(true),
        Err(std::fs::TryLockError::WouldBlock) => Ok(false),
        Err(std::fs::TryLockError::Error(e)) => Err(e.into()),
    }
}

/// Resolve symlinks and relative components so every spelling of a store
/// maps to one lock. A store file that does not exist yet is resolved
/// through its parent directory. In-memory paths are returned unchanged.
pub fn canonical_store_path(store_path: &Path) -> PathBuf {
    if is_in_memory(store_path) {
        return store_path.to_path_buf();
    }
    if let Ok(resolved) = std::fs::canonicalize(store_path) {
        return resolved;
    }

    let parent = match store_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match (std::fs::canonicalize(parent), store_path.file_name()) {
        (Ok(dir), Some(file_name)) => dir.join(file_name),
        _ => store_path.to_path_buf(),
    }
}

/// Sidecar lock file for a store path.
pub fn lock_path_for(store_path: &Path) -> PathBuf {
    if is_in_memory(store_path) {
        let name = store_path.to_string_lossy().replace(':', "");
        return std::env::temp_dir().join(format!("recollect-{}-{name}.lock", std::process::id()));
    }
    let mut name = canonical_store_path(store_path).into_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Mutual exclusion over store paths.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    backend: Arc<dyn LockBackend>,
    poll_interval: Duration,
}

impl ConcurrencyGuard {
    pub fn new(config: &LockConfig) -> Self {
        Self::with_backend(Arc::new(FileLockBackend), config)
    }

    pub fn with_backend(backend: Arc<dyn LockBackend>, config: &LockConfig) -> Self {
        Self {
            backend,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    /// Acquire the lock for `store_path`.
    ///
    /// A zero timeout makes exactly one attempt. Otherwise attempts repeat
    /// until the deadline passes, then fail with [`Error::Busy`].
    pub fn acquire(&self, store_path: &Path, timeout: Duration) -> Result<StoreLock> {
        let canonical = canonical_store_path(store_path);
        let lock_path = lock_path_for(&canonical);
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if let Some(handle) = self.backend.try_lock(&lock_path)? {
                tracing::debug!(
                    store = %store_path.display(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Acquired store lock"
                );
                return Ok(StoreLock {
                    store_path: store_path.to_path_buf(),
                    canonical,
                    handle,
                });
            }

            let now = Instant::now();
            if timeout.is_zero() || now >= deadline {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(store = %store_path.display(), waited_ms, "Store lock busy");
                return Err(Error::busy(store_path, waited_ms));
            }

            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

impl Default for ConcurrencyGuard {
    fn default() -> Self {
        Self::new(&LockConfig::default())
    }
}

/// Scoped proof of exclusive access to a store. Released on drop.
pub struct StoreLock {
    store_path: PathBuf,
    canonical: PathBuf,
    handle: LockHandle,
}

impl StoreLock {
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Fail unless this lock guards `store_path`, under any spelling of it.
    pub fn ensure_covers(&self, store_path: &Path) -> Result<()> {
        if self.store_path == store_path || self.canonical == canonical_store_path(store_path) {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "lock held for {} does not cover {}",
                self.store_path.display(),
                store_path.display()
            )))
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        tracing::debug!(lock = %self.handle.lock_path().display(), "Released store lock");
    }
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock")
            .field("store_path", &self.store_path)
            .finish()
    }
}

//! Exclusive locks around read-modify-write of shared files
//!
//! Writers inside one process queue on a tokio mutex per canonical path.
//! Writers in different processes are serialized by `flock(2)` on a hidden
//! sibling `.<name>.lck` file, which is created on first use and never
//! removed.

use crate::error::{CairnError, CairnResult};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

type Registry = Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>;

fn registry() -> &'static Registry {
    static LOCKS: OnceLock<Registry> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Held while a shared file is being rewritten
#[derive(Debug)]
pub(crate) struct FileLock {
    // dropped first: closing the descriptor releases the flock
    file: File,
    _local: OwnedMutexGuard<()>,
}

impl FileLock {
    /// Wait for exclusive access to `path`. The parent directory is created
    /// if needed.
    pub(crate) async fn acquire(path: &Path) -> CairnResult<Self> {
        let key = canonical_key(path).await?;
        let local = {
            let mut locks = match registry().lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let local = local.lock_owned().await;

        let lock_path = lock_path(&key);
        let file = tokio::task::spawn_blocking(move || lock_exclusive(&lock_path))
            .await
            .map_err(|e| CairnError::Internal(format!("lock task failed: {}", e)))??;

        debug!("Locked {}", key.display());
        Ok(Self {
            file,
            _local: local,
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

async fn canonical_key(path: &Path) -> CairnResult<PathBuf> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| CairnError::io(format!("creating directory {}", dir.display()), e))?;
    let dir = tokio::fs::canonicalize(dir)
        .await
        .map_err(|e| CairnError::io(format!("resolving {}", dir.display()), e))?;
    let name = path
        .file_name()
        .ok_or_else(|| CairnError::Internal(format!("{} has no file name", path.display())))?;
    Ok(dir.join(name))
}

fn lock_path(key: &Path) -> PathBuf {
    let name = key
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    key.with_file_name(format!(".{}.lck", name))
}

fn open_lock_file(path: &Path) -> CairnResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| CairnError::io(format!("opening lock {}", path.display()), e))
}

#[cfg(unix)]
fn lock_exclusive(path: &Path) -> CairnResult<File> {
    use std::os::unix::io::AsRawFd;

    let file = open_lock_file(path)?;
    loop {
        // SAFETY: the descriptor belongs to `file`, which outlives the call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(file);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(CairnError::io(format!("locking {}", path.display()), err));
        }
    }
}

#[cfg(not(unix))]
fn lock_exclusive(path: &Path) -> CairnResult<File> {
    open_lock_file(path)
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    // SAFETY: as above; failure only means the lock is already gone
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

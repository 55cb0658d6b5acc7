//! File lock backend
//!
//! Each lock is an advisory `flock` on `<dir>/<name>.lock`. Works across
//! processes on one host, and across hosts when `dir` is on a shared
//! filesystem that honours `flock`.

use crate::error::{StagehouseError, StagehouseResult};
use crate::lock::{HeldLock, LockMode, Locker};
use async_trait::async_trait;
use fs4::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Longest lock name used verbatim as a file name
const MAX_FILE_STEM: usize = 128;

/// Lock backend storing one lock file per name
#[derive(Debug, Clone)]
pub struct FileLocker {
    dir: PathBuf,
}

impl FileLocker {
    /// Create a file locker rooted at `dir`
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Lock directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock file path for `name`
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem(name)))
    }
}

/// Map a name to a safe, unique file stem
///
/// Names that are not plain file names get a hash suffix so that two
/// different names never share a file.
pub(crate) fn file_stem(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized == name && name.len() <= MAX_FILE_STEM && !name.starts_with('.') {
        return sanitized;
    }

    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let prefix: String = sanitized
        .trim_start_matches('.')
        .chars()
        .take(MAX_FILE_STEM - 13)
        .collect();
    format!("{}-{}", prefix, &digest[..12])
}

#[derive(Debug)]
struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl HeldLock for FileLock {
    fn release(&mut self) -> StagehouseResult<()> {
        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };

        FileExt::unlock(file).map_err(|e| StagehouseError::LockRelease {
            lock: self.path.display().to_string(),
            reason: e.to_string(),
        })?;

        self.file = None;
        Ok(())
    }
}

fn try_lock_file(path: &Path, mode: LockMode) -> StagehouseResult<Option<FileLock>> {
    let backend_err = |e: std::io::Error| StagehouseError::LockBackend {
        lock: path.display().to_string(),
        reason: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(backend_err)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(backend_err)?;

    let result = match mode {
        LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
        LockMode::Shared => FileExt::try_lock_shared(&file),
    };

    match result {
        Ok(()) => Ok(Some(FileLock {
            path: path.to_path_buf(),
            file: Some(file),
        })),
        Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
        #[cfg(windows)]
        Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => Ok(None),
        Err(err) => Err(backend_err(err)),
    }
}

/// Delete `<prefix><suffix>.lock` files nobody holds
///
/// Suffixes containing a dot belong to a longer name (another project) and
/// are left alone, as are prefixes that do not map to plain file names.
fn prune_lock_files(dir: &Path, prefix: &str) -> StagehouseResult<usize> {
    let backend_err = |e: std::io::Error| StagehouseError::LockBackend {
        lock: format!("{}*", prefix),
        reason: e.to_string(),
    };

    if file_stem(prefix) != prefix {
        return Ok(0);
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(backend_err(e)),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(backend_err)?;
        let file_name = entry.file_name();
        let Some(suffix) = file_name
            .to_str()
            .and_then(|n| n.strip_prefix(prefix))
            .and_then(|n| n.strip_suffix(".lock"))
        else {
            continue;
        };
        if suffix.is_empty() || suffix.contains('.') {
            continue;
        }

        let path = entry.path();
        match try_lock_file(&path, LockMode::Exclusive)? {
            // unlinked while held, released on drop
            Some(_held) => match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(backend_err(e)),
            },
            None => debug!("Keeping busy lock {}", path.display()),
        }
    }
    Ok(removed)
}

#[async_trait]
impl Locker for FileLocker {
    async fn try_acquire(
        &self,
        name: &str,
        mode: LockMode,
    ) -> StagehouseResult<Option<Box<dyn HeldLock>>> {
        let path = self.lock_path(name);
        debug!("Trying {:?} file lock {}", mode, path.display());

        let lock = tokio::task::spawn_blocking(move || try_lock_file(&path, mode))
            .await
            .map_err(|e| StagehouseError::LockBackend {
                lock: name.to_string(),
                reason: format!("lock task failed: {}", e),
            })??;

        Ok(lock.map(|l| Box::new(l) as Box<dyn HeldLock>))
    }

    async fn prune(&self, prefix: &str) -> StagehouseResult<usize> {
        let dir = self.dir.clone();
        let owned = prefix.to_string();
        tokio::task::spawn_blocking(move || prune_lock_files(&dir, &owned))
            .await
            .map_err(|e| StagehouseError::LockBackend {
                lock: format!("{}*", prefix),
                reason: format!("prune task failed: {}", e),
            })?
    }

    fn locker_name(&self) -> &'static str {
        "file"
    }
}

// src/sys/fs.rs

use std::collections::BTreeMap;
use std::fs::{self, DirBuilder, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, VerifyError};
use crate::sys::traits::FileSystem;

// ==============================================================================
// 1. Concrete Implementation (Unix Filesystem)
// ==============================================================================

pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn ensure_directory(&self, path: &Path, mode: u32) -> Result<()> {
        // Fresh components are born with `mode`; an existing tree is left alone here.
        DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(path)
            .map_err(|e| VerifyError::filesystem(path, e))?;

        let meta = fs::symlink_metadata(path).map_err(|e| VerifyError::filesystem(path, e))?;
        if !meta.is_dir() {
            return Err(VerifyError::filesystem(
                path,
                io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory"),
            ));
        }

        // Umask or a previous run may have left different bits; pin them.
        if meta.permissions().mode() & 0o7777 != mode {
            fs::set_permissions(path, Permissions::from_mode(mode))
                .map_err(|e| VerifyError::filesystem(path, e))?;
        }
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            VerifyError::filesystem(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"),
            )
        })?;

        // 🛡️ Zero-Race Boundary: the staging file is created 0600 by `tempfile`,
        // receives its final mode while still private, and only then is renamed
        // over the target. Readers see either the old file or the finished one.
        let mut staged = tempfile::Builder::new()
            .prefix(".staging-")
            .tempfile_in(parent)
            .map_err(|e| VerifyError::filesystem(parent, e))?;

        staged
            .write_all(contents)
            .and_then(|()| staged.as_file().sync_all())
            .and_then(|()| {
                staged
                    .as_file()
                    .set_permissions(Permissions::from_mode(mode))
            })
            .map_err(|e| VerifyError::filesystem(path, e))?;

        // The returned handle is dropped at once so the file can be exec'd.
        staged
            .persist(path)
            .map_err(|e| VerifyError::filesystem(path, e.error))?;
        Ok(())
    }
}

// ==============================================================================
// 2. In-Memory Fake (Tests)
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryEntry {
    Directory { mode: u32 },
    File { mode: u32, contents: Vec<u8> },
}

/// Records directories and files with their modes. Parents must exist before
/// a file is written, mirroring the real adapter.
#[derive(Default)]
pub struct MemoryFileSystem {
    entries: Mutex<BTreeMap<PathBuf, MemoryEntry>>,
    denied: Mutex<Vec<PathBuf>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every create/write at or below `prefix` fails with `PermissionDenied`.
    pub fn deny_under(&self, prefix: impl Into<PathBuf>) {
        lock(&self.denied).push(prefix.into());
    }

    pub fn entry(&self, path: &Path) -> Option<MemoryEntry> {
        lock(&self.entries).get(path).cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        lock(&self.entries).keys().cloned().collect()
    }

    pub fn file_count(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|e| matches!(e, MemoryEntry::File { .. }))
            .count()
    }

    fn check_allowed(&self, path: &Path) -> Result<()> {
        if lock(&self.denied).iter().any(|p| path.starts_with(p)) {
            return Err(VerifyError::filesystem(
                path,
                io::Error::from(io::ErrorKind::PermissionDenied),
            ));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FileSystem for MemoryFileSystem {
    fn ensure_directory(&self, path: &Path, mode: u32) -> Result<()> {
        self.check_allowed(path)?;
        let mut entries = lock(&self.entries);
        for ancestor in path.ancestors().collect::<Vec<_>>().into_iter().rev() {
            match entries.get_mut(ancestor) {
                Some(MemoryEntry::File { .. }) => {
                    return Err(VerifyError::filesystem(
                        ancestor,
                        io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            "exists and is not a directory",
                        ),
                    ));
                }
                Some(MemoryEntry::Directory { mode: existing }) => {
                    if ancestor == path {
                        *existing = mode;
                    }
                }
                None => {
                    entries.insert(ancestor.to_path_buf(), MemoryEntry::Directory { mode });
                }
            }
        }
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()> {
        self.check_allowed(path)?;
        let mut entries = lock(&self.entries);
        let parent_is_dir = path
            .parent()
            .is_some_and(|p| matches!(entries.get(p), Some(MemoryEntry::Directory { .. })));
        if !parent_is_dir {
            return Err(VerifyError::filesystem(
                path,
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        if let Some(MemoryEntry::Directory { .. }) = entries.get(path) {
            return Err(VerifyError::filesystem(
                path,
                io::Error::new(io::ErrorKind::IsADirectory, "is a directory"),
            ));
        }
        entries.insert(
            path.to_path_buf(),
            MemoryEntry::File {
                mode,
                contents: contents.to_vec(),
            },
        );
        Ok(())
    }
}

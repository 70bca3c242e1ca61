//! Positioned file I/O and OS byte-range locking.
//!
//! [`FileHandle`] is a thin, movable-but-not-copyable wrapper over an open
//! descriptor: positioned reads and writes, truncation, atomic rename, and
//! unique temporary-file creation for the new-store dance.  [`RangeLock`] is
//! the single funnel through which a database instance acquires and releases
//! OS range locks; raw descriptors are never shared between databases.

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    os::unix::fs::{FileExt, OpenOptionsExt},
    os::unix::io::{AsRawFd, RawFd},
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use uuid::Uuid;

use crate::error::{IoSnafu, Result};

// Only the owning user may write the store; the owning group may read it.
const FILE_MODE_OWNER_RW_GROUP_RO: u32 = 0o640;

/// Whether `open` treats a missing file as an error or as a reportable
/// condition (`is_open() == false`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentMode {
    MustExist,
    AllowNotFound,
}

/// Kind of OS range lock to acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    SharedRead,
    ExclusiveWrite,
}

/// An open (or deliberately not-open) store file.
#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    file: Option<File>,
}

impl FileHandle {
    /// Opens `path` without ever creating it.
    ///
    /// With [`PresentMode::AllowNotFound`], a missing file is reported
    /// through [`is_open`](FileHandle::is_open) returning `false` rather
    /// than as an error, so the caller can fall through to new-store
    /// construction.
    ///
    /// # Errors
    ///
    /// Any OS failure other than "not found under `AllowNotFound`" is
    /// surfaced with the operation and path attached.
    pub fn open(path: &Path, writable: bool, present: PresentMode) -> Result<FileHandle> {
        let mut options = OpenOptions::new();
        options.read(true).write(writable);
        match options.open(path) {
            Ok(file) => Ok(FileHandle {
                path: path.to_path_buf(),
                file: Some(file),
            }),
            Err(source) if source.kind() == ErrorKind::NotFound => match present {
                PresentMode::AllowNotFound => Ok(FileHandle {
                    path: path.to_path_buf(),
                    file: None,
                }),
                PresentMode::MustExist => Err(source).context(IoSnafu {
                    operation: "open",
                    path,
                }),
            },
            Err(source) => Err(source).context(IoSnafu {
                operation: "open",
                path,
            }),
        }
    }

    /// Creates a read-write file with a unique, random name inside
    /// `directory`.
    ///
    /// The file is created in the store's own directory (rather than a
    /// system temporary location) so that the eventual rename onto the final
    /// path stays on one volume and inherits the directory's permissions.
    ///
    /// # Errors
    ///
    /// Surfaces the OS error if the file cannot be created.  A name
    /// collision is retried with a fresh name, not reported.
    pub fn create_unique(directory: &Path) -> Result<FileHandle> {
        loop {
            let path = directory.join(format!(".strata-{}.tmp", Uuid::new_v4().simple()));
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(FILE_MODE_OWNER_RW_GROUP_RO)
                .open(&path)
            {
                Ok(file) => {
                    return Ok(FileHandle {
                        path,
                        file: Some(file),
                    })
                }
                Err(source) if source.kind() == ErrorKind::AlreadyExists => continue,
                Err(source) => {
                    return Err(source).context(IoSnafu {
                        operation: "create",
                        path,
                    })
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> &File {
        self.file
            .as_ref()
            .expect("operation on a file handle that is not open")
    }

    /// Unchecked positioned write of the whole buffer at `offset`.
    pub fn write_all_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file().write_all_at(bytes, offset).context(IoSnafu {
            operation: "write",
            path: &self.path,
        })
    }

    /// Unchecked positioned read filling the whole buffer from `offset`.
    pub fn read_exact_at(&self, offset: u64, bytes: &mut [u8]) -> Result<()> {
        self.file().read_exact_at(bytes, offset).context(IoSnafu {
            operation: "read",
            path: &self.path,
        })
    }

    /// Current physical size of the file.
    pub fn size(&self) -> Result<u64> {
        Ok(self
            .file()
            .metadata()
            .context(IoSnafu {
                operation: "metadata",
                path: &self.path,
            })?
            .len())
    }

    /// Sets the physical size of the file to exactly `size` bytes.
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.file().set_len(size).context(IoSnafu {
            operation: "truncate",
            path: &self.path,
        })
    }

    /// Flushes file data and metadata to stable storage.
    pub fn sync_all(&self) -> Result<()> {
        self.file().sync_all().context(IoSnafu {
            operation: "sync",
            path: &self.path,
        })
    }

    /// Renames the file to `to`, replacing any existing file at that path.
    pub fn rename(&mut self, to: &Path) -> Result<()> {
        std::fs::rename(&self.path, to).context(IoSnafu {
            operation: "rename",
            path: &self.path,
        })?;
        self.path = to.to_path_buf();
        Ok(())
    }

    /// Closes the descriptor.  Further positioned I/O is a logic error.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Removes the file from the filesystem.  Used to clean up a partially
    /// built temporary store when construction fails.
    pub fn remove(&mut self) -> Result<()> {
        self.file = None;
        std::fs::remove_file(&self.path).context(IoSnafu {
            operation: "remove",
            path: &self.path,
        })
    }

    /// An unacquired range lock over `[offset, offset + len)` of this file.
    pub fn range_lock(&self, offset: u64, len: u64) -> RangeLock {
        RangeLock {
            fd: self.file().as_raw_fd(),
            path: self.path.clone(),
            offset,
            len,
            held: None,
        }
    }

    /// Borrows the underlying descriptor for memory mapping.
    pub(crate) fn as_file(&self) -> &File {
        self.file()
    }
}

/// An OS byte-range lock over a fixed sub-range of one file.
///
/// The lock is advisory and process-scoped, with the classic POSIX caveat
/// that closing any descriptor for the file drops the process's locks; the
/// owning [`Database`](crate::Database) therefore keeps its `FileHandle`
/// alive for as long as any `RangeLock` derived from it, and never hands the
/// descriptor to another database instance.
#[derive(Debug)]
pub struct RangeLock {
    fd: RawFd,
    path: PathBuf,
    offset: u64,
    len: u64,
    held: Option<LockKind>,
}

impl RangeLock {
    /// Blocks until the lock of the requested kind is acquired.
    ///
    /// # Errors
    ///
    /// Surfaces the OS error (deadlock detection, unsupported filesystem)
    /// with the path attached.
    pub fn lock(&mut self, kind: LockKind) -> Result<()> {
        self.fcntl_lock(kind, true)?;
        self.held = Some(kind);
        Ok(())
    }

    /// Attempts to acquire the lock without blocking; returns `false` when a
    /// conflicting lock is held elsewhere.  This is the probe used before a
    /// modified store is handed to the collector: it succeeds only when no
    /// other process has the store open.
    ///
    /// # Errors
    ///
    /// Surfaces OS errors other than "would conflict".
    pub fn try_lock(&mut self, kind: LockKind) -> Result<bool> {
        match self.fcntl_lock(kind, false) {
            Ok(()) => {
                self.held = Some(kind);
                Ok(true)
            }
            Err(crate::StoreError::Io { source, .. })
                if matches!(
                    source.raw_os_error(),
                    Some(libc::EACCES) | Some(libc::EAGAIN)
                ) =>
            {
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    /// Releases the lock.  A no-op when not held.
    ///
    /// # Errors
    ///
    /// Surfaces the OS error if the release fails.
    pub fn unlock(&mut self) -> Result<()> {
        if self.held.take().is_some() {
            self.fcntl(libc::F_UNLCK, true)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn held(&self) -> Option<LockKind> {
        self.held
    }

    fn fcntl_lock(&self, kind: LockKind, blocking: bool) -> Result<()> {
        let lock_type = match kind {
            LockKind::SharedRead => libc::F_RDLCK,
            LockKind::ExclusiveWrite => libc::F_WRLCK,
        };
        self.fcntl(lock_type, blocking)
    }

    fn fcntl(&self, lock_type: libc::c_int, blocking: bool) -> Result<()> {
        // SAFETY: zero is a valid bit pattern for `flock`; the fields we need
        // are set explicitly below and the rest stay zeroed as fcntl expects.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = lock_type as _;
        fl.l_whence = libc::SEEK_SET as _;
        fl.l_start = self.offset as _;
        fl.l_len = self.len as _;

        let command = if blocking { libc::F_SETLKW } else { libc::F_SETLK };
        loop {
            // SAFETY: `fd` is the descriptor of the file this lock was
            // created from, which the owning database keeps open; `fl` is a
            // properly initialized flock describing our fixed byte range.
            let rc = unsafe { libc::fcntl(self.fd, command, &fl) };
            if rc != -1 {
                return Ok(());
            }
            let source = io::Error::last_os_error();
            if source.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(source).context(IoSnafu {
                operation: "lock",
                path: &self.path,
            });
        }
    }
}

impl Drop for RangeLock {
    fn drop(&mut self) {
        if let Err(error) = self.unlock() {
            debug!(%error, "Failed to release range lock on drop.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_not_found_reports_through_is_open() {
        let dir = tempfile::tempdir().expect("should create temporary directory");
        let missing = dir.path().join("missing.db");

        let handle = FileHandle::open(&missing, false, PresentMode::AllowNotFound)
            .expect("missing file should not be an error in this mode");
        assert!(!handle.is_open());

        let error = FileHandle::open(&missing, false, PresentMode::MustExist)
            .expect_err("missing file must be an error in this mode");
        assert!(matches!(error, crate::StoreError::Io { .. }));
    }

    #[test]
    fn unique_files_do_not_collide() {
        let dir = tempfile::tempdir().expect("should create temporary directory");
        let a = FileHandle::create_unique(dir.path()).expect("should create first file");
        let b = FileHandle::create_unique(dir.path()).expect("should create second file");
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn positioned_io_round_trips() {
        let dir = tempfile::tempdir().expect("should create temporary directory");
        let mut handle = FileHandle::create_unique(dir.path()).expect("should create file");

        handle.truncate(128).expect("truncate should succeed");
        handle
            .write_all_at(40, b"positioned")
            .expect("write should succeed");

        let mut buf = [0u8; 10];
        handle
            .read_exact_at(40, &mut buf)
            .expect("read should succeed");
        assert_eq!(&buf, b"positioned");
        assert_eq!(handle.size().expect("size should succeed"), 128);

        let renamed = dir.path().join("final.db");
        handle.rename(&renamed).expect("rename should succeed");
        assert_eq!(handle.path(), renamed);
    }

    #[test]
    fn range_lock_acquires_and_releases() {
        let dir = tempfile::tempdir().expect("should create temporary directory");
        let handle = FileHandle::create_unique(dir.path()).expect("should create file");
        handle.truncate(64).expect("truncate should succeed");

        let mut lock = handle.range_lock(0, 8);
        lock.lock(LockKind::SharedRead).expect("shared lock should succeed");
        assert_eq!(lock.held(), Some(LockKind::SharedRead));
        lock.unlock().expect("unlock should succeed");
        assert_eq!(lock.held(), None);

        // Locks within a single process never conflict with each other, so
        // an exclusive try-lock over the same range succeeds here.
        assert!(lock
            .try_lock(LockKind::ExclusiveWrite)
            .expect("try_lock should not error"));
    }
}

//! File-backed regions with POSIX `fcntl` locking.
//!
//! **Key design:** POSIX fcntl locks are per-process, not per-fd, and closing
//! *any* fd to a file drops every lock the process holds on it. We therefore
//! keep one canonical fd per inode in a process-global table and pair the
//! fcntl lock (cross-process exclusion) with an in-process mutex (cross-thread
//! exclusion). Handles opened on the same inode share both.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, MutexGuard};
use shmflow_error::{Result, ShmflowError};
use tracing::{debug, warn};

/// Byte offset of the region lock. Advisory only: it does not block I/O.
const LOCK_BYTE: u64 = 0;

// ---------------------------------------------------------------------------
// POSIX fcntl helpers
// ---------------------------------------------------------------------------

/// Apply a POSIX advisory lock on `[start, start + len)`.
///
/// With `wait` the call blocks (`F_SETLKW`) and retries on `EINTR`.
#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn posix_lock(file: &impl AsFd, lock_type: i32, start: u64, len: u64, wait: bool) -> Result<()> {
    let flock = libc::flock {
        l_type: lock_type as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: start as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    };

    loop {
        let arg = if wait {
            nix::fcntl::FcntlArg::F_SETLKW(&flock)
        } else {
            nix::fcntl::FcntlArg::F_SETLK(&flock)
        };
        match nix::fcntl::fcntl(file.as_fd().as_raw_fd(), arg) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => return Err(ShmflowError::Io(e.into())),
        }
    }
}

fn posix_unlock(file: &impl AsFd, start: u64, len: u64) -> Result<()> {
    posix_lock(file, libc::F_UNLCK, start, len, false)
}

// ---------------------------------------------------------------------------
// Inode table: one canonical fd and mutex per file
// ---------------------------------------------------------------------------

/// Unique identity for an open file (device + inode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InodeKey {
    dev: u64,
    ino: u64,
}

impl InodeKey {
    fn of(meta: &fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

/// Per-inode state shared by every handle in this process.
#[derive(Debug)]
struct InodeLock {
    file: File,
    local: Mutex<()>,
}

/// Global per-process table. Entries die with their last handle.
struct InodeTable {
    map: Mutex<HashMap<InodeKey, Weak<InodeLock>>>,
}

fn inode_table() -> &'static InodeTable {
    static TABLE: OnceLock<InodeTable> = OnceLock::new();
    TABLE.get_or_init(|| InodeTable {
        map: Mutex::new(HashMap::new()),
    })
}

impl InodeTable {
    /// Live entry for the file at `path`, looked up without opening a new fd.
    fn live(
        map: &HashMap<InodeKey, Weak<InodeLock>>,
        path: &Path,
    ) -> Option<Arc<InodeLock>> {
        let meta = fs::metadata(path).ok()?;
        map.get(&InodeKey::of(&meta)).and_then(Weak::upgrade)
    }

    fn register(
        map: &mut HashMap<InodeKey, Weak<InodeLock>>,
        file: File,
    ) -> Result<Arc<InodeLock>> {
        let key = InodeKey::of(&file.metadata()?);
        let inode = Arc::new(InodeLock {
            file,
            local: Mutex::new(()),
        });
        map.retain(|_, weak| weak.strong_count() > 0);
        map.insert(key, Arc::downgrade(&inode));
        Ok(inode)
    }
}

// ---------------------------------------------------------------------------
// FileBacking
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct FileBacking {
    path: PathBuf,
    inode: Arc<InodeLock>,
}

impl FileBacking {
    pub(crate) fn create(path: &Path, size: usize) -> Result<Arc<Self>> {
        let table = inode_table();
        let mut map = table.map.lock();
        let size_bytes = size as u64;

        let inode = if let Some(existing) = InodeTable::live(&map, path) {
            // Reuse the canonical fd; opening a second one would drop our locks on close.
            existing.file.set_len(0)?;
            existing.file.set_len(size_bytes)?;
            existing
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| {
                    debug!(path = %path.display(), error = %e, "region create failed");
                    ShmflowError::CannotOpen {
                        path: path.to_path_buf(),
                    }
                })?;
            file.set_len(size_bytes)?;
            InodeTable::register(&mut map, file)?
        };
        drop(map);

        debug!(path = %path.display(), size, "created file-backed region");
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            inode,
        }))
    }

    pub(crate) fn open(path: &Path) -> Result<(Arc<Self>, usize)> {
        let table = inode_table();
        let mut map = table.map.lock();

        let inode = if let Some(existing) = InodeTable::live(&map, path) {
            existing
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| {
                    debug!(path = %path.display(), error = %e, "region open failed");
                    ShmflowError::CannotOpen {
                        path: path.to_path_buf(),
                    }
                })?;
            InodeTable::register(&mut map, file)?
        };
        drop(map);

        let len = usize::try_from(inode.file.metadata()?.len())
            .map_err(|_| ShmflowError::layout("region file larger than address space"))?;
        Ok((
            Arc::new(Self {
                path: path.to_path_buf(),
                inode,
            }),
            len,
        ))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn lock(&self) -> Result<FileGuard<'_>> {
        let local = self.inode.local.lock();
        posix_lock(&self.inode.file, libc::F_WRLCK, LOCK_BYTE, 1, true)?;
        Ok(FileGuard {
            _local: local,
            file: &self.inode.file,
        })
    }
}

/// Holds both the in-process mutex and the fcntl lock.
pub(crate) struct FileGuard<'a> {
    _local: MutexGuard<'a, ()>,
    file: &'a File,
}

impl FileGuard<'_> {
    pub(crate) fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset as u64)?;
        Ok(())
    }

    pub(crate) fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset as u64)?;
        Ok(())
    }
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        // The fcntl lock must go before the in-process mutex (field drop order).
        if let Err(e) = posix_unlock(self.file, LOCK_BYTE, 1) {
            warn!(error = %e, "failed to release region fcntl lock");
        }
    }
}

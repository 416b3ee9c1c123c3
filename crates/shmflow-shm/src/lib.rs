//! Lockable shared byte regions.
//!
//! A [`ShmRegion`] is a fixed-length byte region guarded by one coarse lock.
//! All access goes through a [`RegionGuard`] using byte offsets, so nothing
//! stored in the region depends on where it is mapped.
//!
//! Two backings:
//! - heap: in-process only, for tests and single-process pipelines;
//! - file: shared by every process that opens the same path. Put the file on
//!   tmpfs (`/dev/shm`) to keep it in memory. Exclusion combines a per-inode
//!   in-process mutex with a POSIX `fcntl` write lock (see [`unix`]).

#[cfg(unix)]
mod unix;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use shmflow_error::{Result, ShmflowError};

#[cfg(unix)]
use unix::{FileBacking, FileGuard};

/// A handle to a lockable shared byte region.
///
/// Cloning is cheap and yields another handle to the same region.
#[derive(Debug, Clone)]
pub struct ShmRegion {
    len: usize,
    backing: Backing,
}

#[derive(Debug, Clone)]
enum Backing {
    Heap(Arc<Mutex<Vec<u8>>>),
    #[cfg(unix)]
    File(Arc<FileBacking>),
}

impl ShmRegion {
    /// Create a new zeroed in-process region.
    #[must_use]
    pub fn heap(size: usize) -> Self {
        Self {
            len: size,
            backing: Backing::Heap(Arc::new(Mutex::new(vec![0; size]))),
        }
    }

    /// Create (or truncate) a file-backed region of `size` zeroed bytes.
    #[cfg(unix)]
    pub fn create(path: impl AsRef<Path>, size: usize) -> Result<Self> {
        let backing = FileBacking::create(path.as_ref(), size)?;
        Ok(Self {
            len: size,
            backing: Backing::File(backing),
        })
    }

    /// Open an existing file-backed region created by another handle or process.
    #[cfg(unix)]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (backing, len) = FileBacking::open(path.as_ref())?;
        Ok(Self {
            len,
            backing: Backing::File(backing),
        })
    }

    /// The size of this region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing file path, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Heap(_) => None,
            #[cfg(unix)]
            Backing::File(file) => Some(file.path()),
        }
    }

    /// Acquire the region lock, blocking until it is available.
    ///
    /// The lock excludes every other thread in this process and, for
    /// file-backed regions, every other process holding the same file.
    pub fn lock(&self) -> Result<RegionGuard<'_>> {
        let inner = match &self.backing {
            Backing::Heap(data) => GuardInner::Heap(data.lock()),
            #[cfg(unix)]
            Backing::File(file) => GuardInner::File(file.lock()?),
        };
        Ok(RegionGuard {
            len: self.len,
            inner,
        })
    }
}

/// Exclusive access to a locked region. Releases the lock on drop.
pub struct RegionGuard<'a> {
    len: usize,
    inner: GuardInner<'a>,
}

enum GuardInner<'a> {
    Heap(MutexGuard<'a, Vec<u8>>),
    #[cfg(unix)]
    File(FileGuard<'a>),
}

impl RegionGuard<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(ShmflowError::OutOfBounds {
                offset,
                len,
                region_len: self.len,
            }),
        }
    }

    /// Fill `buf` from the region starting at `offset`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        match &self.inner {
            GuardInner::Heap(data) => {
                buf.copy_from_slice(&data[offset..offset + buf.len()]);
                Ok(())
            }
            #[cfg(unix)]
            GuardInner::File(file) => file.read_at(offset, buf),
        }
    }

    /// Write `data` into the region starting at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        match &mut self.inner {
            GuardInner::Heap(region) => {
                region[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
            #[cfg(unix)]
            GuardInner::File(file) => file.write_at(offset, data),
        }
    }

    /// Read `len` bytes into a new buffer.
    pub fn read_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Move `len` bytes from `src` to `dst`; the ranges may overlap.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) -> Result<()> {
        self.check(src, len)?;
        self.check(dst, len)?;
        if let GuardInner::Heap(region) = &mut self.inner {
            region.copy_within(src..src + len, dst);
            return Ok(());
        }
        let bytes = self.read_vec(src, len)?;
        self.write_at(dst, &bytes)
    }

    /// Zero `len` bytes at `offset`.
    pub fn zero(&mut self, offset: usize, len: usize) -> Result<()> {
        self.write_at(offset, &vec![0; len])
    }

    /// Read a little-endian `u32` at the given byte offset.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut bytes = [0_u8; 4];
        self.read_at(offset, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a little-endian `u32` at the given byte offset.
    pub fn write_u32(&mut self, offset: usize, val: u32) -> Result<()> {
        self.write_at(offset, &val.to_le_bytes())
    }

    /// Read a little-endian `u64` at the given byte offset.
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let mut bytes = [0_u8; 8];
        self.read_at(offset, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write a little-endian `u64` at the given byte offset.
    pub fn write_u64(&mut self, offset: usize, val: u64) -> Result<()> {
        self.write_at(offset, &val.to_le_bytes())
    }
}

/// Suggested location for a named region: tmpfs on Linux, the temp dir elsewhere.
#[must_use]
pub fn default_region_path(name: &str) -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.join(name)
    } else {
        std::env::temp_dir().join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_region_new_zeroed() {
        let region = ShmRegion::heap(4096);
        assert_eq!(region.len(), 4096);
        let guard = region.lock().unwrap();
        assert!(guard.read_vec(0, 4096).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_heap_region_read_write_ints() {
        let region = ShmRegion::heap(64);
        let mut guard = region.lock().unwrap();
        guard.write_u32(0, 0xDEAD_BEEF).unwrap();
        guard.write_u64(8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(guard.read_u32(0).unwrap(), 0xDEAD_BEEF);
        assert_eq!(guard.read_u64(8).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let region = ShmRegion::heap(16);
        let mut guard = region.lock().unwrap();
        assert!(matches!(
            guard.write_u64(12, 1),
            Err(ShmflowError::OutOfBounds { offset: 12, .. })
        ));
        assert!(guard.read_u32(usize::MAX - 1).is_err());
    }

    #[test]
    fn test_copy_within_overlapping() {
        let region = ShmRegion::heap(8);
        let mut guard = region.lock().unwrap();
        guard.write_at(0, &[1, 2, 3, 4]).unwrap();
        guard.copy_within(0, 2, 4).unwrap();
        assert_eq!(guard.read_vec(0, 6).unwrap(), vec![1, 2, 1, 2, 3, 4]);
    }

    #[test]
    fn test_clones_share_heap_region() {
        let region = ShmRegion::heap(8);
        let other = region.clone();
        region.lock().unwrap().write_u32(4, 77).unwrap();
        assert_eq!(other.lock().unwrap().read_u32(4).unwrap(), 77);
        assert!(region.path().is_none());
    }

    #[test]
    fn test_file_region_visible_through_second_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let creator = ShmRegion::create(&path, 256).unwrap();
        creator.lock().unwrap().write_u64(128, 42).unwrap();

        let attached = ShmRegion::open(&path).unwrap();
        assert_eq!(attached.len(), 256);
        assert_eq!(attached.path(), Some(path.as_path()));
        assert_eq!(attached.lock().unwrap().read_u64(128).unwrap(), 42);
    }

    #[test]
    fn test_file_region_copy_within() {
        let dir = tempfile::tempdir().unwrap();
        let region = ShmRegion::create(dir.path().join("r"), 32).unwrap();
        let mut guard = region.lock().unwrap();
        guard.write_at(4, &[9, 8, 7]).unwrap();
        guard.copy_within(4, 5, 3).unwrap();
        assert_eq!(guard.read_vec(4, 4).unwrap(), vec![9, 9, 8, 7]);
    }

    #[test]
    fn test_file_region_serializes_threads_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter");
        ShmRegion::create(&path, 8).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let region = ShmRegion::open(&path).unwrap();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let mut guard = region.lock().unwrap();
                        let v = guard.read_u64(0).unwrap();
                        guard.write_u64(0, v + 1).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let region = ShmRegion::open(&path).unwrap();
        assert_eq!(region.lock().unwrap().read_u64(0).unwrap(), 800);
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShmRegion::open(dir.path().join("absent")).is_err());
    }
}

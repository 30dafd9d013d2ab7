#![forbid(unsafe_code)]
//! Byte-addressed stream devices.
//!
//! The allocator's bitmap, an index's resident root, its allocation stream
//! and its slot bitmap are all streams with the same capability set:
//! positional read, positional write, length, and resize. [`ByteDevice`] is
//! that set; consumers only ever see `Arc<dyn ByteDevice>`.
//!
//! Variants:
//! - [`MemByteDevice`]: heap-backed, the shape of a resident attribute value.
//! - [`FileByteDevice`]: a host file with `pread`/`pwrite` semantics.
//! - [`SliceDevice`]: a fixed window onto another device, the shape of a
//!   non-resident stream laid out contiguously inside a volume image.

use ntfs_error::{NtfsError, Result};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`. Writing past the end is an
    /// error; grow the device with [`set_len`](Self::set_len) first.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Grow (zero-filled) or shrink the device.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// `[offset, offset + len)` as a checked end, validated against `limit`.
fn checked_range(op: &str, offset: u64, len: usize, limit: u64) -> Result<u64> {
    let len = u64::try_from(len)
        .map_err(|_| NtfsError::InvalidArgument(format!("{op} length overflows u64")))?;
    let end = offset
        .checked_add(len)
        .ok_or_else(|| NtfsError::InvalidArgument(format!("{op} range overflows u64")))?;
    if end > limit {
        return Err(NtfsError::InvalidArgument(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={limit}"
        )));
    }
    Ok(end)
}

fn to_index(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| NtfsError::InvalidArgument(format!("offset {value} overflows usize")))
}

/// In-memory device.
#[derive(Debug, Default)]
pub struct MemByteDevice {
    bytes: RwLock<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.read().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let limit = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let end = checked_range("read", offset, buf.len(), limit)?;
        buf.copy_from_slice(&bytes[to_index(offset)?..to_index(end)?]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let limit = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let end = checked_range("write", offset, buf.len(), limit)?;
        bytes[to_index(offset)?..to_index(end)?].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        let len = to_index(len)?;
        self.bytes.write().resize(len, 0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `FileExt` is thread-safe and does not share a seek position, so the
/// device can be used from several threads at once.
#[derive(Debug)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: AtomicU64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len: AtomicU64::new(len),
            writable,
        })
    }

    /// Create (or truncate) a file of `len` zero bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len: AtomicU64::new(len),
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range("read", offset, buf.len(), self.len_bytes())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(NtfsError::ReadOnly);
        }
        checked_range("write", offset, buf.len(), self.len_bytes())?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(NtfsError::ReadOnly);
        }
        self.file.set_len(len)?;
        self.len.store(len, Ordering::Release);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Fixed-size window `[base, base + len)` of another device.
pub struct SliceDevice {
    inner: Arc<dyn ByteDevice>,
    base: u64,
    len: u64,
}

impl SliceDevice {
    pub fn new(inner: Arc<dyn ByteDevice>, base: u64, len: u64) -> Result<Self> {
        let end = base
            .checked_add(len)
            .ok_or_else(|| NtfsError::InvalidArgument("slice range overflows u64".to_owned()))?;
        if end > inner.len_bytes() {
            return Err(NtfsError::InvalidArgument(format!(
                "slice [{base}, {end}) exceeds device length {}",
                inner.len_bytes()
            )));
        }
        Ok(Self { inner, base, len })
    }
}

impl std::fmt::Debug for SliceDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceDevice")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl ByteDevice for SliceDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range("read", offset, buf.len(), self.len)?;
        self.inner.read_exact_at(self.base + offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range("write", offset, buf.len(), self.len)?;
        self.inner.write_all_at(self.base + offset, buf)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        if len == self.len {
            return Ok(());
        }
        Err(NtfsError::InvalidArgument(format!(
            "slice device cannot be resized from {} to {len}",
            self.len
        )))
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// Read `len` bytes at `offset` into a fresh buffer.
pub fn read_vec(dev: &dyn ByteDevice, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; len];
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

/// Read the whole device.
pub fn read_all(dev: &dyn ByteDevice) -> Result<Vec<u8>> {
    let len = to_index(dev.len_bytes())?;
    read_vec(dev, 0, len)
}

/// Replace the whole contents, resizing to `bytes.len()`.
pub fn replace_all(dev: &dyn ByteDevice, bytes: &[u8]) -> Result<()> {
    let len = u64::try_from(bytes.len())
        .map_err(|_| NtfsError::InvalidArgument("length overflows u64".to_owned()))?;
    if dev.len_bytes() != len {
        dev.set_len(len)?;
    }
    dev.write_all_at(0, bytes)
}

#![forbid(unsafe_code)]
//! Shared newtypes for the NTFS storage core.
//!
//! Unit-carrying wrappers keep clusters, virtual clusters and bytes from being
//! mixed up at call sites. The byte-level helpers here are the only place raw
//! little-endian decoding happens; everything above them works with typed
//! values and [`ParseError`].

pub mod identity;

pub use identity::{AttributeReference, FileRecordReference, SystemFile};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Byte size of the boot sector holding the BIOS parameter block.
pub const BOOT_SECTOR_SIZE: usize = 512;
/// OEM identifier stored at offset 0x03 of an NTFS boot sector.
pub const NTFS_OEM_ID: [u8; 8] = *b"NTFS    ";
/// Magic tag of an index allocation block.
pub const INDX_MAGIC: [u8; 4] = *b"INDX";
/// Magic tag of a master file table record.
pub const FILE_MAGIC: [u8; 4] = *b"FILE";

/// Logical cluster number: an absolute cluster index on the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterNumber(pub u64);

/// Virtual cluster number: a cluster index relative to the start of one
/// attribute's allocation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Vcn(pub u64);

/// Validated cluster size (power of two in 512..=2 MiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterSize(u32);

impl ClusterSize {
    pub const MIN: u32 = 512;
    pub const MAX: u32 = 2 * 1024 * 1024;

    /// Create a `ClusterSize` if `value` is a power of two in [512, 2 MiB].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "cluster_size",
                reason: "must be power of two in 512..=2097152",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

/// A contiguous range of clusters, as handed out by the cluster allocator.
///
/// `start` is absolute. An extent never has zero length once it leaves the
/// allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterExtent {
    pub start: ClusterNumber,
    pub length: u64,
}

impl ClusterExtent {
    #[must_use]
    pub fn new(start: u64, length: u64) -> Self {
        Self {
            start: ClusterNumber(start),
            length,
        }
    }

    /// One past the last cluster of the extent, `None` on overflow.
    #[must_use]
    pub fn end(self) -> Option<u64> {
        self.start.0.checked_add(self.length)
    }

    /// Whether two extents share at least one cluster.
    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        let self_end = self.start.0.saturating_add(self.length);
        let other_end = other.start.0.saturating_add(other.length);
        self.start.0 < other_end && other.start.0 < self_end
    }

    /// Whether `cluster` falls inside the extent.
    #[must_use]
    pub fn contains(self, cluster: u64) -> bool {
        cluster >= self.start.0 && cluster - self.start.0 < self.length
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
    #[error("malformed run header {header:#04x} at offset {offset}")]
    BadRunHeader { offset: usize, header: u8 },
    #[error("update sequence mismatch in sector {sector}: expected {expected:#06x}, found {actual:#06x}")]
    FixupMismatch {
        sector: usize,
        expected: u16,
        actual: u16,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    Ok(i64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[must_use]
pub fn trim_space_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_owned()
}

impl fmt::Display for ClusterNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Vcn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ClusterSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ClusterExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.start.0, self.length)
    }
}

/// Round a small in-record offset up to the next multiple of 8.
///
/// Every variable-length NTFS structure (index entries, node headers) is
/// 8-byte aligned.
#[must_use]
pub fn round_up8(value: usize) -> usize {
    (value + 7) & !7
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `usize` to `u16` with an explicit error path.
pub fn usize_to_u16(value: usize, field: &'static str) -> Result<u16, ParseError> {
    u16::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `usize` to `u32` with an explicit error path.
pub fn usize_to_u32(value: usize, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
        assert!(read_le_i64(&bytes, 0).expect("i64") < 0);
    }

    #[test]
    fn test_read_past_end_is_insufficient_data() {
        let bytes = [0_u8; 3];
        assert_eq!(
            read_le_u32(&bytes, 1),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 1,
                actual: 2
            })
        );
        assert!(matches!(
            ensure_slice(&bytes, usize::MAX, 2),
            Err(ParseError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_write_helpers() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 0, 0xBEEF).unwrap();
        write_le_u32(&mut buf, 2, 0x0102_0304).unwrap();
        write_le_u64(&mut buf, 8, u64::MAX - 1).unwrap();
        assert_eq!(read_le_u16(&buf, 0).unwrap(), 0xBEEF);
        assert_eq!(read_le_u32(&buf, 2).unwrap(), 0x0102_0304);
        assert_eq!(read_le_u64(&buf, 8).unwrap(), u64::MAX - 1);
        assert!(write_le_u32(&mut buf, 14, 1).is_err());
    }

    #[test]
    fn test_trim_space_padded() {
        assert_eq!(trim_space_padded(b"NTFS    "), "NTFS");
        assert_eq!(trim_space_padded(b"ab\0cd"), "ab");
    }

    #[test]
    fn test_cluster_size_validation() {
        assert!(ClusterSize::new(4096).is_ok());
        assert!(ClusterSize::new(512).is_ok());
        assert!(ClusterSize::new(2 * 1024 * 1024).is_ok());
        assert_eq!(ClusterSize::new(4096).map(ClusterSize::get), Ok(4096));

        assert!(ClusterSize::new(3000).is_err());
        assert!(ClusterSize::new(256).is_err());
        assert!(ClusterSize::new(4 * 1024 * 1024).is_err());
        assert!(ClusterSize::new(0).is_err());
    }

    #[test]
    fn test_extent_geometry() {
        let a = ClusterExtent::new(10, 5);
        let b = ClusterExtent::new(14, 2);
        let c = ClusterExtent::new(15, 2);
        assert!(a.overlaps(b));
        assert!(!a.overlaps(c));
        assert!(a.contains(14));
        assert!(!a.contains(15));
        assert_eq!(a.end(), Some(15));
        assert_eq!(a.to_string(), "10+5");
    }

    #[test]
    fn test_round_up8() {
        assert_eq!(round_up8(0), 0);
        assert_eq!(round_up8(1), 8);
        assert_eq!(round_up8(16), 16);
        assert_eq!(round_up8(0x12), 0x18);
    }

    #[test]
    fn test_narrowing_helpers() {
        assert_eq!(u64_to_usize(42, "test"), Ok(42));
        assert_eq!(usize_to_u16(65_535, "test"), Ok(u16::MAX));
        assert!(usize_to_u16(65_536, "test").is_err());
        assert!(usize_to_u32(usize::MAX, "test").is_err() || usize::BITS == 32);
    }
}

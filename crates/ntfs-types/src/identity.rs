//! Stable identity of file records and the attributes inside them.
//!
//! A [`FileRecordReference`] packs a 48-bit MFT slot index with the 16-bit
//! sequence number of that slot. The sequence number is bumped every time
//! the slot is reused, so a reference taken before a delete/recreate cycle
//! compares unequal to the live record and must be treated as not found.

use crate::{ParseError, read_le_u16, read_le_u64, write_le_u16, write_le_u64};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

const INDEX_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
const SEQUENCE_SHIFT: u32 = 48;

/// Records below this index are reserved for filesystem metadata files.
pub const FIRST_USER_RECORD: u64 = 16;

/// Well-known system records at fixed MFT slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum SystemFile {
    Mft = 0,
    MftMirror = 1,
    LogFile = 2,
    Volume = 3,
    AttrDef = 4,
    RootDirectory = 5,
    Bitmap = 6,
    Boot = 7,
    BadClus = 8,
    Secure = 9,
    UpCase = 10,
    Extend = 11,
}

impl SystemFile {
    /// MFT slot index of this system file.
    #[must_use]
    pub fn index(self) -> u64 {
        self as u64
    }

    /// Reference to the system file as created by a fresh format, where the
    /// sequence number equals the slot index except for `$MFT` (which uses 1).
    #[must_use]
    pub fn reference(self) -> FileRecordReference {
        let seq = match self {
            Self::Mft => 1,
            other => u16::try_from(other.index()).unwrap_or(u16::MAX),
        };
        FileRecordReference::new(self.index(), seq)
    }
}

/// Packed `(mft_index, sequence_number)` identity of one file record.
///
/// Equality and ordering are both over `(index, sequence)`; the raw packed
/// value is never compared directly because its high bits carry the
/// sequence number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FileRecordReference(u64);

impl FileRecordReference {
    /// Wire size in bytes.
    pub const SIZE: usize = 8;

    /// Build from an index and a sequence number. Index bits above 48 are
    /// discarded.
    #[must_use]
    pub fn new(index: u64, sequence: u16) -> Self {
        Self((index & INDEX_MASK) | (u64::from(sequence) << SEQUENCE_SHIFT))
    }

    /// Build from the packed on-disk value.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// MFT slot index (low 48 bits).
    #[must_use]
    pub fn index(self) -> u64 {
        self.0 & INDEX_MASK
    }

    /// Slot reuse counter (high 16 bits).
    #[must_use]
    pub fn sequence(self) -> u16 {
        #[expect(clippy::cast_possible_truncation)]
        let seq = (self.0 >> SEQUENCE_SHIFT) as u16;
        seq
    }

    /// Whether the record is one of the reserved metadata records.
    #[must_use]
    pub fn is_mft_record(self) -> bool {
        self.index() < FIRST_USER_RECORD
    }

    /// Whether `other` names the same slot, regardless of sequence number.
    ///
    /// Useful to tell "stale" from "unrelated" when an equality check fails.
    #[must_use]
    pub fn same_slot(self, other: Self) -> bool {
        self.index() == other.index()
    }

    /// Reference to the next incarnation of this slot. Sequence 0 is
    /// reserved, so the counter wraps to 1.
    #[must_use]
    pub fn next_incarnation(self) -> Self {
        let next = match self.sequence().wrapping_add(1) {
            0 => 1,
            seq => seq,
        };
        Self::new(self.index(), next)
    }

    pub fn read_from(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        read_le_u64(data, offset).map(Self)
    }

    pub fn write_to(self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u64(data, offset, self.0)
    }
}

impl Ord for FileRecordReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index()
            .cmp(&other.index())
            .then_with(|| self.sequence().cmp(&other.sequence()))
    }
}

impl PartialOrd for FileRecordReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for FileRecordReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRecordReference")
            .field("index", &self.index())
            .field("sequence", &self.sequence())
            .finish()
    }
}

impl fmt::Display for FileRecordReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MFT:{} (ver: {})", self.index(), self.sequence())
    }
}

impl From<SystemFile> for FileRecordReference {
    fn from(file: SystemFile) -> Self {
        file.reference()
    }
}

/// An attribute inside one file record.
///
/// Derived ordering is field order: file reference first, then attribute id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttributeReference {
    pub file: FileRecordReference,
    pub attribute_id: u16,
}

impl AttributeReference {
    /// Wire size: file reference followed by the attribute id.
    pub const SIZE: usize = FileRecordReference::SIZE + 2;

    #[must_use]
    pub fn new(file: FileRecordReference, attribute_id: u16) -> Self {
        Self { file, attribute_id }
    }

    pub fn read_from(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let file = FileRecordReference::read_from(data, offset)?;
        let attribute_id = read_le_u16(data, offset + FileRecordReference::SIZE)?;
        Ok(Self { file, attribute_id })
    }

    pub fn write_to(self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        // Bounds-check the whole record before writing any part of it.
        crate::ensure_slice(data, offset, Self::SIZE)?;
        self.file.write_to(data, offset)?;
        write_le_u16(data, offset + FileRecordReference::SIZE, self.attribute_id)
    }
}

impl fmt::Display for AttributeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.attr[{}]", self.file, self.attribute_id)
    }
}

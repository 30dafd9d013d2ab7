//! Update sequence ("fixup") protection for multi-sector records.
//!
//! Before a record is written, the last two bytes of every 512-byte stride
//! are saved into the update sequence array (USA) and replaced with the
//! record's update sequence number (USN). On read, every stride must end in
//! the same USN; a stride that does not was not part of the latest write.
//!
//! Header layout shared by `FILE` and `INDX` records:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00 | 4 | magic |
//! | 0x04 | 2 | USA offset (points at the USN) |
//! | 0x06 | 2 | USA count (USN slot + one slot per stride) |

use ntfs_types::{ParseError, read_fixed, read_le_u16, write_bytes, write_le_u16};

/// Stride protected by one update sequence slot, independent of the
/// volume's sector size.
pub const FIXUP_STRIDE: usize = 512;

/// Bytes of the fixed header in front of the array.
pub const FIXUP_HEADER_SIZE: usize = 8;

/// Parsed fixup header plus the current update sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupRecord {
    pub magic: [u8; 4],
    pub usa_offset: u16,
    pub usa_count: u16,
    pub usn: u16,
}

impl FixupRecord {
    /// Header for a fresh record of `record_size` bytes with the array at
    /// `usa_offset`. The USN starts at 0 and becomes 1 on the first protect.
    pub fn new(magic: [u8; 4], usa_offset: u16, record_size: usize) -> Result<Self, ParseError> {
        let usa_count = usa_count_for(record_size)?;
        let record = Self {
            magic,
            usa_offset,
            usa_count,
            usn: 0,
        };
        record.check_layout(record_size)?;
        Ok(record)
    }

    /// Size of the array in bytes, USN slot included.
    #[must_use]
    pub fn usa_size(&self) -> usize {
        usize::from(self.usa_count) * 2
    }

    /// First byte after the array.
    #[must_use]
    pub fn usa_end(&self) -> usize {
        usize::from(self.usa_offset) + self.usa_size()
    }

    /// Read the header and USN without touching the payload.
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        let magic = read_fixed::<4>(buf, 0x00)?;
        let usa_offset = read_le_u16(buf, 0x04)?;
        let usa_count = read_le_u16(buf, 0x06)?;
        let usn = read_le_u16(buf, usize::from(usa_offset))?;
        let record = Self {
            magic,
            usa_offset,
            usa_count,
            usn,
        };
        record.check_layout(buf.len())?;
        Ok(record)
    }

    fn check_layout(&self, record_size: usize) -> Result<(), ParseError> {
        if usa_count_for(record_size)? != self.usa_count {
            return Err(ParseError::InvalidField {
                field: "usa_count",
                reason: "does not match record size",
            });
        }
        if usize::from(self.usa_offset) < FIXUP_HEADER_SIZE || self.usa_offset % 2 != 0 {
            return Err(ParseError::InvalidField {
                field: "usa_offset",
                reason: "overlaps header or misaligned",
            });
        }
        // The array lives in the first stride, ahead of that stride's own slot.
        if self.usa_end() > FIXUP_STRIDE - 2 {
            return Err(ParseError::InvalidField {
                field: "usa_offset",
                reason: "array extends past first stride",
            });
        }
        Ok(())
    }

    fn write_header(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        write_bytes(buf, 0x00, &self.magic)?;
        write_le_u16(buf, 0x04, self.usa_offset)?;
        write_le_u16(buf, 0x06, self.usa_count)?;
        write_le_u16(buf, usize::from(self.usa_offset), self.usn)
    }

    /// Install the next USN: write the header, stash the last two bytes of
    /// each stride into the array and overwrite them with the USN.
    ///
    /// `buf` must hold the fully serialised payload. The stashed bytes of
    /// each stride must not overlap the header or the array itself.
    pub fn protect(&mut self, buf: &mut [u8]) -> Result<(), ParseError> {
        self.check_layout(buf.len())?;
        self.usn = next_usn(self.usn);
        self.write_header(buf)?;

        let usn = self.usn.to_le_bytes();
        let array = usize::from(self.usa_offset) + 2;
        for sector in 0..buf.len() / FIXUP_STRIDE {
            let tail = (sector + 1) * FIXUP_STRIDE - 2;
            let saved = [buf[tail], buf[tail + 1]];
            write_bytes(buf, array + sector * 2, &saved)?;
            buf[tail..tail + 2].copy_from_slice(&usn);
        }
        Ok(())
    }

    /// Verify every stride and restore the stashed bytes in place.
    ///
    /// All strides are checked before anything is restored, so on error
    /// `buf` is left exactly as read.
    pub fn unprotect(buf: &mut [u8], expected_magic: [u8; 4]) -> Result<Self, ParseError> {
        let record = Self::parse(buf)?;
        if record.magic != expected_magic {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(u32::from_le_bytes(expected_magic)),
                actual: u64::from(u32::from_le_bytes(record.magic)),
            });
        }

        let sectors = buf.len() / FIXUP_STRIDE;
        for sector in 0..sectors {
            let actual = read_le_u16(buf, (sector + 1) * FIXUP_STRIDE - 2)?;
            if actual != record.usn {
                return Err(ParseError::FixupMismatch {
                    sector,
                    expected: record.usn,
                    actual,
                });
            }
        }

        let array = usize::from(record.usa_offset) + 2;
        for sector in 0..sectors {
            let saved = read_fixed::<2>(buf, array + sector * 2)?;
            let tail = (sector + 1) * FIXUP_STRIDE - 2;
            buf[tail..tail + 2].copy_from_slice(&saved);
        }
        Ok(record)
    }
}

/// `1 + strides` for a record size that is a non-zero multiple of 512.
pub fn usa_count_for(record_size: usize) -> Result<u16, ParseError> {
    if record_size == 0 || record_size % FIXUP_STRIDE != 0 {
        return Err(ParseError::InvalidField {
            field: "record_size",
            reason: "must be a non-zero multiple of 512",
        });
    }
    u16::try_from(1 + record_size / FIXUP_STRIDE).map_err(|_| ParseError::IntegerConversion {
        field: "usa_count",
    })
}

/// USNs wrap and skip 0, which readers treat as "never written".
#[must_use]
pub fn next_usn(usn: u16) -> u16 {
    match usn.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

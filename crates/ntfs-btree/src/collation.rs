//! Key ordering for index nodes.
//!
//! The index never interprets keys itself; every comparison goes through a
//! [`Collation`]. The standard NTFS rules that need no external table are
//! provided by [`StandardCollation`]. File name collation needs the volume's
//! upcase table, so callers supply it as a closure.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A total order over raw index keys.
pub trait Collation {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> Collation for F
where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

pub const COLLATION_BINARY: u32 = 0x00;
pub const COLLATION_FILE_NAME: u32 = 0x01;
pub const COLLATION_UNSIGNED_LONG: u32 = 0x10;
pub const COLLATION_SID: u32 = 0x11;
pub const COLLATION_SECURITY_HASH: u32 = 0x12;
pub const COLLATION_MULTIPLE_UNSIGNED_LONGS: u32 = 0x13;

/// Collation rules selectable by their on-disk rule number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StandardCollation {
    /// Plain byte-wise order, shorter key first on a common prefix.
    #[default]
    Binary,
    /// First little-endian `u32` of the key (`$O` of `$ObjId`, `$SII`).
    UnsignedLong,
    /// Byte-wise order of security identifiers.
    Sid,
    /// Hash then id, both little-endian `u32` (`$SDH`).
    SecurityHash,
    /// Consecutive little-endian `u32`s (`$Q` of `$Quota`).
    MultipleUnsignedLongs,
}

impl StandardCollation {
    #[must_use]
    pub const fn rule(self) -> u32 {
        match self {
            Self::Binary => COLLATION_BINARY,
            Self::UnsignedLong => COLLATION_UNSIGNED_LONG,
            Self::Sid => COLLATION_SID,
            Self::SecurityHash => COLLATION_SECURITY_HASH,
            Self::MultipleUnsignedLongs => COLLATION_MULTIPLE_UNSIGNED_LONGS,
        }
    }

    /// `None` for rules that need more than the key bytes (file names) or
    /// that are unknown.
    #[must_use]
    pub const fn from_rule(rule: u32) -> Option<Self> {
        match rule {
            COLLATION_BINARY => Some(Self::Binary),
            COLLATION_UNSIGNED_LONG => Some(Self::UnsignedLong),
            COLLATION_SID => Some(Self::Sid),
            COLLATION_SECURITY_HASH => Some(Self::SecurityHash),
            COLLATION_MULTIPLE_UNSIGNED_LONGS => Some(Self::MultipleUnsignedLongs),
            _ => None,
        }
    }
}

/// A short key sorts before any key that has the word.
fn word_at(key: &[u8], index: usize) -> Option<u32> {
    let start = index.checked_mul(4)?;
    let bytes = key.get(start..start.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl Collation for StandardCollation {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::Binary | Self::Sid => a.cmp(b),
            Self::UnsignedLong => word_at(a, 0).cmp(&word_at(b, 0)),
            Self::SecurityHash => word_at(a, 0)
                .cmp(&word_at(b, 0))
                .then_with(|| word_at(a, 1).cmp(&word_at(b, 1))),
            Self::MultipleUnsignedLongs => {
                let words = a.len().max(b.len()) / 4;
                (0..words)
                    .map(|i| word_at(a, i).cmp(&word_at(b, i)))
                    .find(|ord| ord.is_ne())
                    .unwrap_or(Ordering::Equal)
            }
        }
    }
}

#![forbid(unsafe_code)]
//! Error types for the NTFS storage core.
//!
//! # Error Taxonomy
//!
//! Two layers, as in every crate of this workspace:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ntfs-types` | Byte-level format violations (run headers, fixups, index nodes) |
//! | Runtime | `NtfsError` | `ntfs-error` (this crate) | Errors returned by the allocator, the index and the CLI |
//!
//! ## Mapping Policy: ParseError → NtfsError
//!
//! `ntfs-error` does not depend on `ntfs-types`. Conversion happens where
//! both are visible (`ntfs-btree`, `ntfs-core`):
//!
//! | ParseError Variant | NtfsError Variant |
//! |--------------------|-------------------|
//! | `FixupMismatch` | `TornWrite { block, sector }` |
//! | `InvalidMagic` while opening a volume | `Format(detail)` |
//! | anything else while reading live metadata | `Corruption { block, detail }` |
//!
//! `block` is the VCN of the index block, or the byte offset divided by the
//! cluster size for other structures.
//!
//! ## Error classes
//!
//! [`NtfsError::class`] folds the variants into the four kinds callers are
//! expected to branch on: corruption, exhaustion, precondition violation
//! and environment (I/O, lookups). A torn write and a garbage header are
//! both corruption but stay distinguishable by variant.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` / `TornWrite` | `EIO` |
//! | `Format` / `Parse` / `InvalidGeometry` / `InvalidArgument` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified error type for all storage-core operations.
#[derive(Debug, Error)]
pub enum NtfsError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata is structurally invalid at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// A multi-sector block failed its update sequence check: some sectors
    /// hold a newer write than others.
    #[error("torn write detected at block {block}, sector {sector}")]
    TornWrite { block: u64, sector: usize },

    /// Not an NTFS structure at all (wrong magic, wrong OEM id).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Volume geometry out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The caller broke an API precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Not enough free clusters (or index slots) to satisfy a request.
    /// Nothing stays claimed when this is returned.
    #[error("no space left on device: requested {requested}, found {found}")]
    NoSpace { requested: u64, found: u64 },

    /// Key, record, or named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Key or object already present.
    #[error("already exists: {0}")]
    Exists(String),

    /// Mutation attempted through a read-only handle.
    #[error("read-only volume")]
    ReadOnly,
}

/// Coarse classification for callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// On-disk data cannot be trusted; never retried automatically.
    Corruption,
    /// The volume is full.
    Exhaustion,
    /// Programming error on the caller side.
    Precondition,
    /// I/O failure, missing or duplicate object.
    Environment,
}

impl NtfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// Exhaustive: adding a variant is a compile error until it is mapped.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::TornWrite { .. } => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace { .. } => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::ReadOnly => libc::EROFS,
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Corruption { .. } | Self::TornWrite { .. } | Self::Format(_) | Self::Parse(_) => {
                ErrorClass::Corruption
            }
            Self::NoSpace { .. } => ErrorClass::Exhaustion,
            Self::InvalidArgument(_) | Self::InvalidGeometry(_) | Self::ReadOnly => {
                ErrorClass::Precondition
            }
            Self::Io(_) | Self::NotFound(_) | Self::Exists(_) => ErrorClass::Environment,
        }
    }

    /// Shorthand for `Corruption` with a formatted detail.
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }
}

/// Result alias using `NtfsError`.
pub type Result<T> = std::result::Result<T, NtfsError>;

#![forbid(unsafe_code)]
//! On-disk format codecs for the NTFS storage core.
//!
//! Pure parsing crate: no I/O, no side effects. Turns byte slices into typed
//! run lists, update-sequence protected records, index nodes and the boot
//! sector, and back.

pub mod boot;
pub mod fixup;
pub mod index;
pub mod runs;

pub use boot::{BootSector, VolumeGeometry, decode_record_size, encode_record_size};
pub use fixup::{FIXUP_STRIDE, FixupRecord, next_usn, usa_count_for};
pub use index::{
    EntryLayout, INDX_USA_OFFSET, IndexBlock, IndexEntry, IndexNode, IndexNodeHeader, IndexRoot,
    IndexRootHeader,
};
pub use runs::{CookedRun, DataRun, RUN_LIST_END, RunList, var_len};

//! Index node wire formats: the resident `$INDEX_ROOT` value and the `INDX`
//! blocks of the `$INDEX_ALLOCATION` stream.
//!
//! Both share a 16-byte node header followed by 8-byte aligned entries and a
//! terminating "end" entry. The end entry carries no key but may carry the
//! child pointer for keys greater than every entry in the node.
//!
//! Node header (relative to its own start):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00 | 4 | offset to first entry |
//! | 0x04 | 4 | bytes in use (header included) |
//! | 0x08 | 4 | bytes allocated (header included) |
//! | 0x0C | 1 | flags (0x01 = has child nodes) |
//!
//! Entry header:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00 | 8 | file reference (`File` layout) or data offset/length (`Generic`) |
//! | 0x08 | 2 | entry length |
//! | 0x0A | 2 | key length |
//! | 0x0C | 2 | flags (0x01 = child pointer, 0x02 = end entry) |
//! | 0x10 | .. | key, then data (`Generic`), then child VCN in the last 8 bytes |

use crate::fixup::FixupRecord;
use ntfs_types::{
    INDX_MAGIC, ParseError, Vcn, ensure_slice, ensure_slice_mut, read_le_u16, read_le_u32,
    read_le_u64, round_up8, u64_to_usize, usize_to_u16, usize_to_u32, write_bytes, write_le_u16,
    write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const INDEX_ROOT_HEADER_SIZE: usize = 0x10;
pub const INDEX_NODE_HEADER_SIZE: usize = 0x10;
/// Offset of the node header inside an `INDX` block.
pub const INDEX_BLOCK_NODE_OFFSET: usize = 0x18;
/// Offset of the update sequence array inside an `INDX` block.
pub const INDX_USA_OFFSET: u16 = 0x28;
pub const INDEX_ENTRY_HEADER_SIZE: usize = 0x10;

pub const ENTRY_FLAG_NODE: u16 = 0x0001;
pub const ENTRY_FLAG_END: u16 = 0x0002;
pub const NODE_FLAG_HAS_CHILDREN: u8 = 0x01;

const CHILD_POINTER_SIZE: usize = 8;

/// How an entry stores its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntryLayout {
    /// Directory style: the value is an 8-byte file reference stored in the
    /// first eight bytes of the entry header.
    File,
    /// View index style: data offset/length in the header, data after the key.
    #[default]
    Generic,
}

/// One key/value pair in an index node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    /// Child node holding keys ordered before this one.
    pub child: Option<Vcn>,
}

impl IndexEntry {
    #[must_use]
    pub fn new(key: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            key,
            data,
            child: None,
        }
    }

    /// On-disk size of this entry under `layout`.
    #[must_use]
    pub fn encoded_len(&self, layout: EntryLayout) -> usize {
        let inline = match layout {
            EntryLayout::File => INDEX_ENTRY_HEADER_SIZE + self.key.len(),
            EntryLayout::Generic => INDEX_ENTRY_HEADER_SIZE + self.key.len() + self.data.len(),
        };
        round_up8(inline) + child_size(self.child)
    }

    /// Write at `offset`, returning the bytes used.
    pub fn write_into(
        &self,
        buf: &mut [u8],
        offset: usize,
        layout: EntryLayout,
    ) -> Result<usize, ParseError> {
        let len = self.encoded_len(layout);
        ensure_slice_mut(buf, offset, len)?.fill(0);

        match layout {
            EntryLayout::File => {
                if self.data.len() != 8 {
                    return Err(ParseError::InvalidField {
                        field: "index_entry_data",
                        reason: "file index value must be an 8-byte file reference",
                    });
                }
                write_bytes(buf, offset, &self.data)?;
            }
            EntryLayout::Generic => {
                let data_offset = if self.data.is_empty() {
                    0
                } else {
                    INDEX_ENTRY_HEADER_SIZE + self.key.len()
                };
                write_le_u16(buf, offset, usize_to_u16(data_offset, "index_data_offset")?)?;
                write_le_u16(
                    buf,
                    offset + 0x02,
                    usize_to_u16(self.data.len(), "index_data_length")?,
                )?;
                if !self.data.is_empty() {
                    write_bytes(buf, offset + data_offset, &self.data)?;
                }
            }
        }

        let flags = if self.child.is_some() {
            ENTRY_FLAG_NODE
        } else {
            0
        };
        write_le_u16(buf, offset + 0x08, usize_to_u16(len, "index_entry_length")?)?;
        write_le_u16(
            buf,
            offset + 0x0A,
            usize_to_u16(self.key.len(), "index_key_length")?,
        )?;
        write_le_u16(buf, offset + 0x0C, flags)?;
        write_bytes(buf, offset + INDEX_ENTRY_HEADER_SIZE, &self.key)?;
        if let Some(child) = self.child {
            write_le_u64(buf, offset + len - CHILD_POINTER_SIZE, child.0)?;
        }
        Ok(len)
    }
}

fn child_size(child: Option<Vcn>) -> usize {
    if child.is_some() { CHILD_POINTER_SIZE } else { 0 }
}

fn end_entry_len(child: Option<Vcn>) -> usize {
    INDEX_ENTRY_HEADER_SIZE + child_size(child)
}

fn write_end_entry(buf: &mut [u8], offset: usize, child: Option<Vcn>) -> Result<usize, ParseError> {
    let len = end_entry_len(child);
    ensure_slice_mut(buf, offset, len)?.fill(0);
    let flags = ENTRY_FLAG_END | if child.is_some() { ENTRY_FLAG_NODE } else { 0 };
    write_le_u16(buf, offset + 0x08, usize_to_u16(len, "index_entry_length")?)?;
    write_le_u16(buf, offset + 0x0C, flags)?;
    if let Some(child) = child {
        write_le_u64(buf, offset + len - CHILD_POINTER_SIZE, child.0)?;
    }
    Ok(len)
}

enum RawEntry {
    Entry(IndexEntry),
    End(Option<Vcn>),
}

fn parse_entry(
    buf: &[u8],
    offset: usize,
    limit: usize,
    layout: EntryLayout,
) -> Result<(RawEntry, usize), ParseError> {
    let length = usize::from(read_le_u16(buf, offset + 0x08)?);
    let key_len = usize::from(read_le_u16(buf, offset + 0x0A)?);
    let flags = read_le_u16(buf, offset + 0x0C)?;

    if length < INDEX_ENTRY_HEADER_SIZE || length % 8 != 0 {
        return Err(ParseError::InvalidField {
            field: "index_entry_length",
            reason: "shorter than header or unaligned",
        });
    }
    if offset + length > limit {
        return Err(ParseError::InvalidField {
            field: "index_entry_length",
            reason: "entry extends past node",
        });
    }

    let child = if flags & ENTRY_FLAG_NODE != 0 {
        if length < INDEX_ENTRY_HEADER_SIZE + CHILD_POINTER_SIZE {
            return Err(ParseError::InvalidField {
                field: "index_entry_length",
                reason: "no room for child pointer",
            });
        }
        Some(Vcn(read_le_u64(buf, offset + length - CHILD_POINTER_SIZE)?))
    } else {
        None
    };
    let body_end = length - child_size(child);

    if flags & ENTRY_FLAG_END != 0 {
        return Ok((RawEntry::End(child), length));
    }

    if INDEX_ENTRY_HEADER_SIZE + key_len > body_end {
        return Err(ParseError::InvalidField {
            field: "index_key_length",
            reason: "key extends past entry",
        });
    }
    let key = ensure_slice(buf, offset + INDEX_ENTRY_HEADER_SIZE, key_len)?.to_vec();

    let data = match layout {
        EntryLayout::File => ensure_slice(buf, offset, 8)?.to_vec(),
        EntryLayout::Generic => {
            let data_offset = usize::from(read_le_u16(buf, offset)?);
            let data_len = usize::from(read_le_u16(buf, offset + 0x02)?);
            if data_len == 0 {
                Vec::new()
            } else {
                if data_offset < INDEX_ENTRY_HEADER_SIZE || data_offset + data_len > body_end {
                    return Err(ParseError::InvalidField {
                        field: "index_data_offset",
                        reason: "data outside entry",
                    });
                }
                ensure_slice(buf, offset + data_offset, data_len)?.to_vec()
            }
        }
    };

    Ok((RawEntry::Entry(IndexEntry { key, data, child }), length))
}

/// The 16-byte header in front of every node's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexNodeHeader {
    pub first_entry_offset: u32,
    pub total_size: u32,
    pub allocated_size: u32,
    pub flags: u8,
}

impl IndexNodeHeader {
    pub fn parse(buf: &[u8], at: usize) -> Result<Self, ParseError> {
        ensure_slice(buf, at, INDEX_NODE_HEADER_SIZE)?;
        Ok(Self {
            first_entry_offset: read_le_u32(buf, at)?,
            total_size: read_le_u32(buf, at + 0x04)?,
            allocated_size: read_le_u32(buf, at + 0x08)?,
            flags: buf[at + 0x0C],
        })
    }

    pub fn write(&self, buf: &mut [u8], at: usize) -> Result<(), ParseError> {
        ensure_slice_mut(buf, at, INDEX_NODE_HEADER_SIZE)?.fill(0);
        write_le_u32(buf, at, self.first_entry_offset)?;
        write_le_u32(buf, at + 0x04, self.total_size)?;
        write_le_u32(buf, at + 0x08, self.allocated_size)?;
        buf[at + 0x0C] = self.flags;
        Ok(())
    }

    #[must_use]
    pub fn has_children(&self) -> bool {
        self.flags & NODE_FLAG_HAS_CHILDREN != 0
    }
}

/// Decoded node: ordered entries plus the end entry's child pointer.
///
/// In an interior node every entry and the end entry carry a child; in a
/// leaf none do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexNode {
    pub entries: Vec<IndexEntry>,
    pub end_child: Option<Vcn>,
}

impl IndexNode {
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.end_child.is_none()
    }

    /// Bytes used by the entries, end entry included.
    #[must_use]
    pub fn entries_size(&self, layout: EntryLayout) -> usize {
        self.entries
            .iter()
            .map(|e| e.encoded_len(layout))
            .sum::<usize>()
            + end_entry_len(self.end_child)
    }

    fn check_children(&self) -> Result<(), ParseError> {
        let interior = self.end_child.is_some();
        if self.entries.iter().any(|e| e.child.is_some() != interior) {
            return Err(ParseError::InvalidField {
                field: "index_entry_flags",
                reason: "child pointers inconsistent within node",
            });
        }
        Ok(())
    }

    /// Parse the node whose header starts at `header_at`.
    pub fn parse(
        buf: &[u8],
        header_at: usize,
        layout: EntryLayout,
    ) -> Result<(IndexNodeHeader, Self), ParseError> {
        let header = IndexNodeHeader::parse(buf, header_at)?;
        let first = u64_to_usize(u64::from(header.first_entry_offset), "first_entry_offset")?;
        let total = u64_to_usize(u64::from(header.total_size), "total_size")?;
        if first < INDEX_NODE_HEADER_SIZE || first > total || header.total_size > header.allocated_size {
            return Err(ParseError::InvalidField {
                field: "index_node_header",
                reason: "entry area out of order",
            });
        }
        let limit = header_at + total;
        ensure_slice(buf, header_at, total)?;

        let mut entries = Vec::new();
        let mut pos = header_at + first;
        let end_child = loop {
            if pos >= limit {
                return Err(ParseError::InvalidField {
                    field: "index_entries",
                    reason: "missing end entry",
                });
            }
            let (raw, used) = parse_entry(buf, pos, limit, layout)?;
            pos += used;
            match raw {
                RawEntry::Entry(entry) => entries.push(entry),
                RawEntry::End(child) => break child,
            }
        };

        let node = Self { entries, end_child };
        node.check_children()?;
        if header.has_children() != node.end_child.is_some() {
            return Err(ParseError::InvalidField {
                field: "index_node_flags",
                reason: "has-children flag disagrees with entries",
            });
        }
        Ok((header, node))
    }

    /// Serialise at `header_at`, returning the header that was written.
    ///
    /// Fails if the entries do not fit in `allocated_size` bytes (header
    /// included) or the child pointers are inconsistent.
    pub fn write(
        &self,
        buf: &mut [u8],
        header_at: usize,
        first_entry_offset: usize,
        allocated_size: usize,
        layout: EntryLayout,
    ) -> Result<IndexNodeHeader, ParseError> {
        self.check_children()?;
        let total = first_entry_offset + self.entries_size(layout);
        if total > allocated_size {
            return Err(ParseError::InvalidField {
                field: "index_entries",
                reason: "node overflows its allocation",
            });
        }
        ensure_slice_mut(buf, header_at, allocated_size)?.fill(0);

        let header = IndexNodeHeader {
            first_entry_offset: usize_to_u32(first_entry_offset, "first_entry_offset")?,
            total_size: usize_to_u32(total, "total_size")?,
            allocated_size: usize_to_u32(allocated_size, "allocated_size")?,
            flags: if self.end_child.is_some() {
                NODE_FLAG_HAS_CHILDREN
            } else {
                0
            },
        };
        header.write(buf, header_at)?;

        let mut pos = header_at + first_entry_offset;
        for entry in &self.entries {
            pos += entry.write_into(buf, pos, layout)?;
        }
        write_end_entry(buf, pos, self.end_child)?;
        Ok(header)
    }
}

/// Fixed prefix of the `$INDEX_ROOT` attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRootHeader {
    /// Type of the indexed attribute (0x30 for file names, 0 for views).
    pub attribute_type: u32,
    pub collation_rule: u32,
    pub index_buffer_size: u32,
    pub clusters_per_index_block: u8,
}

impl IndexRootHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(buf, 0, INDEX_ROOT_HEADER_SIZE)?;
        Ok(Self {
            attribute_type: read_le_u32(buf, 0x00)?,
            collation_rule: read_le_u32(buf, 0x04)?,
            index_buffer_size: read_le_u32(buf, 0x08)?,
            clusters_per_index_block: buf[0x0C],
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice_mut(buf, 0, INDEX_ROOT_HEADER_SIZE)?.fill(0);
        write_le_u32(buf, 0x00, self.attribute_type)?;
        write_le_u32(buf, 0x04, self.collation_rule)?;
        write_le_u32(buf, 0x08, self.index_buffer_size)?;
        buf[0x0C] = self.clusters_per_index_block;
        Ok(())
    }
}

/// The resident root: header plus the top node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRoot {
    pub header: IndexRootHeader,
    pub node: IndexNode,
}

impl IndexRoot {
    /// Bytes of root value that are not entries.
    pub const OVERHEAD: usize = INDEX_ROOT_HEADER_SIZE + INDEX_NODE_HEADER_SIZE;

    pub fn parse(buf: &[u8], layout: EntryLayout) -> Result<Self, ParseError> {
        let header = IndexRootHeader::parse(buf)?;
        let (_, node) = IndexNode::parse(buf, INDEX_ROOT_HEADER_SIZE, layout)?;
        Ok(Self { header, node })
    }

    #[must_use]
    pub fn encoded_len(&self, layout: EntryLayout) -> usize {
        Self::OVERHEAD + self.node.entries_size(layout)
    }

    /// Serialise to exactly [`encoded_len`](Self::encoded_len) bytes.
    pub fn to_bytes(&self, layout: EntryLayout) -> Result<Vec<u8>, ParseError> {
        let len = self.encoded_len(layout);
        let mut buf = vec![0_u8; len];
        self.header.write(&mut buf)?;
        self.node.write(
            &mut buf,
            INDEX_ROOT_HEADER_SIZE,
            INDEX_NODE_HEADER_SIZE,
            len - INDEX_ROOT_HEADER_SIZE,
            layout,
        )?;
        Ok(buf)
    }
}

/// One `INDX` block from the allocation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    pub lsn: u64,
    pub vcn: Vcn,
    /// Update sequence number of the last protect; bumped on every encode.
    pub usn: u16,
    pub node: IndexNode,
}

impl IndexBlock {
    #[must_use]
    pub fn new(vcn: Vcn, node: IndexNode) -> Self {
        Self {
            lsn: 0,
            vcn,
            usn: 0,
            node,
        }
    }

    /// Node-relative offset of the first entry for a block of `block_size`.
    pub fn first_entry_offset(block_size: usize) -> Result<usize, ParseError> {
        let usa_count = crate::fixup::usa_count_for(block_size)?;
        Ok(round_up8(INDEX_NODE_HEADER_SIZE + usize::from(usa_count) * 2))
    }

    /// Bytes available for entries (end entry included) in one block.
    pub fn entry_capacity(block_size: usize) -> Result<usize, ParseError> {
        let first = Self::first_entry_offset(block_size)?;
        block_size
            .checked_sub(INDEX_BLOCK_NODE_OFFSET + first)
            .ok_or(ParseError::InvalidField {
                field: "index_buffer_size",
                reason: "too small for block header",
            })
    }

    /// Verify the fixups of `raw` in place and decode the block.
    pub fn decode(raw: &mut [u8], layout: EntryLayout) -> Result<Self, ParseError> {
        let fixup = FixupRecord::unprotect(raw, INDX_MAGIC)?;
        let lsn = read_le_u64(raw, 0x08)?;
        let vcn = Vcn(read_le_u64(raw, 0x10)?);
        let (_, node) = IndexNode::parse(raw, INDEX_BLOCK_NODE_OFFSET, layout)?;
        Ok(Self {
            lsn,
            vcn,
            usn: fixup.usn,
            node,
        })
    }

    /// Serialise and protect into a `block_size` buffer ready for writing.
    pub fn encode(&mut self, block_size: usize, layout: EntryLayout) -> Result<Vec<u8>, ParseError> {
        let mut fixup = FixupRecord::new(INDX_MAGIC, INDX_USA_OFFSET, block_size)?;
        fixup.usn = self.usn;
        let first = Self::first_entry_offset(block_size)?;
        let allocated = block_size
            .checked_sub(INDEX_BLOCK_NODE_OFFSET)
            .ok_or(ParseError::InvalidField {
                field: "index_buffer_size",
                reason: "too small for block header",
            })?;

        let mut buf = vec![0_u8; block_size];
        write_le_u64(&mut buf, 0x08, self.lsn)?;
        write_le_u64(&mut buf, 0x10, self.vcn.0)?;
        self.node
            .write(&mut buf, INDEX_BLOCK_NODE_OFFSET, first, allocated, layout)?;
        fixup.protect(&mut buf)?;
        self.usn = fixup.usn;
        Ok(buf)
    }
}

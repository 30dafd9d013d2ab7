#![forbid(unsafe_code)]
//! NTFS index B-tree.
//!
//! An index is an ordered key/value map stored in three streams of its
//! owning file:
//!
//! - the resident `$INDEX_ROOT` value: a small header plus the top node,
//! - the `$INDEX_ALLOCATION` stream: fixed-size `INDX` blocks addressed by
//!   VCN, each protected by update sequence fixups,
//! - the `$BITMAP` stream: one bit per block slot of the allocation stream.
//!
//! Values live at every level. An entry's child holds the keys ordered
//! before it; the end entry's child holds the keys after the last entry.
//! Either every entry of a node has a child or none does.
//!
//! ## Balancing
//!
//! - A block that overflows is divided around its byte midpoint: the left
//!   half moves to a new block and the middle entry moves up to the parent
//!   pointing at it. The right half keeps the original VCN.
//! - A root that overflows is deposed: all its entries move into a new block
//!   and the root keeps only an end entry pointing there.
//! - Removing an entry that has a child replaces it with the largest entry of
//!   that child's subtree.
//! - A block left with no entries is freed. An empty leaf's separator is
//!   pushed down into the neighbouring subtree; an empty interior block is
//!   replaced by its only child. There is no merging of sparse siblings.

pub mod collation;

pub use collation::{Collation, StandardCollation};

use ntfs_alloc::Bitmap;
use ntfs_block::{ByteDevice, read_all, replace_all};
use ntfs_error::{NtfsError, Result};
use ntfs_ondisk::{
    EntryLayout, IndexBlock, IndexEntry, IndexNode, IndexRoot, IndexRootHeader, VolumeGeometry,
};
use ntfs_types::{ClusterSize, FileRecordReference, ParseError, Vcn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, trace};

// ── Constants ───────────────────────────────────────────────────────────────

/// `block` reported in errors about the resident root node.
pub const ROOT_NODE: u64 = u64::MAX;

/// Size of an end entry carrying a child pointer.
const END_ENTRY_WITH_CHILD: usize = 0x18;

/// Size added to an entry when it gains a child pointer.
const CHILD_POINTER_SIZE: usize = 8;

/// Deeper than any index a real volume can hold; deeper means a cycle.
const MAX_DEPTH: usize = 32;

// ── Options ─────────────────────────────────────────────────────────────────

/// Sizing and format parameters of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Bytes per `INDX` block.
    pub index_buffer_size: u32,
    pub bytes_per_cluster: u32,
    /// Bytes the resident root value may occupy, header included.
    pub root_capacity: u32,
    pub layout: EntryLayout,
    /// Attribute type recorded in the root header (0x30 for file names).
    pub attribute_type: u32,
    pub collation_rule: u32,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            index_buffer_size: 4096,
            bytes_per_cluster: 4096,
            root_capacity: 480,
            layout: EntryLayout::Generic,
            attribute_type: 0,
            collation_rule: collation::COLLATION_BINARY,
        }
    }
}

impl IndexOptions {
    /// Defaults with block and cluster sizes taken from the volume.
    #[must_use]
    pub fn for_geometry(geometry: &VolumeGeometry) -> Self {
        Self {
            index_buffer_size: geometry.index_buffer_size,
            bytes_per_cluster: u32::try_from(geometry.bytes_per_cluster()).unwrap_or(u32::MAX),
            ..Self::default()
        }
    }

    fn block_size(&self) -> usize {
        self.index_buffer_size as usize
    }

    /// Entry bytes (end entry included) one block holds.
    pub fn block_capacity(&self) -> Result<usize> {
        IndexBlock::entry_capacity(self.block_size())
            .map_err(|err| NtfsError::InvalidArgument(format!("index buffer size: {err}")))
    }

    /// Entry bytes (end entry included) the resident root holds.
    #[must_use]
    pub fn root_entry_capacity(&self) -> usize {
        (self.root_capacity as usize).saturating_sub(IndexRoot::OVERHEAD)
    }

    /// Largest entry, child pointer included, that keeps block division
    /// producing two non-empty halves that both fit.
    pub fn max_entry_len(&self) -> Result<usize> {
        Ok((self.block_capacity()? - END_ENTRY_WITH_CHILD) / 2)
    }

    /// VCN distance between consecutive block slots.
    #[must_use]
    pub fn vcn_stride(&self) -> u64 {
        u64::from(self.index_buffer_size)
            .div_ceil(u64::from(self.bytes_per_cluster).max(1))
            .max(1)
    }

    /// Root header field: clusters per block, or 512-byte units per block
    /// when a cluster is larger than a block.
    #[must_use]
    pub fn clusters_per_index_block(&self) -> u8 {
        let units = if self.bytes_per_cluster <= self.index_buffer_size {
            self.vcn_stride()
        } else {
            u64::from(self.index_buffer_size / 512)
        };
        u8::try_from(units).unwrap_or(u8::MAX)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.index_buffer_size.is_power_of_two() || !(512..=65_536).contains(&self.index_buffer_size)
        {
            return Err(NtfsError::InvalidArgument(format!(
                "index buffer size {} must be a power of two in 512..=65536",
                self.index_buffer_size
            )));
        }
        ClusterSize::new(self.bytes_per_cluster)
            .map_err(|err| NtfsError::InvalidArgument(format!("bytes per cluster: {err}")))?;
        let block_capacity = self.block_capacity()?;
        let root_entries = self.root_entry_capacity();
        if root_entries < END_ENTRY_WITH_CHILD {
            return Err(NtfsError::InvalidArgument(format!(
                "root capacity {} cannot hold an end entry",
                self.root_capacity
            )));
        }
        if root_entries > block_capacity - END_ENTRY_WITH_CHILD {
            return Err(NtfsError::InvalidArgument(format!(
                "root capacity {} exceeds what one index block holds",
                self.root_capacity
            )));
        }
        Ok(())
    }

    fn root_header(&self) -> IndexRootHeader {
        IndexRootHeader {
            attribute_type: self.attribute_type,
            collation_rule: self.collation_rule,
            index_buffer_size: self.index_buffer_size,
            clusters_per_index_block: self.clusters_per_index_block(),
        }
    }
}

// ── Node helpers ────────────────────────────────────────────────────────────

/// Child holding the keys at `pos`: before entry `pos`, or after the last
/// entry when `pos == entries.len()`.
fn child_at(node: &IndexNode, pos: usize) -> Option<Vcn> {
    match node.entries.get(pos) {
        Some(entry) => entry.child,
        None => node.end_child,
    }
}

fn set_child_at(node: &mut IndexNode, pos: usize, child: Option<Vcn>) {
    match node.entries.get_mut(pos) {
        Some(entry) => entry.child = child,
        None => node.end_child = child,
    }
}

/// Index of the entry that moves up when `entries` are divided: the first
/// whose inclusion passes half the bytes, kept off both ends.
fn division_point(entries: &[IndexEntry], layout: EntryLayout) -> Option<usize> {
    if entries.len() < 3 {
        return None;
    }
    let total: usize = entries.iter().map(|e| e.encoded_len(layout)).sum();
    let mut running = 0;
    let mut mid = entries.len() - 2;
    for (i, entry) in entries.iter().enumerate() {
        running += entry.encoded_len(layout);
        if running * 2 > total {
            mid = i;
            break;
        }
    }
    Some(mid.clamp(1, entries.len() - 2))
}

/// How a child ended up after a mutation, as seen by its parent.
#[derive(Debug)]
enum ChildOutcome {
    /// Stored in place; nothing for the parent to do.
    Settled,
    /// Divided: these entries, in order, point at the new blocks and belong
    /// in the parent just before the child's slot.
    Divided(Vec<IndexEntry>),
    /// No entries left and not stored; the parent frees the block. `Some`
    /// is the only remaining grandchild.
    Emptied(Option<Vcn>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Insert,
    Update,
    Upsert,
}

/// Shape of an index, as found by [`Index::verify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub entries: usize,
    pub blocks: usize,
    /// Levels below the root on the longest path.
    pub depth: usize,
}

// ── Index ───────────────────────────────────────────────────────────────────

/// An ordered key/value index over its root, allocation and bitmap streams.
pub struct Index<C> {
    root_stream: Arc<dyn ByteDevice>,
    alloc_stream: Arc<dyn ByteDevice>,
    slots: Bitmap,
    header: IndexRootHeader,
    root: IndexNode,
    options: IndexOptions,
    collation: C,
}

impl<C> std::fmt::Debug for Index<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("header", &self.header)
            .field("root_entries", &self.root.entries.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<C: Collation> Index<C> {
    /// Create an empty index, truncating all three streams.
    pub fn create(
        root_stream: Arc<dyn ByteDevice>,
        alloc_stream: Arc<dyn ByteDevice>,
        bitmap_stream: Arc<dyn ByteDevice>,
        options: IndexOptions,
        collation: C,
    ) -> Result<Self> {
        options.validate()?;
        alloc_stream.set_len(0)?;
        bitmap_stream.set_len(0)?;
        let index = Self {
            root_stream,
            alloc_stream,
            slots: Bitmap::open(bitmap_stream, u64::MAX)?,
            header: options.root_header(),
            root: IndexNode::default(),
            options,
            collation,
        };
        index.store_root()?;
        debug!(
            index_buffer_size = options.index_buffer_size,
            collation_rule = options.collation_rule,
            "index_create"
        );
        Ok(index)
    }

    /// Open an existing index. Block size, attribute type and collation rule
    /// come from the stored root header; the rest from `options`.
    pub fn open(
        root_stream: Arc<dyn ByteDevice>,
        alloc_stream: Arc<dyn ByteDevice>,
        bitmap_stream: Arc<dyn ByteDevice>,
        mut options: IndexOptions,
        collation: C,
    ) -> Result<Self> {
        let raw = read_all(root_stream.as_ref())?;
        let parsed = IndexRoot::parse(&raw, options.layout).map_err(|err| parse_failure(ROOT_NODE, err))?;
        options.index_buffer_size = parsed.header.index_buffer_size;
        options.attribute_type = parsed.header.attribute_type;
        options.collation_rule = parsed.header.collation_rule;
        options.validate()?;
        trace!(entries = parsed.node.entries.len(), "index_open");
        Ok(Self {
            root_stream,
            alloc_stream,
            slots: Bitmap::open(bitmap_stream, u64::MAX)?,
            header: parsed.header,
            root: parsed.node,
            options,
            collation,
        })
    }

    #[must_use]
    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    #[must_use]
    pub fn root_header(&self) -> &IndexRootHeader {
        &self.header
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    /// Position of `key` among `node`'s entries, and whether it is there.
    fn position(&self, node: &IndexNode, key: &[u8]) -> (usize, bool) {
        match node
            .entries
            .binary_search_by(|entry| self.collation.compare(&entry.key, key))
        {
            Ok(pos) => (pos, true),
            Err(pos) => (pos, false),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (pos, found) = self.position(&self.root, key);
        if found {
            return Ok(Some(self.root.entries[pos].data.clone()));
        }
        let mut next = child_at(&self.root, pos);
        let mut depth = 0;
        while let Some(vcn) = next {
            depth += 1;
            let block = self.load_block(vcn, depth)?;
            let (pos, found) = self.position(&block.node, key);
            if found {
                return Ok(Some(block.node.entries[pos].data.clone()));
            }
            next = child_at(&block.node, pos);
        }
        Ok(None)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Value of a file-layout entry as a file reference.
    pub fn get_file_reference(&self, key: &[u8]) -> Result<Option<FileRecordReference>> {
        self.get(key)?
            .map(|data| {
                FileRecordReference::read_from(&data, 0)
                    .map_err(|err| NtfsError::Parse(err.to_string()))
            })
            .transpose()
    }

    /// Visit every entry in key order.
    pub fn walk<F>(&self, visit: &mut F) -> Result<()>
    where
        F: FnMut(&IndexEntry) -> Result<()>,
    {
        self.walk_node(&self.root, 0, visit)
    }

    fn walk_node<F>(&self, node: &IndexNode, depth: usize, visit: &mut F) -> Result<()>
    where
        F: FnMut(&IndexEntry) -> Result<()>,
    {
        for entry in &node.entries {
            if let Some(child) = entry.child {
                let block = self.load_block(child, depth + 1)?;
                self.walk_node(&block.node, depth + 1, visit)?;
            }
            visit(entry)?;
        }
        if let Some(child) = node.end_child {
            let block = self.load_block(child, depth + 1)?;
            self.walk_node(&block.node, depth + 1, visit)?;
        }
        Ok(())
    }

    /// All `(key, value)` pairs in key order.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        self.walk(&mut |entry| {
            out.push((entry.key.clone(), entry.data.clone()));
            Ok(())
        })?;
        Ok(out)
    }

    pub fn len(&self) -> Result<usize> {
        let mut count = 0;
        self.walk(&mut |_| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.entries.is_empty() && self.root.end_child.is_none()
    }

    /// Every entry whose key falls in a contiguous range, in key order.
    ///
    /// `probe(key)` says where `key` lies relative to the range: `Less`
    /// before it, `Equal` inside, `Greater` after. Subtrees wholly before or
    /// after the range are not read.
    pub fn find_all<P>(&self, probe: P) -> Result<Vec<(Vec<u8>, Vec<u8>)>>
    where
        P: Fn(&[u8]) -> Ordering,
    {
        let mut out = Vec::new();
        self.find_in(&self.root, 0, &probe, &mut out)?;
        Ok(out)
    }

    fn find_in<P>(
        &self,
        node: &IndexNode,
        depth: usize,
        probe: &P,
        out: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<bool>
    where
        P: Fn(&[u8]) -> Ordering,
    {
        for entry in &node.entries {
            let place = probe(&entry.key);
            if place != Ordering::Less {
                if let Some(child) = entry.child {
                    let block = self.load_block(child, depth + 1)?;
                    if !self.find_in(&block.node, depth + 1, probe, out)? {
                        return Ok(false);
                    }
                }
            }
            match place {
                Ordering::Less => {}
                Ordering::Equal => out.push((entry.key.clone(), entry.data.clone())),
                Ordering::Greater => return Ok(false),
            }
        }
        if let Some(child) = node.end_child {
            let block = self.load_block(child, depth + 1)?;
            return self.find_in(&block.node, depth + 1, probe, out);
        }
        Ok(true)
    }

    // ── Mutation ────────────────────────────────────────────────────────

    /// Add a new entry; [`NtfsError::Exists`] if the key is present.
    pub fn insert(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        self.write(key, data, WriteMode::Insert)
    }

    /// Replace the value of an existing entry; [`NtfsError::NotFound`] if
    /// the key is absent.
    pub fn update(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        self.write(key, data, WriteMode::Update)
    }

    /// Insert or replace.
    pub fn upsert(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        self.write(key, data, WriteMode::Upsert)
    }

    fn check_entry(&self, entry: &IndexEntry) -> Result<()> {
        if self.options.layout == EntryLayout::File && entry.data.len() != FileRecordReference::SIZE {
            return Err(NtfsError::InvalidArgument(format!(
                "file index value must be {} bytes, got {}",
                FileRecordReference::SIZE,
                entry.data.len()
            )));
        }
        let len = entry.encoded_len(self.options.layout) + CHILD_POINTER_SIZE;
        let max = self.options.max_entry_len()?;
        if len > max {
            return Err(NtfsError::InvalidArgument(format!(
                "index entry of {len} bytes exceeds the {max}-byte limit"
            )));
        }
        Ok(())
    }

    fn write(&mut self, key: &[u8], data: &[u8], mode: WriteMode) -> Result<()> {
        let entry = IndexEntry::new(key.to_vec(), data.to_vec());
        self.check_entry(&entry)?;
        trace!(key_len = key.len(), data_len = data.len(), mode = ?mode, "index_write");

        let mut root = self.root.clone();
        self.write_in(&mut root, entry, mode, 0)?;
        self.root = root;
        self.settle_root()
    }

    fn write_in(
        &mut self,
        node: &mut IndexNode,
        entry: IndexEntry,
        mode: WriteMode,
        depth: usize,
    ) -> Result<()> {
        let (pos, found) = self.position(node, &entry.key);
        if found {
            if mode == WriteMode::Insert {
                return Err(NtfsError::Exists(format!(
                    "index key {}",
                    hex(&entry.key)
                )));
            }
            let slot = &mut node.entries[pos];
            slot.key = entry.key;
            slot.data = entry.data;
            return Ok(());
        }
        match child_at(node, pos) {
            None => {
                if mode == WriteMode::Update {
                    return Err(NtfsError::NotFound(format!(
                        "index key {}",
                        hex(&entry.key)
                    )));
                }
                node.entries.insert(pos, entry);
                Ok(())
            }
            Some(child) => {
                let outcome = self.write_in_block(child, entry, mode, depth + 1)?;
                self.absorb(node, pos, outcome, depth)
            }
        }
    }

    fn write_in_block(
        &mut self,
        vcn: Vcn,
        entry: IndexEntry,
        mode: WriteMode,
        depth: usize,
    ) -> Result<ChildOutcome> {
        let mut block = self.load_block(vcn, depth)?;
        self.write_in(&mut block.node, entry, mode, depth)?;
        self.settle_block(block)
    }

    /// Remove `key`, returning whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let mut root = self.root.clone();
        if !self.remove_in(&mut root, key, 0)? {
            return Ok(false);
        }
        self.root = root;
        trace!(key_len = key.len(), "index_remove");
        self.collapse_root()?;
        self.settle_root()?;
        Ok(true)
    }

    fn remove_in(&mut self, node: &mut IndexNode, key: &[u8], depth: usize) -> Result<bool> {
        let (pos, found) = self.position(node, key);
        if found {
            match node.entries[pos].child {
                None => {
                    node.entries.remove(pos);
                }
                Some(child) => {
                    let (largest, outcome) = self.take_largest_in_block(child, depth + 1)?;
                    let slot = &mut node.entries[pos];
                    slot.key = largest.key;
                    slot.data = largest.data;
                    self.absorb(node, pos, outcome, depth)?;
                }
            }
            return Ok(true);
        }
        let Some(child) = child_at(node, pos) else {
            return Ok(false);
        };
        let mut block = self.load_block(child, depth + 1)?;
        if !self.remove_in(&mut block.node, key, depth + 1)? {
            return Ok(false);
        }
        let outcome = self.settle_block(block)?;
        self.absorb(node, pos, outcome, depth)?;
        Ok(true)
    }

    fn take_largest_in_block(&mut self, vcn: Vcn, depth: usize) -> Result<(IndexEntry, ChildOutcome)> {
        let mut block = self.load_block(vcn, depth)?;
        let largest = match block.node.end_child {
            None => block.node.entries.pop().ok_or_else(|| {
                invariant_violation(vcn.0, "non-root leaf is not empty", "empty leaf block")
            })?,
            Some(child) => {
                let (largest, outcome) = self.take_largest_in_block(child, depth + 1)?;
                let pos = block.node.entries.len();
                self.absorb(&mut block.node, pos, outcome, depth)?;
                largest
            }
        };
        let outcome = self.settle_block(block)?;
        Ok((largest, outcome))
    }

    /// Fold a child's outcome into `node`, the child being the one at `pos`.
    fn absorb(
        &mut self,
        node: &mut IndexNode,
        pos: usize,
        outcome: ChildOutcome,
        depth: usize,
    ) -> Result<()> {
        match outcome {
            ChildOutcome::Settled => Ok(()),
            ChildOutcome::Divided(separators) => {
                node.entries.splice(pos..pos, separators);
                Ok(())
            }
            ChildOutcome::Emptied(Some(grandchild)) => {
                if let Some(old) = child_at(node, pos) {
                    self.free_block(old, "lifted")?;
                }
                set_child_at(node, pos, Some(grandchild));
                Ok(())
            }
            ChildOutcome::Emptied(None) => {
                if let Some(old) = child_at(node, pos) {
                    self.free_block(old, "emptied")?;
                }
                if pos < node.entries.len() {
                    // The separator has nothing left before it: it becomes
                    // the smallest key of the next subtree.
                    let mut entry = node.entries.remove(pos);
                    entry.child = None;
                    self.push_down(node, pos, entry, depth)
                } else if let Some(mut last) = node.entries.pop() {
                    // The last entry's subtree takes over the end slot and
                    // receives the entry as its new largest key.
                    node.end_child = last.child.take();
                    let pos = node.entries.len();
                    self.push_down(node, pos, last, depth)
                } else {
                    node.end_child = None;
                    Ok(())
                }
            }
        }
    }

    fn push_down(
        &mut self,
        node: &mut IndexNode,
        pos: usize,
        entry: IndexEntry,
        depth: usize,
    ) -> Result<()> {
        let Some(child) = child_at(node, pos) else {
            return Err(invariant_violation(
                ROOT_NODE,
                "interior node has a child in every slot",
                "missing child pointer",
            ));
        };
        let outcome = self.write_in_block(child, entry, WriteMode::Insert, depth + 1)?;
        self.absorb(node, pos, outcome, depth)
    }

    /// Store a modified block, dividing it until every part fits.
    fn settle_block(&mut self, mut block: IndexBlock) -> Result<ChildOutcome> {
        let layout = self.options.layout;
        if block.node.entries.is_empty() {
            return Ok(ChildOutcome::Emptied(block.node.end_child));
        }
        if block.node.entries_size(layout) <= self.options.block_capacity()? {
            self.store_block(&mut block)?;
            return Ok(ChildOutcome::Settled);
        }

        let Some(mid) = division_point(&block.node.entries, layout) else {
            return Err(invariant_violation(
                block.vcn.0,
                "overflowing block has at least three entries",
                "cannot divide index block",
            ));
        };
        let mut entries = std::mem::take(&mut block.node.entries);
        block.node.entries = entries.split_off(mid + 1);
        let Some(mut separator) = entries.pop() else {
            return Err(invariant_violation(
                block.vcn.0,
                "division point inside entries",
                "cannot divide index block",
            ));
        };
        let left = IndexNode {
            entries,
            end_child: separator.child,
        };
        let left_vcn = self.allocate_block("divide")?;
        debug!(
            node = block.vcn.0,
            new_node = left_vcn.0,
            left_entries = left.entries.len(),
            right_entries = block.node.entries.len(),
            "index_node_split"
        );
        let right_vcn = block.vcn;

        // A half can still overflow when one mutation grew a node twice.
        let mut separators = self.settle_half(IndexBlock::new(left_vcn, left))?;
        separator.child = Some(left_vcn);
        separators.push(separator);
        separators.extend(self.settle_half(block)?);
        trace!(node = right_vcn.0, separators = separators.len(), "index_node_divided");
        Ok(ChildOutcome::Divided(separators))
    }

    fn settle_half(&mut self, half: IndexBlock) -> Result<Vec<IndexEntry>> {
        let vcn = half.vcn;
        match self.settle_block(half)? {
            ChildOutcome::Settled => Ok(Vec::new()),
            ChildOutcome::Divided(separators) => Ok(separators),
            ChildOutcome::Emptied(_) => Err(invariant_violation(
                vcn.0,
                "division halves are not empty",
                "empty half after division",
            )),
        }
    }

    /// Depose the root until it fits, then store it.
    fn settle_root(&mut self) -> Result<()> {
        let layout = self.options.layout;
        while self.root.entries_size(layout) > self.options.root_entry_capacity() {
            let moved = std::mem::take(&mut self.root);
            let entries = moved.entries.len();
            let vcn = self.allocate_block("depose")?;
            self.root.end_child = Some(vcn);
            debug!(new_node = vcn.0, entries, "index_root_depose");
            match self.settle_block(IndexBlock::new(vcn, moved))? {
                ChildOutcome::Settled => {}
                ChildOutcome::Divided(separators) => {
                    self.root.entries.splice(0..0, separators);
                }
                ChildOutcome::Emptied(_) => {
                    return Err(invariant_violation(
                        ROOT_NODE,
                        "deposed root is not empty",
                        "empty root deposed",
                    ));
                }
            }
        }
        self.store_root()
    }

    /// Pull a lone child back into an entry-less root while it fits.
    fn collapse_root(&mut self) -> Result<()> {
        while self.root.entries.is_empty() {
            let Some(child) = self.root.end_child else {
                break;
            };
            let block = self.load_block(child, 1)?;
            if block.node.entries_size(self.options.layout) > self.options.root_entry_capacity() {
                break;
            }
            self.root = block.node;
            self.free_block(child, "collapsed_into_root")?;
        }
        Ok(())
    }

    // ── Storage ─────────────────────────────────────────────────────────

    fn block_position(&self, vcn: Vcn) -> Result<u64> {
        let stride = self.options.vcn_stride();
        if vcn.0 % stride != 0 {
            return Err(invariant_violation(
                vcn.0,
                "vcn is a multiple of the block stride",
                &format!("vcn {} not a multiple of {stride}", vcn.0),
            ));
        }
        let cluster = u64::from(self.options.bytes_per_cluster);
        let buffer = u64::from(self.options.index_buffer_size);
        let position = if cluster <= buffer {
            vcn.0.checked_mul(cluster)
        } else {
            (vcn.0 / stride).checked_mul(buffer)
        };
        position.ok_or_else(|| invariant_violation(vcn.0, "block position fits u64", "vcn out of range"))
    }

    fn load_block(&self, vcn: Vcn, depth: usize) -> Result<IndexBlock> {
        if depth > MAX_DEPTH {
            return Err(invariant_violation(
                vcn.0,
                "depth<=MAX_DEPTH",
                "index deeper than any valid tree",
            ));
        }
        let slot = vcn.0 / self.options.vcn_stride();
        if !self.slots.is_present(slot) {
            return Err(invariant_violation(
                vcn.0,
                "referenced block is allocated",
                "child points at a free index block",
            ));
        }
        let position = self.block_position(vcn)?;
        let mut raw = vec![0_u8; self.options.block_size()];
        self.alloc_stream.read_exact_at(position, &mut raw)?;
        let block =
            IndexBlock::decode(&mut raw, self.options.layout).map_err(|err| parse_failure(vcn.0, err))?;
        if block.vcn != vcn {
            return Err(invariant_violation(
                vcn.0,
                "block.vcn==pointer",
                &format!("block at vcn {} claims vcn {}", vcn.0, block.vcn.0),
            ));
        }
        trace!(vcn = vcn.0, entries = block.node.entries.len(), "index_node_load");
        Ok(block)
    }

    fn store_block(&self, block: &mut IndexBlock) -> Result<()> {
        let position = self.block_position(block.vcn)?;
        let raw = block
            .encode(self.options.block_size(), self.options.layout)
            .map_err(|err| NtfsError::Corruption {
                block: block.vcn.0,
                detail: format!("cannot encode index block: {err}"),
            })?;
        self.alloc_stream.write_all_at(position, &raw)?;
        trace!(
            vcn = block.vcn.0,
            entries = block.node.entries.len(),
            usn = block.usn,
            "index_node_store"
        );
        Ok(())
    }

    fn store_root(&self) -> Result<()> {
        let root = IndexRoot {
            header: self.header,
            node: self.root.clone(),
        };
        let raw = root
            .to_bytes(self.options.layout)
            .map_err(|err| NtfsError::Corruption {
                block: ROOT_NODE,
                detail: format!("cannot encode index root: {err}"),
            })?;
        replace_all(self.root_stream.as_ref(), &raw)?;
        trace!(entries = self.root.entries.len(), bytes = raw.len(), "index_node_store");
        Ok(())
    }

    fn allocate_block(&mut self, purpose: &'static str) -> Result<Vcn> {
        let slot = self
            .slots
            .allocate_first_available(0)?
            .ok_or(NtfsError::NoSpace {
                requested: 1,
                found: 0,
            })?;
        let vcn = slot
            .checked_mul(self.options.vcn_stride())
            .map(Vcn)
            .ok_or_else(|| NtfsError::InvalidArgument(format!("index block slot {slot} out of range")))?;
        let end = self.block_position(vcn)? + u64::from(self.options.index_buffer_size);
        if self.alloc_stream.len_bytes() < end {
            self.alloc_stream.set_len(end)?;
        }
        trace!(vcn = vcn.0, slot, purpose, "index_block_alloc");
        Ok(vcn)
    }

    fn free_block(&mut self, vcn: Vcn, reason: &'static str) -> Result<()> {
        self.slots.mark_absent(vcn.0 / self.options.vcn_stride())?;
        debug!(vcn = vcn.0, reason, "index_node_freed");
        Ok(())
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    /// Check ordering, child references and slot accounting over the whole
    /// tree.
    pub fn verify(&self) -> Result<IndexStats> {
        let mut stats = IndexStats::default();
        let mut seen = HashSet::new();
        let mut last_key: Option<Vec<u8>> = None;
        self.verify_node(&self.root, 0, &mut stats, &mut seen, &mut last_key)?;
        stats.blocks = seen.len();
        let bits = u64::try_from(self.slots.len_bytes()).unwrap_or(u64::MAX).saturating_mul(8);
        let allocated = self.slots.count_present(bits);
        if allocated != seen.len() as u64 {
            return Err(invariant_violation(
                ROOT_NODE,
                "allocated slots == reachable blocks",
                &format!("{allocated} slots allocated, {} blocks reachable", seen.len()),
            ));
        }
        Ok(stats)
    }

    fn verify_node(
        &self,
        node: &IndexNode,
        depth: usize,
        stats: &mut IndexStats,
        seen: &mut HashSet<u64>,
        last_key: &mut Option<Vec<u8>>,
    ) -> Result<()> {
        stats.depth = stats.depth.max(depth);
        for entry in &node.entries {
            self.verify_child(entry.child, depth, stats, seen, last_key)?;
            if let Some(previous) = last_key.as_deref() {
                if self.collation.compare(previous, &entry.key) != Ordering::Less {
                    return Err(invariant_violation(
                        ROOT_NODE,
                        "keys strictly increasing in order",
                        &format!("key {} not after {}", hex(&entry.key), hex(previous)),
                    ));
                }
            }
            *last_key = Some(entry.key.clone());
            stats.entries += 1;
        }
        self.verify_child(node.end_child, depth, stats, seen, last_key)
    }

    fn verify_child(
        &self,
        child: Option<Vcn>,
        depth: usize,
        stats: &mut IndexStats,
        seen: &mut HashSet<u64>,
        last_key: &mut Option<Vec<u8>>,
    ) -> Result<()> {
        let Some(vcn) = child else {
            return Ok(());
        };
        if !seen.insert(vcn.0) {
            return Err(invariant_violation(
                vcn.0,
                "each block referenced once",
                "index block reachable twice",
            ));
        }
        let block = self.load_block(vcn, depth + 1)?;
        if block.node.entries.is_empty() && block.node.end_child.is_none() {
            return Err(invariant_violation(
                vcn.0,
                "non-root leaf is not empty",
                "empty leaf block",
            ));
        }
        self.verify_node(&block.node, depth + 1, stats, seen, last_key)
    }

    /// Human-readable dump of the node structure.
    pub fn dump(&self) -> Result<String> {
        let mut out = String::new();
        self.dump_node(&self.root, "R", "", 0, &mut out)?;
        Ok(out)
    }

    fn dump_node(
        &self,
        node: &IndexNode,
        id: &str,
        prefix: &str,
        depth: usize,
        out: &mut String,
    ) -> Result<()> {
        out.push_str(&format!("{prefix}{id}:\n"));
        let nested = format!("{prefix}        ");
        for entry in &node.entries {
            if let Some(child) = entry.child {
                let block = self.load_block(child, depth + 1)?;
                self.dump_node(&block.node, &format!("i{}", child.0), &nested, depth + 1, out)?;
            }
            out.push_str(&format!(
                "{prefix}      {{{} --> {}}}\n",
                hex(&entry.key),
                hex(&entry.data)
            ));
        }
        out.push_str(&format!("{prefix}      E\n"));
        if let Some(child) = node.end_child {
            let block = self.load_block(child, depth + 1)?;
            self.dump_node(&block.node, &format!("i{}", child.0), &nested, depth + 1, out)?;
        }
        Ok(())
    }

    /// Flush all three streams.
    pub fn sync(&self) -> Result<()> {
        self.root_stream.sync()?;
        self.alloc_stream.sync()?;
        self.slots.sync()
    }
}

// ── Error helpers ───────────────────────────────────────────────────────────

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn invariant_violation(block: u64, invariant: &'static str, detail: &str) -> NtfsError {
    error!(block, invariant, detail, "index_invariant_violation");
    NtfsError::Corruption {
        block,
        detail: detail.to_owned(),
    }
}

/// Map a node decoding failure at `block` (a VCN, or [`ROOT_NODE`]).
fn parse_failure(block: u64, err: ParseError) -> NtfsError {
    match err {
        ParseError::FixupMismatch {
            sector,
            expected,
            actual,
        } => {
            error!(block, sector, expected, actual, "fixup_mismatch");
            NtfsError::TornWrite { block, sector }
        }
        other => {
            error!(block, error = %other, "index_invariant_violation");
            NtfsError::Corruption {
                block,
                detail: other.to_string(),
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

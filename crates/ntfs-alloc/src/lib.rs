#![forbid(unsafe_code)]
//! Cluster allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap helpers**: raw bit manipulation on byte slices, least
//!    significant bit first, bit set = in use.
//! 2. **[`Bitmap`]**: a bit-indexed stream over a [`ByteDevice`] with a
//!    write-through cache. Setting a bit past the end grows the stream.
//!    Index-block slot maps use it directly.
//! 3. **[`ClusterBitmap`]**: the volume's cluster map. Hands out extents with
//!    a zoned, randomised search and undoes partial claims on failure.
//!
//! ## Zones
//!
//! For `n` clusters the search visits `[n/8, n)`, `[n/16, n/8)`,
//! `[n/32, n/16)` and finally `[0, n/32)`. Low clusters, where metadata
//! tends to sit, are only handed out once everything above is full.

use ntfs_block::{ByteDevice, read_all};
use ntfs_error::{NtfsError, Result};
use ntfs_types::ClusterExtent;
use rand::Rng;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

#[expect(clippy::cast_possible_truncation)]
fn bit_position(idx: u64) -> (usize, u8) {
    ((idx / 8) as usize, (idx % 8) as u8)
}

/// Get bit `idx` from a bitmap byte slice. Bits past the slice read as clear.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let (byte_idx, bit_idx) = bit_position(idx);
    bitmap
        .get(byte_idx)
        .is_some_and(|byte| (byte >> bit_idx) & 1 == 1)
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    let (byte_idx, bit_idx) = bit_position(idx);
    if let Some(byte) = bitmap.get_mut(byte_idx) {
        *byte |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    let (byte_idx, bit_idx) = bit_position(idx);
    if let Some(byte) = bitmap.get_mut(byte_idx) {
        *byte &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
///
/// Bits past the end of the slice count as free.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u64) -> u64 {
    let (full_bytes, remainder) = bit_position(count);
    let mut free = 0_u64;

    for &byte in bitmap.iter().take(full_bytes) {
        free += u64::from(byte.count_zeros());
    }
    let missing = full_bytes.saturating_sub(bitmap.len());
    free += 8 * u64::try_from(missing).unwrap_or(u64::MAX / 8);

    if remainder > 0 {
        match bitmap.get(full_bytes) {
            Some(&byte) => {
                for bit in 0..remainder {
                    if (byte >> bit) & 1 == 0 {
                        free += 1;
                    }
                }
            }
            None => free += u64::from(remainder),
        }
    }

    free
}

/// Find the first free (zero) bit in `start..end`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], start: u64, end: u64) -> Option<u64> {
    let mut idx = start;
    while idx < end {
        let (byte_idx, bit_idx) = bit_position(idx);
        let Some(&byte) = bitmap.get(byte_idx) else {
            return Some(idx);
        };
        if byte == 0xFF && bit_idx == 0 {
            idx += 8;
            continue;
        }
        if (byte >> bit_idx) & 1 == 0 {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

// ── Bit-indexed stream ──────────────────────────────────────────────────────

fn byte_index(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| NtfsError::InvalidArgument(format!("bitmap byte {value} not addressable")))
}

/// A bit per entry, persisted in a byte stream.
///
/// Reads come from an in-memory copy of the stream. Every mutation writes the
/// touched bytes through to the stream before the copy is updated.
pub struct Bitmap {
    stream: Arc<dyn ByteDevice>,
    cache: Vec<u8>,
    max_index: u64,
    next_available: u64,
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("len_bytes", &self.cache.len())
            .field("max_index", &self.max_index)
            .field("next_available", &self.next_available)
            .finish_non_exhaustive()
    }
}

impl Bitmap {
    /// Load the stream. `max_index` bounds
    /// [`allocate_first_available`](Self::allocate_first_available).
    pub fn open(stream: Arc<dyn ByteDevice>, max_index: u64) -> Result<Self> {
        let cache = read_all(stream.as_ref())?;
        Ok(Self {
            stream,
            cache,
            max_index,
            next_available: 0,
        })
    }

    #[must_use]
    pub fn max_index(&self) -> u64 {
        self.max_index
    }

    /// Current stream length in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.cache
    }

    #[must_use]
    pub fn is_present(&self, index: u64) -> bool {
        bitmap_get(&self.cache, index)
    }

    pub fn mark_present(&mut self, index: u64) -> Result<()> {
        self.update_range(index, 1, true)
    }

    pub fn mark_present_range(&mut self, index: u64, count: u64) -> Result<()> {
        self.update_range(index, count, true)
    }

    pub fn mark_absent(&mut self, index: u64) -> Result<()> {
        self.mark_absent_range(index, 1)
    }

    pub fn mark_absent_range(&mut self, index: u64, count: u64) -> Result<()> {
        self.update_range(index, count, false)?;
        if count > 0 && index < self.next_available {
            self.next_available = index;
        }
        Ok(())
    }

    /// Claim the lowest clear bit at or above `min` (and at or above every
    /// bit handed out since the last release). `None` when all bits up to
    /// `max_index` are set.
    pub fn allocate_first_available(&mut self, min: u64) -> Result<Option<u64>> {
        let from = min.max(self.next_available);
        let Some(index) = bitmap_find_free(&self.cache, from, self.max_index) else {
            return Ok(None);
        };
        self.mark_present(index)?;
        self.next_available = index + 1;
        Ok(Some(index))
    }

    /// Number of set bits among the first `limit`.
    #[must_use]
    pub fn count_present(&self, limit: u64) -> u64 {
        limit - bitmap_count_free(&self.cache, limit)
    }

    /// Number of clear bits among the first `limit`.
    #[must_use]
    pub fn count_absent(&self, limit: u64) -> u64 {
        bitmap_count_free(&self.cache, limit)
    }

    /// First clear bit in `start..end`.
    #[must_use]
    pub fn next_absent(&self, start: u64, end: u64) -> Option<u64> {
        bitmap_find_free(&self.cache, start, end)
    }

    /// Resize the stream to hold `entries` bits, rounded up to whole 8-byte
    /// words. Returns the number of bits the stream now holds.
    pub fn set_total_entries(&mut self, entries: u64) -> Result<u64> {
        let length = entries.div_ceil(8).div_ceil(8) * 8;
        self.stream.set_len(length)?;
        self.cache.resize(byte_index(length)?, 0);
        Ok(length * 8)
    }

    fn update_range(&mut self, index: u64, count: u64, present: bool) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let last = index.checked_add(count - 1).ok_or_else(|| {
            NtfsError::InvalidArgument(format!("bit range {index}+{count} overflows"))
        })?;
        let first_byte = byte_index(index / 8)?;
        let last_byte = byte_index(last / 8)?;

        if last_byte >= self.cache.len() {
            let grown = (last_byte + 1).div_ceil(8) * 8;
            self.stream.set_len(grown as u64)?;
            self.cache.resize(grown, 0);
        }

        let base = index - index % 8;
        let mut bytes = self.cache[first_byte..=last_byte].to_vec();
        for bit in index..=last {
            if present {
                bitmap_set(&mut bytes, bit - base);
            } else {
                bitmap_clear(&mut bytes, bit - base);
            }
        }
        self.stream.write_all_at(first_byte as u64, &bytes)?;
        self.cache[first_byte..=last_byte].copy_from_slice(&bytes);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.stream.sync()
    }
}

// ── Cluster allocator ───────────────────────────────────────────────────────

/// Search zones for a volume of `total` clusters, in visiting order.
#[must_use]
pub fn allocation_zones(total: u64) -> [Range<u64>; 4] {
    [
        total / 8..total,
        total / 16..total / 8,
        total / 32..total / 16,
        0..total / 32,
    ]
}

/// The volume cluster map.
///
/// `R` is the placement randomness. It is injected so tests can pin
/// placement with a seeded generator; the storage core picks the default.
pub struct ClusterBitmap<R> {
    bitmap: Bitmap,
    total_clusters: u64,
    rng: R,
}

impl<R> fmt::Debug for ClusterBitmap<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterBitmap")
            .field("bitmap", &self.bitmap)
            .field("total_clusters", &self.total_clusters)
            .finish_non_exhaustive()
    }
}

impl<R: Rng> ClusterBitmap<R> {
    /// Wrap an existing bitmap stream.
    pub fn open(stream: Arc<dyn ByteDevice>, total_clusters: u64, rng: R) -> Result<Self> {
        if total_clusters == 0 {
            return Err(NtfsError::InvalidArgument(
                "volume has no clusters".to_owned(),
            ));
        }
        Ok(Self {
            bitmap: Bitmap::open(stream, total_clusters)?,
            total_clusters,
            rng,
        })
    }

    /// Initialise `stream` as an empty bitmap for `total_clusters`.
    ///
    /// Bits past the last cluster, up to the 8-byte rounded stream length,
    /// are marked in use so they are never handed out.
    pub fn format(stream: Arc<dyn ByteDevice>, total_clusters: u64, rng: R) -> Result<Self> {
        stream.set_len(0)?;
        let mut this = Self::open(stream, total_clusters, rng)?;
        let bits = this.bitmap.set_total_entries(total_clusters)?;
        if bits > total_clusters {
            this.bitmap
                .mark_present_range(total_clusters, bits - total_clusters)?;
        }
        debug!(
            total_clusters,
            bitmap_bytes = this.bitmap.len_bytes(),
            "cluster_bitmap_format"
        );
        Ok(this)
    }

    #[must_use]
    pub fn total_clusters(&self) -> u64 {
        self.total_clusters
    }

    #[must_use]
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    #[must_use]
    pub fn is_allocated(&self, cluster: u64) -> bool {
        self.bitmap.is_present(cluster)
    }

    #[must_use]
    pub fn free_cluster_count(&self) -> u64 {
        self.bitmap.count_absent(self.total_clusters)
    }

    /// Reserve a known range, e.g. the boot sector or the MFT.
    pub fn mark_allocated(&mut self, first: u64, count: u64) -> Result<()> {
        self.check_range(first, count)?;
        self.bitmap.mark_present_range(first, count)
    }

    /// Allocate `count` clusters.
    ///
    /// Returns the runs in the order they were claimed; their lengths sum to
    /// `count`. A zero count returns no runs. If the volume cannot supply
    /// `count` clusters, everything claimed by this call is released again
    /// and [`NtfsError::NoSpace`] is returned. If releasing those claims
    /// fails, that I/O error is returned instead.
    pub fn allocate(
        &mut self,
        count: u64,
        proposed_start: Option<u64>,
    ) -> Result<Vec<ClusterExtent>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if let Some(start) = proposed_start {
            if start >= self.total_clusters {
                return Err(NtfsError::InvalidArgument(format!(
                    "proposed start {start} beyond volume of {} clusters",
                    self.total_clusters
                )));
            }
        }

        let mut claimed = Vec::new();
        let mut found = 0_u64;
        let mut last_zone = 0_usize;

        for (zone_idx, zone) in allocation_zones(self.total_clusters)
            .into_iter()
            .enumerate()
        {
            if found == count {
                break;
            }
            if zone.is_empty() {
                continue;
            }
            last_zone = zone_idx;
            let focus = match proposed_start {
                Some(start) if zone.contains(&start) => start,
                _ => self.rng.gen_range(zone.clone()),
            };
            let outcome =
                self.claim_in_zone(zone_idx, &zone, focus, count, &mut found, &mut claimed);
            if let Err(err) = outcome {
                self.roll_back(&claimed)?;
                return Err(err);
            }
        }

        if found < count {
            self.roll_back(&claimed)?;
            warn!(requested = count, found, "cluster_alloc_exhausted");
            return Err(NtfsError::NoSpace {
                requested: count,
                found,
            });
        }

        debug!(
            requested = count,
            extents = claimed.len(),
            zone = last_zone,
            "cluster_alloc_done"
        );
        Ok(claimed)
    }

    /// Walk `zone` circularly from `focus`, visiting each cluster at most
    /// once, and claim free clusters until `count` are held in total.
    fn claim_in_zone(
        &mut self,
        zone_idx: usize,
        zone: &Range<u64>,
        focus: u64,
        count: u64,
        found: &mut u64,
        claimed: &mut Vec<ClusterExtent>,
    ) -> Result<()> {
        let mut cursor = focus;
        let mut probes_left = zone.end - zone.start;

        while *found < count && probes_left > 0 {
            let segment_end = zone.end.min(cursor + probes_left);
            let Some(free) = self.bitmap.next_absent(cursor, segment_end) else {
                probes_left -= segment_end - cursor;
                cursor = zone.start;
                continue;
            };
            probes_left -= free - cursor;
            cursor = free;

            let run_start = cursor;
            while cursor < segment_end && *found < count && !self.bitmap.is_present(cursor) {
                self.bitmap.mark_present(cursor)?;
                cursor += 1;
                *found += 1;
                probes_left -= 1;
                // Keep the run recorded even if the next mark fails.
                match claimed.last_mut() {
                    Some(last) if last.start.0 == run_start && cursor - run_start > 1 => {
                        last.length += 1;
                    }
                    _ => claimed.push(ClusterExtent::new(run_start, 1)),
                }
            }
            trace!(
                start = run_start,
                length = cursor - run_start,
                zone = zone_idx,
                "cluster_run_claimed"
            );

            if cursor >= zone.end {
                cursor = zone.start;
            }
        }
        Ok(())
    }

    /// Release every claimed extent. All extents are attempted; the first
    /// failure is returned, since the bitmap then still holds clusters the
    /// caller never received.
    fn roll_back(&mut self, claimed: &[ClusterExtent]) -> Result<()> {
        let mut first_failure = None;
        for extent in claimed {
            if let Err(err) = self.bitmap.mark_absent_range(extent.start.0, extent.length) {
                error!(extent = %extent, error = %err, "cluster_rollback_failed");
                first_failure.get_or_insert(err);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Release runs previously returned by [`allocate`](Self::allocate) or
    /// reserved with [`mark_allocated`](Self::mark_allocated).
    ///
    /// Every cluster must currently be allocated; nothing is changed if any
    /// run is out of range or partly free.
    pub fn free(&mut self, runs: &[ClusterExtent]) -> Result<()> {
        for run in runs {
            self.check_range(run.start.0, run.length)?;
            for cluster in run.start.0..run.start.0 + run.length {
                if !self.bitmap.is_present(cluster) {
                    return Err(NtfsError::Corruption {
                        block: cluster,
                        detail: "double-free: cluster already free in bitmap".into(),
                    });
                }
            }
        }
        for run in runs {
            self.bitmap.mark_absent_range(run.start.0, run.length)?;
        }
        debug!(
            runs = runs.len(),
            clusters = runs.iter().map(|r| r.length).sum::<u64>(),
            "cluster_free"
        );
        Ok(())
    }

    fn check_range(&self, first: u64, count: u64) -> Result<()> {
        match first.checked_add(count) {
            Some(end) if end <= self.total_clusters => Ok(()),
            _ => Err(NtfsError::InvalidArgument(format!(
                "cluster range {first}+{count} outside volume of {} clusters",
                self.total_clusters
            ))),
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.bitmap.sync()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

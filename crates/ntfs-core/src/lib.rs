#![forbid(unsafe_code)]
//! NTFS metadata storage core.
//!
//! Re-exports the component crates and provides [`StorageCore`], the point
//! where the volume geometry, the shared cluster bitmap and the allocation
//! RNG come together. Cluster bitmap mutations are serialised behind a
//! mutex; each [`SharedIndex`] allows concurrent lookups and exclusive
//! mutations.

use ntfs_alloc::ClusterBitmap;
use ntfs_block::{read_all, read_vec};
use ntfs_ondisk::{BootSector, DataRun, decode_record_size};
use parking_lot::{Mutex, RwLock};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use ntfs_alloc::{Bitmap, allocation_zones};
pub use ntfs_block::{ByteDevice, FileByteDevice, MemByteDevice, SliceDevice};
pub use ntfs_btree::{Collation, Index, IndexOptions, IndexStats, StandardCollation};
pub use ntfs_error::{ErrorClass, NtfsError, Result};
pub use ntfs_ondisk::{
    CookedRun, EntryLayout, FixupRecord, IndexBlock, IndexRootHeader, RunList, VolumeGeometry,
};
pub use ntfs_types::{
    AttributeReference, ClusterExtent, ClusterNumber, FileRecordReference, ParseError, SystemFile,
    Vcn,
};

// ── Options ─────────────────────────────────────────────────────────────────

/// Options controlling how a [`StorageCore`] is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreOptions {
    /// Seed for the allocator's placement RNG. `None` seeds from the
    /// operating system, so placement differs between processes.
    pub alloc_seed: Option<u64>,
    /// Skip geometry validation. Use for recovery or diagnostics only.
    pub skip_validation: bool,
}

impl CoreOptions {
    fn rng(&self) -> StdRng {
        match self.alloc_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

// ── Error mapping ───────────────────────────────────────────────────────────

fn is_geometry_field(field: &str) -> bool {
    matches!(
        field,
        "bytes_per_sector"
            | "sectors_per_cluster"
            | "bytes_per_cluster"
            | "cluster_size"
            | "total_sectors"
            | "index_buffer_size"
            | "mft_record_size"
            | "record_size"
    )
}

/// Map a format-layer error found at `block` into the runtime taxonomy.
#[must_use]
pub fn parse_error_to_ntfs(block: u64, err: &ParseError) -> NtfsError {
    match err {
        ParseError::FixupMismatch { sector, .. } => NtfsError::TornWrite {
            block,
            sector: *sector,
        },
        ParseError::InvalidMagic { .. } => NtfsError::Format(err.to_string()),
        ParseError::InvalidField { field, reason } if is_geometry_field(field) => {
            NtfsError::InvalidGeometry(format!("{field}: {reason}"))
        }
        ParseError::InsufficientData { .. }
        | ParseError::InvalidField { .. }
        | ParseError::IntegerConversion { .. }
        | ParseError::BadRunHeader { .. } => NtfsError::Corruption {
            block,
            detail: err.to_string(),
        },
    }
}

/// Geometry described by a boot sector, validated unless `skip_validation`.
pub fn geometry_from_boot_sector(boot: &BootSector, skip_validation: bool) -> Result<VolumeGeometry> {
    if !skip_validation {
        return boot.geometry().map_err(|err| parse_error_to_ntfs(0, &err));
    }
    let bytes_per_sector = u32::from(boot.bytes_per_sector);
    let sectors_per_cluster = boot.sectors_per_cluster();
    let cluster = bytes_per_sector.saturating_mul(sectors_per_cluster);
    let record_size = |raw| decode_record_size(raw, cluster).map_err(|err| parse_error_to_ntfs(0, &err));
    Ok(VolumeGeometry {
        bytes_per_sector,
        sectors_per_cluster,
        total_sectors: boot.total_sectors,
        mft_record_size: record_size(boot.raw_mft_record_size)?,
        index_buffer_size: record_size(boot.raw_index_buffer_size)?,
    })
}

// ── StorageCore ─────────────────────────────────────────────────────────────

/// Geometry plus the volume's cluster bitmap, shared by every file.
pub struct StorageCore {
    geometry: VolumeGeometry,
    options: CoreOptions,
    clusters: Mutex<ClusterBitmap<StdRng>>,
}

impl std::fmt::Debug for StorageCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCore")
            .field("geometry", &self.geometry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl StorageCore {
    fn check_geometry(geometry: &VolumeGeometry, options: &CoreOptions) -> Result<()> {
        if options.skip_validation {
            return Ok(());
        }
        geometry
            .validate()
            .map_err(|err| NtfsError::InvalidGeometry(err.to_string()))
    }

    /// Initialise a fresh cluster bitmap on `bitmap_stream`. Cluster 0 holds
    /// the boot sector and starts out allocated.
    pub fn format(
        geometry: VolumeGeometry,
        bitmap_stream: Arc<dyn ByteDevice>,
        options: CoreOptions,
    ) -> Result<Self> {
        Self::check_geometry(&geometry, &options)?;
        let mut clusters =
            ClusterBitmap::format(bitmap_stream, geometry.total_clusters(), options.rng())?;
        clusters.mark_allocated(0, 1)?;
        info!(
            total_clusters = geometry.total_clusters(),
            bytes_per_cluster = geometry.bytes_per_cluster(),
            "storage_core_format"
        );
        Ok(Self {
            geometry,
            options,
            clusters: Mutex::new(clusters),
        })
    }

    /// Open over an existing cluster bitmap.
    pub fn open(
        geometry: VolumeGeometry,
        bitmap_stream: Arc<dyn ByteDevice>,
        options: CoreOptions,
    ) -> Result<Self> {
        Self::check_geometry(&geometry, &options)?;
        let needed = geometry.total_clusters().div_ceil(8);
        if bitmap_stream.len_bytes() < needed && !options.skip_validation {
            return Err(NtfsError::Corruption {
                block: 0,
                detail: format!(
                    "cluster bitmap holds {} bytes, volume needs {needed}",
                    bitmap_stream.len_bytes()
                ),
            });
        }
        let clusters = ClusterBitmap::open(bitmap_stream, geometry.total_clusters(), options.rng())?;
        debug!(
            total_clusters = geometry.total_clusters(),
            free_clusters = clusters.free_cluster_count(),
            "storage_core_open"
        );
        Ok(Self {
            geometry,
            options,
            clusters: Mutex::new(clusters),
        })
    }

    /// Open using the geometry in the boot sector at the start of `volume`.
    pub fn open_volume(
        volume: &dyn ByteDevice,
        bitmap_stream: Arc<dyn ByteDevice>,
        options: CoreOptions,
    ) -> Result<Self> {
        let sector = read_vec(volume, 0, ntfs_types::BOOT_SECTOR_SIZE)?;
        let boot = BootSector::parse(&sector).map_err(|err| parse_error_to_ntfs(0, &err))?;
        let geometry = geometry_from_boot_sector(&boot, options.skip_validation)?;
        Self::open(geometry, bitmap_stream, options)
    }

    #[must_use]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    #[must_use]
    pub fn total_clusters(&self) -> u64 {
        self.geometry.total_clusters()
    }

    #[must_use]
    pub fn free_cluster_count(&self) -> u64 {
        self.clusters.lock().free_cluster_count()
    }

    #[must_use]
    pub fn is_allocated(&self, cluster: u64) -> bool {
        self.clusters.lock().is_allocated(cluster)
    }

    /// Snapshot of the raw bitmap bytes.
    #[must_use]
    pub fn bitmap_bytes(&self) -> Vec<u8> {
        self.clusters.lock().bitmap().as_bytes().to_vec()
    }

    pub fn mark_allocated(&self, first: u64, count: u64) -> Result<()> {
        self.clusters.lock().mark_allocated(first, count)
    }

    /// Claim `count` clusters, preferring `proposed_start`.
    pub fn allocate(&self, count: u64, proposed_start: Option<u64>) -> Result<Vec<ClusterExtent>> {
        self.clusters.lock().allocate(count, proposed_start)
    }

    pub fn free(&self, extents: &[ClusterExtent]) -> Result<()> {
        self.clusters.lock().free(extents)
    }

    /// Grow `runs` by `count` clusters, preferring the clusters right after
    /// its last run. Returns the extents claimed.
    ///
    /// A first extent that continues the last run is folded into it. If the
    /// new runs cannot be encoded the clusters are released and `runs` is
    /// left as it was.
    pub fn extend_run_list(&self, runs: &mut RunList, count: u64) -> Result<Vec<ClusterExtent>> {
        let cooked = runs.cooked().map_err(|err| parse_error_to_ntfs(0, &err))?;
        let last = cooked
            .iter()
            .rev()
            .find_map(|run| run.lcn.map(|lcn| (lcn.0, run.length)));
        let proposed = last
            .and_then(|(lcn, length)| lcn.checked_add(length))
            .filter(|next| *next < self.total_clusters());

        let extents = self.allocate(count, proposed)?;
        match Self::append_extents(runs, last, &extents) {
            Ok(extended) => {
                debug!(
                    requested = count,
                    extents = extents.len(),
                    runs = extended.len(),
                    "run_list_extend"
                );
                *runs = extended;
                Ok(extents)
            }
            Err(err) => {
                warn!(requested = count, error = %err, "run_list_extend_failed");
                self.free(&extents)?;
                Err(parse_error_to_ntfs(0, &err))
            }
        }
    }

    fn append_extents(
        runs: &RunList,
        last: Option<(u64, u64)>,
        extents: &[ClusterExtent],
    ) -> std::result::Result<RunList, ParseError> {
        let mut out = runs.runs().to_vec();
        let mut rest = extents;
        let mut previous_lcn = last.map_or(0, |(lcn, _)| lcn);
        // Only a physical final run can absorb growth; after a sparse tail
        // the new clusters start a run of their own.
        if let (Some((lcn, length)), Some(first), Some(tail)) =
            (last, extents.first(), out.last_mut())
        {
            if !tail.is_sparse() && lcn.checked_add(length) == Some(first.start.0) {
                let merged = tail.length().checked_add(first.length).ok_or(
                    ParseError::InvalidField {
                        field: "run_length",
                        reason: "overflow",
                    },
                )?;
                *tail = DataRun::new(tail.offset(), merged)?;
                rest = &extents[1..];
                previous_lcn = lcn;
            }
        }
        let tail = RunList::from_extents(rest, previous_lcn)?;
        out.extend_from_slice(tail.runs());
        Ok(RunList::from_runs(out))
    }

    /// Release every non-sparse run of `runs`, returning the clusters freed.
    pub fn release_run_list(&self, runs: &RunList) -> Result<u64> {
        let extents: Vec<ClusterExtent> = runs
            .cooked()
            .map_err(|err| parse_error_to_ntfs(0, &err))?
            .into_iter()
            .filter_map(|run| run.lcn.map(|lcn| ClusterExtent::new(lcn.0, run.length)))
            .collect();
        self.free(&extents)?;
        Ok(extents.iter().map(|e| e.length).sum())
    }

    /// Index options matching this volume's block and cluster sizes.
    #[must_use]
    pub fn index_options(&self) -> IndexOptions {
        IndexOptions::for_geometry(&self.geometry)
    }

    fn check_index_options(&self, options: &IndexOptions) -> Result<()> {
        if u64::from(options.bytes_per_cluster) != self.geometry.bytes_per_cluster() {
            return Err(NtfsError::InvalidArgument(format!(
                "index cluster size {} does not match volume cluster size {}",
                options.bytes_per_cluster,
                self.geometry.bytes_per_cluster()
            )));
        }
        Ok(())
    }

    /// Create an empty index whose collation is one of the standard rules.
    pub fn create_index(&self, streams: IndexStreams, options: IndexOptions) -> Result<SharedIndex> {
        self.check_index_options(&options)?;
        let collation = StandardCollation::from_rule(options.collation_rule).ok_or_else(|| {
            NtfsError::InvalidArgument(format!(
                "collation rule {:#x} needs a caller-supplied collation",
                options.collation_rule
            ))
        })?;
        self.create_index_with(streams, options, collation)
    }

    pub fn create_index_with<C: Collation>(
        &self,
        streams: IndexStreams,
        options: IndexOptions,
        collation: C,
    ) -> Result<SharedIndex<C>> {
        self.check_index_options(&options)?;
        let index = Index::create(
            streams.root,
            streams.allocation,
            streams.bitmap,
            options,
            collation,
        )?;
        Ok(SharedIndex::new(index))
    }

    /// Open an index, picking the collation from its root header.
    pub fn open_index(&self, streams: IndexStreams, layout: EntryLayout) -> Result<SharedIndex> {
        let raw = read_all(streams.root.as_ref())?;
        let header =
            IndexRootHeader::parse(&raw).map_err(|err| parse_error_to_ntfs(ntfs_btree::ROOT_NODE, &err))?;
        let collation = StandardCollation::from_rule(header.collation_rule).ok_or_else(|| {
            NtfsError::InvalidArgument(format!(
                "collation rule {:#x} needs a caller-supplied collation",
                header.collation_rule
            ))
        })?;
        let options = IndexOptions {
            layout,
            ..self.index_options()
        };
        self.open_index_with(streams, options, collation)
    }

    pub fn open_index_with<C: Collation>(
        &self,
        streams: IndexStreams,
        options: IndexOptions,
        collation: C,
    ) -> Result<SharedIndex<C>> {
        self.check_index_options(&options)?;
        let index = Index::open(
            streams.root,
            streams.allocation,
            streams.bitmap,
            options,
            collation,
        )?;
        Ok(SharedIndex::new(index))
    }

    pub fn sync(&self) -> Result<()> {
        self.clusters.lock().sync()
    }
}

// ── Indexes ─────────────────────────────────────────────────────────────────

/// The three streams an index lives in.
#[derive(Clone)]
pub struct IndexStreams {
    /// Resident `$INDEX_ROOT` value.
    pub root: Arc<dyn ByteDevice>,
    /// `$INDEX_ALLOCATION` stream of `INDX` blocks.
    pub allocation: Arc<dyn ByteDevice>,
    /// `$BITMAP` of allocated block slots.
    pub bitmap: Arc<dyn ByteDevice>,
}

impl IndexStreams {
    /// Three fresh in-memory streams.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            root: Arc::new(MemByteDevice::new(0)),
            allocation: Arc::new(MemByteDevice::new(0)),
            bitmap: Arc::new(MemByteDevice::new(0)),
        }
    }
}

impl std::fmt::Debug for IndexStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStreams")
            .field("root_len", &self.root.len_bytes())
            .field("allocation_len", &self.allocation.len_bytes())
            .field("bitmap_len", &self.bitmap.len_bytes())
            .finish()
    }
}

/// An index behind a reader/writer lock: lookups share, mutations exclude.
#[derive(Debug)]
pub struct SharedIndex<C = StandardCollation> {
    inner: RwLock<Index<C>>,
}

impl<C: Collation> SharedIndex<C> {
    #[must_use]
    pub fn new(index: Index<C>) -> Self {
        Self {
            inner: RwLock::new(index),
        }
    }

    #[must_use]
    pub fn into_inner(self) -> Index<C> {
        self.inner.into_inner()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.read().get(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.inner.read().contains_key(key)
    }

    pub fn get_file_reference(&self, key: &[u8]) -> Result<Option<FileRecordReference>> {
        self.inner.read().get_file_reference(key)
    }

    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.read().entries()
    }

    pub fn len(&self) -> Result<usize> {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn find_all<P>(&self, probe: P) -> Result<Vec<(Vec<u8>, Vec<u8>)>>
    where
        P: Fn(&[u8]) -> Ordering,
    {
        self.inner.read().find_all(probe)
    }

    pub fn verify(&self) -> Result<IndexStats> {
        self.inner.read().verify()
    }

    pub fn dump(&self) -> Result<String> {
        self.inner.read().dump()
    }

    pub fn insert(&self, key: &[u8], data: &[u8]) -> Result<()> {
        self.inner.write().insert(key, data)
    }

    pub fn update(&self, key: &[u8], data: &[u8]) -> Result<()> {
        self.inner.write().update(key, data)
    }

    pub fn upsert(&self, key: &[u8], data: &[u8]) -> Result<()> {
        self.inner.write().upsert(key, data)
    }

    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.inner.write().remove(key)
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.read().sync()
    }
}

#![forbid(unsafe_code)]

use ntfs_core::{
    ByteDevice, ClusterExtent, CoreOptions, EntryLayout, FileByteDevice, FileRecordReference,
    IndexOptions, IndexStreams, MemByteDevice, NtfsError, RunList, StorageCore, VolumeGeometry,
};
use std::sync::Arc;
use std::thread;

fn geometry(total_clusters: u64) -> VolumeGeometry {
    VolumeGeometry {
        bytes_per_sector: 512,
        sectors_per_cluster: 8,
        total_sectors: total_clusters * 8,
        mft_record_size: 1024,
        index_buffer_size: 4096,
    }
}

fn options(seed: u64) -> CoreOptions {
    CoreOptions {
        alloc_seed: Some(seed),
        ..CoreOptions::default()
    }
}

fn set_bits(bytes: &[u8], limit: u64) -> u64 {
    (0..limit)
        .filter(|bit| bytes[usize::try_from(bit / 8).expect("index")] & (1 << (bit % 8)) != 0)
        .count() as u64
}

#[test]
fn hundred_clusters_on_a_thousand_cluster_volume() {
    let stream: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(0));
    let core = StorageCore::format(geometry(1024), stream, options(1)).expect("format");
    core.mark_allocated(0, 8).expect("reserve");
    assert_eq!(set_bits(&core.bitmap_bytes(), 1024), 8);

    let extents = core.allocate(100, None).expect("allocate");
    assert_eq!(extents.iter().map(|e| e.length).sum::<u64>(), 100);
    let reserved = ClusterExtent::new(0, 8);
    for extent in &extents {
        assert!(!extent.overlaps(reserved), "{extent} overlaps reserved clusters");
    }
    for (i, a) in extents.iter().enumerate() {
        for b in &extents[i + 1..] {
            assert!(!a.overlaps(*b), "{a} overlaps {b}");
        }
    }
    assert_eq!(set_bits(&core.bitmap_bytes(), 1024), 108);
}

#[test]
fn file_backed_bitmap_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bitmap");
    let geometry = geometry(4096);

    let extents = {
        let stream: Arc<dyn ByteDevice> =
            Arc::new(FileByteDevice::create(&path, 0).expect("create"));
        let core = StorageCore::format(geometry, stream, options(2)).expect("format");
        let mut runs = RunList::new();
        let extents = core.extend_run_list(&mut runs, 300).expect("extend");
        core.extend_run_list(&mut runs, 50).expect("extend again");
        assert_eq!(runs.total_clusters(), 350);
        core.sync().expect("sync");
        extents
    };

    let stream: Arc<dyn ByteDevice> = Arc::new(FileByteDevice::open(&path).expect("open"));
    let core = StorageCore::open(geometry, stream, options(3)).expect("reopen");
    assert_eq!(core.free_cluster_count(), 4096 - 1 - 350);
    for extent in &extents {
        assert!(core.is_allocated(extent.start.0));
    }

    let err = core.allocate(1, Some(4096)).expect_err("outside volume");
    assert!(matches!(err, NtfsError::InvalidArgument(_)));
}

#[test]
fn directory_index_maps_names_to_records() {
    let stream: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(0));
    let core = StorageCore::format(geometry(2048), stream, options(4)).expect("format");
    let streams = IndexStreams::in_memory();
    let index_options = IndexOptions {
        layout: EntryLayout::File,
        attribute_type: 0x30,
        ..core.index_options()
    };
    let index = core
        .create_index(streams.clone(), index_options)
        .expect("create");

    for n in 0_u64..500 {
        let name = format!("file-{n:05}.txt");
        let reference = FileRecordReference::new(16 + n, 1);
        index
            .insert(name.as_bytes(), &reference.raw().to_le_bytes())
            .expect("insert");
    }
    // A recycled slot gets a new sequence number; the old reference no
    // longer matches what the index returns.
    let stale = FileRecordReference::new(16 + 42, 1);
    let fresh = stale.next_incarnation();
    index
        .update(b"file-00042.txt", &fresh.raw().to_le_bytes())
        .expect("update");
    let found = index
        .get_file_reference(b"file-00042.txt")
        .expect("get")
        .expect("present");
    assert_ne!(found, stale);
    assert_eq!(found, fresh);

    let stats = index.verify().expect("verify");
    assert_eq!(stats.entries, 500);
    assert!(stats.blocks > 1);

    drop(index);
    let reopened = core
        .open_index(streams, EntryLayout::File)
        .expect("open");
    assert_eq!(reopened.len().expect("len"), 500);
    for n in (0_u64..500).step_by(3) {
        let name = format!("file-{n:05}.txt");
        assert!(reopened.remove(name.as_bytes()).expect("remove"));
    }
    assert_eq!(reopened.verify().expect("verify").entries, 500 - 167);
}

#[test]
fn concurrent_lookups_share_an_index() {
    let stream: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(0));
    let core = StorageCore::format(geometry(1024), stream, options(5)).expect("format");
    let index = Arc::new(
        core.create_index(IndexStreams::in_memory(), core.index_options())
            .expect("create"),
    );
    for n in 0_u32..300 {
        index
            .insert(&n.to_be_bytes(), &n.to_le_bytes())
            .expect("insert");
    }

    let readers: Vec<_> = (0_u32..4)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for n in (t..300).step_by(4) {
                    let value = index.get(&n.to_be_bytes()).expect("get");
                    assert_eq!(value, Some(n.to_le_bytes().to_vec()));
                }
            })
        })
        .collect();
    for reader in readers {
        reader.join().expect("reader");
    }
}

#[test]
fn concurrent_allocations_never_overlap() {
    let stream: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(0));
    let core = Arc::new(StorageCore::format(geometry(8192), stream, options(6)).expect("format"));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let core = Arc::clone(&core);
            thread::spawn(move || {
                (0..20)
                    .flat_map(|_| core.allocate(37, None).expect("allocate"))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut all: Vec<ClusterExtent> = workers
        .into_iter()
        .flat_map(|w| w.join().expect("worker"))
        .collect();
    assert_eq!(all.iter().map(|e| e.length).sum::<u64>(), 4 * 20 * 37);
    all.sort_by_key(|e| e.start);
    for pair in all.windows(2) {
        assert!(!pair[0].overlaps(pair[1]), "{} overlaps {}", pair[0], pair[1]);
    }
    assert_eq!(core.free_cluster_count(), 8192 - 1 - 4 * 20 * 37);
}

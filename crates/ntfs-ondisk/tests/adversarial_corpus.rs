#![forbid(unsafe_code)]

use ntfs_ondisk::{
    BootSector, DataRun, EntryLayout, FixupRecord, IndexBlock, IndexEntry, IndexNode, IndexRoot,
    IndexRootHeader, RunList, VolumeGeometry,
};
use ntfs_types::{INDX_MAGIC, ParseError, Vcn};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

#[derive(Debug, Default)]
struct ErrorCoverage {
    insufficient_data: u32,
    invalid_magic: u32,
    invalid_field: u32,
    integer_conversion: u32,
    bad_run_header: u32,
    fixup_mismatch: u32,
}

impl ErrorCoverage {
    fn observe(&mut self, err: &ParseError) {
        match err {
            ParseError::InsufficientData { .. } => self.insufficient_data += 1,
            ParseError::InvalidMagic { .. } => self.invalid_magic += 1,
            ParseError::InvalidField { .. } => self.invalid_field += 1,
            ParseError::IntegerConversion { .. } => self.integer_conversion += 1,
            ParseError::BadRunHeader { .. } => self.bad_run_header += 1,
            ParseError::FixupMismatch { .. } => self.fixup_mismatch += 1,
        }
    }
}

fn run_parser<T, F>(
    sample_name: &str,
    parser_name: &'static str,
    parser_hits: &mut BTreeMap<&'static str, u32>,
    coverage: &mut ErrorCoverage,
    parser: F,
) -> bool
where
    F: FnOnce() -> Result<T, ParseError>,
{
    *parser_hits.entry(parser_name).or_default() += 1;
    match catch_unwind(AssertUnwindSafe(parser)) {
        Ok(Ok(_)) => false,
        Ok(Err(err)) => {
            coverage.observe(&err);
            true
        }
        Err(_) => panic!("parser `{parser_name}` panicked on sample `{sample_name}`"),
    }
}

fn valid_run_list() -> Vec<u8> {
    RunList::from_runs(vec![
        DataRun::new(0x1234, 0x30).expect("run"),
        DataRun::new(-0x100, 0x10).expect("run"),
        DataRun::sparse(8).expect("sparse"),
        DataRun::new(0x80, 0x80).expect("run"),
    ])
    .to_bytes()
}

fn valid_root() -> Vec<u8> {
    let node = IndexNode {
        entries: (0_u8..6)
            .map(|i| IndexEntry::new(vec![i; 4], vec![i, i]))
            .collect(),
        end_child: None,
    };
    IndexRoot {
        header: IndexRootHeader {
            attribute_type: 0,
            collation_rule: 0x10,
            index_buffer_size: 4096,
            clusters_per_index_block: 1,
        },
        node,
    }
    .to_bytes(EntryLayout::Generic)
    .expect("root")
}

fn valid_block() -> Vec<u8> {
    let node = IndexNode {
        entries: (0_u8..20)
            .map(|i| {
                let mut entry = IndexEntry::new(vec![i; 12], u64::from(i).to_le_bytes().to_vec());
                entry.child = Some(Vcn(u64::from(i) + 1));
                entry
            })
            .collect(),
        end_child: Some(Vcn(99)),
    };
    IndexBlock::new(Vcn(3), node)
        .encode(1024, EntryLayout::File)
        .expect("block")
}

fn valid_boot() -> Vec<u8> {
    let geometry = VolumeGeometry {
        bytes_per_sector: 512,
        sectors_per_cluster: 8,
        total_sectors: 65_536,
        mft_record_size: 1024,
        index_buffer_size: 4096,
    };
    BootSector::for_geometry(&geometry, 4, 2, 7)
        .expect("boot")
        .to_bytes()
        .expect("bytes")
        .to_vec()
}

/// Deterministic mutations of each valid structure: truncations, single-byte
/// overwrites with boundary values, and bit flips.
fn corpus() -> Vec<(String, Vec<u8>)> {
    let seeds = [
        ("runs", valid_run_list()),
        ("root", valid_root()),
        ("block", valid_block()),
        ("boot", valid_boot()),
    ];
    let mut out = Vec::new();
    for (name, seed) in seeds {
        out.push((format!("{name}-pristine"), seed.clone()));
        for cut in [0, 1, 7, seed.len() / 2, seed.len().saturating_sub(1)] {
            out.push((format!("{name}-truncate-{cut}"), seed[..cut.min(seed.len())].to_vec()));
        }
        // Last byte of a protected record is the final stride's signature slot.
        let mut torn = seed.clone();
        if let Some(last) = torn.last_mut() {
            *last ^= 0x01;
        }
        out.push((format!("{name}-torn-tail"), torn));

        let stride = (seed.len() / 24).max(1);
        for pos in (0..seed.len()).step_by(stride) {
            for value in [0x00_u8, 0xFF, 0x80, 0x19] {
                let mut sample = seed.clone();
                sample[pos] = value;
                out.push((format!("{name}-set-{pos}-{value:02x}"), sample));
            }
            let mut flipped = seed.clone();
            flipped[pos] ^= 0x01;
            out.push((format!("{name}-flip-{pos}"), flipped));
        }
    }
    out
}

#[test]
fn adversarial_corpus_is_panic_free_and_exercises_parse_error_variants() {
    let samples = corpus();
    assert!(samples.len() >= 200, "corpus too small: {}", samples.len());

    let mut parser_hits = BTreeMap::new();
    let mut coverage = ErrorCoverage::default();
    let mut samples_with_errors = 0_u32;

    for (name, bytes) in &samples {
        let mut sample_had_error = false;

        sample_had_error |= run_parser(name, "run_list_parse", &mut parser_hits, &mut coverage, || {
            RunList::parse(bytes).and_then(|(list, _)| list.cooked())
        });
        sample_had_error |= run_parser(name, "index_root_parse", &mut parser_hits, &mut coverage, || {
            IndexRoot::parse(bytes, EntryLayout::Generic)
        });
        sample_had_error |= run_parser(name, "index_block_decode", &mut parser_hits, &mut coverage, || {
            let mut copy = bytes.clone();
            IndexBlock::decode(&mut copy, EntryLayout::File)
        });
        sample_had_error |= run_parser(name, "fixup_unprotect", &mut parser_hits, &mut coverage, || {
            let mut copy = bytes.clone();
            FixupRecord::unprotect(&mut copy, INDX_MAGIC)
        });
        sample_had_error |= run_parser(name, "boot_sector_parse", &mut parser_hits, &mut coverage, || {
            BootSector::parse(bytes).and_then(|boot| boot.geometry())
        });

        if sample_had_error {
            samples_with_errors += 1;
        }
    }

    assert_eq!(parser_hits.len(), 5);
    assert!(samples_with_errors > 0);
    assert!(coverage.insufficient_data > 0, "{coverage:?}");
    assert!(coverage.invalid_magic > 0, "{coverage:?}");
    assert!(coverage.invalid_field > 0, "{coverage:?}");
    assert!(coverage.bad_run_header > 0, "{coverage:?}");
    assert!(coverage.fixup_mismatch > 0, "{coverage:?}");
}

#[test]
fn pristine_samples_parse() {
    assert!(RunList::parse(&valid_run_list()).is_ok());
    assert!(IndexRoot::parse(&valid_root(), EntryLayout::Generic).is_ok());
    let mut block = valid_block();
    let decoded = IndexBlock::decode(&mut block, EntryLayout::File).expect("block");
    assert_eq!(decoded.node.entries.len(), 20);
    assert_eq!(decoded.node.end_child, Some(Vcn(99)));
    assert!(BootSector::parse(&valid_boot()).is_ok());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn proptest_parsers_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..1536)) {
        let _ = RunList::parse(&bytes);
        let _ = IndexRoot::parse(&bytes, EntryLayout::Generic);
        let _ = IndexRoot::parse(&bytes, EntryLayout::File);
        let _ = BootSector::parse(&bytes);
        let mut copy = bytes.clone();
        let _ = IndexBlock::decode(&mut copy, EntryLayout::Generic);
    }
}

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ntfs_core::{
    ByteDevice, CookedRun, EntryLayout, FileByteDevice, IndexBlock, RunList, VolumeGeometry,
    geometry_from_boot_sector, parse_error_to_ntfs,
};
use ntfs_ondisk::BootSector;
use ntfs_types::BOOT_SECTOR_SIZE;
use serde::Serialize;
use std::env;
use std::path::Path;

#[derive(Debug, Serialize)]
struct RunsOutput {
    bytes_consumed: usize,
    total_clusters: u64,
    runs: Vec<RunOutput>,
}

#[derive(Debug, Serialize)]
struct RunOutput {
    vcn: u64,
    /// `None` for sparse runs.
    lcn: Option<u64>,
    length: u64,
    offset_delta: i64,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    oem_id: String,
    serial_number: String,
    mft_cluster: u64,
    mft_mirror_cluster: u64,
    bytes_per_cluster: u64,
    total_clusters: u64,
    geometry: VolumeGeometry,
}

#[derive(Debug, Serialize)]
struct BlockOutput {
    vcn: u64,
    lsn: u64,
    usn: u16,
    entries: usize,
    leaf: bool,
    end_child: Option<u64>,
    keys: Vec<String>,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();
    let json = rest.iter().any(|arg| arg == "--json");
    let positional: Vec<&str> = rest
        .iter()
        .map(String::as_str)
        .filter(|arg| !arg.starts_with("--"))
        .collect();

    match command.as_str() {
        "runs" => {
            let Some(hex) = positional.first() else {
                bail!("runs requires a hex-encoded run list");
            };
            runs_cmd(hex, json)
        }
        "inspect" => {
            let Some(path) = positional.first() else {
                bail!("inspect requires an image path");
            };
            inspect(Path::new(path), json)
        }
        "verify-block" => {
            let [path, offset, size] = positional.as_slice() else {
                bail!("verify-block requires <image-path> <offset> <size>");
            };
            let offset = parse_number(offset).context("offset")?;
            let size = usize::try_from(parse_number(size).context("size")?)
                .context("size does not fit in memory")?;
            let layout = if rest.iter().any(|arg| arg == "--file-names") {
                EntryLayout::File
            } else {
                EntryLayout::Generic
            };
            verify_block(Path::new(path), offset, size, layout, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("ntfs-cli\n");
    println!("USAGE:");
    println!("  ntfs-cli runs <hex-bytes> [--json]");
    println!("  ntfs-cli inspect <image-path> [--json]");
    println!("  ntfs-cli verify-block <image-path> <offset> <size> [--file-names] [--json]");
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

/// Decimal, or hexadecimal with a `0x` prefix.
fn parse_number(text: &str) -> Result<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).with_context(|| format!("bad hex number {text}")),
        None => text.parse().with_context(|| format!("bad number {text}")),
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<char> = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != ',')
        .collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).with_context(|| format!("bad hex byte {byte}"))
        })
        .collect()
}

fn runs_cmd(hex: &str, json: bool) -> Result<()> {
    let bytes = decode_hex(hex)?;
    let (list, consumed) = RunList::parse(&bytes).context("decode run list")?;
    let cooked: Vec<CookedRun> = list.cooked().context("resolve run offsets")?;
    let output = RunsOutput {
        bytes_consumed: consumed,
        total_clusters: list.total_clusters(),
        runs: cooked
            .iter()
            .zip(list.runs())
            .map(|(run, raw)| RunOutput {
                vcn: run.vcn.0,
                lcn: run.lcn.map(|lcn| lcn.0),
                length: run.length,
                offset_delta: raw.offset(),
            })
            .collect(),
    };

    if json {
        return print_json(&output);
    }
    println!("run list: {} runs, {} bytes", output.runs.len(), output.bytes_consumed);
    for run in &output.runs {
        match run.lcn {
            Some(lcn) => println!(
                "  vcn {:>10}  lcn {:>12}  length {:>8}  (delta {:+})",
                run.vcn, lcn, run.length, run.offset_delta
            ),
            None => println!("  vcn {:>10}  sparse             length {:>8}", run.vcn, run.length),
        }
    }
    println!("total clusters: {}", output.total_clusters);
    Ok(())
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let dev = FileByteDevice::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;
    let mut sector = vec![0_u8; BOOT_SECTOR_SIZE];
    dev.read_exact_at(0, &mut sector)
        .with_context(|| format!("failed to read boot sector of {}", path.display()))?;
    let boot = BootSector::parse(&sector)
        .map_err(|err| parse_error_to_ntfs(0, &err))
        .with_context(|| format!("no NTFS boot sector in {}", path.display()))?;
    let geometry = geometry_from_boot_sector(&boot, false).context("boot sector geometry")?;

    let output = InspectOutput {
        oem_id: boot.oem_id.clone(),
        serial_number: format!("{:016X}", boot.serial_number),
        mft_cluster: boot.mft_cluster.0,
        mft_mirror_cluster: boot.mft_mirror_cluster.0,
        bytes_per_cluster: geometry.bytes_per_cluster(),
        total_clusters: geometry.total_clusters(),
        geometry,
    };

    if json {
        return print_json(&output);
    }
    println!("NTFS Inspector");
    println!("oem_id: {}", output.oem_id);
    println!("serial_number: {}", output.serial_number);
    println!("bytes_per_sector: {}", geometry.bytes_per_sector);
    println!("sectors_per_cluster: {}", geometry.sectors_per_cluster);
    println!("bytes_per_cluster: {}", output.bytes_per_cluster);
    println!("total_clusters: {}", output.total_clusters);
    println!("mft_record_size: {}", geometry.mft_record_size);
    println!("index_buffer_size: {}", geometry.index_buffer_size);
    println!("mft_cluster: {}", output.mft_cluster);
    println!("mft_mirror_cluster: {}", output.mft_mirror_cluster);
    Ok(())
}

fn verify_block(
    path: &Path,
    offset: u64,
    size: usize,
    layout: EntryLayout,
    json: bool,
) -> Result<()> {
    let dev = FileByteDevice::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;
    let mut raw = vec![0_u8; size];
    dev.read_exact_at(offset, &mut raw)
        .with_context(|| format!("failed to read {size} bytes at {offset:#x}"))?;
    let block = IndexBlock::decode(&mut raw, layout)
        .map_err(|err| parse_error_to_ntfs(offset, &err))
        .with_context(|| format!("index block at {offset:#x} failed verification"))?;

    let output = BlockOutput {
        vcn: block.vcn.0,
        lsn: block.lsn,
        usn: block.usn,
        entries: block.node.entries.len(),
        leaf: block.node.is_leaf(),
        end_child: block.node.end_child.map(|vcn| vcn.0),
        keys: block
            .node
            .entries
            .iter()
            .map(|entry| entry.key.iter().map(|b| format!("{b:02x}")).collect())
            .collect(),
    };

    if json {
        return print_json(&output);
    }
    println!("INDX block at {offset:#x}: fixups verified");
    println!("vcn: {}", output.vcn);
    println!("lsn: {}", output.lsn);
    println!("usn: {:#06x}", output.usn);
    println!(
        "entries: {} ({})",
        output.entries,
        if output.leaf { "leaf" } else { "interior" }
    );
    if let Some(child) = output.end_child {
        println!("end child: vcn {child}");
    }
    for key in &output.keys {
        println!("  {key}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_input_accepts_separators() {
        assert_eq!(decode_hex("21 18:34,56 00").expect("hex"), vec![0x21, 0x18, 0x34, 0x56, 0x00]);
        assert!(decode_hex("123").is_err());
        assert!(decode_hex("zz").is_err());
    }

    #[test]
    fn numbers_accept_hex_prefix() {
        assert_eq!(parse_number("4096").expect("dec"), 4096);
        assert_eq!(parse_number("0x1000").expect("hex"), 4096);
        assert!(parse_number("0xg").is_err());
    }
}

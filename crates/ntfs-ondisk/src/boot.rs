//! NTFS boot sector (BIOS parameter block) and the volume geometry derived
//! from it.

use ntfs_types::{
    BOOT_SECTOR_SIZE, ClusterNumber, ClusterSize, NTFS_OEM_ID, ParseError, read_fixed,
    read_le_i64, read_le_u16, read_le_u64, trim_space_padded, write_bytes,
    write_le_u16, write_le_u64,
};
use serde::{Deserialize, Serialize};

const BOOT_SIGNATURE: u16 = 0xAA55;

/// Geometry every storage-core component reads but never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub total_sectors: u64,
    pub mft_record_size: u32,
    /// Bytes per `INDX` block.
    pub index_buffer_size: u32,
}

impl VolumeGeometry {
    #[must_use]
    pub fn bytes_per_cluster(&self) -> u64 {
        u64::from(self.bytes_per_sector) * u64::from(self.sectors_per_cluster)
    }

    #[must_use]
    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / u64::from(self.sectors_per_cluster.max(1))
    }

    /// Cluster size as a validated newtype.
    pub fn cluster_size(&self) -> Result<ClusterSize, ParseError> {
        let bytes = u32::try_from(self.bytes_per_cluster()).map_err(|_| {
            ParseError::IntegerConversion {
                field: "bytes_per_cluster",
            }
        })?;
        ClusterSize::new(bytes)
    }

    /// Clusters one index block spans (at least one).
    #[must_use]
    pub fn clusters_per_index_block(&self) -> u64 {
        u64::from(self.index_buffer_size)
            .div_ceil(self.bytes_per_cluster().max(1))
            .max(1)
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        if !self.bytes_per_sector.is_power_of_two() || !(256..=4096).contains(&self.bytes_per_sector)
        {
            return Err(ParseError::InvalidField {
                field: "bytes_per_sector",
                reason: "must be power of two in 256..=4096",
            });
        }
        if !self.sectors_per_cluster.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectors_per_cluster",
                reason: "must be a power of two",
            });
        }
        self.cluster_size()?;
        if self.total_clusters() == 0 {
            return Err(ParseError::InvalidField {
                field: "total_sectors",
                reason: "volume holds no clusters",
            });
        }
        for (field, size) in [
            ("index_buffer_size", self.index_buffer_size),
            ("mft_record_size", self.mft_record_size),
        ] {
            if size == 0 || size % 512 != 0 || !size.is_power_of_two() {
                return Err(ParseError::InvalidField {
                    field,
                    reason: "must be a power-of-two multiple of 512",
                });
            }
        }
        Ok(())
    }
}

/// Decoded boot sector fields relevant to the storage core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSector {
    pub oem_id: String,
    pub bytes_per_sector: u16,
    /// Raw byte; values above 0x80 encode `1 << (256 - raw)`.
    pub raw_sectors_per_cluster: u8,
    pub media_descriptor: u8,
    pub total_sectors: u64,
    pub mft_cluster: ClusterNumber,
    pub mft_mirror_cluster: ClusterNumber,
    pub raw_mft_record_size: i8,
    pub raw_index_buffer_size: i8,
    pub serial_number: u64,
}

impl BootSector {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        let oem = read_fixed::<8>(buf, 0x03)?;
        if oem != NTFS_OEM_ID {
            return Err(ParseError::InvalidMagic {
                expected: u64::from_le_bytes(NTFS_OEM_ID),
                actual: u64::from_le_bytes(oem),
            });
        }
        let signature = read_le_u16(buf, 0x1FE)?;
        if signature != BOOT_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(BOOT_SIGNATURE),
                actual: u64::from(signature),
            });
        }

        let total_sectors = u64::try_from(read_le_i64(buf, 0x28)?).map_err(|_| {
            ParseError::InvalidField {
                field: "total_sectors",
                reason: "negative",
            }
        })?;

        Ok(Self {
            oem_id: trim_space_padded(&oem),
            bytes_per_sector: read_le_u16(buf, 0x0B)?,
            raw_sectors_per_cluster: read_fixed::<1>(buf, 0x0D)?[0],
            media_descriptor: read_fixed::<1>(buf, 0x15)?[0],
            total_sectors,
            mft_cluster: ClusterNumber(read_le_u64(buf, 0x30)?),
            mft_mirror_cluster: ClusterNumber(read_le_u64(buf, 0x38)?),
            raw_mft_record_size: i8::from_le_bytes(read_fixed::<1>(buf, 0x40)?),
            raw_index_buffer_size: i8::from_le_bytes(read_fixed::<1>(buf, 0x44)?),
            serial_number: read_le_u64(buf, 0x48)?,
        })
    }

    #[must_use]
    pub fn sectors_per_cluster(&self) -> u32 {
        match self.raw_sectors_per_cluster {
            raw @ 0..=0x80 => u32::from(raw),
            raw => 1_u32.checked_shl(256 - u32::from(raw)).unwrap_or(0),
        }
    }

    /// Derive and validate the geometry described by this sector.
    pub fn geometry(&self) -> Result<VolumeGeometry, ParseError> {
        let bytes_per_sector = u32::from(self.bytes_per_sector);
        let sectors_per_cluster = self.sectors_per_cluster();
        let cluster = bytes_per_sector.saturating_mul(sectors_per_cluster);
        let geometry = VolumeGeometry {
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors: self.total_sectors,
            mft_record_size: decode_record_size(self.raw_mft_record_size, cluster)?,
            index_buffer_size: decode_record_size(self.raw_index_buffer_size, cluster)?,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Build the boot sector for a fresh volume with `geometry`.
    pub fn for_geometry(
        geometry: &VolumeGeometry,
        mft_cluster: u64,
        mft_mirror_cluster: u64,
        serial_number: u64,
    ) -> Result<Self, ParseError> {
        geometry.validate()?;
        let cluster = geometry.cluster_size()?.get();
        let raw_sectors_per_cluster = if geometry.sectors_per_cluster <= 0x80 {
            u8::try_from(geometry.sectors_per_cluster).map_err(|_| ParseError::IntegerConversion {
                field: "sectors_per_cluster",
            })?
        } else {
            u8::try_from(256 - geometry.sectors_per_cluster.trailing_zeros()).map_err(|_| {
                ParseError::IntegerConversion {
                    field: "sectors_per_cluster",
                }
            })?
        };
        Ok(Self {
            oem_id: trim_space_padded(&NTFS_OEM_ID),
            bytes_per_sector: u16::try_from(geometry.bytes_per_sector).map_err(|_| {
                ParseError::IntegerConversion {
                    field: "bytes_per_sector",
                }
            })?,
            raw_sectors_per_cluster,
            media_descriptor: 0xF8,
            total_sectors: geometry.total_sectors,
            mft_cluster: ClusterNumber(mft_cluster),
            mft_mirror_cluster: ClusterNumber(mft_mirror_cluster),
            raw_mft_record_size: encode_record_size(geometry.mft_record_size, cluster),
            raw_index_buffer_size: encode_record_size(geometry.index_buffer_size, cluster),
            serial_number,
        })
    }

    /// Serialise to a full 512-byte sector.
    pub fn to_bytes(&self) -> Result<[u8; BOOT_SECTOR_SIZE], ParseError> {
        let mut buf = [0_u8; BOOT_SECTOR_SIZE];
        write_bytes(&mut buf, 0x00, &[0xEB, 0x52, 0x90])?;
        write_bytes(&mut buf, 0x03, &NTFS_OEM_ID)?;
        write_le_u16(&mut buf, 0x0B, self.bytes_per_sector)?;
        buf[0x0D] = self.raw_sectors_per_cluster;
        buf[0x15] = self.media_descriptor;
        write_le_u64(&mut buf, 0x28, self.total_sectors)?;
        write_le_u64(&mut buf, 0x30, self.mft_cluster.0)?;
        write_le_u64(&mut buf, 0x38, self.mft_mirror_cluster.0)?;
        buf[0x40] = self.raw_mft_record_size.to_le_bytes()[0];
        buf[0x44] = self.raw_index_buffer_size.to_le_bytes()[0];
        write_le_u64(&mut buf, 0x48, self.serial_number)?;
        write_le_u16(&mut buf, 0x1FE, BOOT_SIGNATURE)?;
        Ok(buf)
    }
}

/// Decode a record-size byte: negative means `1 << -raw` bytes, positive
/// means that many clusters.
pub fn decode_record_size(raw: i8, bytes_per_cluster: u32) -> Result<u32, ParseError> {
    if raw < 0 {
        1_u32
            .checked_shl(u32::from(raw.unsigned_abs()))
            .ok_or(ParseError::InvalidField {
                field: "record_size",
                reason: "shift out of range",
            })
    } else {
        u32::from(raw.unsigned_abs())
            .checked_mul(bytes_per_cluster)
            .ok_or(ParseError::InvalidField {
                field: "record_size",
                reason: "overflow",
            })
    }
}

/// Inverse of [`decode_record_size`]: whole clusters when the record spans
/// at least one, otherwise a negative shift.
#[must_use]
pub fn encode_record_size(size: u32, bytes_per_cluster: u32) -> i8 {
    if bytes_per_cluster != 0 && size >= bytes_per_cluster {
        if let Ok(clusters) = i8::try_from(size / bytes_per_cluster) {
            return clusters;
        }
    }
    // trailing_zeros of a u32 is at most 32, so the negation fits.
    -i8::try_from(size.trailing_zeros()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_geometry() -> VolumeGeometry {
        VolumeGeometry {
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            total_sectors: 2_097_152,
            mft_record_size: 1024,
            index_buffer_size: 4096,
        }
    }

    #[test]
    fn boot_sector_round_trip() {
        let geometry = sample_geometry();
        let boot = BootSector::for_geometry(&geometry, 786_432, 2, 0xDEAD_BEEF).expect("build");
        assert_eq!(boot.raw_mft_record_size, -10);
        assert_eq!(boot.raw_index_buffer_size, 1);

        let bytes = boot.to_bytes().expect("encode");
        let parsed = BootSector::parse(&bytes).expect("parse");
        assert_eq!(parsed, boot);
        assert_eq!(parsed.oem_id, "NTFS");
        assert_eq!(parsed.geometry().expect("geometry"), geometry);
    }

    #[test]
    fn geometry_derivations() {
        let g = sample_geometry();
        assert_eq!(g.bytes_per_cluster(), 4096);
        assert_eq!(g.total_clusters(), 262_144);
        assert_eq!(g.clusters_per_index_block(), 1);
        assert_eq!(g.cluster_size().unwrap().get(), 4096);

        let small = VolumeGeometry {
            sectors_per_cluster: 1,
            ..g
        };
        assert_eq!(small.clusters_per_index_block(), 8);
    }

    #[test]
    fn record_size_encoding() {
        assert_eq!(decode_record_size(-10, 4096), Ok(1024));
        assert_eq!(decode_record_size(2, 4096), Ok(8192));
        assert!(decode_record_size(-40, 4096).is_err());
        assert_eq!(encode_record_size(1024, 4096), -10);
        assert_eq!(encode_record_size(4096, 4096), 1);
        assert_eq!(encode_record_size(4096, 512), 8);
    }

    #[test]
    fn large_cluster_encoding() {
        let mut sector = BootSector::for_geometry(&sample_geometry(), 4, 2, 1).unwrap();
        sector.raw_sectors_per_cluster = 0xF4;
        assert_eq!(sector.sectors_per_cluster(), 4096);
    }

    #[test]
    fn rejects_wrong_oem_and_signature() {
        let boot = BootSector::for_geometry(&sample_geometry(), 4, 2, 1).unwrap();
        let mut bytes = boot.to_bytes().unwrap();
        bytes[0x03..0x0B].copy_from_slice(b"EXFAT   ");
        assert!(matches!(
            BootSector::parse(&bytes),
            Err(ParseError::InvalidMagic { .. })
        ));

        let mut bytes = boot.to_bytes().unwrap();
        bytes[0x1FF] = 0;
        assert!(BootSector::parse(&bytes).is_err());
    }

    #[test]
    fn validate_rejects_bad_geometry() {
        let g = sample_geometry();
        for bad in [
            VolumeGeometry {
                bytes_per_sector: 500,
                ..g
            },
            VolumeGeometry {
                sectors_per_cluster: 3,
                ..g
            },
            VolumeGeometry {
                total_sectors: 4,
                ..g
            },
            VolumeGeometry {
                index_buffer_size: 1000,
                ..g
            },
        ] {
            assert!(bad.validate().is_err(), "{bad:?}");
        }
        assert!(g.validate().is_ok());
    }
}

//! Cluster run lists (the "mapping pairs" of a non-resident attribute).
//!
//! Each run is a header byte followed by a length field and an offset field.
//! The low nibble of the header is the byte count of the length, the high
//! nibble the byte count of the offset. The offset is a signed delta from the
//! previous run's starting LCN; an offset width of zero marks a sparse run.
//! A stored offset field that decodes to zero is rejected, since it would
//! read back as a hole.
//! A header byte of `0x00` terminates the list.

use ntfs_types::{ClusterExtent, ClusterNumber, ParseError, Vcn, ensure_slice, ensure_slice_mut};
use serde::{Deserialize, Serialize};

/// Run list terminator byte.
pub const RUN_LIST_END: u8 = 0x00;

const MAX_FIELD_BYTES: usize = 8;

/// One encoded run: a signed cluster delta and an unsigned cluster count.
///
/// `length` is always non-zero and fits in an `i64`, which is what every
/// NTFS writer assumes when sizing the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRun {
    offset: i64,
    length: u64,
}

impl DataRun {
    /// Build a run, rejecting zero or out-of-range lengths.
    pub fn new(offset: i64, length: u64) -> Result<Self, ParseError> {
        if length == 0 {
            return Err(ParseError::InvalidField {
                field: "run_length",
                reason: "zero-length run",
            });
        }
        if i64::try_from(length).is_err() {
            return Err(ParseError::IntegerConversion {
                field: "run_length",
            });
        }
        Ok(Self { offset, length })
    }

    /// A hole of `length` clusters with no physical backing.
    pub fn sparse(length: u64) -> Result<Self, ParseError> {
        Self::new(0, length)
    }

    /// Signed LCN delta from the previous non-sparse run.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub fn is_sparse(&self) -> bool {
        self.offset == 0
    }

    /// Bytes this run occupies on disk, header included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + self.length_width() + self.offset_width()
    }

    fn length_width(&self) -> usize {
        // new() guarantees the length fits in i64.
        #[expect(clippy::cast_possible_wrap)]
        let as_signed = self.length as i64;
        var_len(as_signed)
    }

    fn offset_width(&self) -> usize {
        if self.is_sparse() {
            0
        } else {
            var_len(self.offset)
        }
    }

    /// Decode the run starting at `offset`.
    ///
    /// Returns `Ok(None)` at the `0x00` terminator, otherwise the run and the
    /// number of bytes it occupied.
    pub fn decode(buf: &[u8], offset: usize) -> Result<Option<(Self, usize)>, ParseError> {
        let header = ensure_slice(buf, offset, 1)?[0];
        if header == RUN_LIST_END {
            return Ok(None);
        }

        let length_width = usize::from(header & 0x0F);
        let offset_width = usize::from(header >> 4);
        if length_width == 0 || length_width > MAX_FIELD_BYTES || offset_width > MAX_FIELD_BYTES {
            return Err(ParseError::BadRunHeader { offset, header });
        }

        let body = ensure_slice(buf, offset + 1, length_width + offset_width)?;
        let length = read_unsigned(&body[..length_width]);
        let delta = if offset_width == 0 {
            0
        } else {
            read_signed(&body[length_width..])
        };
        if offset_width != 0 && delta == 0 {
            return Err(ParseError::InvalidField {
                field: "run_offset",
                reason: "stored offset is zero",
            });
        }

        let run = Self::new(delta, length)?;
        Ok(Some((run, 1 + length_width + offset_width)))
    }

    /// Encode into `buf` at `offset`, returning the bytes written.
    pub fn encode_into(&self, buf: &mut [u8], offset: usize) -> Result<usize, ParseError> {
        let length_width = self.length_width();
        let offset_width = self.offset_width();
        let total = 1 + length_width + offset_width;
        self.write_fields(ensure_slice_mut(buf, offset, total)?);
        Ok(total)
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; self.encoded_len()];
        self.write_fields(&mut buf);
        buf
    }

    /// `out` must be exactly `encoded_len()` bytes.
    fn write_fields(&self, out: &mut [u8]) {
        let length_width = self.length_width();
        let offset_width = self.offset_width();
        debug_assert_eq!(out.len(), 1 + length_width + offset_width);

        #[expect(clippy::cast_possible_truncation)]
        let header = ((offset_width as u8) << 4) | (length_width as u8);
        out[0] = header;
        out[1..=length_width].copy_from_slice(&self.length.to_le_bytes()[..length_width]);
        out[1 + length_width..].copy_from_slice(&self.offset.to_le_bytes()[..offset_width]);
    }
}

/// Minimal byte count that reproduces `value` under sign extension.
///
/// Bytes are emitted until the remainder is `0` or `-1`; a positive value
/// whose top emitted byte has bit 7 set gains a `0x00`, and a negative value
/// whose top byte has bit 7 clear gains a `0xFF`.
#[must_use]
pub fn var_len(value: i64) -> usize {
    let positive = value >= 0;
    let mut rest = value;
    let mut len = 0;
    let mut top_high_bit;
    loop {
        top_high_bit = rest & 0x80 != 0;
        rest >>= 8;
        len += 1;
        if rest == 0 || rest == -1 {
            break;
        }
    }
    if positive == top_high_bit {
        len += 1;
    }
    len
}

fn read_unsigned(bytes: &[u8]) -> u64 {
    let mut raw = [0_u8; 8];
    raw[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

fn read_signed(bytes: &[u8]) -> i64 {
    let negative = bytes.last().is_some_and(|b| b & 0x80 != 0);
    let mut raw = if negative { [0xFF_u8; 8] } else { [0_u8; 8] };
    raw[..bytes.len()].copy_from_slice(bytes);
    i64::from_le_bytes(raw)
}

/// A run resolved to absolute coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookedRun {
    pub vcn: Vcn,
    /// `None` for sparse runs.
    pub lcn: Option<ClusterNumber>,
    pub length: u64,
}

/// An ordered run list as stored in a non-resident attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunList {
    runs: Vec<DataRun>,
}

impl RunList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_runs(runs: Vec<DataRun>) -> Self {
        Self { runs }
    }

    #[must_use]
    pub fn runs(&self) -> &[DataRun] {
        &self.runs
    }

    pub fn push(&mut self, run: DataRun) {
        self.runs.push(run);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Total clusters covered, sparse runs included.
    #[must_use]
    pub fn total_clusters(&self) -> u64 {
        self.runs.iter().map(DataRun::length).sum()
    }

    /// Parse runs up to and including the terminator.
    ///
    /// Returns the list and the bytes consumed (terminator included). A list
    /// that runs off the end of `buf` without a terminator is truncated data.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ParseError> {
        let mut runs = Vec::new();
        let mut pos = 0;
        while let Some((run, used)) = DataRun::decode(buf, pos)? {
            runs.push(run);
            pos += used;
        }
        Ok((Self { runs }, pos + 1))
    }

    /// Encoded size including the terminator.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.runs.iter().map(DataRun::encoded_len).sum::<usize>() + 1
    }

    /// Serialise into `buf` at `offset`, returning bytes written.
    pub fn serialize_into(&self, buf: &mut [u8], offset: usize) -> Result<usize, ParseError> {
        ensure_slice(buf, offset, self.encoded_len())?;
        let mut pos = offset;
        for run in &self.runs {
            pos += run.encode_into(buf, pos)?;
        }
        buf[pos] = RUN_LIST_END;
        Ok(pos + 1 - offset)
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        for run in &self.runs {
            out.extend_from_slice(&run.to_bytes());
        }
        out.push(RUN_LIST_END);
        out
    }

    /// Resolve deltas into absolute LCNs.
    pub fn cooked(&self) -> Result<Vec<CookedRun>, ParseError> {
        let mut out = Vec::with_capacity(self.runs.len());
        let mut vcn = 0_u64;
        let mut lcn = 0_i64;
        for run in &self.runs {
            let physical = if run.is_sparse() {
                None
            } else {
                lcn = lcn.checked_add(run.offset()).ok_or(ParseError::InvalidField {
                    field: "run_offset",
                    reason: "lcn overflow",
                })?;
                let absolute = u64::try_from(lcn).map_err(|_| ParseError::InvalidField {
                    field: "run_offset",
                    reason: "negative lcn",
                })?;
                Some(ClusterNumber(absolute))
            };
            out.push(CookedRun {
                vcn: Vcn(vcn),
                lcn: physical,
                length: run.length(),
            });
            vcn = vcn.checked_add(run.length()).ok_or(ParseError::InvalidField {
                field: "run_length",
                reason: "vcn overflow",
            })?;
        }
        Ok(out)
    }

    /// Delta-encode absolute extents, continuing from `previous_lcn` (the
    /// starting LCN of the last non-sparse run already in the list, or 0).
    ///
    /// An extent that starts exactly at `previous_lcn` cannot be expressed:
    /// its zero delta would read back as a sparse run.
    pub fn from_extents(extents: &[ClusterExtent], previous_lcn: u64) -> Result<Self, ParseError> {
        let mut runs = Vec::with_capacity(extents.len());
        let mut prev = i128::from(previous_lcn);
        for extent in extents {
            let start = i128::from(extent.start.0);
            let delta = i64::try_from(start - prev).map_err(|_| ParseError::IntegerConversion {
                field: "run_offset",
            })?;
            if delta == 0 {
                return Err(ParseError::InvalidField {
                    field: "run_offset",
                    reason: "zero delta would read back as sparse",
                });
            }
            runs.push(DataRun::new(delta, extent.length)?);
            prev = start;
        }
        Ok(Self { runs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(offset: i64, length: u64) -> DataRun {
        DataRun::new(offset, length).expect("valid run")
    }

    #[test]
    fn minimal_widths_at_sign_boundaries() {
        assert_eq!(var_len(1), 1);
        assert_eq!(var_len(127), 1);
        assert_eq!(var_len(128), 2);
        assert_eq!(var_len(255), 2);
        assert_eq!(var_len(0x7FFF), 2);
        assert_eq!(var_len(0x8000), 3);
        assert_eq!(var_len(-1), 1);
        assert_eq!(var_len(-128), 1);
        assert_eq!(var_len(-129), 2);
        assert_eq!(var_len(i64::MAX), 8);
        assert_eq!(var_len(i64::MIN), 8);
    }

    #[test]
    fn offset_128_needs_padding_byte() {
        let bytes = run(128, 1).to_bytes();
        assert_eq!(bytes, vec![0x21, 0x01, 0x80, 0x00]);

        let bytes = run(127, 1).to_bytes();
        assert_eq!(bytes, vec![0x11, 0x01, 0x7F]);
    }

    #[test]
    fn negative_offset_padding() {
        // -256 = 0xFF00: low byte 0x00 has bit 7 clear, so 0xFF is appended.
        assert_eq!(run(-256, 2).to_bytes(), vec![0x21, 0x02, 0x00, 0xFF]);
        assert_eq!(run(-128, 2).to_bytes(), vec![0x11, 0x02, 0x80]);
    }

    #[test]
    fn length_with_high_bit_gains_zero_byte() {
        assert_eq!(run(1, 0x80).to_bytes(), vec![0x12, 0x80, 0x00, 0x01]);
    }

    #[test]
    fn sparse_run_has_no_offset_field() {
        let sparse = DataRun::sparse(16).expect("sparse");
        assert!(sparse.is_sparse());
        assert_eq!(sparse.to_bytes(), vec![0x01, 0x10]);
        let (decoded, used) = DataRun::decode(&[0x01, 0x10, 0x00], 0)
            .expect("decode")
            .expect("run");
        assert_eq!(decoded, sparse);
        assert_eq!(used, 2);
    }

    #[test]
    fn decode_known_list() {
        // 0x30 clusters at LCN 0x1234, then 0x10 clusters 0x100 earlier, then a hole.
        let raw = [
            0x21, 0x30, 0x34, 0x12, 0x21, 0x10, 0x00, 0xFF, 0x01, 0x08, 0x00, 0xEE,
        ];
        let (list, used) = RunList::parse(&raw).expect("parse");
        assert_eq!(used, 11);
        assert_eq!(list.runs(), &[run(0x1234, 0x30), run(-0x100, 0x10), DataRun::sparse(8).unwrap()]);
        assert_eq!(list.to_bytes(), raw[..11].to_vec());

        let cooked = list.cooked().expect("cook");
        assert_eq!(cooked[0].lcn, Some(ClusterNumber(0x1234)));
        assert_eq!(cooked[1].lcn, Some(ClusterNumber(0x1134)));
        assert_eq!(cooked[1].vcn, Vcn(0x30));
        assert_eq!(cooked[2].lcn, None);
        assert_eq!(cooked[2].vcn, Vcn(0x40));
        assert_eq!(list.total_clusters(), 0x48);
    }

    #[test]
    fn terminator_is_not_a_record() {
        assert_eq!(DataRun::decode(&[0x00, 0x11], 0), Ok(None));
        let (list, used) = RunList::parse(&[0x00]).expect("empty list");
        assert!(list.is_empty());
        assert_eq!(used, 1);
    }

    #[test]
    fn garbage_header_is_bad_run_header() {
        assert_eq!(
            DataRun::decode(&[0x19, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], 0),
            Err(ParseError::BadRunHeader {
                offset: 0,
                header: 0x19
            })
        );
        assert_eq!(
            DataRun::decode(&[0x00, 0x90], 1),
            Err(ParseError::BadRunHeader {
                offset: 1,
                header: 0x90
            })
        );
    }

    #[test]
    fn truncated_run_is_insufficient_data() {
        assert!(matches!(
            DataRun::decode(&[0x21, 0x01, 0x80], 0),
            Err(ParseError::InsufficientData { .. })
        ));
        assert!(matches!(
            RunList::parse(&[0x11, 0x01, 0x05]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(DataRun::new(5, 0).is_err());
        assert!(DataRun::decode(&[0x11, 0x00, 0x05], 0).is_err());
        assert!(DataRun::new(5, u64::MAX).is_err());
    }

    #[test]
    fn stored_zero_offset_is_not_a_hole() {
        assert_eq!(
            DataRun::decode(&[0x11, 0x01, 0x00], 0),
            Err(ParseError::InvalidField {
                field: "run_offset",
                reason: "stored offset is zero",
            })
        );
        // Sign-extended padding that still decodes to zero.
        assert!(DataRun::decode(&[0x21, 0x04, 0x00, 0x00], 0).is_err());
        assert!(RunList::parse(&[0x11, 0x04, 0x10, 0x11, 0x02, 0x00, 0x00]).is_err());
    }

    #[test]
    fn to_bytes_matches_encode_into() {
        for original in [run(0x1234, 0x30), run(-1, 1), DataRun::sparse(9).expect("sparse")] {
            let mut buf = vec![0_u8; original.encoded_len()];
            let written = original.encode_into(&mut buf, 0).expect("encode");
            assert_eq!(written, buf.len());
            assert_eq!(original.to_bytes(), buf);
        }
    }

    #[test]
    fn negative_cumulative_lcn_is_rejected() {
        let list = RunList::from_runs(vec![run(4, 1), run(-5, 1)]);
        assert!(list.cooked().is_err());
    }

    #[test]
    fn from_extents_delta_encodes() {
        let extents = [ClusterExtent::new(900, 10), ClusterExtent::new(200, 5)];
        let list = RunList::from_extents(&extents, 0).expect("encode");
        assert_eq!(list.runs(), &[run(900, 10), run(-700, 5)]);
        let cooked = list.cooked().expect("cook");
        assert_eq!(cooked[1].lcn, Some(ClusterNumber(200)));

        let continued = RunList::from_extents(&[ClusterExtent::new(950, 1)], 900).expect("continue");
        assert_eq!(continued.runs(), &[run(50, 1)]);

        assert!(RunList::from_extents(&[ClusterExtent::new(0, 1)], 0).is_err());
    }

    #[test]
    fn serialize_into_respects_bounds() {
        let list = RunList::from_runs(vec![run(0x1234, 0x30)]);
        let mut small = [0_u8; 4];
        assert!(list.serialize_into(&mut small, 0).is_err());
        let mut buf = [0xAA_u8; 8];
        assert_eq!(list.serialize_into(&mut buf, 1), Ok(5));
        assert_eq!(&buf[1..6], &[0x21, 0x30, 0x34, 0x12, 0x00]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(512))]

        #[test]
        fn proptest_run_round_trip(offset in any::<i64>(), length in 1_u64..=0x7FFF_FFFF_FFFF_FFFF) {
            let original = DataRun::new(offset, length).unwrap();
            let bytes = original.to_bytes();
            prop_assert_eq!(bytes.len(), original.encoded_len());
            let (decoded, used) = DataRun::decode(&bytes, 0).unwrap().unwrap();
            prop_assert_eq!(decoded, original);
            prop_assert_eq!(used, bytes.len());
        }

        #[test]
        fn proptest_offset_width_is_minimal(offset in any::<i64>().prop_filter("non-sparse", |v| *v != 0)) {
            let width = var_len(offset);
            // One byte fewer must not sign-extend back to the same value.
            if width > 1 {
                let shorter = read_signed(&offset.to_le_bytes()[..width - 1]);
                prop_assert_ne!(shorter, offset);
            }
            prop_assert_eq!(read_signed(&offset.to_le_bytes()[..width]), offset);
        }

        #[test]
        fn proptest_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = RunList::parse(&bytes);
        }
    }
}

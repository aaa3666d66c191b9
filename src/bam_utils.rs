//! Helpers for BAM record access shared across pipeline stages: aux tag
//! encoding/decoding, read-pair geometry, cigar summaries and the external
//! sort hand-off.

use std::io::{Read as IoRead, Seek, SeekFrom};
use std::process::Command;

use rust_htslib::bam::{self, record::Aux, record::Cigar};
use unwrap::unwrap;

/// CI index of the SV supported by this record
pub const SV_AUX_TAG: &[u8] = b"SV";

/// Left breakpoint position derived from this record
pub const LBP_AUX_TAG: &[u8] = b"LB";

/// Right breakpoint position derived from this record
pub const RBP_AUX_TAG: &[u8] = b"RB";

/// Copy-locus breakpoint position (interspersed duplications only)
pub const CPY_AUX_TAG: &[u8] = b"CP";

fn unexpected_aux_val_err(record: &bam::Record, aux_tag: &[u8], aux_val: Aux<'_>) -> ! {
    let qname = std::str::from_utf8(record.qname()).unwrap().to_string();
    panic!(
        "Unexpected {} tag format in read {qname}: {:?}",
        std::str::from_utf8(aux_tag).unwrap(),
        aux_val,
    );
}

fn missing_aux_tag_err(record: &bam::Record, aux_tag: &[u8]) -> ! {
    let qname = std::str::from_utf8(record.qname()).unwrap().to_string();
    panic!(
        "Missing {} tag in read {qname}",
        std::str::from_utf8(aux_tag).unwrap(),
    );
}

/// Retrieve an int aux tag, promoting any of the on-disk integer widths to i64
///
/// Function will panic if the tag has a non-int value
///
pub fn get_optional_int_aux_tag(record: &bam::Record, aux_tag: &[u8]) -> Option<i64> {
    match record.aux(aux_tag) {
        Ok(aux_val) => Some(match aux_val {
            Aux::U8(val) => val as i64,
            Aux::U16(val) => val as i64,
            Aux::U32(val) => val as i64,
            Aux::I8(val) => val as i64,
            Aux::I16(val) => val as i64,
            Aux::I32(val) => val as i64,
            _ => unexpected_aux_val_err(record, aux_tag, aux_val),
        }),
        _ => None,
    }
}

/// Retrieve an int aux tag from bam record
///
/// Function will panic if the tag is missing or has a non-int value
///
pub fn get_int_aux_tag(record: &bam::Record, aux_tag: &[u8]) -> i64 {
    get_optional_int_aux_tag(record, aux_tag)
        .unwrap_or_else(|| missing_aux_tag_err(record, aux_tag))
}

/// Write an int aux tag using the smallest integer width accommodating the value
pub fn push_int_aux_tag(record: &mut bam::Record, aux_tag: &[u8], value: i64) {
    let aux_val = if value >= 0 && value <= u8::MAX as i64 {
        Aux::U8(value as u8)
    } else if value >= 0 && value <= u16::MAX as i64 {
        Aux::U16(value as u16)
    } else {
        Aux::I32(value as i32)
    };
    unwrap!(
        record.push_aux(aux_tag, aux_val),
        "Failed to add {} aux tag to record",
        String::from_utf8_lossy(aux_tag),
    );
}

/// Mapping strand of a record or its mate, as stored in the legacy
/// signaling-reads text format
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MappingOri {
    Forward = 1,
    Reverse = 2,
}

impl MappingOri {
    pub fn from_int(x: i64) -> Option<Self> {
        match x {
            1 => Some(MappingOri::Forward),
            2 => Some(MappingOri::Reverse),
            _ => None,
        }
    }
}

pub fn get_mapping_ori(record: &bam::Record) -> MappingOri {
    if record.is_reverse() {
        MappingOri::Reverse
    } else {
        MappingOri::Forward
    }
}

/// Read-pair index of this record, 1 or 2
pub fn get_pair_number(record: &bam::Record) -> u8 {
    if record.is_first_in_template() {
        1
    } else {
        2
    }
}

/// Sum of clip op lengths on the (left, right) ends of the alignment
pub fn get_clip_lengths(cigar: &[Cigar], include_hard_clip: bool) -> (usize, usize) {
    let mut left = 0;
    let mut right = 0;
    let mut in_left_clip = true;
    for c in cigar.iter() {
        match c {
            Cigar::SoftClip(len) => {
                if in_left_clip {
                    left += *len as usize;
                } else {
                    right += *len as usize;
                }
            }
            Cigar::HardClip(len) => {
                if include_hard_clip {
                    if in_left_clip {
                        left += *len as usize;
                    } else {
                        right += *len as usize;
                    }
                }
            }
            _ => {
                in_left_clip = false;
            }
        }
    }
    (left, right)
}

/// True if either end of the alignment is clipped by at least `min_len` bases
///
/// Hard clips count when `include_hard_clip` is set, matching their acceptance
/// as breakpoint-scan evidence even though the clipped sequence is absent.
///
pub fn has_min_clip(cigar: &[Cigar], min_len: usize, include_hard_clip: bool) -> bool {
    let (left, right) = get_clip_lengths(cigar, include_hard_clip);
    left >= min_len || right >= min_len
}

pub fn is_hard_clipped(cigar: &[Cigar]) -> bool {
    cigar.iter().any(|c| matches!(c, Cigar::HardClip(_)))
}

/// Total aligned (match-type op) read length
pub fn get_matched_length(cigar: &[Cigar]) -> i64 {
    cigar
        .iter()
        .map(|c| match c {
            Cigar::Match(len) | Cigar::Equal(len) | Cigar::Diff(len) => *len as i64,
            _ => 0,
        })
        .sum()
}

/// Test whether a reconstructed split alignment provides credible breakpoint
/// support
///
/// The primary deletion op is the longest `D` in the cigar. The alignment
/// qualifies when at least 5 matched bases flank the deletion on each side and
/// at least 50 matched bases exist in total.
///
pub fn is_valid_split(cigar: &[Cigar]) -> bool {
    let mut max_del = 0u32;
    let mut del_index = 0;
    for (i, c) in cigar.iter().enumerate() {
        if let Cigar::Del(len) = c {
            if *len > max_del {
                max_del = *len;
                del_index = i;
            }
        }
    }
    if max_del == 0 {
        return false;
    }

    let mlen = get_matched_length(&cigar[..del_index]);
    if mlen < 5 {
        return false;
    }
    let mlen2 = get_matched_length(&cigar[del_index + 1..]);
    if mlen2 < 5 {
        return false;
    }
    mlen + mlen2 >= 50
}

/// The fixed 28-byte block marking the end of a well-formed BGZF stream
const BGZF_EOF_MARKER: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02,
    0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Check that a BAM file ends with the BGZF EOF marker, the cheapest available
/// truncation probe
pub fn has_bgzf_eof(bam_filename: &str) -> bool {
    let mut file = match std::fs::File::open(bam_filename) {
        Ok(x) => x,
        Err(_) => return false,
    };
    let len = match file.seek(SeekFrom::End(0)) {
        Ok(x) => x,
        Err(_) => return false,
    };
    if len < BGZF_EOF_MARKER.len() as u64 {
        return false;
    }
    if file
        .seek(SeekFrom::End(-(BGZF_EOF_MARKER.len() as i64)))
        .is_err()
    {
        return false;
    }
    let mut tail = [0u8; 28];
    if file.read_exact(&mut tail).is_err() {
        return false;
    }
    tail == BGZF_EOF_MARKER
}

/// Group a cluster BAM by its CI tag using an external `samtools sort -t SV`
///
/// samtools is located via PATH. A missing binary or non-zero exit is fatal,
/// the downstream stages cannot run on ungrouped input.
///
pub fn sort_bam_by_sv_tag(input_filename: &str, output_filename: &str, thread_count: usize) {
    let tag = std::str::from_utf8(SV_AUX_TAG).unwrap();
    let status = Command::new("samtools")
        .arg("sort")
        .args(["-t", tag])
        .args(["-@", &thread_count.to_string()])
        .args(["-o", output_filename])
        .arg(input_filename)
        .status();
    let status = unwrap!(
        status,
        "Failed to launch samtools sort on '{}'",
        input_filename
    );
    if !status.success() {
        panic!("samtools sort -t {tag} failed on '{input_filename}' with status {status}",);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::{header, Header, HeaderView, Read};

    fn get_test_header() -> HeaderView {
        let mut _header = Header::new();
        _header.push_record(
            header::HeaderRecord::new(b"SQ")
                .push_tag(b"SN", "chr1")
                .push_tag(b"LN", 10000000),
        );
        HeaderView::from_header(&_header)
    }

    #[test]
    fn test_int_aux_tag_roundtrip() {
        let header = get_test_header();
        let sam_line = b"qname\t0\tchr1\t100\t60\t10M\t*\t0\t0\tACGCCGTATC\tDDDDDEEEEE";
        let mut rec = bam::Record::from_sam(&header, sam_line).unwrap();

        push_int_aux_tag(&mut rec, SV_AUX_TAG, 42);
        assert_eq!(get_int_aux_tag(&rec, SV_AUX_TAG), 42);

        push_int_aux_tag(&mut rec, LBP_AUX_TAG, 1_234_567);
        assert_eq!(get_int_aux_tag(&rec, LBP_AUX_TAG), 1_234_567);
    }

    #[test]
    fn test_int_aux_tag_width_promotion() {
        let header = get_test_header();

        // One tag per BAM integer width
        let sam_line =
            b"qname\t0\tchr1\t100\t60\t10M\t*\t0\t0\tACGCCGTATC\tDDDDDEEEEE\tXA:i:3\tXB:i:300\tXC:i:70000";
        let rec = bam::Record::from_sam(&header, sam_line).unwrap();

        assert_eq!(get_int_aux_tag(&rec, b"XA"), 3);
        assert_eq!(get_int_aux_tag(&rec, b"XB"), 300);
        assert_eq!(get_int_aux_tag(&rec, b"XC"), 70000);
        assert_eq!(get_optional_int_aux_tag(&rec, b"XZ"), None);
    }

    #[test]
    fn test_pair_number_and_ori() {
        let header = get_test_header();

        // paired + first-in-template + reverse
        let sam_line = b"qname\t81\tchr1\t100\t60\t10M\t=\t200\t0\tACGCCGTATC\tDDDDDEEEEE";
        let rec = bam::Record::from_sam(&header, sam_line).unwrap();
        assert_eq!(get_pair_number(&rec), 1);
        assert_eq!(get_mapping_ori(&rec), MappingOri::Reverse);

        // paired + second-in-template + forward
        let sam_line = b"qname\t161\tchr1\t100\t60\t10M\t=\t200\t0\tACGCCGTATC\tDDDDDEEEEE";
        let rec = bam::Record::from_sam(&header, sam_line).unwrap();
        assert_eq!(get_pair_number(&rec), 2);
        assert_eq!(get_mapping_ori(&rec), MappingOri::Forward);
    }

    #[test]
    fn test_clip_lengths() {
        let cigar = vec![Cigar::SoftClip(20), Cigar::Match(80)];
        assert_eq!(get_clip_lengths(&cigar, true), (20, 0));
        assert!(has_min_clip(&cigar, 10, false));

        let cigar = vec![Cigar::HardClip(15), Cigar::Match(80), Cigar::SoftClip(5)];
        assert_eq!(get_clip_lengths(&cigar, false), (0, 5));
        assert_eq!(get_clip_lengths(&cigar, true), (15, 5));
        assert!(!has_min_clip(&cigar, 10, false));
        assert!(has_min_clip(&cigar, 10, true));
        assert!(is_hard_clipped(&cigar));
    }

    #[test]
    fn test_matched_length() {
        let cigar = vec![
            Cigar::SoftClip(20),
            Cigar::Match(30),
            Cigar::Ins(5),
            Cigar::Match(45),
        ];
        assert_eq!(get_matched_length(&cigar), 75);
    }

    #[test]
    fn test_is_valid_split() {
        // 40M500D40M: well supported split
        let cigar = vec![Cigar::Match(40), Cigar::Del(500), Cigar::Match(40)];
        assert!(is_valid_split(&cigar));

        // 97M500D3M: right flank too short
        let cigar = vec![Cigar::Match(97), Cigar::Del(500), Cigar::Match(3)];
        assert!(!is_valid_split(&cigar));

        // 100M: no deletion op at all
        let cigar = vec![Cigar::Match(100)];
        assert!(!is_valid_split(&cigar));

        // 20M500D20M: flanks pass but total matched length is below 50
        let cigar = vec![Cigar::Match(20), Cigar::Del(500), Cigar::Match(20)];
        assert!(!is_valid_split(&cigar));

        // Longest D is the primary op, the small D on the left is flank noise
        let cigar = vec![
            Cigar::Match(30),
            Cigar::Del(2),
            Cigar::Match(10),
            Cigar::Del(800),
            Cigar::Match(30),
        ];
        assert!(is_valid_split(&cigar));
    }

    #[test]
    fn test_has_bgzf_eof() {
        let dir = tempfile::tempdir().unwrap();
        let bam_path = dir.path().join("eof_test.bam");
        let bam_path = bam_path.to_str().unwrap();

        {
            let mut header = Header::new();
            header.push_record(
                header::HeaderRecord::new(b"SQ")
                    .push_tag(b"SN", "chr1")
                    .push_tag(b"LN", 10000000),
            );
            let writer = bam::Writer::from_path(bam_path, &header, bam::Format::Bam).unwrap();
            drop(writer);
        }
        assert!(has_bgzf_eof(bam_path));

        let text_path = dir.path().join("not_a_bam.txt");
        std::fs::write(&text_path, b"plain text, much longer than the eof marker block").unwrap();
        assert!(!has_bgzf_eof(text_path.to_str().unwrap()));

        // Reader-level open of the intact file must also succeed
        let mut reader = bam::Reader::from_path(bam_path).unwrap();
        let mut rec = bam::Record::new();
        assert!(reader.read(&mut rec).is_none());
    }
}

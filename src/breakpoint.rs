//! Per-read breakpoint extraction from CIGAR clip geometry.
//!
//! Reads a CI-grouped cluster BAM and derives one base-level breakpoint
//! position per record: a read whose alignment is clipped on the right ends at
//! the breakpoint (`pos + matched_len`), a read clipped on the left starts at
//! it (`pos`). The position is written back as a side-specific aux tag for the
//! vote stage.

use log::info;
use rust_htslib::bam::{self, Read};
use unwrap::unwrap;

use crate::bam_utils::{
    get_clip_lengths, get_matched_length, get_optional_int_aux_tag, push_int_aux_tag,
    CPY_AUX_TAG, LBP_AUX_TAG, RBP_AUX_TAG, SV_AUX_TAG,
};
use crate::sv_store::{CiSide, CiStore, SvType};

/// Minimum aligned length and minimum clip length for a split to count
pub const MIN_SPLIT_SUPPORT: i64 = 10;

/// Which side of the aligned block the clip falls on
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SplitKind {
    /// Clip at the right end of the alignment; the read runs into the
    /// breakpoint from the left
    RightOfMatch,
    /// Clip at the left end; the read leaves the breakpoint rightward
    LeftOfMatch,
}

/// Derive the split kind and breakpoint position of one record
///
/// Returns None when the record carries no usable split: unclipped, too little
/// aligned sequence, or too short a clipped overhang.
///
fn get_read_breakpoint(record: &bam::Record) -> Option<(SplitKind, i64)> {
    let cigar = record.cigar();
    let (left_clip, right_clip) = get_clip_lengths(&cigar, true);
    if left_clip == 0 && right_clip == 0 {
        return None;
    }

    let matched_len = get_matched_length(&cigar);
    if matched_len < MIN_SPLIT_SUPPORT {
        return None;
    }

    // A clip on the left end wins when both ends are clipped
    if left_clip > 0 {
        if (left_clip as i64) < MIN_SPLIT_SUPPORT {
            return None;
        }
        // 1-based position of the first aligned base
        Some((SplitKind::LeftOfMatch, record.pos() + 1))
    } else {
        if (right_clip as i64) < MIN_SPLIT_SUPPORT {
            return None;
        }
        // 1-based position of the last aligned base
        Some((SplitKind::RightOfMatch, record.pos() + matched_len))
    }
}

/// Deletion breakpoints have a fixed relationship to split orientation: the
/// left breakpoint is reached by reads clipped on the right, the right
/// breakpoint by reads clipped on the left
fn passes_del_split_geometry(side: CiSide, kind: SplitKind) -> bool {
    match side {
        CiSide::Left => kind == SplitKind::RightOfMatch,
        CiSide::Right => kind == SplitKind::LeftOfMatch,
        CiSide::Copy => true,
    }
}

/// Walk the CI-sorted cluster BAM and tag each record carrying a usable split
/// with its breakpoint position
///
/// Exactly one of the left/right/copy tags is set per output record, matching
/// the side of the CI the record supports. Votes falling outside the widened
/// CI are dropped as invalid geometry.
///
pub fn set_breakpoint_tags(
    input_filename: &str,
    output_filename: &str,
    ci_store: &CiStore,
    sv_type: SvType,
) -> usize {
    info!("Extracting breakpoints from '{input_filename}'");

    let mut reader = unwrap!(
        bam::Reader::from_path(input_filename),
        "Unable to open cluster BAM file: '{}'",
        input_filename,
    );
    let output_header = bam::Header::from_template(reader.header());
    let mut writer = unwrap!(
        bam::Writer::from_path(output_filename, &output_header, bam::Format::Bam),
        "Unable to create breakpoint BAM file: '{}'",
        output_filename,
    );

    let mut written = 0usize;
    let mut missing_tag = 0usize;
    let mut dropped = 0usize;

    let mut record = bam::Record::new();
    while let Some(r) = reader.read(&mut record) {
        unwrap!(r, "Failed to parse cluster BAM record");

        let ci = match get_optional_int_aux_tag(&record, SV_AUX_TAG)
            .and_then(|x| ci_store.try_get(x as usize))
        {
            Some(x) => x,
            None => {
                missing_tag += 1;
                continue;
            }
        };

        let (kind, breakpoint) = match get_read_breakpoint(&record) {
            Some(x) => x,
            None => {
                dropped += 1;
                continue;
            }
        };

        if sv_type == SvType::Del && !passes_del_split_geometry(ci.side, kind) {
            dropped += 1;
            continue;
        }
        if !ci.contains(breakpoint) {
            dropped += 1;
            continue;
        }

        let bp_tag = match ci.side {
            CiSide::Left => LBP_AUX_TAG,
            CiSide::Right => RBP_AUX_TAG,
            CiSide::Copy => CPY_AUX_TAG,
        };
        push_int_aux_tag(&mut record, bp_tag, breakpoint);
        unwrap!(
            writer.write(&record),
            "Failed to write record to breakpoint BAM '{}'",
            output_filename,
        );
        record.remove_aux(bp_tag).unwrap();
        written += 1;
    }

    info!(
        "Breakpoint extraction: {written} records tagged, {dropped} without usable splits, {missing_tag} with missing/invalid CI tags"
    );
    written
}

//! Per-record signaling predicates: does a paired-end alignment's geometry
//! (orientation, insert size, clipping) support an SV hypothesis of the run's
//! class?

use rust_htslib::bam;

use crate::bam_utils::has_min_clip;
use crate::insert_size::InsertStats;
use crate::sv_store::SvType;

/// Minimum soft-clip length treated as split-read evidence
pub const MIN_SIGNAL_CLIP_LEN: usize = 10;

/// Basic eligibility shared by all SV classes: paired, self mapped, mate
/// mapped, same chromosome
fn passes_basic_pair_checks(record: &bam::Record) -> bool {
    record.is_paired()
        && !record.is_unmapped()
        && !record.is_mate_unmapped()
        && record.tid() == record.mtid()
}

fn has_signal_clip(record: &bam::Record) -> bool {
    has_min_clip(&record.cigar(), MIN_SIGNAL_CLIP_LEN, true)
}

/// Classify one record against one SV class
///
/// Records failing the basic paired/mapped predicates are rejected for every
/// class. Beyond that each class keys on its own geometry signature.
///
pub fn is_signaling(record: &bam::Record, sv_type: SvType, stats: &InsertStats) -> bool {
    if !passes_basic_pair_checks(record) {
        return false;
    }

    let pos = record.pos();
    let mate_pos = record.mpos();

    match sv_type {
        SvType::Del => {
            if has_signal_clip(record) {
                return true;
            }
            if (pos - mate_pos).abs() > stats.discordance_threshold() {
                return true;
            }
            // Everted pair: forward read whose reverse mate maps to its left,
            // or reverse read whose forward mate maps to its right
            (!record.is_reverse() && record.is_mate_reverse() && mate_pos < pos)
                || (record.is_reverse() && !record.is_mate_reverse() && mate_pos > pos)
        }
        SvType::Inv => {
            let same_direction = record.is_reverse() == record.is_mate_reverse();
            same_direction || has_signal_clip(record)
        }
        SvType::DupTandem | SvType::DupIsp => {
            let dup_signature = (record.is_reverse()
                && !record.is_mate_reverse()
                && pos <= mate_pos)
                || (!record.is_reverse() && record.is_mate_reverse() && pos > mate_pos);
            dup_signature && has_signal_clip(record)
        }
        SvType::Ins => has_signal_clip(record),
    }
}

/// Copy-locus predicate for interspersed duplications
///
/// The copy CI accepts clipped reads at either orientation, the duplication
/// pair signature is only required at the donor locus.
///
pub fn is_copy_locus_signaling(record: &bam::Record) -> bool {
    passes_basic_pair_checks(record) && has_signal_clip(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::{header, Header, HeaderView};

    fn get_test_header() -> HeaderView {
        let mut _header = Header::new();
        _header.push_record(
            header::HeaderRecord::new(b"SQ")
                .push_tag(b"SN", "chr1")
                .push_tag(b"LN", 10000000),
        );
        _header.push_record(
            header::HeaderRecord::new(b"SQ")
                .push_tag(b"SN", "chr2")
                .push_tag(b"LN", 10000000),
        );
        HeaderView::from_header(&_header)
    }

    fn test_stats() -> InsertStats {
        InsertStats { mean: 400, sd: 20 }
    }

    fn record_from(sam_line: &str) -> bam::Record {
        bam::Record::from_sam(&get_test_header(), sam_line.as_bytes()).unwrap()
    }

    #[test]
    fn test_basic_pair_rejections() {
        let stats = test_stats();

        // Unpaired
        let rec = record_from("r1\t0\tchr1\t1000\t60\t20S80M\t*\t0\t0\t*\t*");
        assert!(!is_signaling(&rec, SvType::Del, &stats));

        // Mate unmapped (flags: paired + mate unmapped + first)
        let rec = record_from("r1\t73\tchr1\t1000\t60\t20S80M\t=\t1000\t0\t*\t*");
        assert!(!is_signaling(&rec, SvType::Del, &stats));

        // Mate on another chromosome, rejected for every class
        let rec = record_from("r1\t65\tchr1\t1000\t60\t20S80M\tchr2\t1000\t0\t*\t*");
        for sv_type in [
            SvType::Del,
            SvType::Inv,
            SvType::DupTandem,
            SvType::DupIsp,
            SvType::Ins,
        ] {
            assert!(!is_signaling(&rec, sv_type, &stats));
        }
    }

    #[test]
    fn test_del_soft_clip() {
        let stats = test_stats();

        // 20 bp soft clip: split-read evidence (flags: paired + mate reverse + first)
        let rec = record_from("r1\t97\tchr1\t1000\t60\t20S80M\t=\t1200\t0\t*\t*");
        assert!(is_signaling(&rec, SvType::Del, &stats));

        // Clip below the 10 bp floor, concordant insert: no signal
        let rec = record_from("r1\t97\tchr1\t1000\t60\t5S95M\t=\t1200\t0\t*\t*");
        assert!(!is_signaling(&rec, SvType::Del, &stats));

        // Hard clips are accepted as vote-scan evidence
        let rec = record_from("r1\t97\tchr1\t1000\t60\t30H70M\t=\t1200\t0\t*\t*");
        assert!(is_signaling(&rec, SvType::Del, &stats));
    }

    #[test]
    fn test_del_discordant_insert_size() {
        let stats = test_stats();

        // |1000 - 1050000| far beyond mean + 3 sd = 460
        let rec = record_from("r1\t97\tchr1\t1000\t60\t100M\t=\t1050000\t0\t*\t*");
        assert!(is_signaling(&rec, SvType::Del, &stats));

        // Concordant distance, unclipped: no signal
        let rec = record_from("r1\t97\tchr1\t1000\t60\t100M\t=\t1300\t0\t*\t*");
        assert!(!is_signaling(&rec, SvType::Del, &stats));
    }

    #[test]
    fn test_del_everted_orientation() {
        let stats = test_stats();

        // Forward read, reverse mate to its left
        let rec = record_from("r1\t97\tchr1\t1000\t60\t100M\t=\t800\t0\t*\t*");
        assert!(is_signaling(&rec, SvType::Del, &stats));

        // Reverse read, forward mate to its right (flags: paired + reverse + first)
        let rec = record_from("r1\t81\tchr1\t1000\t60\t100M\t=\t1200\t0\t*\t*");
        assert!(is_signaling(&rec, SvType::Del, &stats));
    }

    #[test]
    fn test_inv_same_direction_mates() {
        let stats = test_stats();

        // ++ pair (neither reverse)
        let rec = record_from("r1\t65\tchr1\t1000\t60\t100M\t=\t1200\t0\t*\t*");
        assert!(is_signaling(&rec, SvType::Inv, &stats));

        // -- pair (flags: paired + reverse + mate reverse + first)
        let rec = record_from("r1\t113\tchr1\t1000\t60\t100M\t=\t1200\t0\t*\t*");
        assert!(is_signaling(&rec, SvType::Inv, &stats));

        // Normal +- orientation without a clip: no signal
        let rec = record_from("r1\t97\tchr1\t1000\t60\t100M\t=\t1200\t0\t*\t*");
        assert!(!is_signaling(&rec, SvType::Inv, &stats));

        // Normal orientation but clipped in the CI region
        let rec = record_from("r1\t97\tchr1\t1000\t60\t20S80M\t=\t1200\t0\t*\t*");
        assert!(is_signaling(&rec, SvType::Inv, &stats));
    }

    #[test]
    fn test_dup_signature() {
        let stats = test_stats();

        // Reverse read before its forward mate, clipped: DUP signature
        let rec = record_from("r1\t81\tchr1\t1000\t60\t20S80M\t=\t1200\t0\t*\t*");
        assert!(is_signaling(&rec, SvType::DupTandem, &stats));
        assert!(is_signaling(&rec, SvType::DupIsp, &stats));

        // Same orientation pattern but unclipped: no signal
        let rec = record_from("r1\t81\tchr1\t1000\t60\t100M\t=\t1200\t0\t*\t*");
        assert!(!is_signaling(&rec, SvType::DupTandem, &stats));

        // Clipped but normal +- orientation: no signal
        let rec = record_from("r1\t97\tchr1\t1000\t60\t20S80M\t=\t1200\t0\t*\t*");
        assert!(!is_signaling(&rec, SvType::DupTandem, &stats));
    }

    #[test]
    fn test_ins_any_clip() {
        let stats = test_stats();

        let rec = record_from("r1\t97\tchr1\t1000\t60\t80M20S\t=\t1200\t0\t*\t*");
        assert!(is_signaling(&rec, SvType::Ins, &stats));

        let rec = record_from("r1\t97\tchr1\t1000\t60\t100M\t=\t1200\t0\t*\t*");
        assert!(!is_signaling(&rec, SvType::Ins, &stats));
    }

    #[test]
    fn test_copy_locus_accepts_either_orientation() {
        // Forward clipped
        let rec = record_from("r1\t97\tchr1\t1000\t60\t20S80M\t=\t1200\t0\t*\t*");
        assert!(is_copy_locus_signaling(&rec));

        // Reverse clipped
        let rec = record_from("r1\t81\tchr1\t1000\t60\t20S80M\t=\t1200\t0\t*\t*");
        assert!(is_copy_locus_signaling(&rec));

        // Unclipped
        let rec = record_from("r1\t97\tchr1\t1000\t60\t100M\t=\t1200\t0\t*\t*");
        assert!(!is_copy_locus_signaling(&rec));
    }
}

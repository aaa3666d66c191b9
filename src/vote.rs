//! Breakpoint vote aggregation and refined call output.
//!
//! One pass over a CI-grouped, breakpoint-tagged BAM builds a per-CI histogram
//! of voted positions. The histogram is flushed to a text votes file, and the
//! top-voted left/right (and copy) positions per SV become records of the
//! refined output VCF.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};

use itertools::Itertools;
use log::{info, warn};
use rust_htslib::bam::{self, Read};
use unwrap::unwrap;

use crate::bam_utils::{
    get_optional_int_aux_tag, is_valid_split, CPY_AUX_TAG, LBP_AUX_TAG, RBP_AUX_TAG, SV_AUX_TAG,
};
use crate::genome_ref::GenomeRef;
use crate::sv_store::{CiSide, CiStore, SvStore, SvType};

/// Vote histograms keyed by CI index, in CI order for stable output
pub type BreakpointVotes = BTreeMap<usize, HashMap<i64, usize>>;

/// A supported breakpoint position with its vote count
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VotedPos {
    pub pos: i64,
    pub count: usize,
}

/// Tally breakpoint votes from a CI-sorted BAM with breakpoint aux tags
///
/// Each record contributes one vote at its tagged position, on the side its CI
/// dictates. With `require_valid_split` set, records whose cigar does not show
/// a credible split alignment are ignored (used for the alignment-path BAM,
/// whose cigars carry the deletion op).
///
pub fn collect_breakpoint_votes(
    bam_filename: &str,
    ci_store: &CiStore,
    require_valid_split: bool,
) -> BreakpointVotes {
    info!("Collecting breakpoint votes from '{bam_filename}'");

    let mut reader = unwrap!(
        bam::Reader::from_path(bam_filename),
        "Unable to open breakpoint BAM file: '{}'",
        bam_filename,
    );

    let mut votes = BreakpointVotes::new();
    let mut malformed = 0usize;

    let mut record = bam::Record::new();
    while let Some(r) = reader.read(&mut record) {
        unwrap!(r, "Failed to parse breakpoint BAM record");

        let ci_index = match get_optional_int_aux_tag(&record, SV_AUX_TAG) {
            Some(x) => x as usize,
            None => {
                malformed += 1;
                continue;
            }
        };
        let ci = match ci_store.try_get(ci_index) {
            Some(x) => x,
            None => {
                malformed += 1;
                continue;
            }
        };

        let bp_tag = match ci.side {
            CiSide::Left => LBP_AUX_TAG,
            CiSide::Right => RBP_AUX_TAG,
            CiSide::Copy => CPY_AUX_TAG,
        };
        let pos = match get_optional_int_aux_tag(&record, bp_tag) {
            Some(x) => x,
            None => {
                malformed += 1;
                continue;
            }
        };

        if require_valid_split && !is_valid_split(&record.cigar()) {
            continue;
        }

        *votes.entry(ci_index).or_default().entry(pos).or_insert(0) += 1;
    }

    if malformed > 0 {
        warn!("Skipped {malformed} records with missing or invalid aux tags");
    }
    info!("Collected votes for {} confidence intervals", votes.len());
    votes
}

/// Vote list of one CI sorted by descending count, position breaking ties
pub fn sorted_votes(histogram: &HashMap<i64, usize>) -> Vec<VotedPos> {
    histogram
        .iter()
        .map(|(&pos, &count)| VotedPos { pos, count })
        .sorted_by(|a, b| b.count.cmp(&a.count).then(a.pos.cmp(&b.pos)))
        .collect()
}

/// Write the votes file: one `ci <idx> <side>` block per supported CI followed
/// by its `pos count` lines in descending vote order
pub fn write_votes_file(votes: &BreakpointVotes, ci_store: &CiStore, filename: &str) {
    let file = unwrap!(
        File::create(filename),
        "Unable to create votes file: '{}'",
        filename,
    );
    let mut writer = BufWriter::new(file);

    for (&ci_index, histogram) in votes.iter() {
        let list = sorted_votes(histogram);
        if list.is_empty() {
            continue;
        }
        let side = ci_store.get(ci_index).side.code();
        writeln!(writer, "ci {ci_index} {side}").unwrap();
        for voted in list {
            writeln!(writer, "{} {}", voted.pos, voted.count).unwrap();
        }
    }
    writer.flush().unwrap();
}

/// A refined breakpoint pair ready for VCF output
#[derive(Debug)]
pub struct RefinedCall {
    pub sv_id: String,
    pub chrom: String,
    pub sv_type: SvType,
    pub left: VotedPos,
    pub right: VotedPos,
    pub copy: Option<VotedPos>,
}

/// Reduce per-CI vote histograms to one refined call per supported SV
///
/// SVs are visited in input VCF order so the output order is stable. A call is
/// emitted when both breakpoints collected votes and at least one side reaches
/// `min_support`.
///
pub fn get_refined_calls(
    votes: &BreakpointVotes,
    sv_store: &SvStore,
    ci_store: &CiStore,
    min_support: usize,
) -> Vec<RefinedCall> {
    let top_vote = |ci_index: Option<usize>| -> Option<VotedPos> {
        let histogram = votes.get(&ci_index?)?;
        sorted_votes(histogram).first().copied()
    };

    let mut calls = Vec::new();
    for sv in sv_store.iter() {
        let left = match top_vote(ci_store.left_ci(&sv.id)) {
            Some(x) => x,
            None => continue,
        };
        let right = match top_vote(ci_store.right_ci(&sv.id)) {
            Some(x) => x,
            None => continue,
        };
        if left.count < min_support && right.count < min_support {
            continue;
        }
        // A crossed breakpoint pair cannot describe a DEL/INV/DUP interval
        if left.pos > right.pos && sv.sv_type != SvType::Ins {
            continue;
        }
        calls.push(RefinedCall {
            sv_id: sv.id.clone(),
            chrom: sv.chrom.clone(),
            sv_type: sv.sv_type,
            left,
            right,
            copy: top_vote(ci_store.copy_ci(&sv.id)),
        });
    }
    info!(
        "{} of {} SVs have refined breakpoints with sufficient support",
        calls.len(),
        sv_store.len()
    );
    calls
}

/// Copy the `##` meta lines of the input VCF, which the refined output re-emits
fn read_input_vcf_meta_lines(vcf_filename: &str) -> Vec<String> {
    let file = match File::open(vcf_filename) {
        Ok(x) => x,
        Err(_) => return Vec::new(),
    };
    let mut reader = BufReader::new(file);

    // A bgzip-compressed input cannot be copied textually; the refined file
    // then starts from its own meta lines only
    let magic = match reader.fill_buf() {
        Ok(buf) => buf.to_vec(),
        Err(_) => return Vec::new(),
    };
    if magic.starts_with(&[0x1f, 0x8b]) {
        warn!("Input VCF is compressed, refined output will not repeat its meta headers");
        return Vec::new();
    }

    reader
        .lines()
        .map_while(Result::ok)
        .take_while(|line| line.starts_with("##"))
        .collect()
}

fn get_ref_base(genome_ref: &GenomeRef, chrom: &str, pos: i64) -> char {
    if pos < 1 {
        return '.';
    }
    match genome_ref.slice(chrom, (pos - 1) as usize, pos as usize) {
        Some([base]) => *base as char,
        _ => '.',
    }
}

/// Write the refined VCF: input meta headers, the split-read support INFO
/// declarations, and one record per refined call in input order
pub fn write_refined_vcf(
    calls: &[RefinedCall],
    input_vcf_filename: &str,
    output_filename: &str,
    genome_ref: &GenomeRef,
) {
    info!("Writing refined calls to '{output_filename}'");

    let file = unwrap!(
        File::create(output_filename),
        "Unable to create refined VCF file: '{}'",
        output_filename,
    );
    let mut writer = BufWriter::new(file);

    for line in read_input_vcf_meta_lines(input_vcf_filename) {
        writeln!(writer, "{line}").unwrap();
    }
    writeln!(
        writer,
        "##INFO=<ID=SRSUPL,Number=1,Type=Integer,Description=\"Number of supporting split reads on left breakpoint\">"
    )
    .unwrap();
    writeln!(
        writer,
        "##INFO=<ID=SRSUPR,Number=1,Type=Integer,Description=\"Number of supporting split reads on right breakpoint\">"
    )
    .unwrap();
    if calls.iter().any(|x| x.copy.is_some()) {
        writeln!(
            writer,
            "##INFO=<ID=POS2,Number=1,Type=Integer,Description=\"Refined copy locus position\">"
        )
        .unwrap();
        writeln!(
            writer,
            "##INFO=<ID=SRSUPCPY,Number=1,Type=Integer,Description=\"Number of supporting split reads on copy locus\">"
        )
        .unwrap();
    }
    writeln!(writer, "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO").unwrap();

    for call in calls {
        let ref_base = get_ref_base(genome_ref, &call.chrom, call.left.pos);
        let sv_len = call.right.pos - call.left.pos;
        let mut record_info = format!(
            "SVTYPE={};END={};SVLEN={}",
            call.sv_type, call.right.pos, sv_len
        );
        if let Some(copy) = &call.copy {
            record_info.push_str(&format!(";POS2={}", copy.pos));
        }
        record_info.push_str(&format!(
            ";SRSUPL={};SRSUPR={}",
            call.left.count, call.right.count
        ));
        if let Some(copy) = &call.copy {
            record_info.push_str(&format!(";SRSUPCPY={}", copy.count));
        }

        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t<{}>\t255\tPASS\t{}",
            call.chrom, call.left.pos, call.sv_id, ref_base, call.sv_type, record_info
        )
        .unwrap();
    }
    writer.flush().unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bam_utils::push_int_aux_tag;
    use crate::sv_store::{BreakpointCi, StructuralVariant};
    use rust_htslib::bam::{header, Header, HeaderView};

    fn test_stores() -> (SvStore, CiStore) {
        let mut sv_store = SvStore::default();
        sv_store.add(StructuralVariant {
            id: "sv1".to_string(),
            chrom: "chr1".to_string(),
            start: 1000,
            end: 2000,
            sv_type: SvType::Del,
            copy_pos: None,
        });
        let mut ci_store = CiStore::default();
        ci_store.add(
            "chr1",
            BreakpointCi {
                head: 900,
                tail: 1200,
                sv_id: "sv1".to_string(),
                side: CiSide::Left,
            },
        );
        ci_store.add(
            "chr1",
            BreakpointCi {
                head: 1900,
                tail: 2200,
                sv_id: "sv1".to_string(),
                side: CiSide::Right,
            },
        );
        (sv_store, ci_store)
    }

    fn write_tagged_bam(dir: &std::path::Path, tags: &[(usize, &[u8], i64)]) -> String {
        let bam_path = dir.join("withbp.bam").display().to_string();
        let mut bam_header = Header::new();
        bam_header.push_record(
            header::HeaderRecord::new(b"SQ")
                .push_tag(b"SN", "chr1")
                .push_tag(b"LN", 10000000),
        );
        let header_view = HeaderView::from_header(&bam_header);
        let mut writer = bam::Writer::from_path(&bam_path, &bam_header, bam::Format::Bam).unwrap();
        for (i, (ci_index, bp_tag, pos)) in tags.iter().enumerate() {
            let seq = "A".repeat(100);
            let qual = "D".repeat(100);
            let sam_line =
                format!("read{i}\t97\tchr1\t1000\t60\t80M20S\t=\t1300\t0\t{seq}\t{qual}");
            let mut record = bam::Record::from_sam(&header_view, sam_line.as_bytes()).unwrap();
            push_int_aux_tag(&mut record, SV_AUX_TAG, *ci_index as i64);
            push_int_aux_tag(&mut record, bp_tag, *pos);
            writer.write(&record).unwrap();
        }
        bam_path
    }

    #[test]
    fn test_vote_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ci_store) = test_stores();

        // Three left-side votes: two at 1007, one at 1008
        let bam_filename = write_tagged_bam(
            dir.path(),
            &[
                (0, LBP_AUX_TAG, 1007),
                (0, LBP_AUX_TAG, 1007),
                (0, LBP_AUX_TAG, 1008),
            ],
        );

        let votes = collect_breakpoint_votes(&bam_filename, &ci_store, false);
        assert_eq!(votes.len(), 1);
        assert_eq!(
            sorted_votes(&votes[&0]),
            vec![
                VotedPos {
                    pos: 1007,
                    count: 2
                },
                VotedPos {
                    pos: 1008,
                    count: 1
                },
            ]
        );

        // The soft-clip cigars carry no deletion op, so requiring a valid
        // split rejects every vote
        let gated = collect_breakpoint_votes(&bam_filename, &ci_store, true);
        assert!(gated.is_empty() || gated.values().all(|h| h.is_empty()));
    }

    #[test]
    fn test_votes_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ci_store) = test_stores();

        let mut votes = BreakpointVotes::new();
        votes
            .entry(0)
            .or_default()
            .extend([(1007i64, 2usize), (1008, 1)]);
        votes.entry(1).or_default().extend([(1997i64, 6usize)]);

        let votes_filename = dir.path().join("votes.txt").display().to_string();
        write_votes_file(&votes, &ci_store, &votes_filename);

        let content = std::fs::read_to_string(&votes_filename).unwrap();
        assert_eq!(content, "ci 0 1\n1007 2\n1008 1\nci 1 2\n1997 6\n");
    }

    #[test]
    fn test_refined_calls_support_threshold() {
        let (sv_store, ci_store) = test_stores();

        let mut votes = BreakpointVotes::new();
        votes
            .entry(0)
            .or_default()
            .extend([(1007i64, 2usize), (1008, 1)]);
        votes.entry(1).or_default().extend([(1997i64, 6usize)]);

        // Default support floor: right side reaches it
        let calls = get_refined_calls(&votes, &sv_store, &ci_store, 5);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].left, VotedPos { pos: 1007, count: 2 });
        assert_eq!(
            calls[0].right,
            VotedPos {
                pos: 1997,
                count: 6
            }
        );

        // Neither side reaches a higher floor
        let calls = get_refined_calls(&votes, &sv_store, &ci_store, 10);
        assert!(calls.is_empty());

        // One side without any votes suppresses the call entirely
        votes.remove(&1);
        let calls = get_refined_calls(&votes, &sv_store, &ci_store, 1);
        assert!(calls.is_empty());
    }

    #[test]
    fn test_write_refined_vcf() {
        let dir = tempfile::tempdir().unwrap();

        let input_vcf = dir.path().join("input.vcf").display().to_string();
        std::fs::write(
            &input_vcf,
            "##fileformat=VCFv4.2\n##contig=<ID=chr1,length=10000>\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\nchr1\t1000\tsv1\tN\t<DEL>\t255\tPASS\tSVTYPE=DEL;END=2000\n",
        )
        .unwrap();

        let mut genome_ref = GenomeRef::default();
        genome_ref
            .chroms
            .insert("chr1".to_string(), b"ACGT".repeat(1000));

        let calls = vec![RefinedCall {
            sv_id: "sv1".to_string(),
            chrom: "chr1".to_string(),
            sv_type: SvType::Del,
            left: VotedPos {
                pos: 1007,
                count: 7
            },
            right: VotedPos {
                pos: 1997,
                count: 6
            },
            copy: None,
        }];

        let output = dir.path().join("refined.vcf").display().to_string();
        write_refined_vcf(&calls, &input_vcf, &output, &genome_ref);

        let content = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines[0], "##fileformat=VCFv4.2");
        assert!(lines.iter().any(|l| l.starts_with("##INFO=<ID=SRSUPL")));
        assert!(lines.iter().any(|l| l.starts_with("#CHROM")));

        // chr1 position 1007 is a 'G' (ACGT repeating, 1-based)
        let record = lines.last().unwrap();
        assert_eq!(
            *record,
            "chr1\t1007\tsv1\tG\t<DEL>\t255\tPASS\tSVTYPE=DEL;END=1997;SVLEN=990;SRSUPL=7;SRSUPR=6"
        );
    }
}

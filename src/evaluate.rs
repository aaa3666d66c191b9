//! Comparison of refined calls against a truth set at a tolerance margin.

use std::fs::File;
use std::io::{BufRead, BufReader};

use log::{info, warn};
use unwrap::unwrap;

use crate::sv_store::SvType;
use crate::vcf_input::read_sv_candidates;

/// One truth interval, filtered to the run's SV class
#[derive(Clone, Debug)]
pub struct TruthSv {
    pub chrom: String,
    pub start: i64,
    pub end: i64,
    pub copy_pos: Option<i64>,
}

/// One refined call parsed back from the output VCF
#[derive(Clone, Debug)]
pub struct ResultSv {
    pub id: String,
    pub chrom: String,
    pub start: i64,
    pub end: i64,
    pub copy_pos: Option<i64>,
}

/// Breakpoint accuracy counters
#[derive(Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct EvalCounts {
    pub tp_left: usize,
    pub tp_right: usize,
    pub tp_copy: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

/// Read a truth set from a BED-like file:
/// `chrom start end <any> <any> type [copy_pos]`
///
/// Rows of other SV classes are dropped; a parseable trailing integer column
/// provides the copy-locus truth position for interspersed duplications.
///
pub fn read_truth_bed(filename: &str, sv_type: SvType, max_del_size: Option<i64>) -> Vec<TruthSv> {
    let file = unwrap!(
        File::open(filename),
        "Unable to open truth file: '{}'",
        filename,
    );

    let mut truth = Vec::new();
    let mut malformed = 0usize;
    for line in BufReader::new(file).lines() {
        let line = unwrap!(line, "Failed to read truth file '{}'", filename);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() < 6 {
            malformed += 1;
            continue;
        }
        let (start, end) = match (words[1].parse::<i64>(), words[2].parse::<i64>()) {
            (Ok(s), Ok(e)) => (s, e),
            _ => {
                malformed += 1;
                continue;
            }
        };
        let row_type = match words[5].parse::<SvType>() {
            Ok(x) => x,
            Err(_) => continue,
        };
        if row_type != sv_type {
            continue;
        }
        if sv_type == SvType::Del {
            if let Some(max_size) = max_del_size {
                if end - start > max_size {
                    continue;
                }
            }
        }
        let copy_pos = words.get(6).and_then(|w| w.parse::<i64>().ok());
        truth.push(TruthSv {
            chrom: words[0].to_string(),
            start,
            end,
            copy_pos,
        });
    }

    if malformed > 0 {
        warn!("Skipped {malformed} malformed truth rows");
    }
    truth
}

/// Read a truth set from a VCF through the regular candidate ingestion path
pub fn read_truth_vcf(filename: &str, sv_type: SvType, max_del_size: Option<i64>) -> Vec<TruthSv> {
    let (sv_store, _) = read_sv_candidates(filename, sv_type, max_del_size, 0);
    sv_store
        .iter()
        .map(|sv| TruthSv {
            chrom: sv.chrom.clone(),
            start: sv.start,
            end: sv.end,
            copy_pos: sv.copy_pos,
        })
        .collect()
}

fn get_info_field(info: &str, key: &str) -> Option<i64> {
    info.split(';').find_map(|field| {
        let (k, v) = field.split_once('=')?;
        if k == key {
            v.parse::<i64>().ok()
        } else {
            None
        }
    })
}

/// Parse the refined VCF back into comparable result rows
pub fn read_refined_results(filename: &str) -> Vec<ResultSv> {
    let file = unwrap!(
        File::open(filename),
        "Unable to open refined VCF file: '{}'",
        filename,
    );

    let mut results = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = unwrap!(line, "Failed to read refined VCF '{}'", filename);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let words: Vec<&str> = line.split('\t').collect();
        if words.len() < 8 {
            continue;
        }
        let start = match words[1].parse::<i64>() {
            Ok(x) => x,
            Err(_) => continue,
        };
        let end = match get_info_field(words[7], "END") {
            Some(x) => x,
            None => continue,
        };
        results.push(ResultSv {
            id: words[2].to_string(),
            chrom: words[0].to_string(),
            start,
            end,
            copy_pos: get_info_field(words[7], "POS2"),
        });
    }
    results
}

/// Collapse consecutive result rows sharing a start or end coordinate, which
/// arise when both CIs of one SV vote through to the same refined pair
pub fn collapse_redundant_results(results: &mut Vec<ResultSv>) {
    results.dedup_by(|a, b| {
        a.chrom == b.chrom && (a.start == b.start || a.end == b.end)
    });
}

fn sort_key(chrom: &str, pos: i64) -> (String, i64) {
    (chrom.to_string(), pos)
}

/// Merge-scan two (chrom, pos)-sorted coordinate lists, counting pairs within
/// `margin` of each other; optionally tracks unmatched counts on both sides
fn count_matches_within_margin(
    result_pos: &[(String, i64)],
    truth_pos: &[(String, i64)],
    margin: i64,
    mut unmatched: Option<(&mut usize, &mut usize)>,
) -> usize {
    let mut matches = 0;
    let mut i = 0;
    let mut j = 0;
    while i < result_pos.len() && j < truth_pos.len() {
        let res = &result_pos[i];
        let tru = &truth_pos[j];

        if res.0 == tru.0 && (res.1 - tru.1).abs() <= margin {
            matches += 1;
            i += 1;
            j += 1;
        } else if res < tru {
            // Result behind every remaining truth entry: unmatched call
            if let Some((fp, _)) = unmatched.as_mut() {
                **fp += 1;
            }
            i += 1;
        } else {
            // Truth behind every remaining result entry: missed event
            if let Some((_, fn_count)) = unmatched.as_mut() {
                **fn_count += 1;
            }
            j += 1;
        }
    }
    if let Some((fp, fn_count)) = unmatched.as_mut() {
        **fp += result_pos.len() - i;
        **fn_count += truth_pos.len() - j;
    }
    matches
}

/// Compare refined calls against the truth set
///
/// Left breakpoints drive the false positive/negative counters; right and copy
/// breakpoints contribute their own true positive counts.
///
pub fn evaluate_results(results: &[ResultSv], truth: &[TruthSv], margin: i64) -> EvalCounts {
    let mut counts = EvalCounts::default();

    let mut results = results.to_vec();
    results.sort_by_key(|x| sort_key(&x.chrom, x.start));
    collapse_redundant_results(&mut results);

    let mut truth = truth.to_vec();
    truth.sort_by_key(|x| sort_key(&x.chrom, x.start));

    let result_starts: Vec<_> = results.iter().map(|x| sort_key(&x.chrom, x.start)).collect();
    let truth_starts: Vec<_> = truth.iter().map(|x| sort_key(&x.chrom, x.start)).collect();
    counts.tp_left = count_matches_within_margin(
        &result_starts,
        &truth_starts,
        margin,
        Some((&mut counts.false_positives, &mut counts.false_negatives)),
    );

    let mut result_ends: Vec<_> = results.iter().map(|x| sort_key(&x.chrom, x.end)).collect();
    let mut truth_ends: Vec<_> = truth.iter().map(|x| sort_key(&x.chrom, x.end)).collect();
    result_ends.sort();
    truth_ends.sort();
    counts.tp_right = count_matches_within_margin(&result_ends, &truth_ends, margin, None);

    let mut result_copies: Vec<_> = results
        .iter()
        .filter_map(|x| x.copy_pos.map(|p| sort_key(&x.chrom, p)))
        .collect();
    let mut truth_copies: Vec<_> = truth
        .iter()
        .filter_map(|x| x.copy_pos.map(|p| sort_key(&x.chrom, p)))
        .collect();
    if !result_copies.is_empty() && !truth_copies.is_empty() {
        result_copies.sort();
        truth_copies.sort();
        counts.tp_copy = count_matches_within_margin(&result_copies, &truth_copies, margin, None);
    }

    info!(
        "Evaluation at margin {margin}: {} left and {} right breakpoints matched, {} FP, {} FN",
        counts.tp_left, counts.tp_right, counts.false_positives, counts.false_negatives
    );
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, chrom: &str, start: i64, end: i64) -> ResultSv {
        ResultSv {
            id: id.to_string(),
            chrom: chrom.to_string(),
            start,
            end,
            copy_pos: None,
        }
    }

    fn truth(chrom: &str, start: i64, end: i64) -> TruthSv {
        TruthSv {
            chrom: chrom.to_string(),
            start,
            end,
            copy_pos: None,
        }
    }

    #[test]
    fn test_single_match_within_margin() {
        let results = vec![result("sv1", "1", 1003, 1997)];
        let truth_set = vec![truth("1", 1000, 2000)];

        let counts = evaluate_results(&results, &truth_set, 5);
        assert_eq!(
            counts,
            EvalCounts {
                tp_left: 1,
                tp_right: 1,
                tp_copy: 0,
                false_positives: 0,
                false_negatives: 0,
            }
        );
    }

    #[test]
    fn test_match_outside_margin() {
        let results = vec![result("sv1", "1", 1010, 2020)];
        let truth_set = vec![truth("1", 1000, 2000)];

        let counts = evaluate_results(&results, &truth_set, 5);
        assert_eq!(counts.tp_left, 0);
        assert_eq!(counts.tp_right, 0);
        assert_eq!(counts.false_positives, 1);
        assert_eq!(counts.false_negatives, 1);
    }

    #[test]
    fn test_unmatched_counters() {
        let results = vec![
            result("sv1", "1", 1000, 2000),
            result("sv2", "1", 50000, 60000),
        ];
        let truth_set = vec![truth("1", 1002, 2001), truth("1", 90000, 95000)];

        let counts = evaluate_results(&results, &truth_set, 5);
        assert_eq!(counts.tp_left, 1);
        assert_eq!(counts.false_positives, 1);
        assert_eq!(counts.false_negatives, 1);
    }

    #[test]
    fn test_chromosome_mismatch_not_matched() {
        let results = vec![result("sv1", "1", 1000, 2000)];
        let truth_set = vec![truth("2", 1000, 2000)];

        let counts = evaluate_results(&results, &truth_set, 5);
        assert_eq!(counts.tp_left, 0);
        assert_eq!(counts.false_positives, 1);
        assert_eq!(counts.false_negatives, 1);
    }

    #[test]
    fn test_redundant_results_collapsed() {
        // Both CIs of the same SV produced a result row with an identical
        // start; the pair counts once
        let results = vec![
            result("sv1a", "1", 1000, 2000),
            result("sv1b", "1", 1000, 2003),
        ];
        let truth_set = vec![truth("1", 1000, 2000)];

        let counts = evaluate_results(&results, &truth_set, 5);
        assert_eq!(counts.tp_left, 1);
        assert_eq!(counts.false_positives, 0);
    }

    #[test]
    fn test_copy_position_matching() {
        let mut results = vec![result("dup1", "1", 1000, 2000)];
        results[0].copy_pos = Some(5002);
        let mut truth_set = vec![truth("1", 1000, 2000)];
        truth_set[0].copy_pos = Some(5000);

        let counts = evaluate_results(&results, &truth_set, 5);
        assert_eq!(counts.tp_copy, 1);
    }

    #[test]
    fn test_read_truth_bed() {
        let dir = tempfile::tempdir().unwrap();
        let bed_path = dir.path().join("truth.bed").display().to_string();
        std::fs::write(
            &bed_path,
            "chr1\t1000\t2000\tx\ty\tdel\n\
             chr1\t3000\t4000\tx\ty\tinv\n\
             chr1\t5000\t90000\tx\ty\tdel\n\
             chr2\t100\t200\tx\ty\tDUP:ISP\t7000\n\
             malformed row\n",
        )
        .unwrap();

        let dels = read_truth_bed(&bed_path, SvType::Del, Some(10000));
        assert_eq!(dels.len(), 1);
        assert_eq!((dels[0].start, dels[0].end), (1000, 2000));

        let dups = read_truth_bed(&bed_path, SvType::DupIsp, None);
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].copy_pos, Some(7000));
    }

    #[test]
    fn test_read_refined_results_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let vcf_path = dir.path().join("refined.vcf").display().to_string();
        std::fs::write(
            &vcf_path,
            "##fileformat=VCFv4.2\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n\
             chr1\t1007\tsv1\tG\t<DEL>\t255\tPASS\tSVTYPE=DEL;END=1997;SVLEN=990;SRSUPL=7;SRSUPR=6\n",
        )
        .unwrap();

        let results = read_refined_results(&vcf_path);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "sv1");
        assert_eq!((results[0].start, results[0].end), (1007, 1997));
        assert_eq!(results[0].copy_pos, None);
    }
}

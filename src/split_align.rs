//! Two-window affine-gap split alignment.
//!
//! A read suspected of spanning an SV breakpoint is aligned against two
//! reference windows at once: `ref_left` around the left breakpoint and
//! `ref_right` around the right one. Each window gets an independent Gotoh DP
//! (reference-local, read-global), and the read is cut at the split point
//! maximizing the combined score. For deletions the right window is reversed
//! first so its inner breakpoint sits at index 0 of the DP grid.

use std::sync::Mutex;

use crossbeam_channel::bounded;
use log::info;
use rust_htslib::bam::{
    self,
    record::{Cigar, CigarString},
    Read,
};
use unwrap::unwrap;

use crate::bam_utils::{
    get_optional_int_aux_tag, push_int_aux_tag, LBP_AUX_TAG, RBP_AUX_TAG, SV_AUX_TAG,
};
use crate::genome_ref::GenomeRef;
use crate::sv_store::{BreakpointCi, CiSide, CiStore, SvStore, SvType};

pub const MATCH_SCORE: i64 = 5;
pub const MISMATCH_SCORE: i64 = -4;
pub const GAP_OPEN_SCORE: i64 = -16;
pub const GAP_EXTEND_SCORE: i64 = -1;

/// Identity floor for accepting one side of a split alignment
pub const MIN_SPLIT_IDENTITY: f64 = 0.95;

const WORKER_QUEUE_CAPACITY: usize = 2000;

/// Base-order reversal without complementing; the DP grids work on reversed
/// sequences directly
fn reverse(seq: &[u8]) -> Vec<u8> {
    seq.iter().rev().copied().collect()
}

/// Result of one two-window split alignment
///
/// The three string triples render the alignment per side: reference line,
/// read line, and a marker line with `|` (match), space (mismatch or gap) and
/// `S` (soft-clipped read overhang). `lbp`/`rbp` are 0-based offsets of the
/// breakpoint-adjacent bases within their windows; `pos` is the 0-based start
/// of the left alignment within `ref_left`.
///
#[derive(Debug)]
pub struct SplitAlignment {
    pub ref_line_left: String,
    pub read_line_left: String,
    pub markers_left: String,
    pub ref_line_right: String,
    pub read_line_right: String,
    pub markers_right: String,
    pub identity_left: f64,
    pub identity_right: f64,
    pub lbp: i64,
    pub rbp: i64,
    pub pos: i64,
}

impl SplitAlignment {
    /// Both sides identical enough, or one side empty and the other identical
    /// enough
    pub fn is_accepted(&self) -> bool {
        let left_ok = self.identity_left >= MIN_SPLIT_IDENTITY;
        let right_ok = self.identity_right >= MIN_SPLIT_IDENTITY;
        (left_ok && right_ok)
            || (self.identity_left == -1.0 && right_ok)
            || (left_ok && self.identity_right == -1.0)
    }
}

/// One window's DP state: Gotoh score table with two affine-gap companions,
/// plus the per-read-column argmax over reference rows
struct DpTables {
    score: Vec<Vec<i64>>,
    gap_a: Vec<Vec<i64>>,
    gap_b: Vec<Vec<i64>>,
    /// best[j]: reference row with the highest score for read prefix length j
    best: Vec<usize>,
}

/// Fill the DP for one window: reference-local (free start anywhere in the
/// window), read-global (the read prefix must be consumed from its start)
fn fill_dp_tables(ref_seq: &[u8], read: &[u8]) -> DpTables {
    let rows = ref_seq.len() + 1;
    let cols = read.len() + 1;

    let mut score = vec![vec![0i64; cols]; rows];
    let mut gap_a = vec![vec![0i64; cols]; rows];
    let mut gap_b = vec![vec![0i64; cols]; rows];
    let mut best = vec![0usize; cols];

    for i in 1..rows {
        let val = GAP_OPEN_SCORE + (i as i64 - 1) * GAP_EXTEND_SCORE;
        gap_a[i][0] = val;
        gap_b[i][0] = val;
    }
    for j in 1..cols {
        let val = GAP_OPEN_SCORE + (j as i64 - 1) * GAP_EXTEND_SCORE;
        score[0][j] = val;
        gap_a[0][j] = val;
        gap_b[0][j] = val;
        best[j] = if rows > 1 { 1 } else { 0 };
    }

    for i in 1..rows {
        for j in 1..cols {
            gap_a[i][j] =
                std::cmp::max(gap_a[i - 1][j], score[i - 1][j] + GAP_OPEN_SCORE) + GAP_EXTEND_SCORE;
            gap_b[i][j] =
                std::cmp::max(gap_b[i][j - 1], score[i][j - 1] + GAP_OPEN_SCORE) + GAP_EXTEND_SCORE;

            let sub = if ref_seq[i - 1] == read[j - 1] {
                MATCH_SCORE
            } else {
                MISMATCH_SCORE
            };
            let diag = std::cmp::max(
                score[i - 1][j - 1],
                std::cmp::max(gap_a[i - 1][j - 1], gap_b[i - 1][j - 1]),
            );
            score[i][j] = diag + sub;

            if score[i][j] > score[best[j]][j] {
                best[j] = i;
            }
        }
    }

    DpTables {
        score,
        gap_a,
        gap_b,
        best,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum TraceState {
    Diagonal,
    GapA,
    GapB,
}

struct Traceback {
    ref_line: Vec<u8>,
    read_line: Vec<u8>,
    markers: Vec<u8>,
    /// Reference row where the alignment starts (0-based window offset)
    start_row: usize,
    mismatches: i64,
    indels: i64,
}

/// Walk the three DP states from `(end_row, end_col)` back to the window edge,
/// emitting alignment strings in reverse order
fn trace_alignment(ref_seq: &[u8], read: &[u8], tables: &DpTables, end_row: usize) -> Traceback {
    let mut out = Traceback {
        ref_line: Vec::new(),
        read_line: Vec::new(),
        markers: Vec::new(),
        start_row: 0,
        mismatches: 0,
        indels: 0,
    };

    let mut state = TraceState::Diagonal;
    let mut pi = end_row;
    let mut pj = read.len();

    while pi > 0 && pj > 0 {
        match state {
            TraceState::Diagonal => {
                let sub = if ref_seq[pi - 1] == read[pj - 1] {
                    out.markers.push(b'|');
                    MATCH_SCORE
                } else {
                    out.markers.push(b' ');
                    MISMATCH_SCORE
                };
                out.ref_line.push(ref_seq[pi - 1]);
                out.read_line.push(read[pj - 1]);

                if tables.gap_a[pi - 1][pj - 1] + sub == tables.score[pi][pj] {
                    out.indels += 1;
                    state = TraceState::GapA;
                } else if tables.gap_b[pi - 1][pj - 1] + sub == tables.score[pi][pj] {
                    out.indels += 1;
                    state = TraceState::GapB;
                }
                pi -= 1;
                pj -= 1;

                if sub < 0 {
                    out.mismatches += 1;
                }
            }
            TraceState::GapA => {
                // Reference base with no read partner
                out.ref_line.push(ref_seq[pi - 1]);
                out.read_line.push(b'-');
                out.markers.push(b' ');
                if tables.score[pi - 1][pj] + GAP_EXTEND_SCORE + GAP_OPEN_SCORE
                    == tables.gap_a[pi][pj]
                {
                    state = TraceState::Diagonal;
                }
                pi -= 1;
            }
            TraceState::GapB => {
                // Read base with no reference partner
                out.ref_line.push(b'-');
                out.read_line.push(read[pj - 1]);
                out.markers.push(b' ');
                if tables.score[pi][pj - 1] + GAP_EXTEND_SCORE + GAP_OPEN_SCORE
                    == tables.gap_b[pi][pj]
                {
                    state = TraceState::Diagonal;
                }
                pj -= 1;
            }
        }
    }

    // Read prefix extending past the alignable window becomes a soft clip
    while pj > 0 {
        out.ref_line.push(b'-');
        out.read_line.push(read[pj - 1]);
        out.markers.push(b'S');
        pj -= 1;
    }

    out.start_row = pi;
    out
}

/// Identity of one alignment side: the match fraction penalized by a
/// logarithmic term for the disparity between reference span and read span.
/// Undefined (-1) for an empty side.
fn get_side_identity(mismatches: i64, indels: i64, ref_span: i64, read_span: i64) -> f64 {
    if read_span == 0 {
        return -1.0;
    }
    let span_gap = 1.0 + (ref_span - read_span).abs() as f64;
    1.0 - ((mismatches + indels) as f64 + span_gap.ln()) / read_span as f64
}

/// Align a read against the two breakpoint windows and pick the best split
///
/// `sv_type` controls the right-window orientation: for deletions `ref_right`
/// is reversed so that its inner breakpoint maps to DP index 0, and the
/// reported `rbp` is mirrored back into window coordinates.
///
pub fn align_split_read(
    ref_left: &[u8],
    ref_right: &[u8],
    read: &[u8],
    sv_type: SvType,
) -> SplitAlignment {
    let n = read.len();
    let read_reversed = reverse(read);
    let ref_right_oriented = if sv_type == SvType::Del {
        reverse(ref_right)
    } else {
        ref_right.to_vec()
    };

    let left = fill_dp_tables(ref_left, read);
    let right = fill_dp_tables(&ref_right_oriented, &read_reversed);

    // Choose the split maximizing the summed best scores of the read prefix
    // against the left window and the read suffix against the right window
    let mut split = n;
    let mut max_score = left.score[left.best[n]][n];
    for s in (0..n).rev() {
        let candidate = left.score[left.best[s]][s] + right.score[right.best[n - s]][n - s];
        if candidate > max_score {
            max_score = candidate;
            split = s;
        }
    }

    let left_end_row = left.best[split];
    let right_end_row = right.best[n - split];

    let lbp = left_end_row as i64 - 1;
    let rbp = if sv_type == SvType::Del {
        ref_right.len() as i64 - right_end_row as i64 - 1
    } else {
        right_end_row as i64 - 1
    };

    let left_trace = trace_alignment(ref_left, &read[..split], &left, left_end_row);
    let right_trace = trace_alignment(
        &ref_right_oriented,
        &read_reversed[..n - split],
        &right,
        right_end_row,
    );

    let identity_left = get_side_identity(
        left_trace.mismatches,
        left_trace.indels,
        left_end_row as i64 - left_trace.start_row as i64,
        split as i64,
    );
    let identity_right = get_side_identity(
        right_trace.mismatches,
        right_trace.indels,
        right_end_row as i64 - right_trace.start_row as i64,
        (n - split) as i64,
    );

    // The left strings were built backward; the right strings were built
    // backward over reversed sequences, which leaves them in forward order
    SplitAlignment {
        ref_line_left: String::from_utf8(reverse(&left_trace.ref_line)).unwrap(),
        read_line_left: String::from_utf8(reverse(&left_trace.read_line)).unwrap(),
        markers_left: String::from_utf8(reverse(&left_trace.markers)).unwrap(),
        ref_line_right: String::from_utf8(right_trace.ref_line).unwrap(),
        read_line_right: String::from_utf8(right_trace.read_line).unwrap(),
        markers_right: String::from_utf8(right_trace.markers).unwrap(),
        identity_left,
        identity_right,
        lbp,
        rbp,
        pos: left_trace.start_row as i64,
    }
}

/// Rebuild a cigar from one side's alignment strings
///
/// Returns the cigar ops plus the read length they consume.
///
pub fn compute_cigar(ref_line: &str, read_line: &str, markers: &str) -> (Vec<Cigar>, usize) {
    #[derive(Clone, Copy, PartialEq)]
    enum Op {
        Match,
        Ins,
        Del,
        SoftClip,
    }

    let ref_line = ref_line.as_bytes();
    let read_line = read_line.as_bytes();
    let markers = markers.as_bytes();

    let mut cigar = Vec::new();
    let mut read_len = 0usize;
    let mut current: Option<(Op, u32)> = None;

    let flush = |current: &mut Option<(Op, u32)>, cigar: &mut Vec<Cigar>| {
        if let Some((op, len)) = current.take() {
            cigar.push(match op {
                Op::Match => Cigar::Match(len),
                Op::Ins => Cigar::Ins(len),
                Op::Del => Cigar::Del(len),
                Op::SoftClip => Cigar::SoftClip(len),
            });
        }
    };

    for i in 0..markers.len() {
        let op = if markers[i] == b'S' {
            Op::SoftClip
        } else if markers[i] == b'|' {
            Op::Match
        } else if ref_line[i] == b'-' {
            Op::Ins
        } else if read_line[i] == b'-' {
            Op::Del
        } else {
            // Mismatch renders as an alignment match op
            Op::Match
        };

        if op != Op::Del {
            read_len += 1;
        }
        match current {
            Some((cur_op, ref mut len)) if cur_op == op => *len += 1,
            _ => {
                flush(&mut current, &mut cigar);
                current = Some((op, 1));
            }
        }
    }
    flush(&mut current, &mut cigar);

    (cigar, read_len)
}

/// The pair of reference windows bracketing one SV
fn get_sv_windows<'a>(
    ci: &BreakpointCi,
    ci_store: &'a CiStore,
) -> (&'a BreakpointCi, &'a BreakpointCi) {
    let left_index = ci_store.left_ci(&ci.sv_id).unwrap();
    let right_index = ci_store.right_ci(&ci.sv_id).unwrap();
    (ci_store.get(left_index), ci_store.get(right_index))
}

/// Align one cluster record against its SV's window pair and rewrite it as a
/// precise split alignment
///
/// Returns None when the alignment fails the identity gate.
///
fn align_cluster_record(
    mut record: bam::Record,
    ci_store: &CiStore,
    sv_store: &SvStore,
    genome_ref: &GenomeRef,
) -> Option<bam::Record> {
    let ci_index = get_optional_int_aux_tag(&record, SV_AUX_TAG)? as usize;
    let ci = ci_store.try_get(ci_index)?;
    let sv = sv_store.get(&ci.sv_id)?;
    if ci.side == CiSide::Copy {
        return None;
    }

    let (left_ci, right_ci) = get_sv_windows(ci, ci_store);
    let ref_left = genome_ref.slice(&sv.chrom, (left_ci.head - 1) as usize, left_ci.tail as usize)?;
    let ref_right =
        genome_ref.slice(&sv.chrom, (right_ci.head - 1) as usize, right_ci.tail as usize)?;

    let read = record.seq().as_bytes();
    let result = align_split_read(ref_left, ref_right, &read, sv.sv_type);
    if !result.is_accepted() {
        return None;
    }

    let (mut cigar, _) = compute_cigar(
        &result.ref_line_left,
        &result.read_line_left,
        &result.markers_left,
    );
    let (cigar_right, _) = compute_cigar(
        &result.ref_line_right,
        &result.read_line_right,
        &result.markers_right,
    );

    let left_bp = left_ci.head + result.lbp;
    let right_bp = right_ci.head + result.rbp;
    let del_len = right_bp - left_bp - 1;
    if del_len > 0 {
        cigar.push(Cigar::Del(del_len as u32));
    }
    cigar.extend(cigar_right);

    // Rewrite the record as a proper pair anchored at the refined alignment
    let flags: u16 = if record.is_reverse() {
        0x1 | 0x2 | 0x10
    } else {
        0x1 | 0x2 | 0x20
    };

    let qname = record.qname().to_vec();
    let qual = record.qual().to_vec();
    record.set(&qname, Some(&CigarString(cigar)), &read, &qual);
    record.set_flags(flags);
    record.set_pos(left_ci.head - 1 + result.pos);

    // Re-assert the CI tag so downstream voting survives the record rewrite
    let _ = record.remove_aux(SV_AUX_TAG);
    push_int_aux_tag(&mut record, SV_AUX_TAG, ci_index as i64);
    push_int_aux_tag(&mut record, LBP_AUX_TAG, left_bp);
    push_int_aux_tag(&mut record, RBP_AUX_TAG, right_bp);
    Some(record)
}

/// Run every cluster record through the split aligner on a worker pool,
/// writing accepted alignments (with breakpoint tags) to `output_filename`
///
/// Returns (aligned, total) record counts.
///
pub fn align_clusters(
    cluster_filename: &str,
    output_filename: &str,
    ci_store: &CiStore,
    sv_store: &SvStore,
    genome_ref: &GenomeRef,
    thread_count: usize,
) -> (usize, usize) {
    assert!(thread_count > 0);
    info!("Aligning cluster reads from '{cluster_filename}' on {thread_count} threads");

    let mut reader = unwrap!(
        bam::Reader::from_path(cluster_filename),
        "Unable to open cluster BAM file: '{}'",
        cluster_filename,
    );
    let output_header = bam::Header::from_template(reader.header());
    let writer = unwrap!(
        bam::Writer::from_path(output_filename, &output_header, bam::Format::Bam),
        "Unable to create alignment BAM file: '{}'",
        output_filename,
    );
    let writer = Mutex::new(writer);
    let writer_ref = &writer;

    let aligned = std::sync::atomic::AtomicUsize::new(0);
    let aligned_ref = &aligned;

    let mut total = 0usize;
    std::thread::scope(|scope| {
        let mut senders = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            let (tx, rx) = bounded::<bam::Record>(WORKER_QUEUE_CAPACITY);
            senders.push(tx);
            scope.spawn(move || {
                while let Ok(record) = rx.recv() {
                    if let Some(aligned_record) =
                        align_cluster_record(record, ci_store, sv_store, genome_ref)
                    {
                        let mut writer = writer_ref.lock().unwrap();
                        unwrap!(
                            writer.write(&aligned_record),
                            "Failed to write aligned record"
                        );
                        aligned_ref.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            });
        }

        let mut record = bam::Record::new();
        while let Some(r) = reader.read(&mut record) {
            unwrap!(r, "Failed to parse cluster BAM record");
            let outgoing = std::mem::replace(&mut record, bam::Record::new());
            senders[total % thread_count].send(outgoing).unwrap();
            total += 1;
        }
        drop(senders);
    });

    let aligned = aligned.into_inner();
    info!("Split alignment mapped {aligned} of {total} cluster reads");
    (aligned, total)
}

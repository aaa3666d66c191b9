//! Optional per-cluster de novo assembly through the external velvet
//! assembler, and split alignment of the resulting contigs.
//!
//! Each CI group of the sorted cluster BAM is dumped to FASTQ and assembled
//! with `velveth`/`velvetg` (located via PATH). Contigs are gathered into a
//! single `ci`-delimited text file and fed through the same split aligner as
//! raw reads; accepted contigs are written as synthetic BAM records carrying
//! the usual CI and breakpoint tags.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::Command;

use log::{info, warn};
use rust_htslib::bam::{self, record::Cigar, record::CigarString, Read};
use unwrap::unwrap;

use crate::bam_utils::{
    get_optional_int_aux_tag, push_int_aux_tag, LBP_AUX_TAG, RBP_AUX_TAG, SV_AUX_TAG,
};
use crate::genome_ref::GenomeRef;
use crate::split_align::{align_split_read, compute_cigar};
use crate::sv_store::{CiSide, CiStore, SvStore};

const VELVET_HASH_LENGTH: &str = "60";
const VELVET_MIN_CONTIG_LENGTH: &str = "100";

/// Reverse complement of a decoded BAM record sequence
///
/// Record sequences arrive uppercased from the 4-bit BAM encoding; IUPAC
/// ambiguity codes are not worth complementing for assembly input and fold
/// to 'N'.
///
fn rev_comp_seq(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|base| match base {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            _ => b'N',
        })
        .collect()
}

/// Write one cluster's reads as FASTQ; reverse-strand alignments are restored
/// to their sequenced orientation
fn write_cluster_fastq<W: Write>(writer: &mut W, records: &[bam::Record]) {
    for record in records {
        let seq = if record.is_reverse() {
            rev_comp_seq(&record.seq().as_bytes())
        } else {
            record.seq().as_bytes()
        };
        let qual: Vec<u8> = record.qual().iter().map(|q| q + 33).collect();
        writeln!(writer, "@{}", String::from_utf8_lossy(record.qname())).unwrap();
        writer.write_all(&seq).unwrap();
        writeln!(writer).unwrap();
        writeln!(writer, "+").unwrap();
        writer.write_all(&qual).unwrap();
        writeln!(writer).unwrap();
    }
}

/// Assemble one FASTQ cluster with velvet, returning its contig sequences
///
/// A failed assembler invocation logs the cluster and yields no contigs.
///
fn assemble_cluster_fastq(fastq_filename: &str, velvet_dir: &str, ci_index: usize) -> Vec<String> {
    let _ = std::fs::remove_dir_all(velvet_dir);

    let velveth = Command::new("velveth")
        .args([
            velvet_dir,
            VELVET_HASH_LENGTH,
            "-fastq",
            "-short",
            fastq_filename,
            "-strand_specific",
        ])
        .status();
    let velvetg = velveth.and_then(|status| {
        if !status.success() {
            return Ok(status);
        }
        Command::new("velvetg")
            .args([
                velvet_dir,
                "-unused_reads",
                "yes",
                "-min_contig_lgth",
                VELVET_MIN_CONTIG_LENGTH,
                "-cov_cutoff",
                "1",
            ])
            .status()
    });

    match velvetg {
        Ok(status) if status.success() => {}
        Ok(status) => {
            warn!("velvet failed on cluster {ci_index} with status {status}, skipping");
            return Vec::new();
        }
        Err(error) => {
            warn!("velvet could not be launched for cluster {ci_index}: {error}");
            return Vec::new();
        }
    }

    let contigs_fa = format!("{velvet_dir}/contigs.fa");
    let file = match File::open(&contigs_fa) {
        Ok(x) => x,
        Err(_) => {
            warn!("velvet produced no contigs for cluster {ci_index}");
            return Vec::new();
        }
    };

    let mut contigs = Vec::new();
    let mut current = String::new();
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        if line.starts_with('>') {
            if !current.is_empty() {
                contigs.push(std::mem::take(&mut current));
            }
        } else {
            current.push_str(line.trim_end());
        }
    }
    if !current.is_empty() {
        contigs.push(current);
    }
    contigs
}

/// Assemble every CI group of the sorted cluster BAM into contigs
///
/// The contigs file holds one `ci <idx>` header line per assembled cluster
/// followed by one contig sequence per line.
///
pub fn assemble_clusters(cluster_filename: &str, workdir: &str, contigs_filename: &str) {
    info!("Assembling clusters from '{cluster_filename}'");

    let mut reader = unwrap!(
        bam::Reader::from_path(cluster_filename),
        "Unable to open cluster BAM file: '{}'",
        cluster_filename,
    );

    let fastq_filename = format!("{workdir}/cluster_reads.fastq");
    let velvet_dir = format!("{workdir}/velvet");
    let contigs_file = unwrap!(
        File::create(contigs_filename),
        "Unable to create contigs file: '{}'",
        contigs_filename,
    );
    let mut contigs_writer = BufWriter::new(contigs_file);

    let mut flush_cluster = |ci_index: usize, records: &mut Vec<bam::Record>| {
        if records.is_empty() {
            return;
        }
        {
            let fastq = File::create(&fastq_filename).unwrap();
            let mut fastq_writer = BufWriter::new(fastq);
            write_cluster_fastq(&mut fastq_writer, records);
        }
        let contigs = assemble_cluster_fastq(&fastq_filename, &velvet_dir, ci_index);
        if !contigs.is_empty() {
            writeln!(contigs_writer, "ci {ci_index}").unwrap();
            for contig in contigs {
                writeln!(contigs_writer, "{contig}").unwrap();
            }
        }
        records.clear();
    };

    let mut current_ci: Option<usize> = None;
    let mut cluster_records = Vec::new();
    let mut record = bam::Record::new();
    while let Some(r) = reader.read(&mut record) {
        unwrap!(r, "Failed to parse cluster BAM record");
        let ci_index = match get_optional_int_aux_tag(&record, SV_AUX_TAG) {
            Some(x) => x as usize,
            None => continue,
        };
        if current_ci != Some(ci_index) {
            if let Some(previous) = current_ci {
                flush_cluster(previous, &mut cluster_records);
            }
            current_ci = Some(ci_index);
        }
        cluster_records.push(record.clone());
    }
    if let Some(previous) = current_ci {
        flush_cluster(previous, &mut cluster_records);
    }
    contigs_writer.flush().unwrap();

    let _ = std::fs::remove_dir_all(&velvet_dir);
    let _ = std::fs::remove_file(&fastq_filename);
}

/// Parse a contigs file into `(ci_index, contig sequences)` groups
pub fn parse_contigs_file(contigs_filename: &str) -> Vec<(usize, Vec<String>)> {
    let file = unwrap!(
        File::open(contigs_filename),
        "Unable to open contigs file: '{}'",
        contigs_filename,
    );

    let mut groups: Vec<(usize, Vec<String>)> = Vec::new();
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("ci ") {
            if let Ok(ci_index) = rest.trim().parse::<usize>() {
                groups.push((ci_index, Vec::new()));
            }
        } else if line.starts_with('>') {
            continue;
        } else if let Some((_, contigs)) = groups.last_mut() {
            contigs.push(line);
        }
    }
    groups
}

/// Align assembled contigs against their SV windows and emit accepted contigs
/// as breakpoint-tagged records
///
/// Returns (aligned, total) contig counts.
///
pub fn align_contigs(
    contigs_filename: &str,
    cluster_filename: &str,
    output_filename: &str,
    ci_store: &CiStore,
    sv_store: &SvStore,
    genome_ref: &GenomeRef,
) -> (usize, usize) {
    info!("Aligning assembled contigs from '{contigs_filename}'");

    let reader = unwrap!(
        bam::Reader::from_path(cluster_filename),
        "Unable to open cluster BAM file: '{}'",
        cluster_filename,
    );
    let header_view = reader.header().clone();
    let output_header = bam::Header::from_template(reader.header());
    let mut writer = unwrap!(
        bam::Writer::from_path(output_filename, &output_header, bam::Format::Bam),
        "Unable to create contig alignment BAM file: '{}'",
        output_filename,
    );

    let mut aligned = 0usize;
    let mut total = 0usize;
    for (ci_index, contigs) in parse_contigs_file(contigs_filename) {
        let ci = match ci_store.try_get(ci_index) {
            Some(x) => x,
            None => continue,
        };
        let sv = match sv_store.get(&ci.sv_id) {
            Some(x) => x,
            None => continue,
        };
        if ci.side == CiSide::Copy {
            continue;
        }
        let left_ci = ci_store.get(ci_store.left_ci(&sv.id).unwrap());
        let right_ci = ci_store.get(ci_store.right_ci(&sv.id).unwrap());
        let ref_left = match genome_ref.slice(
            &sv.chrom,
            (left_ci.head - 1) as usize,
            left_ci.tail as usize,
        ) {
            Some(x) => x,
            None => continue,
        };
        let ref_right = match genome_ref.slice(
            &sv.chrom,
            (right_ci.head - 1) as usize,
            right_ci.tail as usize,
        ) {
            Some(x) => x,
            None => continue,
        };

        let tid = match header_view.tid(sv.chrom.as_bytes()) {
            Some(x) => x as i32,
            None => continue,
        };

        for contig in contigs {
            total += 1;
            let result = align_split_read(ref_left, ref_right, contig.as_bytes(), sv.sv_type);
            if !result.is_accepted() {
                continue;
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
            let sv_len = right_bp - left_bp - 1;
            if sv_len > 0 {
                cigar.push(Cigar::Del(sv_len as u32));
            }
            cigar.extend(cigar_right);

            let mut record = bam::Record::new();
            let qname = format!("contig_{aligned}");
            let qual = vec![34u8; contig.len()];
            record.set(
                qname.as_bytes(),
                Some(&CigarString(cigar)),
                contig.as_bytes(),
                &qual,
            );
            record.set_tid(tid);
            record.set_pos(left_ci.head - 1 + result.pos);
            record.set_mtid(-1);
            record.set_mpos(-1);
            push_int_aux_tag(&mut record, SV_AUX_TAG, ci_index as i64);
            push_int_aux_tag(&mut record, LBP_AUX_TAG, left_bp);
            push_int_aux_tag(&mut record, RBP_AUX_TAG, right_bp);
            unwrap!(writer.write(&record), "Failed to write contig alignment");
            aligned += 1;
        }
    }

    info!("Contig alignment mapped {aligned} of {total} contigs");
    (aligned, total)
}

//! Parallel scan of the whole-genome alignment file for signaling reads, and
//! the follow-on cluster BAM construction.
//!
//! One producer reads BAM records sequentially and round-robin dispatches them
//! onto per-worker bounded queues; workers classify each record, query the CI
//! index, and register signaling hits in a shared map. The cluster builder
//! then sweeps the BAM once more, writing every signaling record with an `SV`
//! aux tag per supported CI, ready for the external by-tag sort.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::sync::Mutex;

use crossbeam_channel::bounded;
use log::{debug, error, info};
use rust_htslib::bam::ext::BamRecordExtensions;
use rust_htslib::bam::{self, Read};
use unwrap::unwrap;

use crate::bam_utils::{
    get_mapping_ori, get_pair_number, has_bgzf_eof, is_hard_clipped, push_int_aux_tag,
    MappingOri, SV_AUX_TAG,
};
use crate::classify::{is_copy_locus_signaling, is_signaling};
use crate::insert_size::InsertStats;
use crate::sv_store::{CiSide, CiStore, SvType};

/// Per-worker record queue capacity; bounds scanner memory when workers lag
/// behind the producer
const WORKER_QUEUE_CAPACITY: usize = 2000;

/// One signaling observation: which CI a read supports, plus enough pairing
/// information to recognize the read again in a later sweep
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignalingEntry {
    pub ci_index: usize,
    pub pair_number: u8,
    pub mapping_ori: MappingOri,
}

pub type SignalingReadMap = HashMap<String, Vec<SignalingEntry>>;

fn open_checked_bam_reader(bam_filename: &str) -> bam::Reader {
    if !has_bgzf_eof(bam_filename) {
        error!("BGZF EOF marker absent, alignment file is truncated or not BAM: '{bam_filename}'");
        std::process::exit(exitcode::DATAERR);
    }
    unwrap!(
        bam::Reader::from_path(bam_filename),
        "Unable to open alignment file: '{}'",
        bam_filename,
    )
}

fn get_tid_chrom_names(header: &bam::HeaderView) -> Vec<String> {
    (0..header.target_count())
        .map(|tid| String::from_utf8_lossy(header.tid2name(tid)).to_string())
        .collect()
}

fn process_scan_record(
    record: &bam::Record,
    tid2chrom: &[String],
    ci_store: &CiStore,
    sv_type: SvType,
    insert_stats: &InsertStats,
    signaling_reads: &Mutex<SignalingReadMap>,
) {
    let signaling = is_signaling(record, sv_type, insert_stats);
    let copy_signaling = sv_type == SvType::DupIsp && is_copy_locus_signaling(record);
    if !signaling && !copy_signaling {
        return;
    }

    let tid = record.tid();
    if tid < 0 || tid as usize >= tid2chrom.len() {
        return;
    }
    let chrom = &tid2chrom[tid as usize];

    let start = record.pos() + 1;
    let end = record.reference_end();
    let intersecting = ci_store.find_intersecting(chrom, start, end);
    if intersecting.is_empty() {
        return;
    }

    let entry_template = SignalingEntry {
        ci_index: 0,
        pair_number: get_pair_number(record),
        mapping_ori: get_mapping_ori(record),
    };

    let mut map = signaling_reads.lock().unwrap();
    for ci_index in intersecting {
        let accepted = match ci_store.get(ci_index).side {
            CiSide::Copy => copy_signaling,
            _ => signaling,
        };
        if !accepted {
            continue;
        }
        let name = String::from_utf8_lossy(record.qname()).to_string();
        map.entry(name).or_default().push(SignalingEntry {
            ci_index,
            ..entry_template
        });
    }
}

/// Scan the BAM for reads whose geometry signals an SV of the run's class
///
/// Returns the read-name keyed signaling map consumed by the cluster builder.
///
pub fn scan_bam_for_signaling_reads(
    bam_filename: &str,
    ci_store: &CiStore,
    sv_type: SvType,
    insert_stats: &InsertStats,
    thread_count: usize,
) -> SignalingReadMap {
    assert!(thread_count > 0);
    info!("Scanning '{bam_filename}' for signaling reads on {thread_count} threads");

    let mut reader = open_checked_bam_reader(bam_filename);
    let tid2chrom = get_tid_chrom_names(reader.header());
    let tid2chrom = &tid2chrom;

    let signaling_reads = Mutex::new(SignalingReadMap::new());
    let signaling_reads_ref = &signaling_reads;

    std::thread::scope(|scope| {
        let mut senders = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            let (tx, rx) = bounded::<bam::Record>(WORKER_QUEUE_CAPACITY);
            senders.push(tx);
            scope.spawn(move || {
                while let Ok(record) = rx.recv() {
                    process_scan_record(
                        &record,
                        tid2chrom,
                        ci_store,
                        sv_type,
                        insert_stats,
                        signaling_reads_ref,
                    );
                }
            });
        }

        let mut record = bam::Record::new();
        let mut read_index = 0usize;
        while let Some(r) = reader.read(&mut record) {
            unwrap!(r, "Failed to parse alignment record");
            let outgoing = std::mem::replace(&mut record, bam::Record::new());
            senders[read_index % thread_count].send(outgoing).unwrap();
            read_index += 1;
            if read_index % 1_000_000 == 0 {
                debug!("Distributed {read_index} records to scan workers");
            }
        }
        // Dropping the senders closes the queues; the scope joins the workers
        drop(senders);
    });

    let signaling_reads = signaling_reads.into_inner().unwrap();
    info!(
        "Found {} reads signaling {} events",
        signaling_reads.len(),
        sv_type
    );
    signaling_reads
}

/// Write the signaling map in the legacy one-line-per-read text format:
/// `name idx pair ori …`
pub fn write_signaling_reads(signaling_reads: &SignalingReadMap, filename: &str) {
    let file = unwrap!(
        File::create(filename),
        "Unable to create signaling reads file: '{}'",
        filename,
    );
    let mut writer = BufWriter::new(file);
    for (name, entries) in signaling_reads.iter() {
        write!(writer, "{name}").unwrap();
        for entry in entries {
            write!(
                writer,
                " {} {} {}",
                entry.ci_index, entry.pair_number, entry.mapping_ori as i64
            )
            .unwrap();
        }
        writeln!(writer).unwrap();
    }
    writer.flush().unwrap();
}

/// Restore a signaling map written by `write_signaling_reads`
pub fn restore_signaling_reads(filename: &str) -> SignalingReadMap {
    let file = unwrap!(
        File::open(filename),
        "Unable to open signaling reads file: '{}'",
        filename,
    );

    let mut signaling_reads = SignalingReadMap::new();
    for line in BufReader::new(file).lines() {
        let line = unwrap!(line, "Failed to read signaling reads file '{}'", filename);
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let mut entries = Vec::new();
        for chunk in words[1..].chunks_exact(3) {
            let ci_index = chunk[0].parse::<usize>();
            let pair_number = chunk[1].parse::<u8>();
            let mapping_ori = chunk[2].parse::<i64>().ok().and_then(MappingOri::from_int);
            if let (Ok(ci_index), Ok(pair_number), Some(mapping_ori)) =
                (ci_index, pair_number, mapping_ori)
            {
                entries.push(SignalingEntry {
                    ci_index,
                    pair_number,
                    mapping_ori,
                });
            }
        }
        signaling_reads.insert(words[0].to_string(), entries);
    }
    signaling_reads
}

/// Orientation gate applied to deletion clusters: left breakpoints are voted
/// by forward reads whose clipped tail points into the deletion, right
/// breakpoints by reverse reads
fn passes_del_orientation_gate(side: CiSide, mapping_ori: MappingOri) -> bool {
    match side {
        CiSide::Left => mapping_ori != MappingOri::Reverse,
        CiSide::Right => mapping_ori != MappingOri::Forward,
        CiSide::Copy => true,
    }
}

/// Sweep the BAM again and emit every signaling record into the cluster BAM,
/// tagged with the index of each CI it supports
///
/// Hard-clipped records are excluded, their sequence is incomplete for the
/// downstream aligner. Returns the per-CI record counts.
///
pub fn build_cluster_bam(
    bam_filename: &str,
    signaling_reads: &SignalingReadMap,
    ci_store: &CiStore,
    sv_type: SvType,
    output_filename: &str,
) -> HashMap<usize, usize> {
    info!("Writing signaling clusters to '{output_filename}'");

    let mut reader = open_checked_bam_reader(bam_filename);
    let output_header = bam::Header::from_template(reader.header());
    let mut writer = unwrap!(
        bam::Writer::from_path(output_filename, &output_header, bam::Format::Bam),
        "Unable to create cluster BAM file: '{}'",
        output_filename,
    );

    let mut ci_record_counts: HashMap<usize, usize> = HashMap::new();
    let mut record = bam::Record::new();
    let mut read_index = 0usize;
    while let Some(r) = reader.read(&mut record) {
        unwrap!(r, "Failed to parse alignment record");
        read_index += 1;
        if read_index % 1_000_000 == 0 {
            debug!("Cluster builder at record {read_index}");
        }

        let entries = match signaling_reads.get(std::str::from_utf8(record.qname()).unwrap_or(""))
        {
            Some(x) => x,
            None => continue,
        };
        if is_hard_clipped(&record.cigar()) {
            continue;
        }

        let pair_number = get_pair_number(&record);
        for entry in entries {
            if entry.pair_number != pair_number {
                continue;
            }
            let ci = ci_store.get(entry.ci_index);
            if sv_type == SvType::Del && !passes_del_orientation_gate(ci.side, entry.mapping_ori)
            {
                continue;
            }

            push_int_aux_tag(&mut record, SV_AUX_TAG, entry.ci_index as i64);
            unwrap!(
                writer.write(&record),
                "Failed to write record to cluster BAM '{}'",
                output_filename,
            );
            record.remove_aux(SV_AUX_TAG).unwrap();

            *ci_record_counts.entry(entry.ci_index).or_insert(0) += 1;
        }
    }

    info!(
        "Cluster BAM holds reads for {} confidence intervals",
        ci_record_counts.len()
    );
    ci_record_counts
}

use log::{error, info};
use rust_htslib::bam::{self, Read};
use unwrap::unwrap;

/// Fragment-size distribution summary for the scanned library
///
/// `mean` is used as the segment size throughout the pipeline; `sd` feeds the
/// discordant insert-size threshold `mean + 3 * sd`.
///
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct InsertStats {
    pub mean: i64,
    pub sd: i64,
}

impl InsertStats {
    pub fn discordance_threshold(&self) -> i64 {
        self.mean + 3 * self.sd
    }
}

/// Maximum template length accepted as a normal proper-pair observation
pub const MAX_PROPER_TLEN: i64 = 1000;

/// Number of proper-pair observations used per estimation pass
pub const MAX_ESTIMATION_RECORDS: usize = 1_000_000;

fn is_estimation_record(record: &bam::Record, tlen_threshold: i64) -> bool {
    record.is_paired()
        && record.is_proper_pair()
        && record.insert_size() > 0
        && record.insert_size() < tlen_threshold
}

fn scan_tlen<F: FnMut(i64)>(
    bam_filename: &str,
    tlen_threshold: i64,
    max_records: usize,
    mut observe: F,
) -> usize {
    let mut reader = unwrap!(
        bam::Reader::from_path(bam_filename),
        "Unable to open alignment file: '{}'",
        bam_filename,
    );

    let mut count = 0;
    let mut record = bam::Record::new();
    while let Some(r) = reader.read(&mut record) {
        unwrap!(r, "Failed to parse alignment record");
        if !is_estimation_record(&record, tlen_threshold) {
            continue;
        }
        observe(record.insert_size());
        count += 1;
        if count >= max_records {
            break;
        }
    }
    count
}

/// Estimate mean and standard deviation of the proper-pair insert size
///
/// Two streaming passes over up to `max_records` observations with
/// `0 < TLEN < tlen_threshold`; the reader is reopened between passes.
///
pub fn estimate_insert_stats(
    bam_filename: &str,
    tlen_threshold: i64,
    max_records: usize,
) -> InsertStats {
    let mut sum = 0i64;
    let count = scan_tlen(bam_filename, tlen_threshold, max_records, |tlen| {
        sum += tlen;
    });
    if count == 0 {
        error!("No proper pairs found in '{bam_filename}', cannot estimate insert size");
        std::process::exit(exitcode::DATAERR);
    }
    let mean = sum / count as i64;

    let mut sq_sum = 0f64;
    scan_tlen(bam_filename, tlen_threshold, max_records, |tlen| {
        let dev = (tlen - mean) as f64;
        sq_sum += dev * dev;
    });
    let sd = (sq_sum / count as f64).sqrt() as i64;

    info!("Estimated insert size: mean {mean}, sd {sd} (from {count} proper pairs)");

    InsertStats { mean, sd }
}

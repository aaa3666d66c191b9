use log::{info, warn};
use rust_htslib::bcf::{self, Read};
use unwrap::unwrap;

use crate::sv_store::{widen_ci, BreakpointCi, CiSide, CiStore, StructuralVariant, SvStore, SvType};

fn get_info_int(record: &bcf::Record, key: &[u8]) -> Option<i64> {
    match record.info(key).integer() {
        Ok(Some(values)) if !values.is_empty() => Some(values[0] as i64),
        _ => None,
    }
}

/// CIPOS/CIEND-style offset pairs, defaulting to `[0, 0]` when absent
fn get_info_int_pair(record: &bcf::Record, key: &[u8]) -> (i64, i64) {
    match record.info(key).integer() {
        Ok(Some(values)) if values.len() >= 2 => (values[0] as i64, values[1] as i64),
        _ => (0, 0),
    }
}

fn get_info_sv_type(record: &bcf::Record) -> Option<SvType> {
    match record.info(b"SVTYPE").string() {
        Ok(Some(values)) if !values.is_empty() => std::str::from_utf8(values[0])
            .ok()
            .and_then(|s| s.parse::<SvType>().ok()),
        _ => None,
    }
}

/// Build the SV and CI stores from the upstream caller VCF
///
/// Only records of the run's SV class are ingested. Each accepted record
/// produces one left and one right widened CI; interspersed duplications add a
/// copy CI around POS2. Records missing END or SVTYPE are counted and skipped.
///
pub fn read_sv_candidates(
    vcf_filename: &str,
    run_sv_type: SvType,
    max_del_size: Option<i64>,
    segment_size: i64,
) -> (SvStore, CiStore) {
    info!("Reading SV candidates from file '{vcf_filename}'");

    let mut reader = unwrap!(
        bcf::Reader::from_path(vcf_filename),
        "Unable to open input VCF file: '{}'",
        vcf_filename,
    );

    let rid2chrom: Vec<String> = {
        let header = reader.header();
        (0..header.contig_count())
            .map(|rid| {
                let name = unwrap!(
                    header.rid2name(rid),
                    "Invalid contig index {} in VCF header",
                    rid
                );
                String::from_utf8_lossy(name).to_string()
            })
            .collect()
    };

    let mut sv_store = SvStore::default();
    let mut ci_store = CiStore::default();
    let mut skipped_records = 0;

    let mut record = reader.empty_record();
    while let Some(result) = reader.read(&mut record) {
        unwrap!(result, "Failed to parse record from '{}'", vcf_filename);

        let sv_type = match get_info_sv_type(&record) {
            Some(x) => x,
            None => {
                skipped_records += 1;
                continue;
            }
        };
        if sv_type != run_sv_type {
            continue;
        }

        let chrom = match record.rid() {
            Some(rid) if (rid as usize) < rid2chrom.len() => rid2chrom[rid as usize].clone(),
            _ => {
                skipped_records += 1;
                continue;
            }
        };
        let start = record.pos() + 1;
        let end = match get_info_int(&record, b"END") {
            Some(x) => x,
            None => {
                skipped_records += 1;
                continue;
            }
        };

        if sv_type == SvType::Del {
            if let Some(max_size) = max_del_size {
                if end - start > max_size {
                    continue;
                }
            }
        }

        let copy_pos = if sv_type == SvType::DupIsp {
            match get_info_int(&record, b"POS2") {
                Some(x) => Some(x),
                None => {
                    skipped_records += 1;
                    continue;
                }
            }
        } else {
            None
        };

        let id = String::from_utf8_lossy(&record.id()).to_string();
        let sv_size = end - start;

        let (ci_pos_lo, ci_pos_hi) = get_info_int_pair(&record, b"CIPOS");
        let (ci_end_lo, ci_end_hi) = get_info_int_pair(&record, b"CIEND");

        let (left_head, left_tail) =
            widen_ci(start + ci_pos_lo, start + ci_pos_hi, segment_size, sv_size);
        ci_store.add(
            &chrom,
            BreakpointCi {
                head: left_head,
                tail: left_tail,
                sv_id: id.clone(),
                side: CiSide::Left,
            },
        );

        let (right_head, right_tail) =
            widen_ci(end + ci_end_lo, end + ci_end_hi, segment_size, sv_size);
        ci_store.add(
            &chrom,
            BreakpointCi {
                head: right_head,
                tail: right_tail,
                sv_id: id.clone(),
                side: CiSide::Right,
            },
        );

        if let Some(copy_pos) = copy_pos {
            let copy_pad = segment_size + 100;
            ci_store.add(
                &chrom,
                BreakpointCi {
                    head: std::cmp::max(copy_pos - copy_pad, 1),
                    tail: copy_pos + copy_pad,
                    sv_id: id.clone(),
                    side: CiSide::Copy,
                },
            );
        }

        sv_store.add(StructuralVariant {
            id,
            chrom,
            start,
            end,
            sv_type,
            copy_pos,
        });
    }

    info!(
        "Read {} candidate SVs ({} confidence intervals) of type {run_sv_type}",
        sv_store.len(),
        ci_store.len()
    );
    if skipped_records > 0 {
        warn!("Skipped {skipped_records} malformed VCF records");
    }

    (sv_store, ci_store)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_vcf(dir: &std::path::Path, records: &[&str]) -> String {
        use std::io::Write;
        let vcf_path = dir.join("candidates.vcf");
        let mut vcf = std::fs::File::create(&vcf_path).unwrap();
        writeln!(vcf, "##fileformat=VCFv4.2").unwrap();
        writeln!(vcf, "##contig=<ID=chr1,length=100000>").unwrap();
        writeln!(vcf, "##contig=<ID=chr2,length=100000>").unwrap();
        writeln!(
            vcf,
            "##INFO=<ID=SVTYPE,Number=1,Type=String,Description=\"SV class\">"
        )
        .unwrap();
        writeln!(
            vcf,
            "##INFO=<ID=END,Number=1,Type=Integer,Description=\"SV end\">"
        )
        .unwrap();
        writeln!(
            vcf,
            "##INFO=<ID=CIPOS,Number=2,Type=Integer,Description=\"CI around POS\">"
        )
        .unwrap();
        writeln!(
            vcf,
            "##INFO=<ID=CIEND,Number=2,Type=Integer,Description=\"CI around END\">"
        )
        .unwrap();
        writeln!(
            vcf,
            "##INFO=<ID=POS2,Number=1,Type=Integer,Description=\"Copy target\">"
        )
        .unwrap();
        writeln!(vcf, "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO").unwrap();
        for record in records {
            writeln!(vcf, "{record}").unwrap();
        }
        vcf_path.display().to_string()
    }

    #[test]
    fn test_read_sv_candidates_del() {
        let dir = tempfile::tempdir().unwrap();
        let vcf_filename = write_test_vcf(
            dir.path(),
            &[
                "chr1\t1000\tdel1\tN\t<DEL>\t255\tPASS\tSVTYPE=DEL;END=2000;CIPOS=-10,10;CIEND=-20,20",
                "chr2\t5000\tinv1\tN\t<INV>\t255\tPASS\tSVTYPE=INV;END=6000",
                "chr1\t10000\tdel2\tN\t<DEL>\t255\tPASS\tSVTYPE=DEL;END=40000",
            ],
        );

        let (sv_store, ci_store) = read_sv_candidates(&vcf_filename, SvType::Del, None, 400);

        // inv1 filtered by class; del1 and del2 pass
        assert_eq!(sv_store.len(), 2);
        assert_eq!(ci_store.len(), 4);

        let sv = sv_store.get("del1").unwrap();
        assert_eq!((sv.start, sv.end), (1000, 2000));

        // sv size 1000 > segment 400, so pad = 400 + 100
        let left = ci_store.get(ci_store.left_ci("del1").unwrap());
        assert_eq!((left.head, left.tail), (1000 - 10 - 500, 1000 + 10 + 500));
        let right = ci_store.get(ci_store.right_ci("del1").unwrap());
        assert_eq!((right.head, right.tail), (2000 - 20 - 500, 2000 + 20 + 500));

        // CIPOS/CIEND absent defaults to a point interval before widening
        let left2 = ci_store.get(ci_store.left_ci("del2").unwrap());
        assert_eq!((left2.head, left2.tail), (9500, 10500));
    }

    #[test]
    fn test_read_sv_candidates_max_del_size() {
        let dir = tempfile::tempdir().unwrap();
        let vcf_filename = write_test_vcf(
            dir.path(),
            &[
                "chr1\t1000\tsmall\tN\t<DEL>\t255\tPASS\tSVTYPE=DEL;END=2000",
                "chr1\t10000\thuge\tN\t<DEL>\t255\tPASS\tSVTYPE=DEL;END=40000",
            ],
        );

        let (sv_store, _) = read_sv_candidates(&vcf_filename, SvType::Del, Some(10000), 400);
        assert_eq!(sv_store.len(), 1);
        assert!(sv_store.get("small").is_some());
        assert!(sv_store.get("huge").is_none());
    }

    #[test]
    fn test_read_sv_candidates_dup_isp_copy_ci() {
        let dir = tempfile::tempdir().unwrap();
        let vcf_filename = write_test_vcf(
            dir.path(),
            &[
                "chr1\t1000\tdup1\tN\t<DUP:ISP>\t255\tPASS\tSVTYPE=DUP:ISP;END=2000;POS2=50000",
                // POS2 missing: malformed for this class, skipped
                "chr1\t3000\tdup2\tN\t<DUP:ISP>\t255\tPASS\tSVTYPE=DUP:ISP;END=4000",
            ],
        );

        let (sv_store, ci_store) = read_sv_candidates(&vcf_filename, SvType::DupIsp, None, 400);

        assert_eq!(sv_store.len(), 1);
        assert_eq!(ci_store.len(), 3);

        let copy = ci_store.get(ci_store.copy_ci("dup1").unwrap());
        assert_eq!((copy.head, copy.tail), (50000 - 500, 50000 + 500));
        assert_eq!(copy.side, CiSide::Copy);
    }
}

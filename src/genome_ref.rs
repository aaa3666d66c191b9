use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};

use log::info;
use unwrap::unwrap;

/// One line of a FASTA index sidecar
///
/// Only the fields the loader needs are kept: trailing line-length columns are
/// parsed but unused because sequences are accumulated line-by-line.
///
#[derive(Debug, Eq, PartialEq)]
pub struct FaiEntry {
    pub name: String,
    pub length: u64,
    pub offset: u64,
}

/// Parse one `.fai` line of the form `name\tlength\toffset\tlinebases\tlinewidth`
pub fn parse_fai_line(line: &str) -> Option<FaiEntry> {
    let mut words = line.split_whitespace();
    let name = words.next()?.to_string();
    let length = words.next()?.parse::<u64>().ok()?;
    let offset = words.next()?.parse::<u64>().ok()?;
    Some(FaiEntry {
        name,
        length,
        offset,
    })
}

#[derive(Default)]
pub struct GenomeRef {
    /// A map from chrom name to chrom sequence
    pub chroms: HashMap<String, Vec<u8>>,
}

impl GenomeRef {
    pub fn chrom(&self, name: &str) -> Option<&[u8]> {
        self.chroms.get(name).map(|x| x.as_slice())
    }

    /// Sequence bytes on the 0-based half-open range `[start, end)`, clamped
    /// to the chromosome bounds
    pub fn slice(&self, name: &str, start: usize, end: usize) -> Option<&[u8]> {
        let seq = self.chroms.get(name)?;
        let start = std::cmp::min(start, seq.len());
        let end = std::cmp::min(end, seq.len());
        Some(&seq[start..end])
    }
}

/// Read one chromosome sequence starting at the byte offset recorded in its
/// FAI entry, accumulating lines until the next fasta header
fn read_chrom_seq(fasta_file: &mut File, entry: &FaiEntry) -> Vec<u8> {
    unwrap!(
        fasta_file.seek(SeekFrom::Start(entry.offset)),
        "Failed to seek to offset {} for chromosome '{}'",
        entry.offset,
        entry.name,
    );

    let mut seq = Vec::with_capacity(entry.length as usize);
    let reader = BufReader::new(fasta_file);
    for line in reader.lines() {
        let line = unwrap!(line, "Failed to read fasta line for '{}'", entry.name);
        if line.starts_with('>') {
            break;
        }
        seq.extend(line.trim_end().bytes().map(|c| c.to_ascii_uppercase()));
    }
    seq
}

/// Load a reference genome through its FAI index
///
/// All chromosomes are loaded eagerly, the pipeline takes random access on
/// many SVs per chromosome. A missing `.fai` sidecar is fatal.
///
pub fn get_genome_ref_from_fasta(fasta_filename: &str) -> GenomeRef {
    info!("Reading reference genome from file '{fasta_filename}'");

    let fai_filename = format!("{fasta_filename}.fai");
    let fai_file = unwrap!(
        File::open(&fai_filename),
        "Unable to open fasta index file: '{}'",
        fai_filename,
    );
    let mut fasta_file = unwrap!(
        File::open(fasta_filename),
        "Unable to open reference fasta file: '{}'",
        fasta_filename,
    );

    let mut genome_ref = GenomeRef::default();
    for line in BufReader::new(fai_file).lines() {
        let line = unwrap!(line, "Failed to read fasta index file '{}'", fai_filename);
        if line.is_empty() {
            continue;
        }
        let entry = unwrap!(
            parse_fai_line(&line),
            "Malformed fasta index line in '{}': '{}'",
            fai_filename,
            line,
        );
        let seq = read_chrom_seq(&mut fasta_file, &entry);
        info!("Loaded chromosome {} ({} bases)", entry.name, seq.len());
        genome_ref.chroms.insert(entry.name, seq);
    }
    genome_ref
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_fai_line() {
        let entry = parse_fai_line("chr1\t248956422\t112\t70\t71").unwrap();
        assert_eq!(
            entry,
            FaiEntry {
                name: "chr1".to_string(),
                length: 248956422,
                offset: 112,
            }
        );
        assert!(parse_fai_line("chr1\tnot_a_number").is_none());
    }

    fn write_test_reference(dir: &std::path::Path) -> String {
        let fasta_path = dir.join("ref.fa");
        let mut fasta = File::create(&fasta_path).unwrap();
        // >chrA starts at byte 0; sequence bytes start at offset 6
        writeln!(fasta, ">chrA").unwrap();
        writeln!(fasta, "acgt").unwrap();
        writeln!(fasta, "ACGT").unwrap();
        writeln!(fasta, ">chrB").unwrap();
        writeln!(fasta, "TTTT").unwrap();

        let fai_path = format!("{}.fai", fasta_path.display());
        let mut fai = File::create(&fai_path).unwrap();
        writeln!(fai, "chrA\t8\t6\t4\t5").unwrap();
        writeln!(fai, "chrB\t4\t22\t4\t5").unwrap();

        fasta_path.display().to_string()
    }

    #[test]
    fn test_get_genome_ref_from_fasta() {
        let dir = tempfile::tempdir().unwrap();
        let fasta_filename = write_test_reference(dir.path());

        let genome_ref = get_genome_ref_from_fasta(&fasta_filename);

        assert_eq!(genome_ref.chroms.len(), 2);
        assert_eq!(genome_ref.chrom("chrA").unwrap(), b"ACGTACGT");
        assert_eq!(genome_ref.chrom("chrB").unwrap(), b"TTTT");
        assert_eq!(genome_ref.chrom("chrC"), None);
    }

    #[test]
    fn test_slice_clamps_to_chrom_bounds() {
        let mut genome_ref = GenomeRef::default();
        genome_ref
            .chroms
            .insert("chrA".to_string(), b"ACGTACGT".to_vec());

        assert_eq!(genome_ref.slice("chrA", 2, 6).unwrap(), b"GTAC");
        assert_eq!(genome_ref.slice("chrA", 6, 100).unwrap(), b"GT");
        assert_eq!(genome_ref.slice("chrA", 100, 200).unwrap(), b"");
    }
}

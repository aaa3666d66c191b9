use camino::Utf8PathBuf;
use clap::Parser;
use const_format::concatcp;
use log::info;
use serde::Serialize;
use simple_error::{bail, SimpleResult};
use unwrap::unwrap;

use crate::sv_store::SvType;

pub const SETTINGS_FILENAME: &str = concatcp!(env!("CARGO_PKG_NAME"), ".settings.json");

#[derive(Parser, Serialize)]
#[command(
    author,
    version,
    about,
    help_template = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}"
)]
#[clap(rename_all = "kebab_case")]
pub struct Settings {
    /// Pipeline stage to run: 0 = full pipeline, 1 = signaling cluster
    /// extraction and breakpoint tagging, 2 = vote and refined VCF output,
    /// 3 = split alignment of clusters
    #[arg(long, default_value_t = 0, value_name = "STAGE")]
    pub mode: u32,

    /// SV candidate calls from the upstream caller, in VCF format
    #[arg(long = "vcf", value_name = "FILE")]
    pub vcf_filename: String,

    /// Whole-genome paired-end alignment file in BAM format
    #[arg(long = "bam", value_name = "FILE")]
    pub bam_filename: String,

    /// Genome reference in FASTA format; a .fai sidecar is required
    #[arg(long = "ref", value_name = "FILE")]
    pub ref_filename: String,

    /// Directory for all pipeline output and intermediate files
    #[arg(long, value_name = "DIR", default_value = concatcp!(env!("CARGO_PKG_NAME"), "_output"))]
    pub workdir: Utf8PathBuf,

    /// Also write the signaling reads to this legacy text file (relative to
    /// the work directory)
    #[arg(long = "sr", value_name = "FILE")]
    pub signaling_reads_filename: Option<String>,

    /// Number of threads to use (0 = all logical cpus)
    #[arg(long = "threads", default_value_t = 0, value_name = "THREAD_COUNT")]
    pub thread_count: usize,

    /// SV class refined by this run
    #[arg(long = "sv-type", default_value = "DEL", value_name = "TYPE")]
    pub sv_type: SvType,

    /// Minimum split-read votes on either breakpoint before a refined call is
    /// emitted
    #[arg(long, default_value_t = 5)]
    pub min_support: usize,

    /// Drop input deletions larger than this size
    #[arg(long, value_name = "BASES")]
    pub max_del_size: Option<i64>,

    /// Truth set for evaluation, in BED or VCF format
    #[arg(long = "truth", value_name = "FILE")]
    pub truth_filename: Option<String>,

    /// Tolerance in bases when comparing refined breakpoints to the truth set
    #[arg(long, default_value_t = 5)]
    pub margin: i64,

    /// Assemble clusters with velvet and align contigs instead of raw reads
    /// (alignment mode only)
    #[arg(long)]
    pub assemble: bool,

    /// Require a credible deletion-split cigar on every vote, also for
    /// extractor-tagged input
    #[arg(long)]
    pub require_valid_split: bool,

    /// Overwrite an existing work directory
    #[arg(long)]
    pub clobber: bool,

    /// Turn on extra debug logging
    #[arg(long)]
    pub debug: bool,
}

/// Validate settings and update parameters that can't be processed by clap
///
/// Assumes that logging is not set up yet
///
pub fn validate_and_fix_settings_impl(mut settings: Settings) -> SimpleResult<Settings> {
    fn check_required_filename(filename: &str, label: &str) -> SimpleResult<()> {
        if filename.is_empty() {
            bail!("Must specify {label} file");
        }
        if !std::path::Path::new(&filename).exists() {
            bail!("Can't find specified {label} file: '{filename}'");
        }
        Ok(())
    }

    if settings.mode > 3 {
        bail!("--mode must be one of 0, 1, 2, 3");
    }

    check_required_filename(&settings.vcf_filename, "input VCF")?;
    check_required_filename(&settings.bam_filename, "alignment")?;
    check_required_filename(&settings.ref_filename, "reference")?;
    check_required_filename(
        &format!("{}.fai", settings.ref_filename),
        "reference index",
    )?;

    if let Some(truth_filename) = &settings.truth_filename {
        check_required_filename(truth_filename, "truth")?;
    }

    if settings.thread_count == 0 {
        settings.thread_count = num_cpus::get();
    }

    Ok(settings)
}

pub fn validate_and_fix_settings(settings: Settings) -> Settings {
    match validate_and_fix_settings_impl(settings) {
        Ok(x) => x,
        Err(msg) => {
            eprintln!("Invalid command-line setting: {}", msg);
            std::process::exit(exitcode::USAGE);
        }
    }
}

pub fn parse_settings() -> Settings {
    Settings::parse()
}

/// Record the run settings in the work directory in json format
pub fn write_settings(settings: &Settings) {
    let filename = settings.workdir.join(SETTINGS_FILENAME);

    info!("Writing run settings to file: '{filename}'");

    let f = unwrap!(
        std::fs::File::create(&filename),
        "Unable to create settings json file: '{filename}'"
    );
    serde_json::to_writer_pretty(&f, &settings).unwrap();
}

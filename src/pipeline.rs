//! Staged pipeline control flow.
//!
//! Stages communicate through files in the work directory so each stage is
//! independently runnable and checkpointable:
//! vcf + bam -> cluster.bam -> cluster_sorted.bam -> cluster_withbp.bam ->
//! votes.txt -> refined.vcf, with alignment.bam as the optional
//! aligner-driven alternative to the tag-based extractor.

use log::{error, info, warn};

use crate::assembly::{align_contigs, assemble_clusters};
use crate::bam_utils::sort_bam_by_sv_tag;
use crate::breakpoint::set_breakpoint_tags;
use crate::cli::Settings;
use crate::evaluate::{evaluate_results, read_refined_results, read_truth_bed, read_truth_vcf};
use crate::genome_ref::{get_genome_ref_from_fasta, GenomeRef};
use crate::insert_size::{
    estimate_insert_stats, InsertStats, MAX_ESTIMATION_RECORDS, MAX_PROPER_TLEN,
};
use crate::scanner::{
    build_cluster_bam, restore_signaling_reads, scan_bam_for_signaling_reads,
    write_signaling_reads, SignalingReadMap,
};
use crate::split_align::align_clusters;
use crate::sv_store::{CiStore, SvStore};
use crate::vcf_input::read_sv_candidates;
use crate::vote::{collect_breakpoint_votes, get_refined_calls, write_refined_vcf, write_votes_file};

pub const CLUSTER_BAM_FILENAME: &str = "cluster.bam";
pub const RUN_STATS_FILENAME: &str = "run.stats.json";
pub const SORTED_CLUSTER_BAM_FILENAME: &str = "cluster_sorted.bam";
pub const BREAKPOINT_BAM_FILENAME: &str = "cluster_withbp.bam";
pub const ALIGNMENT_BAM_FILENAME: &str = "alignment.bam";
pub const CONTIGS_FILENAME: &str = "assembly.contigs";
pub const VOTES_FILENAME: &str = "votes.txt";
pub const REFINED_VCF_FILENAME: &str = "refined.vcf";

/// Immutable state shared by every stage: fragment statistics plus the SV and
/// CI stores, built once before any worker threads start
pub struct PipelineContext {
    pub insert_stats: InsertStats,
    pub sv_store: SvStore,
    pub ci_store: CiStore,
}

pub fn build_pipeline_context(settings: &Settings) -> PipelineContext {
    let insert_stats = estimate_insert_stats(
        &settings.bam_filename,
        MAX_PROPER_TLEN,
        MAX_ESTIMATION_RECORDS,
    );
    let (sv_store, ci_store) = read_sv_candidates(
        &settings.vcf_filename,
        settings.sv_type,
        settings.max_del_size,
        insert_stats.mean,
    );
    if sv_store.is_empty() {
        warn!(
            "No {} candidates found in '{}', nothing to refine",
            settings.sv_type, settings.vcf_filename
        );
    }
    PipelineContext {
        insert_stats,
        sv_store,
        ci_store,
    }
}

fn workdir_file(settings: &Settings, filename: &str) -> String {
    settings.workdir.join(filename).to_string()
}

fn require_stage_input(filename: &str, producing_mode: u32) {
    if !std::path::Path::new(filename).exists() {
        error!("Missing stage input '{filename}', run mode {producing_mode} first");
        std::process::exit(exitcode::USAGE);
    }
}

/// Run the parallel scan, or restore its result from a signaling-reads file
/// kept by an earlier run
fn get_signaling_reads(settings: &Settings, context: &PipelineContext) -> SignalingReadMap {
    if let Some(sr_filename) = &settings.signaling_reads_filename {
        let sr_path = workdir_file(settings, sr_filename);
        if std::path::Path::new(&sr_path).exists() {
            info!("Restoring signaling reads from '{sr_path}'");
            return restore_signaling_reads(&sr_path);
        }
    }

    let signaling_reads = scan_bam_for_signaling_reads(
        &settings.bam_filename,
        &context.ci_store,
        settings.sv_type,
        &context.insert_stats,
        settings.thread_count,
    );
    if let Some(sr_filename) = &settings.signaling_reads_filename {
        write_signaling_reads(&signaling_reads, &workdir_file(settings, sr_filename));
    }
    signaling_reads
}

/// Stage 1: extract signaling reads into a CI-tagged cluster BAM, group it by
/// CI via the external sort, and tag per-read breakpoints
pub fn run_cluster_stage(settings: &Settings, context: &PipelineContext) {
    let signaling_reads = get_signaling_reads(settings, context);

    let cluster_filename = workdir_file(settings, CLUSTER_BAM_FILENAME);
    build_cluster_bam(
        &settings.bam_filename,
        &signaling_reads,
        &context.ci_store,
        settings.sv_type,
        &cluster_filename,
    );

    let sorted_filename = workdir_file(settings, SORTED_CLUSTER_BAM_FILENAME);
    sort_bam_by_sv_tag(&cluster_filename, &sorted_filename, settings.thread_count);

    set_breakpoint_tags(
        &sorted_filename,
        &workdir_file(settings, BREAKPOINT_BAM_FILENAME),
        &context.ci_store,
        settings.sv_type,
    );
}

fn is_vcf_truth_file(filename: &str) -> bool {
    filename.ends_with(".vcf") || filename.ends_with(".vcf.gz") || filename.ends_with(".bcf")
}

/// Per-run result summary, written as json alongside the refined output
#[derive(serde::Serialize)]
pub struct RunStats {
    pub program_version: String,
    pub sv_type: crate::sv_store::SvType,
    pub insert_stats: InsertStats,
    pub candidate_sv_count: usize,
    pub refined_call_count: Option<usize>,
    pub evaluation: Option<crate::evaluate::EvalCounts>,
}

fn write_run_stats(settings: &Settings, stats: &RunStats) {
    let filename = workdir_file(settings, RUN_STATS_FILENAME);
    let file = match std::fs::File::create(&filename) {
        Ok(x) => x,
        Err(e) => {
            warn!("Unable to write run stats file '{filename}': {e}");
            return;
        }
    };
    serde_json::to_writer_pretty(&file, stats).unwrap();
}

/// Outcome of the vote stage, folded into the run stats
pub struct VoteStageResult {
    pub refined_call_count: usize,
    pub evaluation: Option<crate::evaluate::EvalCounts>,
}

/// Stage 2: tally breakpoint votes from a tagged BAM, write the votes file and
/// the refined VCF, and compare against the truth set when one is given
pub fn run_vote_stage(
    settings: &Settings,
    context: &PipelineContext,
    genome_ref: &GenomeRef,
    votes_input_filename: &str,
    require_valid_split: bool,
) -> VoteStageResult {
    let votes = collect_breakpoint_votes(
        votes_input_filename,
        &context.ci_store,
        require_valid_split || settings.require_valid_split,
    );
    write_votes_file(
        &votes,
        &context.ci_store,
        &workdir_file(settings, VOTES_FILENAME),
    );

    let calls = get_refined_calls(
        &votes,
        &context.sv_store,
        &context.ci_store,
        settings.min_support,
    );
    let refined_filename = workdir_file(settings, REFINED_VCF_FILENAME);
    write_refined_vcf(&calls, &settings.vcf_filename, &refined_filename, genome_ref);

    let evaluation = settings.truth_filename.as_ref().map(|truth_filename| {
        let truth = if is_vcf_truth_file(truth_filename) {
            read_truth_vcf(truth_filename, settings.sv_type, settings.max_del_size)
        } else {
            read_truth_bed(truth_filename, settings.sv_type, settings.max_del_size)
        };
        let results = read_refined_results(&refined_filename);
        evaluate_results(&results, &truth, settings.margin)
    });

    VoteStageResult {
        refined_call_count: calls.len(),
        evaluation,
    }
}

/// Stage 3: realign cluster reads (or assembled contigs) against both SV
/// windows with the split aligner, then vote on the resulting alignments
pub fn run_align_stage(
    settings: &Settings,
    context: &PipelineContext,
    genome_ref: &GenomeRef,
) -> VoteStageResult {
    let sorted_filename = workdir_file(settings, SORTED_CLUSTER_BAM_FILENAME);
    require_stage_input(&sorted_filename, 1);

    let alignment_filename = workdir_file(settings, ALIGNMENT_BAM_FILENAME);
    if settings.assemble {
        let contigs_filename = workdir_file(settings, CONTIGS_FILENAME);
        assemble_clusters(
            &sorted_filename,
            settings.workdir.as_str(),
            &contigs_filename,
        );
        align_contigs(
            &contigs_filename,
            &sorted_filename,
            &alignment_filename,
            &context.ci_store,
            &context.sv_store,
            genome_ref,
        );
    } else {
        align_clusters(
            &sorted_filename,
            &alignment_filename,
            &context.ci_store,
            &context.sv_store,
            genome_ref,
            settings.thread_count,
        );
    }

    // Aligner-produced cigars carry the deletion op, so the split validity
    // gate applies on this path
    run_vote_stage(settings, context, genome_ref, &alignment_filename, true)
}

pub fn run_pipeline(settings: &Settings) {
    let context = build_pipeline_context(settings);

    let vote_result = match settings.mode {
        1 => {
            run_cluster_stage(settings, &context);
            None
        }
        2 => {
            let breakpoint_filename = workdir_file(settings, BREAKPOINT_BAM_FILENAME);
            require_stage_input(&breakpoint_filename, 1);
            let genome_ref = get_genome_ref_from_fasta(&settings.ref_filename);
            Some(run_vote_stage(
                settings,
                &context,
                &genome_ref,
                &breakpoint_filename,
                false,
            ))
        }
        3 => {
            let genome_ref = get_genome_ref_from_fasta(&settings.ref_filename);
            Some(run_align_stage(settings, &context, &genome_ref))
        }
        _ => {
            run_cluster_stage(settings, &context);
            let genome_ref = get_genome_ref_from_fasta(&settings.ref_filename);
            Some(run_vote_stage(
                settings,
                &context,
                &genome_ref,
                &workdir_file(settings, BREAKPOINT_BAM_FILENAME),
                false,
            ))
        }
    };

    write_run_stats(
        settings,
        &RunStats {
            program_version: env!("CARGO_PKG_VERSION").to_string(),
            sv_type: settings.sv_type,
            insert_stats: context.insert_stats,
            candidate_sv_count: context.sv_store.len(),
            refined_call_count: vote_result.as_ref().map(|x| x.refined_call_count),
            evaluation: vote_result.and_then(|x| x.evaluation),
        },
    );

    info!("Pipeline stage(s) complete, output in '{}'", settings.workdir);
}

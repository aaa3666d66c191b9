mod assembly;
mod bam_utils;
mod breakpoint;
mod classify;
mod cli;
mod evaluate;
mod genome_ref;
mod insert_size;
mod pipeline;
mod scanner;
mod split_align;
mod sv_store;
mod vcf_input;
mod vote;

use std::error;
use std::path::Path;
use std::process;

use hhmmss::Hhmmss;
use log::info;

use crate::pipeline::run_pipeline;

static PROG_NAME: &str = env!("CARGO_PKG_NAME");
static PROG_VERSION: &str = env!("CARGO_PKG_VERSION");

fn setup_logger(output_dir: Option<&Path>, debug: bool) -> Result<(), fern::InitError> {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let logger = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                PROG_NAME,
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    let logger = if let Some(output_dir) = output_dir {
        let log_filename = output_dir.join(PROG_NAME.to_string() + ".log");
        logger.chain(fern::log_file(log_filename)?)
    } else {
        logger
    };

    logger.apply()?;
    Ok(())
}

/// Check and create the work directory, then setup the logger to write there
///
/// All error messaging in this method needs to account for no logger being
/// setup yet.
///
fn setup_workdir_and_logger(workdir: &Path, clobber: bool, debug: bool) {
    if workdir.exists() && !(clobber && workdir.is_dir()) {
        eprintln!(
            "Invalid command-line setting: Work directory already exists: \"{}\"",
            workdir.display()
        );
        std::process::exit(exitcode::USAGE);
    }
    if !workdir.exists() {
        if let Err(e) = std::fs::create_dir_all(workdir) {
            panic!(
                "Can't create new work directory at '{}': {}",
                workdir.display(),
                e
            );
        }
    }
    setup_logger(Some(workdir), debug).unwrap();
}

fn run(settings: &cli::Settings) -> Result<(), Box<dyn error::Error>> {
    info!("Starting {PROG_NAME} {PROG_VERSION}");
    info!(
        "cmdline: {}",
        std::env::args().collect::<Vec<_>>().join(" ")
    );
    info!("Running on {} threads", settings.thread_count);

    let start = std::time::Instant::now();

    cli::write_settings(settings);
    run_pipeline(settings);

    info!(
        "{PROG_NAME} completed. Total Runtime: {}",
        start.elapsed().hhmmssxxx()
    );
    Ok(())
}

fn main() {
    let settings = cli::parse_settings();

    // Validation of the workdir needs to be handled separately so that we
    // don't log error messages before logging is setup. Modes 2 and 3 resume
    // from stage outputs already present in the work directory.
    let resume_in_workdir = settings.mode == 2 || settings.mode == 3;
    setup_workdir_and_logger(
        settings.workdir.as_std_path(),
        settings.clobber || resume_in_workdir,
        settings.debug,
    );

    let settings = cli::validate_and_fix_settings(settings);

    if let Err(err) = run(&settings) {
        eprintln!("{}", err);
        process::exit(2);
    }
}

//! # opstats - Main Entry Point
//!
//! Loads a JSON trace space, converts it to op stats and writes the result
//! as JSON to stdout or `--output`. A one-line summary goes to stderr
//! unless `--quiet`.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::io::{self, Write};
use std::path::Path;

use opstats::cli::Args;
use opstats::convert::{
    convert_xspace_to_op_stats_with_executor, Executor, OpStats, OpStatsOptions,
};
use opstats::domain::TraceError;
use opstats::export::{load_xspace, write_op_stats_json, write_op_stats_to_file};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_DATAERR: i32 = 65;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<TraceError>() {
        Some(TraceError::ReadFailed { .. }) => EXIT_USAGE,
        Some(TraceError::InvalidTrace(_) | TraceError::EmptySpace) => EXIT_DATAERR,
        None => EXIT_ERROR,
    }
}

fn load_options(args: &Args) -> Result<OpStatsOptions> {
    let Some(path) = &args.options else {
        return Ok(args.to_options());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read options file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Invalid options file {}", path.display()))
}

fn write_output(path: Option<&Path>, op_stats: &OpStats, pretty: bool) -> Result<()> {
    match path {
        Some(path) => write_op_stats_to_file(path, op_stats, pretty)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => write_op_stats_json(io::stdout().lock(), op_stats, pretty)
            .context("Failed to write op stats to stdout")?,
    }
    Ok(())
}

fn run() -> Result<()> {
    let args = Args::parse();
    let options = load_options(&args)?;
    let executor = if args.threads == 0 {
        Executor::with_available_parallelism("opstats")
    } else {
        Executor::new("opstats", args.threads)
    };
    info!("Options: {options:?}, {} worker threads", executor.threads());

    let space = load_xspace(&args.trace)?;
    let op_stats = convert_xspace_to_op_stats_with_executor(&space, &options, &executor);
    write_output(args.output.as_deref(), &op_stats, args.pretty)?;

    if !args.quiet {
        let mut stderr = io::stderr().lock();
        writeln!(
            stderr,
            "{}: {} device ops, {} host ops, {} steps ({} dropped), {} kernels",
            op_stats.run_environment.device_type,
            op_stats.device_op_metrics_db.metrics_db.len(),
            op_stats.host_op_metrics_db.metrics_db.len(),
            op_stats.step_db.step_sequence.len(),
            op_stats.step_db.num_steps_dropped,
            op_stats.kernel_stats_db.reports.len(),
        )?;
    }
    Ok(())
}

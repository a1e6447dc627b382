//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::convert::OpStatsOptions;
use crate::steps::OverlapPriority;

#[derive(Parser, Debug)]
#[command(
    name = "opstats",
    about = "Convert an accelerator trace space into op statistics",
    after_help = "\
EXAMPLES:
    opstats trace.json                          Op metrics and step db to stdout
    opstats trace.json -o stats.json --pretty   Pretty-printed, written to a file
    opstats trace.json --kernel-stats --no-step-db
    opstats trace.json --options options.json   Options from a JSON file"
)]
pub struct Args {
    /// Trace space to convert (JSON)
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Write op stats here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Skip the host and device op-metrics databases
    #[arg(long)]
    pub no_op_metrics: bool,

    /// Skip the step database
    #[arg(long)]
    pub no_step_db: bool,

    /// Build the kernel-stats database
    #[arg(long)]
    pub kernel_stats: bool,

    /// Drop truncated first and last steps (GPU and CPU traces)
    #[arg(long)]
    pub drop_incomplete_steps: bool,

    /// Let the highest event type win overlapping step time
    #[arg(long)]
    pub prioritize_event_type: bool,

    /// Extraction worker threads (0 = one per CPU)
    #[arg(long, default_value = "0")]
    pub threads: usize,

    /// Pretty-print the JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Suppress the summary on stderr
    #[arg(short, long)]
    pub quiet: bool,

    /// Conversion options as JSON; replaces the option flags above
    #[arg(long, value_name = "FILE", conflicts_with_all = [
        "no_op_metrics", "no_step_db", "kernel_stats", "drop_incomplete_steps",
        "prioritize_event_type",
    ])]
    pub options: Option<PathBuf>,
}

impl Args {
    /// Conversion options selected by the flags.
    #[must_use]
    pub fn to_options(&self) -> OpStatsOptions {
        OpStatsOptions {
            generate_op_metrics_db: !self.no_op_metrics,
            generate_step_db: !self.no_step_db,
            generate_kernel_stats_db: self.kernel_stats,
            maybe_drop_incomplete_steps: self.drop_incomplete_steps,
            overlap_priority: if self.prioritize_event_type {
                OverlapPriority::HighestEventType
            } else {
                OverlapPriority::Innermost
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags() {
        let args = Args::try_parse_from(["opstats", "trace.json"]).unwrap();
        let options = args.to_options();
        assert!(options.generate_op_metrics_db);
        assert!(options.generate_step_db);
        assert!(!options.generate_kernel_stats_db);
        assert_eq!(options.overlap_priority, OverlapPriority::Innermost);
        assert_eq!(args.threads, 0);
    }

    #[test]
    fn test_option_flags() {
        let args = Args::try_parse_from([
            "opstats",
            "trace.json",
            "--no-step-db",
            "--kernel-stats",
            "--drop-incomplete-steps",
            "--prioritize-event-type",
        ])
        .unwrap();
        let options = args.to_options();
        assert!(!options.generate_step_db);
        assert!(options.generate_kernel_stats_db);
        assert!(options.maybe_drop_incomplete_steps);
        assert_eq!(options.overlap_priority, OverlapPriority::HighestEventType);
    }

    #[test]
    fn test_options_file_conflicts_with_flags() {
        let result = Args::try_parse_from([
            "opstats",
            "trace.json",
            "--options",
            "o.json",
            "--kernel-stats",
        ]);
        assert!(result.is_err());
        assert!(Args::try_parse_from(["opstats"]).is_err());
    }
}

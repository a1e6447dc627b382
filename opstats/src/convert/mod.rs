//! Trace-space conversion passes.
//!
//! - [`op_metrics_db`]: op metrics per device plane and for the host
//! - [`hlo_module_map`]: program metadata and cost-analysis registry
//! - [`kernel_stats`]: per-kernel launch reports (GPU)
//! - [`tf_functions`]: per-function call aggregation (host)
//! - [`run_environment`]: environment, perf envelope, core placement
//! - [`executor`]: scoped worker pool for the per-plane tasks
//! - [`op_stats`]: the full pipeline producing [`OpStats`]

pub mod executor;
pub mod hlo_module_map;
pub mod kernel_stats;
pub mod op_metrics_db;
pub mod op_stats;
pub mod run_environment;
pub mod tf_functions;

pub use executor::Executor;
pub use hlo_module_map::{register_cost_analysis, CostAnalysis, HloModuleMap};
pub use kernel_stats::{KernelReport, KernelStatsDb};
pub use op_stats::{
    convert_xspace_to_op_stats, convert_xspace_to_op_stats_with_executor, Diagnostics, OpStats,
    OpStatsOptions,
};
pub use run_environment::{CoreDetails, PerfEnv, RunEnvironment};
pub use tf_functions::TfFunctionDb;

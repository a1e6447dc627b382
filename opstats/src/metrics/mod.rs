//! Operation statistics and duty-cycle accounting.
//!
//! - [`op_metrics`]: records, idle synthesis, attribute parsing
//! - [`op_metrics_db_builder`]: keyed accumulation (host and device flavors)
//! - [`xevent_op_metrics`]: accumulation straight from op events
//! - [`op_metrics_db_combiner`]: additive merge of finished dbs
//! - [`duty_cycle`]: active/idle segments per core, combined per chip

pub mod duty_cycle;
pub mod op_metrics;
pub mod op_metrics_db_builder;
pub mod op_metrics_db_combiner;
pub mod xevent_op_metrics;

pub use duty_cycle::{DutyCycleCombiner, DutyCycleTracker};
pub use op_metrics::{
    add_idle_op, idle_time_ps, is_idle_op, MemoryAccessed, MemoryOperation, OpMetrics,
    OpMetricsDb, PrecisionStats, SourceInfo, IDLE_OP_NAME,
};
pub use op_metrics_db_builder::{
    DeviceOpEntry, DeviceOpMetricsDbBuilder, HostOpMetricsDbBuilder, OpMetricsDbBuilder,
};
pub use op_metrics_db_combiner::OpMetricsDbCombiner;
pub use xevent_op_metrics::{XEventsOpMetricsDbBuilder, SPARSE_CORE_BUSY_OPS};

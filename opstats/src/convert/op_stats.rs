//! Trace space → [`OpStats`].
//!
//! # Pipeline
//!
//! ```text
//!                 ┌─ op metrics ──┐
//!   device plane ─┼─ step events ─┼─ (one task each, own slot) ─► join
//!   (TPU or GPU)  ├─ kernels ─────┤                                 │
//!                 └─ duty cycle ──┘                                 ▼
//!                                               sequential combine per kind
//!                                                                   │
//!   host plane ── op metrics, host steps, functions ────────────────┤
//!                                                                   ▼
//!                                                step db, environment, maps
//! ```
//!
//! Device planes are either every TPU plane (tensor and sparse cores) or,
//! when there is none, every GPU plane. Step events combine by
//! intersection on TPU (a step missing on one core is incomplete everywhere)
//! and by union on GPU.
//!
//! The hardware-module map is built before any task starts and is only read
//! while tasks run. Nothing mutable is shared during the parallel phase.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use opstats_common::schema::{
    HOST_THREADS_PLANE_NAME, SPARSE_CORE_MODULE_LINE_NAME, SPARSE_CORE_OP_LINE_NAME,
    XLA_MODULE_LINE_NAME, XLA_OP_LINE_NAME,
};
use opstats_common::{StatType, XPlane, XSpace};
use serde::{Deserialize, Serialize};

use crate::convert::executor::{Executor, Task};
use crate::convert::hlo_module_map::{
    cost_analysis_for, is_training_run, HloModuleMap, GPU_COST_ANALYSIS_KEY,
};
use crate::convert::kernel_stats::{
    convert_device_trace_xplane_to_kernel_reports, copy_top_k_duration_kernel_reports_to_db,
    insert_or_update_kernel_report, KernelReportMap, KernelStatsDb,
};
use crate::convert::op_metrics_db::{
    convert_device_trace_xplane_to_op_metrics_db, convert_host_threads_xplane_to_op_metrics_db,
};
use crate::convert::run_environment::{
    classify_device_planes, core_details_from_xplane, hostname, perf_env_from_xplane,
    performance_counter_result, run_environment, CoreDetails, PerfEnv, PerformanceCounterResult,
    RunEnvironment,
};
use crate::convert::tf_functions::{
    combine_tf_function_db, convert_host_threads_xline_to_tf_function_db, TfFunctionDb,
};
use crate::domain::{Timespan, DEFAULT_GPU_LOCAL_CORE_ID};
use crate::metrics::duty_cycle::{DutyCycleCombiner, DutyCycleTracker};
use crate::metrics::op_metrics::OpMetricsDb;
use crate::metrics::op_metrics_db_combiner::OpMetricsDbCombiner;
use crate::steps::extraction::{
    convert_device_trace_xplane_to_step_events, convert_host_threads_xplane_to_step_events,
};
use crate::steps::step_db::{convert_step_events_to_step_db, StepDatabase};
use crate::steps::step_events::{OverlapPriority, StepEvents};

/// Op categories that do not count toward the duty cycle.
const OFF_DUTY_CATEGORIES: &[&str] =
    &["infeed", "outfeed", "host send", "host send-done", "host recv", "host recv-done"];

/// Which databases to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpStatsOptions {
    pub generate_op_metrics_db: bool,
    pub generate_step_db: bool,
    pub generate_kernel_stats_db: bool,
    /// Drop truncated first/last steps (GPU and CPU runs only).
    pub maybe_drop_incomplete_steps: bool,
    pub overlap_priority: OverlapPriority,
}

/// Errors and warnings recorded in the trace, deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Diagnostics {
    #[must_use]
    pub fn from_space(space: &XSpace) -> Self {
        let unique = |messages: &[String]| -> Vec<String> {
            messages.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
        };
        Self { errors: unique(&space.errors), warnings: unique(&space.warnings) }
    }
}

/// Everything derived from one trace space.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpStats {
    pub run_environment: RunEnvironment,
    pub perf_env: Option<PerfEnv>,
    pub host_op_metrics_db: OpMetricsDb,
    pub device_op_metrics_db: OpMetricsDb,
    /// Op metrics of the retained TPU steps only.
    pub hlo_metrics_db_complete_steps_only: OpMetricsDb,
    pub step_db: StepDatabase,
    pub kernel_stats_db: KernelStatsDb,
    pub tf_function_db: TfFunctionDb,
    pub core_id_to_details: BTreeMap<u32, CoreDetails>,
    pub diagnostics: Diagnostics,
    pub program_id_to_name_map: BTreeMap<u64, String>,
    pub performance_counter_result: Option<PerformanceCounterResult>,
}

/// Active/idle segments of one TPU plane.
///
/// Op events count as active unless their category is off-duty; module
/// events only mark time as idle where no op ran.
#[must_use]
pub fn construct_duty_cycle_tracker(plane: &XPlane) -> DutyCycleTracker {
    let mut tracker = DutyCycleTracker::new();
    for line in &plane.lines {
        let name = line.name.as_str();
        for event in plane.events(line) {
            let span = Timespan::from_event(&event);
            if name == XLA_OP_LINE_NAME {
                let off_duty = event
                    .stat(StatType::HloCategory)
                    .and_then(|v| v.as_str())
                    .is_some_and(|c| OFF_DUTY_CATEGORIES.contains(&c));
                tracker.add_interval(span, !off_duty);
            } else if name == SPARSE_CORE_OP_LINE_NAME {
                tracker.add_interval(span, true);
            } else if name == XLA_MODULE_LINE_NAME || name == SPARSE_CORE_MODULE_LINE_NAME {
                tracker.add_interval(span, false);
            }
        }
    }
    tracker
}

#[derive(Debug, Default)]
struct DeviceTraceResult {
    duty_cycle_tracker: DutyCycleTracker,
    core_details: Option<CoreDetails>,
}

/// Converts `space` on a worker pool sized to the machine.
#[must_use]
pub fn convert_xspace_to_op_stats(space: &XSpace, options: &OpStatsOptions) -> OpStats {
    convert_xspace_to_op_stats_with_executor(space, options, &Executor::default())
}

/// Converts `space`, running per-plane extraction on `executor`.
///
/// # Panics
///
/// Panics when an extraction task hits a violated invariant (for example
/// self time above total time); partial results are never returned.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn convert_xspace_to_op_stats_with_executor(
    space: &XSpace,
    options: &OpStatsOptions,
    executor: &Executor,
) -> OpStats {
    let (device_planes, is_tpu) = classify_device_planes(space);
    let mut op_stats = OpStats {
        run_environment: run_environment(space, &device_planes, is_tpu),
        diagnostics: Diagnostics::from_space(space),
        ..OpStats::default()
    };

    let has_device = !device_planes.is_empty();
    let hostname = hostname(space);
    if has_device && !is_tpu {
        op_stats.core_id_to_details.insert(
            DEFAULT_GPU_LOCAL_CORE_ID,
            CoreDetails { hostname: hostname.clone(), ..CoreDetails::default() },
        );
    }
    info!(
        "Converting {} {} planes",
        device_planes.len(),
        if is_tpu { "TPU" } else { "GPU" }
    );

    let hlo_module_map = if options.generate_kernel_stats_db
        || (is_tpu && options.generate_op_metrics_db)
    {
        // TPU keeps the counters measured by the hardware.
        let cost = if is_tpu { None } else { cost_analysis_for(GPU_COST_ANALYSIS_KEY) };
        HloModuleMap::build(&space.programs, cost.as_deref())
    } else {
        HloModuleMap::default()
    };

    if options.generate_op_metrics_db {
        op_stats.perf_env = device_planes.first().map(|&plane| perf_env_from_xplane(plane));
    }

    // ------------------------------------------------------------------------
    // Parallel phase: one task per plane per kind, each with its own slot.
    // ------------------------------------------------------------------------
    let slots = |enabled: bool| if enabled { device_planes.len() } else { 0 };
    let mut op_metrics_dbs: Vec<OpMetricsDb> =
        vec![OpMetricsDb::default(); slots(options.generate_op_metrics_db)];
    let mut device_step_events: Vec<StepEvents> =
        vec![StepEvents::default(); slots(options.generate_step_db)];
    let mut kernel_reports: Vec<KernelReportMap> =
        vec![KernelReportMap::default(); slots(options.generate_kernel_stats_db)];
    let mut device_trace_results: Vec<DeviceTraceResult> =
        std::iter::repeat_with(DeviceTraceResult::default).take(device_planes.len()).collect();
    {
        let map = &hlo_module_map;
        let hostname = hostname.as_str();
        let mut tasks: Vec<Task<'_>> = Vec::new();
        for (slot, &plane) in op_metrics_dbs.iter_mut().zip(&device_planes) {
            tasks.push(Box::new(move || {
                *slot = convert_device_trace_xplane_to_op_metrics_db(plane, map);
            }));
        }
        for (slot, &plane) in device_step_events.iter_mut().zip(&device_planes) {
            tasks.push(Box::new(move || {
                *slot = convert_device_trace_xplane_to_step_events(plane);
            }));
        }
        for (slot, &plane) in kernel_reports.iter_mut().zip(&device_planes) {
            tasks.push(Box::new(move || {
                *slot = convert_device_trace_xplane_to_kernel_reports(plane, map);
            }));
        }
        for (slot, &plane) in device_trace_results.iter_mut().zip(&device_planes) {
            tasks.push(Box::new(move || {
                *slot = DeviceTraceResult {
                    duty_cycle_tracker: construct_duty_cycle_tracker(plane),
                    core_details: core_details_from_xplane(plane, hostname),
                };
            }));
        }
        executor.run_all(tasks);
    }

    // ------------------------------------------------------------------------
    // Sequential combine.
    // ------------------------------------------------------------------------
    {
        let mut combiner = OpMetricsDbCombiner::new(&mut op_stats.device_op_metrics_db);
        for db in &op_metrics_dbs {
            combiner.combine(db, true);
        }
    }

    let mut step_events = StepEvents::new();
    let mut any_plane_had_steps = false;
    if is_tpu {
        // Planes without steps do not veto the others.
        let mut common: Option<StepEvents> = None;
        for plane_steps in device_step_events.iter().filter(|s| !s.is_empty()) {
            any_plane_had_steps = true;
            match common.as_mut() {
                None => common = Some(plane_steps.clone()),
                Some(acc) => acc.intersect(plane_steps),
            }
        }
        step_events = common.unwrap_or_default();
    } else {
        for plane_steps in &device_step_events {
            step_events.union(plane_steps);
        }
    }

    let mut reports = KernelReportMap::new();
    for plane_reports in kernel_reports {
        for (key, value) in plane_reports {
            insert_or_update_kernel_report(&mut reports, key, &value);
        }
    }

    if is_tpu {
        let mut duty_cycle = DutyCycleCombiner::new();
        for (plane, result) in device_planes.iter().zip(&device_trace_results) {
            if let Some(details) = &result.core_details {
                op_stats.core_id_to_details.insert(plane.id, details.clone());
                duty_cycle.combine_core(&result.duty_cycle_tracker, details.local_chip_id);
            } else {
                warn!("No core details for TPU plane {}", plane.name);
                duty_cycle.combine_chip(&result.duty_cycle_tracker);
            }
        }
        let db = &mut op_stats.device_op_metrics_db;
        db.idle_time_ps = duty_cycle.total_idle_time_ps();
        db.busy_time_ps = duty_cycle.total_active_time_ps();
    } else {
        for (plane, result) in device_planes.iter().zip(&device_trace_results) {
            if let Some(details) = &result.core_details {
                op_stats.core_id_to_details.insert(plane.id, details.clone());
            }
        }
    }

    op_stats.run_environment.is_training = is_training_run(&space.programs);

    if options.generate_kernel_stats_db {
        op_stats.kernel_stats_db = copy_top_k_duration_kernel_reports_to_db(&reports);
    }

    // ------------------------------------------------------------------------
    // Host plane.
    // ------------------------------------------------------------------------
    if let Some(host_plane) = space.find_plane_with_name(HOST_THREADS_PLANE_NAME) {
        if options.generate_op_metrics_db {
            op_stats.host_op_metrics_db = convert_host_threads_xplane_to_op_metrics_db(host_plane);
        }
        if options.generate_step_db && !has_device {
            let host_step_events = convert_host_threads_xplane_to_step_events(host_plane, None);
            debug!("{} host steps", host_step_events.len());
            step_events.union(&host_step_events);
        }
        op_stats.performance_counter_result = performance_counter_result(host_plane);
        for line in &host_plane.lines {
            let line_db = convert_host_threads_xline_to_tf_function_db(host_plane, line);
            combine_tf_function_db(&line_db, &mut op_stats.tf_function_db);
        }
    }

    // ------------------------------------------------------------------------
    // Step database.
    // ------------------------------------------------------------------------
    if options.generate_step_db {
        if is_tpu {
            // Step-line group ids already exclude truncated steps.
            op_stats.step_db = convert_step_events_to_step_db(has_device, false, &step_events);
            op_stats.step_db.empty_intersect = any_plane_had_steps && step_events.is_empty();
            op_stats.device_op_metrics_db.precision_stats = Some(step_events.precision_stats());
            let mut combiner =
                OpMetricsDbCombiner::new(&mut op_stats.hlo_metrics_db_complete_steps_only);
            for step in &op_stats.step_db.step_sequence {
                combiner.combine(&step.hlo_metrics_db, true);
            }
        } else {
            let non_overlapped = step_events.to_non_overlapped(options.overlap_priority);
            op_stats.step_db = convert_step_events_to_step_db(
                has_device,
                options.maybe_drop_incomplete_steps,
                &non_overlapped,
            );
            op_stats.device_op_metrics_db.precision_stats =
                Some(non_overlapped.precision_stats());
        }
    }

    op_stats.program_id_to_name_map =
        space.programs.iter().map(|p| (p.program_id, p.name.clone())).collect();

    info!(
        "Op stats: {} device ops, {} host ops, {} steps",
        op_stats.device_op_metrics_db.metrics_db.len(),
        op_stats.host_op_metrics_db.metrics_db.len(),
        op_stats.step_db.step_sequence.len()
    );
    op_stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use opstats_common::schema::STEP_LINE_NAME;
    use opstats_common::{stat, XPlaneBuilder};

    fn all_options() -> OpStatsOptions {
        OpStatsOptions {
            generate_op_metrics_db: true,
            generate_step_db: true,
            generate_kernel_stats_db: false,
            maybe_drop_incomplete_steps: false,
            overlap_priority: OverlapPriority::Innermost,
        }
    }

    fn tpu_plane(id: u32, name: &str, steps: &[u64], chip: Option<u32>) -> XPlane {
        let mut b = XPlaneBuilder::new(id, name);
        if let Some(chip) = chip {
            b.add_plane_stat(StatType::CoreDetails, format!(r#"{{"local_chip_id": {chip}}}"#));
        }
        let op = b.event_metadata("fusion.1");
        b.add_metadata_stat(op, StatType::ProgramId, 1u64);
        b.add_metadata_stat(op, StatType::SymbolId, 5u64);
        b.add_line(1, XLA_OP_LINE_NAME, 0);
        b.add_line(2, STEP_LINE_NAME, 0);
        b.add_line(3, XLA_MODULE_LINE_NAME, 0);
        for &step in steps {
            let begin = step * 100;
            let group = || vec![stat(StatType::GroupId, step)];
            b.add_named_event(2, &step.to_string(), begin, 100, group());
            b.add_event(1, op, begin, 40, group());
            b.add_named_event(3, "jit_step", begin, 100, Vec::new());
        }
        b.build()
    }

    #[test]
    fn test_duty_cycle_tracker_line_semantics() {
        let mut b = XPlaneBuilder::new(0, "/device:TPU:0");
        b.add_line(1, XLA_OP_LINE_NAME, 0);
        b.add_named_event(1, "fusion", 0, 40, Vec::new());
        b.add_named_event(1, "infeed", 50, 10, vec![stat(StatType::HloCategory, "infeed")]);
        b.add_line(2, XLA_MODULE_LINE_NAME, 0);
        b.add_named_event(2, "module", 0, 100, Vec::new());
        let tracker = construct_duty_cycle_tracker(&b.build());
        assert_eq!(tracker.total_active_time_ps(), 40);
        assert_eq!(tracker.total_idle_time_ps(), 60);
    }

    #[test]
    fn test_tpu_intersection_and_duty_cycle() {
        let space = XSpace {
            planes: vec![
                tpu_plane(0, "/device:TPU:0", &[1, 2], Some(0)),
                tpu_plane(1, "/device:TPU:1", &[2, 3], Some(0)),
                tpu_plane(2, "/device:TPU:2", &[], None),
            ],
            ..XSpace::default()
        };
        let op_stats = convert_xspace_to_op_stats_with_executor(
            &space,
            &all_options(),
            &Executor::new("test", 2),
        );
        let steps: Vec<u64> = op_stats.step_db.step_sequence.iter().map(|s| s.step_num).collect();
        assert_eq!(steps, vec![2]);
        assert!(!op_stats.step_db.empty_intersect);
        assert_eq!(op_stats.run_environment.device_core_count, 3);
        // Both cores on chip 0: active where either core ran an op.
        let db = &op_stats.device_op_metrics_db;
        assert_eq!(db.busy_time_ps, 40 + 40 + 40);
        assert_eq!(db.idle_time_ps, 300 - 120);
        assert!(db.idle_op().is_none());
        assert_eq!(db.find(1, "fusion.1").unwrap().occurrences, 4);
        assert_eq!(op_stats.core_id_to_details.len(), 2);
        let complete = &op_stats.hlo_metrics_db_complete_steps_only;
        assert_eq!(complete.find(1, "fusion.1").unwrap().occurrences, 2);
    }

    #[test]
    fn test_tpu_disjoint_steps_flag_empty_intersect() {
        let space = XSpace {
            planes: vec![
                tpu_plane(0, "/device:TPU:0", &[1], Some(0)),
                tpu_plane(1, "/device:TPU:1", &[2], Some(1)),
            ],
            ..XSpace::default()
        };
        let op_stats = convert_xspace_to_op_stats(&space, &all_options());
        assert!(op_stats.step_db.step_sequence.is_empty());
        assert!(op_stats.step_db.use_incomplete_step);
        assert!(op_stats.step_db.empty_intersect);
    }

    #[test]
    fn test_diagnostics_deduplicated() {
        let space = XSpace {
            errors: vec!["b".to_string(), "a".to_string(), "b".to_string()],
            warnings: vec!["w".to_string(), "w".to_string()],
            ..XSpace::default()
        };
        let op_stats = convert_xspace_to_op_stats(&space, &OpStatsOptions::default());
        assert_eq!(op_stats.diagnostics.errors, vec!["a", "b"]);
        assert_eq!(op_stats.diagnostics.warnings, vec!["w"]);
        assert_eq!(op_stats.run_environment.device_type, "CPU");
    }

    #[test]
    fn test_options_from_partial_json() {
        let json = r#"{"generate_step_db": true, "overlap_priority": "highest_event_type"}"#;
        let options: OpStatsOptions = serde_json::from_str(json).unwrap();
        assert!(options.generate_step_db);
        assert!(!options.generate_op_metrics_db);
        assert_eq!(options.overlap_priority, OverlapPriority::HighestEventType);
    }
}

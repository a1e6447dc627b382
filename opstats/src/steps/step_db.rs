//! Step database construction.
//!
//! Turns a combined [`StepEvents`] map into the ordered step sequence of the
//! final report:
//!
//! ```text
//!   StepEvents {1, 2, 3, 4}
//!        │  drop truncated edges (device runs, on request)
//!        ▼
//!   steps 2, 3 ──► PerCoreStepInfo { per-core timing + breakdown, step db }
//! ```
//!
//! A step is described one of two ways:
//!
//! | Step has             | Entries        | Breakdown                                 |
//! |----------------------|----------------|-------------------------------------------|
//! | typed event spans    | one, at core 0 | span time clipped to the step, rest Unknown |
//! | only per-core op dbs | one per core   | busy self time as compute, rest Unknown   |

use std::collections::BTreeMap;

use log::{debug, info};
use serde::Serialize;

use crate::domain::{Timespan, SPARSE_CORE_INDEX_START};
use crate::metrics::op_metrics::OpMetricsDb;
use crate::metrics::op_metrics_db_combiner::OpMetricsDbCombiner;
use crate::steps::event_span::EventType;
use crate::steps::step_events::{StepDetails, StepEvents};

/// Timing of one step on one core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepInfoResult {
    pub step_num: u64,
    pub step_name: String,
    pub begin_ps: u64,
    pub duration_ps: u64,
    /// Time per kind of work; sums to `duration_ps`.
    pub step_breakdown: BTreeMap<EventType, u64>,
}

/// One retained step across every core.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerCoreStepInfo {
    pub step_num: u64,
    pub step_info_per_core: BTreeMap<u32, StepInfoResult>,
    /// Every core's op metrics for this step, combined.
    pub hlo_metrics_db: OpMetricsDb,
    /// Core id → replica (base tensor-core) id.
    pub core_id_to_replica_id_map: BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepDatabase {
    pub step_sequence: Vec<PerCoreStepInfo>,
    /// No steps were found; consumers treat the whole trace as one step.
    pub use_incomplete_step: bool,
    pub num_steps_dropped: u32,
    /// TPU planes had steps but none was common to all of them.
    pub empty_intersect: bool,
}

/// Builds the step database from combined step events.
///
/// With `maybe_drop_incomplete_steps` on a device run, a first (last) step
/// that does not begin (end) at the earliest (latest) observed time is
/// treated as truncated and dropped.
#[must_use]
pub fn convert_step_events_to_step_db(
    has_device: bool,
    maybe_drop_incomplete_steps: bool,
    step_events: &StepEvents,
) -> StepDatabase {
    if step_events.is_empty() {
        info!("No steps found, the whole trace counts as one incomplete step");
        return StepDatabase { use_incomplete_step: true, ..StepDatabase::default() };
    }

    let mut retained: Vec<(u64, &StepDetails)> = step_events.iter().collect();
    let mut num_steps_dropped = 0;
    if maybe_drop_incomplete_steps && has_device {
        let observed = observed_timespan(step_events);
        let first_truncated =
            retained.first().is_some_and(|(_, d)| d.step_time().begin_ps() != observed.begin_ps());
        if first_truncated {
            let (id, _) = retained.remove(0);
            debug!("Dropping truncated first step {id}");
            num_steps_dropped += 1;
        }
        if retained.last().is_some_and(|(_, d)| d.step_time().end_ps() != observed.end_ps()) {
            if let Some((id, _)) = retained.pop() {
                debug!("Dropping truncated last step {id}");
                num_steps_dropped += 1;
            }
        }
    }

    let step_sequence: Vec<PerCoreStepInfo> = retained
        .into_iter()
        .filter_map(|(step_num, details)| convert_step_details(step_num, details, has_device))
        .collect();
    debug!(
        "Step database: {} steps, {num_steps_dropped} dropped",
        step_sequence.len()
    );
    StepDatabase {
        step_sequence,
        use_incomplete_step: false,
        num_steps_dropped,
        empty_intersect: false,
    }
}

/// Envelope of every marker and event of every step.
fn observed_timespan(step_events: &StepEvents) -> Timespan {
    let mut observed = Timespan::default();
    for (_, details) in step_events.iter() {
        for marker in details.markers() {
            observed.expand_to_include(&marker.span);
        }
        for event in details.events() {
            observed.expand_to_include(&event.span);
        }
    }
    observed
}

fn convert_step_details(
    step_num: u64,
    details: &StepDetails,
    has_device: bool,
) -> Option<PerCoreStepInfo> {
    let step_time = details.step_time();
    if step_time.duration_ps() == 0 {
        debug!("Skipping step {step_num} without duration");
        return None;
    }

    let mut info = PerCoreStepInfo { step_num, ..PerCoreStepInfo::default() };
    {
        let mut combiner = OpMetricsDbCombiner::new(&mut info.hlo_metrics_db);
        for db in details.per_core_op_metrics_db().values() {
            combiner.combine(db, true);
        }
    }
    for &core_id in details.per_core_op_metrics_db().keys() {
        info.core_id_to_replica_id_map.insert(core_id, replica_id(core_id));
    }

    if details.events().is_empty() {
        let compute = if has_device { EventType::DeviceCompute32 } else { EventType::HostCompute };
        for (&core_id, db) in details.per_core_op_metrics_db() {
            let busy_ps = db.busy_self_time_ps().min(step_time.duration_ps());
            let mut step_breakdown = BTreeMap::new();
            step_breakdown.insert(compute, busy_ps);
            step_breakdown.insert(EventType::Unknown, step_time.duration_ps() - busy_ps);
            info.step_info_per_core.insert(
                core_id,
                StepInfoResult {
                    step_num,
                    step_name: details.step_name().to_string(),
                    begin_ps: step_time.begin_ps(),
                    duration_ps: step_time.duration_ps(),
                    step_breakdown,
                },
            );
        }
        return (!info.step_info_per_core.is_empty()).then_some(info);
    }

    let step_breakdown = event_breakdown(details, step_time);
    if !is_well_formed(&step_breakdown, has_device) {
        let side = if has_device { "device" } else { "host" };
        debug!("Skipping step {step_num} without {side} compute");
        return None;
    }
    info.step_info_per_core.insert(
        0,
        StepInfoResult {
            step_num,
            step_name: details.step_name().to_string(),
            begin_ps: step_time.begin_ps(),
            duration_ps: step_time.duration_ps(),
            step_breakdown,
        },
    );
    Some(info)
}

/// Event time clipped to the step, with the unattributed remainder as
/// [`EventType::Unknown`].
fn event_breakdown(details: &StepDetails, step_time: Timespan) -> BTreeMap<EventType, u64> {
    let mut breakdown: BTreeMap<EventType, u64> = BTreeMap::new();
    let mut attributed_ps = 0;
    for event in details.events() {
        let overlap_ps = step_time.overlapped_duration_ps(&event.span);
        if overlap_ps > 0 {
            *breakdown.entry(event.event_type).or_default() += overlap_ps;
            attributed_ps += overlap_ps;
        }
    }
    let unknown_ps = step_time.duration_ps().saturating_sub(attributed_ps);
    if unknown_ps > 0 {
        *breakdown.entry(EventType::Unknown).or_default() += unknown_ps;
    }
    breakdown
}

fn is_well_formed(breakdown: &BTreeMap<EventType, u64>, has_device: bool) -> bool {
    breakdown.iter().any(|(&event_type, &ps)| {
        ps > 0 && if has_device { event_type.is_device() } else { event_type.is_host() }
    })
}

fn replica_id(core_id: u32) -> u32 {
    if core_id >= SPARSE_CORE_INDEX_START {
        core_id - SPARSE_CORE_INDEX_START
    } else {
        core_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::op_metrics::OpMetrics;
    use crate::steps::event_span::{EventTypeSpan, StepMarker, StepMarkerType};

    fn marked_step(events: &mut StepEvents, id: u64, begin: u64, duration: u64) {
        let details = events.step_mut(id);
        details.add_marker(StepMarker::new(
            StepMarkerType::DeviceStepMarker,
            "step",
            Timespan::new(begin, duration),
        ));
        details.add_event(EventTypeSpan::new(
            EventType::DeviceCompute32,
            Timespan::new(begin, duration / 2),
        ));
    }

    fn core_db(self_time_ps: u64) -> OpMetricsDb {
        OpMetricsDb {
            metrics_db: vec![OpMetrics {
                occurrences: 1,
                time_ps: self_time_ps,
                self_time_ps,
                num_cores: 1,
                ..OpMetrics::new(1, "fusion.1")
            }],
            total_op_time_ps: self_time_ps,
            ..OpMetricsDb::default()
        }
    }

    #[test]
    fn test_empty_step_events() {
        let db = convert_step_events_to_step_db(true, true, &StepEvents::new());
        assert!(db.use_incomplete_step);
        assert!(db.step_sequence.is_empty());
    }

    #[test]
    fn test_events_breakdown_with_unknown_remainder() {
        let mut events = StepEvents::new();
        marked_step(&mut events, 7, 0, 100);
        events.step_mut(7).add_event(EventTypeSpan::new(
            EventType::HostToDevice,
            Timespan::new(90, 30),
        ));
        let db = convert_step_events_to_step_db(true, false, &events);
        assert!(!db.use_incomplete_step);
        let info = &db.step_sequence[0].step_info_per_core[&0];
        assert_eq!(info.step_num, 7);
        assert_eq!(info.duration_ps, 100);
        assert_eq!(info.step_breakdown[&EventType::DeviceCompute32], 50);
        assert_eq!(info.step_breakdown[&EventType::HostToDevice], 10);
        assert_eq!(info.step_breakdown[&EventType::Unknown], 40);
        assert_eq!(info.step_breakdown.values().sum::<u64>(), info.duration_ps);
    }

    #[test]
    fn test_truncated_edges_dropped() {
        let mut events = StepEvents::new();
        marked_step(&mut events, 1, 100, 100);
        marked_step(&mut events, 2, 200, 100);
        marked_step(&mut events, 3, 300, 100);
        // Work observed before the first marker and after the last one.
        let early = EventTypeSpan::new(EventType::HostCompute, Timespan::new(0, 50));
        let late = EventTypeSpan::new(EventType::HostCompute, Timespan::new(450, 50));
        events.step_mut(1).add_event(early);
        events.step_mut(3).add_event(late);

        let kept = convert_step_events_to_step_db(true, false, &events);
        assert_eq!(kept.step_sequence.len(), 3);
        assert_eq!(kept.num_steps_dropped, 0);

        let dropped = convert_step_events_to_step_db(true, true, &events);
        assert_eq!(dropped.num_steps_dropped, 2);
        assert_eq!(
            dropped.step_sequence.iter().map(|s| s.step_num).collect::<Vec<_>>(),
            vec![2]
        );

        let host_only = convert_step_events_to_step_db(false, true, &events);
        assert_eq!(host_only.num_steps_dropped, 0);
    }

    #[test]
    fn test_complete_edges_kept() {
        let mut events = StepEvents::new();
        marked_step(&mut events, 1, 0, 100);
        marked_step(&mut events, 2, 100, 100);
        let db = convert_step_events_to_step_db(true, true, &events);
        assert_eq!(db.num_steps_dropped, 0);
        assert_eq!(db.step_sequence.len(), 2);
    }

    #[test]
    fn test_per_core_steps_and_replica_map() {
        let mut events = StepEvents::new();
        let details = events.step_mut(4);
        details.add_marker(StepMarker::new(
            StepMarkerType::DeviceStepMarker,
            "4",
            Timespan::new(0, 100),
        ));
        details.add_step_op_metrics(2, &core_db(60));
        details.add_step_op_metrics(2 + SPARSE_CORE_INDEX_START, &core_db(150));

        let db = convert_step_events_to_step_db(true, false, &events);
        let step = &db.step_sequence[0];
        let tensor_core = &step.step_info_per_core[&2];
        assert_eq!(tensor_core.step_breakdown[&EventType::DeviceCompute32], 60);
        assert_eq!(tensor_core.step_breakdown[&EventType::Unknown], 40);
        // Busy time is clamped to the step.
        let sparse_core = &step.step_info_per_core[&(2 + SPARSE_CORE_INDEX_START)];
        assert_eq!(sparse_core.step_breakdown[&EventType::DeviceCompute32], 100);
        assert_eq!(step.core_id_to_replica_id_map[&(2 + SPARSE_CORE_INDEX_START)], 2);
        let combined = step.hlo_metrics_db.find(1, "fusion.1").unwrap();
        assert_eq!(combined.num_cores, 2);
        assert_eq!(combined.self_time_ps, 210);
    }

    #[test]
    fn test_step_without_relevant_compute_skipped() {
        let mut events = StepEvents::new();
        let host = EventTypeSpan::new(EventType::HostCompute, Timespan::new(0, 10));
        events.step_mut(1).add_event(host);
        assert!(convert_step_events_to_step_db(true, false, &events).step_sequence.is_empty());
        assert_eq!(convert_step_events_to_step_db(false, false, &events).step_sequence.len(), 1);
    }
}

//! Step reconstruction from one plane.
//!
//! # Device planes
//!
//! ```text
//!   Steps       [====== group 1 ======)[====== group 2 ======)   markers
//!   XLA Ops       [op a)[op b)  [op a)   [op c)      [op a)      per-core dbs
//!   stream:N      [kernel)  [memcpy)       [kernel)               event spans (GPU)
//! ```
//!
//! The step line decides which steps exist: a plane without step-line
//! events yields no steps at all. On TPU, marker steps with no op events
//! are dropped once the op line has any grouped events.
//!
//! # Host planes
//!
//! Host events are keyed by their `group_id` stat. Named step scopes become
//! markers, real compute becomes event spans, and framework ops under an
//! executor scope become the host core's per-step op metrics. When a device
//! snapshot is given, only host steps also seen on the device are kept.

use std::collections::BTreeMap;

use log::debug;
use opstats_common::schema::{
    DERIVED_LINE_NAMES, EXECUTOR_STATE_PROCESS_EVENT, HOST_DISPATCH_EVENTS,
    SPARSE_CORE_OP_LINE_NAME, SPARSE_CORE_STEP_LINE_NAME, STEP_LINE_NAME, TRACE_CONTEXT_EVENT,
    XLA_OP_LINE_NAME,
};
use opstats_common::{EventView, StatType, XLine, XPlane};

use crate::convert::op_metrics_db::enter_host_ops;
use crate::domain::{Timespan, DEFAULT_HOST_CORE_ID, SPARSE_CORE_INDEX_START};
use crate::metrics::op_metrics::OpMetricsDb;
use crate::metrics::op_metrics_db_builder::HostOpMetricsDbBuilder;
use crate::metrics::xevent_op_metrics::XEventsOpMetricsDbBuilder;
use crate::steps::event_span::{
    classify_cpu_event, classify_gpu_event, EventTypeSpan, StepMarker, StepMarkerType,
};
use crate::steps::step_events::StepEvents;

fn group_id(event: &EventView<'_>) -> Option<u64> {
    event.stat(StatType::GroupId).and_then(|v| v.as_u64())
}

// ============================================================================
// Device
// ============================================================================

/// Step events of one device plane.
#[must_use]
pub fn convert_device_trace_xplane_to_step_events(plane: &XPlane) -> StepEvents {
    if plane.is_sparse_core() {
        tpu_step_events(
            plane,
            SPARSE_CORE_STEP_LINE_NAME,
            &[SPARSE_CORE_STEP_LINE_NAME, SPARSE_CORE_OP_LINE_NAME],
            plane.id + SPARSE_CORE_INDEX_START,
        )
    } else if plane.name.starts_with(opstats_common::schema::TPU_PLANE_PREFIX) {
        tpu_step_events(plane, STEP_LINE_NAME, &[XLA_OP_LINE_NAME], plane.id)
    } else {
        gpu_step_events(plane)
    }
}

/// One marker per grouped step-line event.
fn step_markers(plane: &XPlane, line: &XLine) -> StepEvents {
    let mut result = StepEvents::new();
    for event in plane.events(line) {
        let Some(group_id) = group_id(&event) else {
            continue;
        };
        let details = result.step_mut(group_id);
        details.add_marker(StepMarker::new(
            StepMarkerType::DeviceStepMarker,
            event.name(),
            Timespan::from_event(&event),
        ));
        if let Some(name) = event.stat(StatType::StepName).and_then(|v| v.as_str()) {
            details.set_step_name(name);
        }
    }
    result
}

fn tpu_step_events(
    plane: &XPlane,
    step_line_name: &str,
    op_line_names: &[&str],
    core_id: u32,
) -> StepEvents {
    let Some(step_line) = plane.line_by_name(step_line_name).filter(|l| !l.events.is_empty())
    else {
        debug!("No {step_line_name} events on {}", plane.name);
        return StepEvents::new();
    };
    let mut result = step_markers(plane, step_line);

    let mut builders: BTreeMap<u64, XEventsOpMetricsDbBuilder> = BTreeMap::new();
    for line in plane.lines.iter().filter(|l| op_line_names.contains(&l.name.as_str())) {
        for event in plane.events(line) {
            if let Some(group_id) = group_id(&event) {
                builders.entry(group_id).or_default().add_op_metric(&event);
            }
        }
    }
    if builders.is_empty() {
        return result;
    }
    result.retain(|id, _| builders.contains_key(&id));
    for (group_id, builder) in builders {
        if result.contains(group_id) {
            result.step_mut(group_id).add_step_op_metrics(core_id, &builder.finalize());
        }
    }
    result
}

fn gpu_step_events(plane: &XPlane) -> StepEvents {
    let Some(step_line) = plane.line_by_name(STEP_LINE_NAME).filter(|l| !l.events.is_empty())
    else {
        debug!("No {STEP_LINE_NAME} events on {}", plane.name);
        return StepEvents::new();
    };
    let mut result = step_markers(plane, step_line);
    for line in plane.lines.iter().filter(|l| !DERIVED_LINE_NAMES.contains(&l.name.as_str())) {
        for event in plane.events(line) {
            let Some(group_id) = group_id(&event).filter(|id| result.contains(*id)) else {
                continue;
            };
            let tensor_shapes =
                event.stat(StatType::TensorShapes).and_then(|v| v.as_str()).unwrap_or("");
            result.step_mut(group_id).add_event(EventTypeSpan::new(
                classify_gpu_event(event.name(), tensor_shapes),
                Timespan::from_event(&event),
            ));
        }
    }
    result
}

// ============================================================================
// Host
// ============================================================================

/// A named host step scope (`train…`, `test…`, trace context), not a path.
#[must_use]
pub fn is_explicit_host_step_marker(event_name: &str) -> bool {
    (event_name.starts_with("train")
        || event_name.starts_with("test")
        || event_name.starts_with(TRACE_CONTEXT_EVENT))
        && !event_name.contains('/')
}

/// Neither a dispatch wrapper nor a step scope.
#[must_use]
pub fn is_real_cpu_compute(event_name: &str) -> bool {
    !HOST_DISPATCH_EVENTS.contains(&event_name) && !is_explicit_host_step_marker(event_name)
}

/// Step events of the host threads plane.
///
/// With `device_step_events`, host steps whose id the device never saw are
/// discarded, and correlated events classify as host preparation.
#[must_use]
pub fn convert_host_threads_xplane_to_step_events(
    plane: &XPlane,
    device_step_events: Option<&StepEvents>,
) -> StepEvents {
    let mut result = StepEvents::new();
    for line in &plane.lines {
        result.union(&host_line_step_events(plane, line, device_step_events));
    }
    result
}

fn host_line_step_events(
    plane: &XPlane,
    line: &XLine,
    device_step_events: Option<&StepEvents>,
) -> StepEvents {
    let has_device = device_step_events.is_some();
    let mut result = StepEvents::new();
    let mut executor_scopes: BTreeMap<u64, Vec<Timespan>> = BTreeMap::new();
    for event in plane.events(line) {
        let Some(group_id) = group_id(&event) else {
            continue;
        };
        if device_step_events.is_some_and(|device| !device.contains(group_id)) {
            continue;
        }
        let name = event.name();
        let span = Timespan::from_event(&event);
        let step_name = event.stat(StatType::StepName).and_then(|v| v.as_str());
        let details = result.step_mut(group_id);
        if is_explicit_host_step_marker(name) {
            details.add_marker(StepMarker::new(StepMarkerType::ExplicitHostStepMarker, name, span));
        } else if step_name.is_some() {
            details.add_marker(StepMarker::new(StepMarkerType::ImplicitHostStepMarker, name, span));
        } else if is_real_cpu_compute(name) {
            let has_correlation_id = event.stat(StatType::CorrelationId).is_some();
            details.add_event(EventTypeSpan::new(
                classify_cpu_event(name, has_device, has_correlation_id),
                span,
            ));
        }
        if let Some(step_name) = step_name {
            details.set_step_name(step_name);
        }
        if name == EXECUTOR_STATE_PROCESS_EVENT {
            executor_scopes.entry(group_id).or_default().push(span);
        }
    }

    for (group_id, scopes) in executor_scopes {
        let mut db = OpMetricsDb::default();
        {
            let mut builder = HostOpMetricsDbBuilder::new(&mut db);
            let nested = plane.events(line).filter(|e| {
                group_id_matches(e, group_id)
                    && scopes.iter().any(|s| s.includes(&Timespan::from_event(e)))
            });
            enter_host_ops(&mut builder, nested);
        }
        if !db.is_empty() {
            db.total_time_ps = db.total_op_time_ps;
            result.step_mut(group_id).add_step_op_metrics(DEFAULT_HOST_CORE_ID, &db);
        }
    }
    result
}

/// Ungrouped events belong to whichever scope encloses them.
fn group_id_matches(event: &EventView<'_>, expected: u64) -> bool {
    group_id(event).is_none_or(|id| id == expected)
}

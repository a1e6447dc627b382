//! Plane → op-metrics db conversion.
//!
//! Three flavors, one per plane kind:
//!
//! | Plane | Source lines              | Total time                          | IDLE |
//! |-------|---------------------------|-------------------------------------|------|
//! | TPU   | `XLA Ops` / sparse ops    | profile duration stat, or envelope  | no   |
//! | GPU   | every non-derived stream  | max(envelope, op time)              | yes  |
//! | Host  | framework ops, per thread | max(Σ per-line envelopes, op time)  | yes  |
//!
//! TPU idle/busy comes from duty cycle instead of idle synthesis.

use opstats_common::schema::{
    DERIVED_LINE_NAMES, INFEED_ENQUEUE_OP_TYPE, SPARSE_CORE_OP_LINE_NAME, XLA_OP_LINE_NAME,
};
use opstats_common::{EventView, StatType, XLine, XPlane};

use crate::convert::hlo_module_map::HloModuleMap;
use crate::domain::Timespan;
use crate::metrics::op_metrics::{add_idle_op, OpMetricsDb, UNKNOWN_OP_CATEGORY};
use crate::metrics::op_metrics_db_builder::{
    set_metadata_from_instruction, DeviceOpEntry, DeviceOpMetricsDbBuilder,
    HostOpMetricsDbBuilder,
};
use crate::metrics::xevent_op_metrics::XEventsOpMetricsDbBuilder;

/// A framework op event name split into `name` and `Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameworkOp<'a> {
    pub name: &'a str,
    pub op_type: &'a str,
}

/// Parses `scope/name:Type`; names without a non-empty type are not ops.
#[must_use]
pub fn parse_framework_op(event_name: &str) -> Option<FrameworkOp<'_>> {
    let (name, op_type) = event_name.rsplit_once(':')?;
    if name.is_empty() || name.ends_with(':') || op_type.is_empty() || op_type.contains('/') {
        return None;
    }
    Some(FrameworkOp { name, op_type })
}

/// Visits items in nesting order, reporting for each the time covered by
/// its direct children.
///
/// Items are sorted by begin (enclosing first). An item is a child of the
/// innermost open item that fully includes it; partially overlapping items
/// close the open one. Children time never exceeds the parent's duration.
pub(crate) fn visit_nested<T>(
    mut items: Vec<(Timespan, T)>,
    mut visit: impl FnMut(T, Timespan, u64),
) {
    items.sort_by(|a, b| a.0.cmp(&b.0));
    let mut stack: Vec<(Timespan, T, u64)> = Vec::new();
    for (span, item) in items {
        while let Some((open, _, _)) = stack.last() {
            if open.includes(&span) {
                break;
            }
            if let Some((open, open_item, children)) = stack.pop() {
                visit(open_item, open, children);
            }
        }
        if let Some((open, _, children)) = stack.last_mut() {
            *children = (*children + span.duration_ps()).min(open.duration_ps());
        }
        stack.push((span, item, 0));
    }
    while let Some((open, item, children)) = stack.pop() {
        visit(item, open, children);
    }
}

/// Envelope of every event on a line.
fn line_envelope(plane: &XPlane, line: &XLine) -> Timespan {
    let mut envelope = Timespan::default();
    for event in plane.events(line) {
        envelope.expand_to_include(&Timespan::from_event(&event));
    }
    envelope
}

fn is_derived_line(line: &XLine) -> bool {
    DERIVED_LINE_NAMES.contains(&line.name.as_str())
}

// ============================================================================
// Device
// ============================================================================

/// Op-metrics db of one device plane (TPU or GPU by name).
#[must_use]
pub fn convert_device_trace_xplane_to_op_metrics_db(
    plane: &XPlane,
    hlo_module_map: &HloModuleMap,
) -> OpMetricsDb {
    if plane.name.starts_with(opstats_common::schema::TPU_PLANE_PREFIX) {
        convert_tpu_device_trace_xplane_to_op_metrics_db(plane, hlo_module_map)
    } else {
        convert_gpu_device_trace_xplane_to_op_metrics_db(plane, hlo_module_map)
    }
}

/// TPU (tensor-core or sparse-core) plane; no IDLE record is appended.
#[must_use]
pub fn convert_tpu_device_trace_xplane_to_op_metrics_db(
    plane: &XPlane,
    hlo_module_map: &HloModuleMap,
) -> OpMetricsDb {
    let mut builder = XEventsOpMetricsDbBuilder::new();
    let mut envelope = Timespan::default();
    for line in plane
        .lines
        .iter()
        .filter(|l| l.name == XLA_OP_LINE_NAME || l.name == SPARSE_CORE_OP_LINE_NAME)
    {
        for event in plane.events(line) {
            envelope.expand_to_include(&Timespan::from_event(&event));
            builder.add_op_metric(&event);
        }
    }
    let mut db = builder.finalize();
    for op in &mut db.metrics_db {
        if op.children.is_empty() {
            if let Some(instruction) = hlo_module_map.get_instruction(op.hlo_module_id, &op.name) {
                set_metadata_from_instruction(op, instruction);
            }
        }
    }
    db.total_time_ps = plane
        .stat(StatType::TotalProfileDurationPs)
        .and_then(|v| v.as_u64())
        .unwrap_or_else(|| envelope.duration_ps().max(db.total_op_time_ps));
    db
}

/// GPU plane: one occurrence per stream event, IDLE appended.
#[must_use]
pub fn convert_gpu_device_trace_xplane_to_op_metrics_db(
    plane: &XPlane,
    hlo_module_map: &HloModuleMap,
) -> OpMetricsDb {
    let mut db = OpMetricsDb::default();
    let mut envelope = Timespan::default();
    {
        let mut builder = DeviceOpMetricsDbBuilder::new(&mut db);
        for line in plane.lines.iter().filter(|l| !is_derived_line(l)) {
            for event in plane.events(line) {
                envelope.expand_to_include(&Timespan::from_event(&event));
                enter_gpu_event(&mut builder, &event, hlo_module_map);
            }
        }
    }
    db.total_time_ps = envelope.duration_ps().max(db.total_op_time_ps);
    add_idle_op(&mut db);
    db
}

fn enter_gpu_event(
    builder: &mut DeviceOpMetricsDbBuilder<'_>,
    event: &EventView<'_>,
    hlo_module_map: &HloModuleMap,
) {
    let str_stat = |stat_type| event.stat(stat_type).and_then(|v| v.as_str()).unwrap_or("");
    let program_id = event.stat(StatType::ProgramId).and_then(|v| v.as_u64()).unwrap_or(0);
    let hlo_op = str_stat(StatType::HloOp);
    let name = if hlo_op.is_empty() { event.name() } else { hlo_op };
    let instruction = hlo_module_map.get_instruction(program_id, name);
    let category = instruction.map_or_else(
        || {
            let category = str_stat(StatType::HloCategory);
            if category.is_empty() { UNKNOWN_OP_CATEGORY } else { category }
        },
        |i| i.category.as_str(),
    );
    let provenance =
        instruction.map_or_else(|| str_stat(StatType::TfOp), |i| i.provenance.as_str());
    builder.enter_op(&DeviceOpEntry {
        program_id,
        name,
        category,
        provenance,
        deduplicated_name: instruction.map_or("", |i| i.deduplicated_name.as_str()),
        is_eager: event.stat(StatType::IsEager).and_then(|v| v.as_bool()).unwrap_or(false),
        occurrences: event.num_occurrences(),
        time_ps: event.duration_ps(),
        children_time_ps: 0,
        flops: instruction.map_or(0, |i| i.flops),
        model_flops: instruction.map_or(0, |i| i.model_flops),
        bytes_accessed: instruction.map_or(0, |i| i.bytes_accessed),
        memory_accessed_breakdown: &[],
    });
    builder.enter_op_metadata_from_hlo_module_map(program_id, name, hlo_module_map);
}

// ============================================================================
// Host
// ============================================================================

/// Framework-op events of `line` in nesting order, fed to `builder`.
pub(crate) fn enter_host_ops<'a>(
    builder: &mut HostOpMetricsDbBuilder<'_>,
    events: impl IntoIterator<Item = EventView<'a>>,
) {
    let ops: Vec<(Timespan, EventView<'a>)> = events
        .into_iter()
        .filter(|e| parse_framework_op(e.name()).is_some())
        .map(|e| (Timespan::from_event(&e), e))
        .collect();
    visit_nested(ops, |event, span, children_time_ps| {
        if let Some(op) = parse_framework_op(event.name()) {
            let is_eager =
                event.stat(StatType::IsEager).and_then(|v| v.as_bool()).unwrap_or(false);
            builder.enter_op(op.name, op.op_type, is_eager, span.duration_ps(), children_time_ps);
        }
    });
}

/// Host threads plane: framework ops per thread, infeed enqueues, IDLE.
#[must_use]
pub fn convert_host_threads_xplane_to_op_metrics_db(plane: &XPlane) -> OpMetricsDb {
    let mut db = OpMetricsDb::default();
    let mut total_time_ps = 0;
    let mut infeed_enqueues: Vec<Timespan> = Vec::new();
    {
        let mut builder = HostOpMetricsDbBuilder::new(&mut db);
        for line in &plane.lines {
            total_time_ps += line_envelope(plane, line).duration_ps();
            infeed_enqueues.extend(
                plane
                    .events(line)
                    .filter(|e| {
                        parse_framework_op(e.name())
                            .is_some_and(|op| op.op_type == INFEED_ENQUEUE_OP_TYPE)
                    })
                    .map(|e| Timespan::from_event(&e)),
            );
            enter_host_ops(&mut builder, plane.events(line));
        }
        infeed_enqueues.sort();
        for span in infeed_enqueues {
            builder.enter_host_infeed_enqueue(span);
        }
    }
    db.total_time_ps = total_time_ps.max(db.total_op_time_ps);
    add_idle_op(&mut db);
    db
}

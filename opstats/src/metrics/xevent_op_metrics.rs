//! Op-metrics accumulation straight from hardware op events.
//!
//! Each event on an `XLA Ops` (or sparse-core step/op) line is keyed by its
//! `(program_id, symbol_id)` stats. The first occurrence of a key copies the
//! event metadata and its fusion tree; later occurrences only merge timing.
//! FLOPs and bytes are per-occurrence attributes and get scaled once, in
//! [`XEventsOpMetricsDbBuilder::finalize`].
//!
//! Sparse-core step events carry a `step_idle_time_ps` stat instead of an op
//! key. They fold into one synthetic busy record under the key
//! `(u64::MAX, u64::MAX)`, which no real program/symbol pair can reach.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use log::error;
use opstats_common::{EventView, StatType, XEventMetadata, XPlane};

use crate::metrics::op_metrics::{
    add_idle_op, combine_memory_breakdown, parse_memory_breakdown, source_info_or_log,
    OpMetrics, OpMetricsDb, PASS_THROUGH_OPCODES,
};

/// Name and category of the synthetic sparse-core busy record.
pub const SPARSE_CORE_BUSY_OPS: &str = "sparse_core_busy_ops";

/// Symbol id of a program's root; never a real op.
pub const ROOT_SYMBOL_ID: u64 = 0;

const SPARSE_CORE_BUSY_KEY: (u64, u64) = (u64::MAX, u64::MAX);

/// Builds an [`OpMetricsDb`] from op events, one record per op key.
#[derive(Debug, Default)]
pub struct XEventsOpMetricsDbBuilder {
    flat_op_metrics: BTreeMap<u64, BTreeMap<u64, OpMetrics>>,
}

impl XEventsOpMetricsDbBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flat_op_metrics.is_empty()
    }

    /// Accumulates one op event. Events without a program or symbol id, and
    /// root-symbol events, are ignored.
    ///
    /// # Panics
    ///
    /// Panics if a step-idle attribute exceeds the event duration, or a self
    /// duration exceeds the event duration.
    pub fn add_op_metric(&mut self, event: &EventView<'_>) {
        if let Some(idle_ps) = event.stat(StatType::StepIdleTimePs).and_then(|v| v.as_u64()) {
            let duration_ps = event.duration_ps();
            assert!(
                idle_ps <= duration_ps,
                "step idle time {idle_ps}ps exceeds event duration {duration_ps}ps"
            );
            let busy = OpMetrics {
                category: SPARSE_CORE_BUSY_OPS.to_string(),
                occurrences: 1,
                time_ps: duration_ps,
                self_time_ps: duration_ps - idle_ps,
                min_time_ps: duration_ps,
                num_cores: 1,
                ..OpMetrics::new(SPARSE_CORE_BUSY_KEY.0, SPARSE_CORE_BUSY_OPS)
            };
            let (program_id, symbol_id) = SPARSE_CORE_BUSY_KEY;
            self.insert_or_merge(program_id, symbol_id, busy, None);
            return;
        }

        let Some(program_id) = event.stat(StatType::ProgramId).and_then(|v| v.as_u64()) else {
            return;
        };
        let Some(symbol_id) = event.stat(StatType::SymbolId).and_then(|v| v.as_u64()) else {
            return;
        };
        if symbol_id == ROOT_SYMBOL_ID {
            return;
        }
        let metrics = op_metrics_from_event(event, program_id);
        self.insert_or_merge(program_id, symbol_id, metrics, Some(event));
    }

    fn insert_or_merge(
        &mut self,
        program_id: u64,
        symbol_id: u64,
        mut metrics: OpMetrics,
        event: Option<&EventView<'_>>,
    ) {
        match self.flat_op_metrics.entry(program_id).or_default().entry(symbol_id) {
            Entry::Vacant(slot) => {
                if let Some(event) = event {
                    set_metadata_from_event(&mut metrics, event);
                }
                slot.insert(metrics);
            }
            Entry::Occupied(mut slot) => merge_timing(&metrics, slot.get_mut()),
        }
    }

    /// Emits the accumulated records with FLOPs and bytes scaled by
    /// occurrences; `total_op_time_ps` is the sum of self times.
    #[must_use]
    pub fn finalize(self) -> OpMetricsDb {
        let mut db = OpMetricsDb::default();
        for by_symbol in self.flat_op_metrics.into_values() {
            for mut metrics in by_symbol.into_values() {
                scale_counters_by_occurrences(&mut metrics);
                db.total_op_time_ps += metrics.self_time_ps;
                db.metrics_db.push(metrics);
            }
        }
        db
    }

    /// Like [`Self::finalize`], then sets the total time and appends IDLE.
    #[must_use]
    pub fn finalize_with_total(self, total_time_ps: u64) -> OpMetricsDb {
        let mut db = self.finalize();
        db.total_time_ps = total_time_ps;
        add_idle_op(&mut db);
        db
    }
}

fn u64_stat(event: &EventView<'_>, stat_type: StatType) -> Option<u64> {
    event.stat(stat_type).and_then(|v| v.as_u64())
}

fn op_metrics_from_event(event: &EventView<'_>, program_id: u64) -> OpMetrics {
    let time_ps = event.duration_ps();
    let self_time_ps = u64_stat(event, StatType::SelfDurationPs).unwrap_or(time_ps);
    assert!(
        self_time_ps <= time_ps,
        "op {}: self time {self_time_ps}ps exceeds duration {time_ps}ps",
        event.name()
    );
    let flops = u64_stat(event, StatType::Flops).unwrap_or(0);
    let memory_accessed_breakdown = event
        .stat(StatType::MemoryAccessBreakdown)
        .and_then(|v| v.as_str())
        .and_then(|s| match parse_memory_breakdown(s) {
            Ok(breakdown) => Some(breakdown),
            Err(e) => {
                error!("{e}");
                None
            }
        })
        .unwrap_or_default();
    OpMetrics {
        hlo_module_id: program_id,
        occurrences: event.num_occurrences(),
        time_ps,
        self_time_ps,
        min_time_ps: u64_stat(event, StatType::MinDurationPs).unwrap_or(time_ps),
        dma_stall_ps: u64_stat(event, StatType::DmaStallDurationPs).unwrap_or(0),
        num_cores: 1,
        flops,
        model_flops: u64_stat(event, StatType::ModelFlops).unwrap_or(flops),
        bytes_accessed: u64_stat(event, StatType::BytesAccessed).unwrap_or(0),
        is_eager: event.stat(StatType::IsEager).and_then(|v| v.as_bool()).unwrap_or(false),
        memory_accessed_breakdown,
        ..OpMetrics::default()
    }
}

fn merge_timing(src: &OpMetrics, dst: &mut OpMetrics) {
    dst.occurrences += src.occurrences;
    dst.time_ps += src.time_ps;
    dst.self_time_ps += src.self_time_ps;
    dst.dma_stall_ps += src.dma_stall_ps;
    dst.min_time_ps = dst.min_time_ps.min(src.min_time_ps);
}

fn scale_counters_by_occurrences(metrics: &mut OpMetrics) {
    let n = metrics.occurrences;
    metrics.flops *= n;
    metrics.model_flops *= n;
    metrics.bytes_accessed *= n;
    for access in &mut metrics.memory_accessed_breakdown {
        access.bytes_accessed *= n;
    }
}

fn set_metadata_from_event(metrics: &mut OpMetrics, event: &EventView<'_>) {
    let Some(metadata) = event.metadata() else {
        metrics.name = event.name().to_string();
        return;
    };
    apply_metadata(metrics, metadata);
    metrics.children = children_from_metadata(event.plane(), metadata, metrics.hlo_module_id);
}

fn apply_metadata(metrics: &mut OpMetrics, metadata: &XEventMetadata) {
    let str_stat = |stat_type| metadata.stat(stat_type).and_then(|v| v.as_str()).unwrap_or("");
    if metadata.display_name.is_empty() {
        metrics.name.clone_from(&metadata.name);
    } else {
        metrics.name.clone_from(&metadata.display_name);
        metrics.long_name.clone_from(&metadata.name);
    }
    metrics.category = str_stat(StatType::HloCategory).to_string();
    metrics.provenance = str_stat(StatType::TfOp).to_string();
    metrics.deduplicated_name = str_stat(StatType::DeduplicatedName).to_string();
    let source = str_stat(StatType::SourceInfo);
    if !source.is_empty() {
        metrics.source_info = source_info_or_log(source, str_stat(StatType::SourceStack));
    }
}

/// A child whose category or opcode names a pass-through instruction.
fn is_pass_through(metadata: &XEventMetadata) -> bool {
    let category = metadata.stat(StatType::HloCategory).and_then(|v| v.as_str());
    let name =
        if metadata.display_name.is_empty() { &metadata.name } else { &metadata.display_name };
    let opcode = name.trim_start_matches('%').split(['.', ' ']).next().unwrap_or("");
    PASS_THROUGH_OPCODES.iter().any(|op| category == Some(*op) || opcode == *op)
}

/// Fusion tree below `metadata`, one occurrence per child, pass-through
/// children skipped at every level.
fn children_from_metadata(
    plane: &XPlane,
    metadata: &XEventMetadata,
    program_id: u64,
) -> Vec<OpMetrics> {
    metadata
        .child_ids
        .iter()
        .filter_map(|id| plane.metadata(*id))
        .filter(|child| !is_pass_through(child))
        .map(|child| {
            let u64_of = |stat_type| child.stat(stat_type).and_then(|v| v.as_u64()).unwrap_or(0);
            let mut metrics = OpMetrics::new(program_id, "");
            apply_metadata(&mut metrics, child);
            metrics.occurrences = 1;
            metrics.flops = u64_of(StatType::Flops);
            metrics.model_flops = child
                .stat(StatType::ModelFlops)
                .and_then(|v| v.as_u64())
                .unwrap_or(metrics.flops);
            metrics.bytes_accessed = u64_of(StatType::BytesAccessed);
            if let Some(breakdown) = child
                .stat(StatType::MemoryAccessBreakdown)
                .and_then(|v| v.as_str())
                .and_then(|s| parse_memory_breakdown(s).ok())
            {
                combine_memory_breakdown(&mut metrics.memory_accessed_breakdown, &breakdown, 1);
            }
            metrics.children = children_from_metadata(plane, child, program_id);
            metrics
        })
        .collect()
}

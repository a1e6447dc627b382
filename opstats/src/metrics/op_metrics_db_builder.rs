//! Keyed accumulation of operation statistics.
//!
//! [`OpMetricsDbBuilder`] borrows an [`OpMetricsDb`] and guarantees one
//! record per `(hlo_module_id, name)` key. The host and device builders wrap
//! it with their own entry points:
//!
//! - **Host**: module id fixed to 0, eager flag OR-ed across occurrences,
//!   plus an infeed-enqueue tracker over time-sorted enqueue spans.
//! - **Device**: keyed by program id, metadata attached once (first writer
//!   wins), FLOPs/bytes scaled by occurrences, memory breakdown merged.
//!
//! A fresh record has `occurrences == 0`; the first entry that touches a
//! record therefore sees an empty category and fills it.

use std::collections::HashMap;

use crate::convert::hlo_module_map::{HloInstructionInfo, HloModuleMap};
use crate::domain::Timespan;
use crate::metrics::op_metrics::{
    combine_memory_breakdown, MemoryAccessed, OpMetrics, OpMetricsDb, SourceInfo,
    UNKNOWN_OP_CATEGORY,
};

/// One record per `(hlo_module_id, name)` over a borrowed db.
#[derive(Debug)]
pub struct OpMetricsDbBuilder<'a> {
    db: &'a mut OpMetricsDb,
    index: HashMap<u64, HashMap<String, usize>>,
}

impl<'a> OpMetricsDbBuilder<'a> {
    /// Wraps `db`, indexing the records it already holds.
    pub fn new(db: &'a mut OpMetricsDb) -> Self {
        let mut index: HashMap<u64, HashMap<String, usize>> = HashMap::new();
        for (i, metrics) in db.metrics_db.iter().enumerate() {
            index.entry(metrics.hlo_module_id).or_default().insert(metrics.name.clone(), i);
        }
        Self { db, index }
    }

    /// Record for the key, created empty on first use.
    pub fn lookup_or_insert(&mut self, hlo_module_id: u64, name: &str) -> &mut OpMetrics {
        let slots = self.index.entry(hlo_module_id).or_default();
        let idx = if let Some(&idx) = slots.get(name) {
            idx
        } else {
            let idx = self.db.metrics_db.len();
            self.db.metrics_db.push(OpMetrics::new(hlo_module_id, name));
            slots.insert(name.to_string(), idx);
            idx
        };
        &mut self.db.metrics_db[idx]
    }

    #[must_use]
    pub fn db(&self) -> &OpMetricsDb {
        self.db
    }

    pub fn db_mut(&mut self) -> &mut OpMetricsDb {
        self.db
    }
}

// ============================================================================
// Host
// ============================================================================

/// Host-side accumulation: framework ops by name, plus infeed enqueues.
#[derive(Debug)]
pub struct HostOpMetricsDbBuilder<'a> {
    builder: OpMetricsDbBuilder<'a>,
    last_host_infeed_enqueue: Option<Timespan>,
}

impl<'a> HostOpMetricsDbBuilder<'a> {
    pub fn new(db: &'a mut OpMetricsDb) -> Self {
        Self { builder: OpMetricsDbBuilder::new(db), last_host_infeed_enqueue: None }
    }

    /// Records one occurrence of a host op.
    ///
    /// # Panics
    ///
    /// Panics if `children_time_ps` exceeds `time_ps`.
    pub fn enter_op(
        &mut self,
        name: &str,
        category: &str,
        is_eager: bool,
        time_ps: u64,
        children_time_ps: u64,
    ) {
        assert!(
            time_ps >= children_time_ps,
            "host op {name}: children time {children_time_ps}ps exceeds time {time_ps}ps"
        );
        let self_time_ps = time_ps - children_time_ps;
        let op = self.builder.lookup_or_insert(0, name);
        if op.category.is_empty() {
            op.category = category.to_string();
        }
        op.num_cores = 1;
        op.is_eager |= is_eager;
        op.min_time_ps = if op.occurrences == 0 { time_ps } else { op.min_time_ps.min(time_ps) };
        op.occurrences += 1;
        op.time_ps += time_ps;
        op.self_time_ps += self_time_ps;
        self.builder.db_mut().total_op_time_ps += self_time_ps;
    }

    /// Records one infeed enqueue; spans must arrive sorted and disjoint.
    ///
    /// # Panics
    ///
    /// Panics if `span` begins before the previous enqueue ended.
    pub fn enter_host_infeed_enqueue(&mut self, span: Timespan) {
        if let Some(last) = self.last_host_infeed_enqueue {
            assert!(
                span.begin_ps() >= last.end_ps(),
                "infeed enqueue {span} overlaps or precedes previous enqueue {last}"
            );
            let db = self.builder.db_mut();
            db.total_host_infeed_enq_duration_ps += last.duration_ps();
            db.total_host_infeed_enq_start_timestamp_ps_diff +=
                span.begin_ps() - last.begin_ps();
        }
        self.last_host_infeed_enqueue = Some(span);
    }

    #[must_use]
    pub fn db(&self) -> &OpMetricsDb {
        self.builder.db()
    }
}

// ============================================================================
// Device
// ============================================================================

/// One (possibly aggregated) device op observation.
#[derive(Debug, Clone, Default)]
pub struct DeviceOpEntry<'e> {
    pub program_id: u64,
    pub name: &'e str,
    pub category: &'e str,
    pub provenance: &'e str,
    pub deduplicated_name: &'e str,
    pub is_eager: bool,
    pub occurrences: u64,
    /// Total time over all occurrences.
    pub time_ps: u64,
    pub children_time_ps: u64,
    /// Per-occurrence counters.
    pub flops: u64,
    pub model_flops: u64,
    pub bytes_accessed: u64,
    pub memory_accessed_breakdown: &'e [MemoryAccessed],
}

/// Device-side accumulation keyed by `(program_id, name)`.
#[derive(Debug)]
pub struct DeviceOpMetricsDbBuilder<'a> {
    builder: OpMetricsDbBuilder<'a>,
}

impl<'a> DeviceOpMetricsDbBuilder<'a> {
    pub fn new(db: &'a mut OpMetricsDb) -> Self {
        Self { builder: OpMetricsDbBuilder::new(db) }
    }

    /// Accumulates one entry.
    ///
    /// # Panics
    ///
    /// Panics if the entry's children time exceeds its time.
    pub fn enter_op(&mut self, entry: &DeviceOpEntry<'_>) {
        assert!(
            entry.time_ps >= entry.children_time_ps,
            "device op {}: children time {}ps exceeds time {}ps",
            entry.name,
            entry.children_time_ps,
            entry.time_ps
        );
        let self_time_ps = entry.time_ps - entry.children_time_ps;
        let op = self.builder.lookup_or_insert(entry.program_id, entry.name);
        set_metadata_once(op, entry.category, entry.provenance, entry.deduplicated_name);
        op.num_cores = op.num_cores.max(1);
        op.is_eager |= entry.is_eager;
        if entry.occurrences > 0 {
            let per_occurrence_ps = entry.time_ps / entry.occurrences;
            op.min_time_ps = if op.occurrences == 0 {
                per_occurrence_ps
            } else {
                op.min_time_ps.min(per_occurrence_ps)
            };
        }
        op.occurrences += entry.occurrences;
        op.time_ps += entry.time_ps;
        op.self_time_ps += self_time_ps;
        op.flops += entry.flops * entry.occurrences;
        let model_flops = if entry.model_flops == 0 { entry.flops } else { entry.model_flops };
        op.model_flops += model_flops * entry.occurrences;
        op.bytes_accessed += entry.bytes_accessed * entry.occurrences;
        combine_memory_breakdown(
            &mut op.memory_accessed_breakdown,
            entry.memory_accessed_breakdown,
            entry.occurrences,
        );
        self.builder.db_mut().total_op_time_ps += self_time_ps;
    }

    /// Attaches metadata without touching counters.
    pub fn enter_op_metadata(
        &mut self,
        program_id: u64,
        name: &str,
        category: &str,
        provenance: &str,
        deduplicated_name: &str,
        is_eager: bool,
        source_info: Option<SourceInfo>,
    ) {
        let op = self.builder.lookup_or_insert(program_id, name);
        set_metadata_once(op, category, provenance, deduplicated_name);
        op.is_eager |= is_eager;
        if op.source_info.is_none() {
            op.source_info = source_info;
        }
    }

    /// Attaches metadata and the fusion tree of the matching hardware-module
    /// instruction; a name missing from the map is left untouched.
    pub fn enter_op_metadata_from_hlo_module_map(
        &mut self,
        program_id: u64,
        name: &str,
        hlo_module_map: &HloModuleMap,
    ) {
        if let Some(instruction) = hlo_module_map.get_instruction(program_id, name) {
            let op = self.builder.lookup_or_insert(program_id, name);
            set_metadata_from_instruction(op, instruction);
        }
    }

    #[must_use]
    pub fn db(&self) -> &OpMetricsDb {
        self.builder.db()
    }
}

fn set_metadata_once(
    op: &mut OpMetrics,
    category: &str,
    provenance: &str,
    deduplicated_name: &str,
) {
    if op.category.is_empty() {
        op.category =
            if category.is_empty() { UNKNOWN_OP_CATEGORY } else { category }.to_string();
    }
    if op.provenance.is_empty() {
        op.provenance = provenance.to_string();
    }
    if op.deduplicated_name.is_empty() {
        op.deduplicated_name = deduplicated_name.to_string();
    }
}

/// Fills unset metadata of `op` from a hardware-module instruction, including
/// its fusion children when `op` has none yet.
pub fn set_metadata_from_instruction(op: &mut OpMetrics, instruction: &HloInstructionInfo) {
    set_metadata_once(
        op,
        &instruction.category,
        &instruction.provenance,
        &instruction.deduplicated_name,
    );
    if op.long_name.is_empty() {
        op.long_name.clone_from(&instruction.expression);
    }
    if op.source_info.is_none() {
        op.source_info.clone_from(&instruction.source_info);
    }
    if op.children.is_empty() {
        op.children = instruction.fused_children_metrics(op.hlo_module_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::op_metrics::MemoryOperation;
    use opstats_common::{Instruction, ProgramModule};

    #[test]
    fn test_lookup_reuses_existing_records() {
        let mut db = OpMetricsDb::default();
        db.metrics_db.push(OpMetrics::new(3, "fusion"));
        let mut builder = OpMetricsDbBuilder::new(&mut db);
        builder.lookup_or_insert(3, "fusion").occurrences = 5;
        builder.lookup_or_insert(4, "fusion");
        assert_eq!(db.metrics_db.len(), 2);
        assert_eq!(db.metrics_db[0].occurrences, 5);
    }

    #[test]
    fn test_host_self_time_over_n_occurrences() {
        let mut db = OpMetricsDb::default();
        let mut builder = HostOpMetricsDbBuilder::new(&mut db);
        for _ in 0..4 {
            builder.enter_op("matmul", "MatMul", false, 100, 30);
        }
        builder.enter_op("matmul", "Other", true, 50, 0);
        let op = db.find(0, "matmul").unwrap();
        assert_eq!(op.occurrences, 5);
        assert_eq!(op.self_time_ps, 4 * 70 + 50);
        assert_eq!(op.time_ps, 450);
        assert_eq!(op.min_time_ps, 50);
        assert_eq!(op.category, "MatMul");
        assert!(op.is_eager);
        assert_eq!(db.total_op_time_ps, 330);
    }

    #[test]
    #[should_panic(expected = "exceeds time")]
    fn test_host_children_above_time_panics() {
        let mut db = OpMetricsDb::default();
        HostOpMetricsDbBuilder::new(&mut db).enter_op("op", "Op", false, 10, 20);
    }

    #[test]
    fn test_host_infeed_enqueue_totals() {
        let mut db = OpMetricsDb::default();
        let mut builder = HostOpMetricsDbBuilder::new(&mut db);
        builder.enter_host_infeed_enqueue(Timespan::new(0, 10));
        builder.enter_host_infeed_enqueue(Timespan::new(100, 20));
        builder.enter_host_infeed_enqueue(Timespan::new(250, 5));
        assert_eq!(db.total_host_infeed_enq_duration_ps, 30);
        assert_eq!(db.total_host_infeed_enq_start_timestamp_ps_diff, 250);
    }

    #[test]
    #[should_panic(expected = "overlaps or precedes")]
    fn test_host_infeed_overlap_panics() {
        let mut db = OpMetricsDb::default();
        let mut builder = HostOpMetricsDbBuilder::new(&mut db);
        builder.enter_host_infeed_enqueue(Timespan::new(0, 10));
        builder.enter_host_infeed_enqueue(Timespan::new(5, 10));
    }

    #[test]
    fn test_device_first_writer_wins_and_counters_scale() {
        let breakdown = [MemoryAccessed {
            operation_type: MemoryOperation::Read,
            memory_space: 1,
            bytes_accessed: 8,
        }];
        let mut db = OpMetricsDb::default();
        let mut builder = DeviceOpMetricsDbBuilder::new(&mut db);
        builder.enter_op(&DeviceOpEntry {
            program_id: 7,
            name: "fusion.1",
            category: "convolution",
            provenance: "model/conv:Conv2D",
            occurrences: 2,
            time_ps: 40,
            children_time_ps: 10,
            flops: 100,
            bytes_accessed: 16,
            memory_accessed_breakdown: &breakdown,
            ..DeviceOpEntry::default()
        });
        builder.enter_op(&DeviceOpEntry {
            program_id: 7,
            name: "fusion.1",
            category: "ignored",
            occurrences: 1,
            time_ps: 10,
            flops: 100,
            model_flops: 50,
            memory_accessed_breakdown: &breakdown,
            ..DeviceOpEntry::default()
        });
        let op = db.find(7, "fusion.1").unwrap();
        assert_eq!(op.category, "convolution");
        assert_eq!(op.provenance, "model/conv:Conv2D");
        assert_eq!(op.occurrences, 3);
        assert_eq!(op.self_time_ps, 40);
        assert_eq!(op.min_time_ps, 10);
        assert_eq!(op.flops, 300);
        assert_eq!(op.model_flops, 250);
        assert_eq!(op.bytes_accessed, 32);
        assert_eq!(op.memory_accessed_breakdown[0].bytes_accessed, 24);
        assert_eq!(db.total_op_time_ps, 40);
    }

    #[test]
    fn test_device_unknown_category_default() {
        let mut db = OpMetricsDb::default();
        let mut builder = DeviceOpMetricsDbBuilder::new(&mut db);
        builder.enter_op(&DeviceOpEntry {
            name: "mystery",
            occurrences: 1,
            time_ps: 5,
            ..DeviceOpEntry::default()
        });
        assert_eq!(db.metrics_db[0].category, UNKNOWN_OP_CATEGORY);
    }

    #[test]
    fn test_device_metadata_from_module_map() {
        let programs = vec![ProgramModule {
            program_id: 1,
            name: "train_step".to_string(),
            instructions: vec![Instruction {
                name: "fusion.2".to_string(),
                opcode: "fusion".to_string(),
                category: "loop fusion".to_string(),
                tf_op_name: "dense/MatMul:MatMul".to_string(),
                source_info: Some("model.py:12".to_string()),
                fused_instructions: vec![
                    Instruction {
                        name: "param.0".to_string(),
                        opcode: "parameter".to_string(),
                        ..Instruction::default()
                    },
                    Instruction {
                        name: "add.3".to_string(),
                        opcode: "add".to_string(),
                        ..Instruction::default()
                    },
                ],
                ..Instruction::default()
            }],
        }];
        let map = HloModuleMap::build(&programs, None);
        let mut db = OpMetricsDb::default();
        let mut builder = DeviceOpMetricsDbBuilder::new(&mut db);
        builder.enter_op_metadata_from_hlo_module_map(1, "fusion.2", &map);
        builder.enter_op_metadata_from_hlo_module_map(1, "missing", &map);
        builder.enter_op_metadata(1, "fusion.2", "other", "", "", true, None);

        assert_eq!(db.metrics_db.len(), 1);
        let op = &db.metrics_db[0];
        assert_eq!(op.category, "loop fusion");
        assert_eq!(op.provenance, "dense/MatMul:MatMul");
        assert_eq!(op.source_info.as_ref().map(|s| s.line_number), Some(12));
        assert!(op.is_eager);
        assert_eq!(op.occurrences, 0);
        assert_eq!(op.children.len(), 1);
        assert_eq!(op.children[0].name, "add.3");
        assert_eq!(op.children[0].occurrences, 1);
    }
}

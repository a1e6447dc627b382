//! Hardware-module map and pluggable cost analysis.
//!
//! The map indexes every instruction of every captured program by
//! `(program_id, instruction name)`, fused instructions included. It is built
//! once before any extraction task starts and only read afterwards.
//!
//! # Cost analysis
//!
//! FLOPs and bytes per instruction come from a [`CostAnalysis`] selected by
//! hardware key from a process-wide registry:
//!
//! | Key     | Estimator                     |
//! |---------|-------------------------------|
//! | `"gpu"` | [`OperandOutputCostAnalysis`] |
//! | none    | declared instruction counters |
//!
//! TPU conversion passes no estimator and keeps the counters measured by the
//! hardware.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, warn};
use opstats_common::{Instruction, ProgramModule};

use crate::metrics::op_metrics::{
    source_info_or_log, OpMetrics, SourceInfo, PASS_THROUGH_OPCODES,
};

/// Registry key of the GPU estimator.
pub const GPU_COST_ANALYSIS_KEY: &str = "gpu";

/// Framework op-name fragments that only appear in training programs.
const TRAINING_SIGNALS: &[&str] = &["gradients/", "gradient_tape/", "/backward", "optimizer/"];

// ============================================================================
// Cost analysis
// ============================================================================

/// Estimated cost of one instruction execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CostEstimate {
    pub flops: u64,
    pub model_flops: u64,
    pub bytes_accessed: u64,
}

/// Hardware-specific FLOPs/bytes estimator.
pub trait CostAnalysis: Send + Sync {
    fn estimate(&self, instruction: &Instruction) -> CostEstimate;
}

/// Declared FLOPs; bytes from operand plus output sizes.
#[derive(Debug, Default)]
pub struct OperandOutputCostAnalysis;

impl CostAnalysis for OperandOutputCostAnalysis {
    fn estimate(&self, instruction: &Instruction) -> CostEstimate {
        let moved = instruction.operand_bytes + instruction.output_bytes;
        CostEstimate {
            flops: instruction.flops,
            model_flops: instruction.flops,
            bytes_accessed: if moved == 0 { instruction.bytes_accessed } else { moved },
        }
    }
}

type Registry = Mutex<HashMap<String, Arc<dyn CostAnalysis>>>;

static COST_ANALYSIS_REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    COST_ANALYSIS_REGISTRY.get_or_init(|| {
        let mut estimators: HashMap<String, Arc<dyn CostAnalysis>> = HashMap::new();
        estimators.insert(GPU_COST_ANALYSIS_KEY.to_string(), Arc::new(OperandOutputCostAnalysis));
        Mutex::new(estimators)
    })
}

/// Registers (or replaces) the estimator for a hardware key.
pub fn register_cost_analysis(key: &str, analysis: Arc<dyn CostAnalysis>) {
    if let Ok(mut estimators) = registry().lock() {
        debug!("Registering cost analysis for '{key}'");
        estimators.insert(key.to_string(), analysis);
    }
}

/// Estimator registered for `key`, if any.
#[must_use]
pub fn cost_analysis_for(key: &str) -> Option<Arc<dyn CostAnalysis>> {
    let found = registry().lock().ok().and_then(|estimators| estimators.get(key).cloned());
    if found.is_none() {
        warn!("No cost analysis registered for '{key}'");
    }
    found
}

// ============================================================================
// Module map
// ============================================================================

/// One instruction with its resolved cost and metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HloInstructionInfo {
    pub name: String,
    pub opcode: String,
    pub category: String,
    /// Framework op that produced the instruction.
    pub provenance: String,
    pub deduplicated_name: String,
    pub expression: String,
    pub source_info: Option<SourceInfo>,
    pub flops: u64,
    pub model_flops: u64,
    pub bytes_accessed: u64,
    pub fused: Vec<HloInstructionInfo>,
}

impl HloInstructionInfo {
    fn from_instruction(instruction: &Instruction, cost: Option<&dyn CostAnalysis>) -> Self {
        let estimate = cost.map_or(
            CostEstimate {
                flops: instruction.flops,
                model_flops: instruction.flops,
                bytes_accessed: instruction.bytes_accessed,
            },
            |c| c.estimate(instruction),
        );
        let category = if instruction.category.is_empty() {
            instruction.opcode.clone()
        } else {
            instruction.category.clone()
        };
        Self {
            name: instruction.name.clone(),
            opcode: instruction.opcode.clone(),
            category,
            provenance: instruction.tf_op_name.clone(),
            deduplicated_name: instruction.deduplicated_name.clone(),
            expression: instruction.expression.clone(),
            source_info: instruction.source_info.as_deref().and_then(|s| source_info_or_log(s, "")),
            flops: estimate.flops,
            model_flops: estimate.model_flops,
            bytes_accessed: estimate.bytes_accessed,
            fused: instruction
                .fused_instructions
                .iter()
                .map(|f| Self::from_instruction(f, cost))
                .collect(),
        }
    }

    #[must_use]
    pub fn is_pass_through(&self) -> bool {
        PASS_THROUGH_OPCODES.contains(&self.opcode.as_str())
    }

    /// Fusion tree as op metrics, one occurrence per child, pass-through
    /// instructions skipped.
    #[must_use]
    pub fn fused_children_metrics(&self, program_id: u64) -> Vec<OpMetrics> {
        self.fused
            .iter()
            .filter(|child| !child.is_pass_through())
            .map(|child| OpMetrics {
                long_name: child.expression.clone(),
                deduplicated_name: child.deduplicated_name.clone(),
                category: child.category.clone(),
                provenance: child.provenance.clone(),
                occurrences: 1,
                flops: child.flops,
                model_flops: child.model_flops,
                bytes_accessed: child.bytes_accessed,
                source_info: child.source_info.clone(),
                children: child.fused_children_metrics(program_id),
                ..OpMetrics::new(program_id, child.name.clone())
            })
            .collect()
    }
}

/// Instructions of one program, fused ones included, by name.
#[derive(Debug, Clone, Default)]
pub struct HloModuleInfo {
    pub program_id: u64,
    pub name: String,
    instructions: HashMap<String, HloInstructionInfo>,
}

impl HloModuleInfo {
    #[must_use]
    pub fn get_instruction(&self, name: &str) -> Option<&HloInstructionInfo> {
        self.instructions.get(name)
    }

    pub fn instructions(&self) -> impl Iterator<Item = &HloInstructionInfo> {
        self.instructions.values()
    }

    fn index(&mut self, info: &HloInstructionInfo) {
        for child in &info.fused {
            self.index(child);
        }
        self.instructions.entry(info.name.clone()).or_insert_with(|| info.clone());
    }
}

/// Every captured program, by program id.
#[derive(Debug, Clone, Default)]
pub struct HloModuleMap {
    modules: BTreeMap<u64, HloModuleInfo>,
}

impl HloModuleMap {
    /// Indexes `programs`, costing each instruction with `cost` when given.
    #[must_use]
    pub fn build(programs: &[ProgramModule], cost: Option<&dyn CostAnalysis>) -> Self {
        let mut modules = BTreeMap::new();
        for program in programs {
            let mut module = HloModuleInfo {
                program_id: program.program_id,
                name: program.name.clone(),
                instructions: HashMap::new(),
            };
            for instruction in &program.instructions {
                module.index(&HloInstructionInfo::from_instruction(instruction, cost));
            }
            modules.insert(program.program_id, module);
        }
        debug!("Indexed {} hardware modules", modules.len());
        Self { modules }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    #[must_use]
    pub fn get_instruction(&self, program_id: u64, name: &str) -> Option<&HloInstructionInfo> {
        self.modules.get(&program_id)?.get_instruction(name)
    }
}

/// True as soon as one instruction of one program carries a training signal.
#[must_use]
pub fn is_training_run(programs: &[ProgramModule]) -> bool {
    fn has_signal(instruction: &Instruction) -> bool {
        TRAINING_SIGNALS.iter().any(|s| instruction.tf_op_name.contains(s))
            || instruction.fused_instructions.iter().any(has_signal)
    }
    programs.iter().any(|p| p.instructions.iter().any(has_signal))
}

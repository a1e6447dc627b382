//! Well-known plane, line, event and stat names.

use serde::{Deserialize, Serialize};

// ============================================================================
// Plane names
// ============================================================================

/// Prefix shared by every TPU plane (tensor cores and sparse cores).
pub const TPU_PLANE_PREFIX: &str = "/device:TPU:";

/// Prefix shared by every GPU plane.
pub const GPU_PLANE_PREFIX: &str = "/device:GPU:";

/// Host threads plane.
pub const HOST_THREADS_PLANE_NAME: &str = "/host:CPU";

/// Marker separating a TPU chip name from its sparse-core index.
pub const SPARSE_CORE_PLANE_INFIX: &str = " SparseCore ";

// ============================================================================
// Line names
// ============================================================================

/// One event per executed XLA operation.
pub const XLA_OP_LINE_NAME: &str = "XLA Ops";

/// One event per executed XLA module (program).
pub const XLA_MODULE_LINE_NAME: &str = "XLA Modules";

/// One event per step, spanning the whole step, carrying the group id.
pub const STEP_LINE_NAME: &str = "Steps";

pub const SPARSE_CORE_STEP_LINE_NAME: &str = "Sparse Core Steps";
pub const SPARSE_CORE_OP_LINE_NAME: &str = "Sparse Core Ops";
pub const SPARSE_CORE_MODULE_LINE_NAME: &str = "Sparse Core Modules";

pub const FRAMEWORK_OP_LINE_NAME: &str = "Framework Ops";
pub const FRAMEWORK_NAME_SCOPE_LINE_NAME: &str = "Framework Name Scope";
pub const SOURCE_LINE_NAME: &str = "Source code";

/// Lines synthesized from other lines; never treated as device streams.
pub const DERIVED_LINE_NAMES: &[&str] = &[
    XLA_OP_LINE_NAME,
    XLA_MODULE_LINE_NAME,
    STEP_LINE_NAME,
    FRAMEWORK_OP_LINE_NAME,
    FRAMEWORK_NAME_SCOPE_LINE_NAME,
    SOURCE_LINE_NAME,
];

// ============================================================================
// Host event names
// ============================================================================

/// Trace-context annotation, carries the user-visible step number.
pub const TRACE_CONTEXT_EVENT: &str = "TraceContext";

/// Function-dispatch wrapper that opens a step scope.
pub const FUNCTION_RUN_EVENT: &str = "FunctionRun";

/// Executor work item processing scope.
pub const EXECUTOR_STATE_PROCESS_EVENT: &str = "ExecutorState::Process";

/// Dispatch wrappers that never represent real CPU compute.
pub const HOST_DISPATCH_EVENTS: &[&str] =
    &["EagerExecute", "EagerLocalExecute", "EagerKernelExecute", FUNCTION_RUN_EVENT];

/// Framework op type of host infeed enqueues.
pub const INFEED_ENQUEUE_OP_TYPE: &str = "InfeedEnqueue";

// ============================================================================
// Stat types
// ============================================================================

/// Attribute keys read by the conversion engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatType {
    // Op identity and cost
    ProgramId,
    SymbolId,
    HloOp,
    HloCategory,
    TfOp,
    DeduplicatedName,
    SourceInfo,
    SourceStack,
    Flops,
    ModelFlops,
    BytesAccessed,
    /// `read|write:<memory space>:<bytes>` entries separated by commas.
    MemoryAccessBreakdown,
    IsEager,
    TensorShapes,
    // Per-event timing
    SelfDurationPs,
    MinDurationPs,
    DmaStallDurationPs,
    StepIdleTimePs,
    // Grouping
    GroupId,
    StepId,
    StepNum,
    StepName,
    CorrelationId,
    ProducerType,
    ProducerId,
    ConsumerType,
    ConsumerId,
    // Host functions
    TfFunctionCall,
    TfFunctionTracingCount,
    // Kernels
    KernelDetails,
    // Plane-level
    CoreDetails,
    DeviceTypeString,
    TotalProfileDurationPs,
    MatrixUnitUtilizationPercent,
    DevCapPeakTeraflopsPerSecond,
    DevCapPeakHbmBwGigabytesPerSecond,
    DevCapPeakSramRdBwGigabytesPerSecond,
    DevCapPeakSramWrBwGigabytesPerSecond,
    DevCapPeakCmemRdBwGigabytesPerSecond,
    DevCapPeakCmemWrBwGigabytesPerSecond,
    DevCapPeakVmemRdBwGigabytesPerSecond,
    DevCapPeakVmemWrBwGigabytesPerSecond,
    DevHasMegacore,
    DevHasMergedVmem,
    DevCapCoreCount,
    DevCapClockRateKhz,
    DevCapMemoryBandwidth,
    DevCapComputeCapMajor,
    DevCapComputeCapMinor,
}

// ============================================================================
// Plane name parsing
// ============================================================================

/// Returns the core index of a TPU tensor-core plane (`/device:TPU:<n>`).
///
/// Sparse-core planes share the prefix but are not tensor cores.
#[must_use]
pub fn tensor_core_id(plane_name: &str) -> Option<u32> {
    plane_name.strip_prefix(TPU_PLANE_PREFIX)?.parse().ok()
}

/// Returns the sparse-core index of a `/device:TPU:<n> SparseCore <m>` plane.
#[must_use]
pub fn sparse_core_id(plane_name: &str) -> Option<u32> {
    let rest = plane_name.strip_prefix(TPU_PLANE_PREFIX)?;
    let (chip, core) = rest.split_once(SPARSE_CORE_PLANE_INFIX)?;
    chip.parse::<u32>().ok()?;
    core.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_core_id() {
        assert_eq!(tensor_core_id("/device:TPU:3"), Some(3));
        assert_eq!(tensor_core_id("/device:TPU:0 SparseCore 1"), None);
        assert_eq!(tensor_core_id("/device:GPU:0"), None);
    }

    #[test]
    fn test_sparse_core_id() {
        assert_eq!(sparse_core_id("/device:TPU:0 SparseCore 1"), Some(1));
        assert_eq!(sparse_core_id("/device:TPU:0"), None);
        assert_eq!(sparse_core_id("/device:TPU:x SparseCore 1"), None);
    }

    #[test]
    fn test_stat_type_serializes_snake_case() {
        let json = serde_json::to_string(&StatType::StepIdleTimePs).unwrap();
        assert_eq!(json, "\"step_idle_time_ps\"");
    }
}

//! Per-kernel launch reports for GPU planes.
//!
//! Every stream event carrying a `kernel_details` stat becomes one
//! occurrence of a [`KernelReportKey`]: the kernel name, its launch shape and
//! the framework op it ran for. Reports from all planes merge by key and the
//! final database keeps the longest-running kernels.
//!
//! Launch details are a space-separated `key:value` list:
//!
//! ```text
//! regs:32 static_shared:0 dynamic_shared:16384 grid:80,1,1 block:256,1,1
//! ```

use std::collections::BTreeMap;

use log::{debug, warn};
use opstats_common::schema::DERIVED_LINE_NAMES;
use opstats_common::{EventView, StatType, XPlane};
use serde::Serialize;

use crate::convert::hlo_module_map::HloModuleMap;
use crate::domain::ParseError;

/// Kernels kept in the final database.
pub const MAX_KERNEL_REPORTS: usize = 1000;

/// Kernel-name fragments of tensor-core implementations.
const TENSOR_CORE_KERNEL_PATTERNS: &[&str] =
    &["884", "1688", "16816", "wmma", "hmma", "tensorop", "xmma"];

/// Framework op-type fragments that can run on tensor cores.
const TENSOR_CORE_ELIGIBLE_OP_PATTERNS: &[&str] = &["conv", "matmul", "einsum", "dot"];

/// Registers and shared memory per thread block, plus launch dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct KernelLaunchParams {
    pub registers_per_thread: u32,
    pub static_shmem_bytes: u32,
    pub dynamic_shmem_bytes: u32,
    pub grid_dim: [u32; 3],
    pub block_dim: [u32; 3],
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ParseError> {
    value
        .parse()
        .map_err(|_| ParseError::KernelDetails(format!("{key}: '{value}' is not a number")))
}

fn parse_dim(key: &str, value: &str) -> Result<[u32; 3], ParseError> {
    let mut dim = [1; 3];
    let parts: Vec<&str> = value.split(',').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(ParseError::KernelDetails(format!("{key}: '{value}' is not x,y,z")));
    }
    for (slot, part) in dim.iter_mut().zip(parts) {
        *slot = parse_u32(key, part)?;
    }
    Ok(dim)
}

/// Parses the `kernel_details` stat. Unknown keys are ignored.
///
/// # Errors
///
/// Returns [`ParseError::KernelDetails`] on a token without `:` or a value
/// that is not a number (or `x,y,z` triple for dimensions).
pub fn parse_kernel_launch_params(details: &str) -> Result<KernelLaunchParams, ParseError> {
    let mut params = KernelLaunchParams::default();
    for token in details.split_whitespace() {
        let (key, value) = token
            .split_once(':')
            .ok_or_else(|| ParseError::KernelDetails(format!("'{token}' is not key:value")))?;
        match key {
            "regs" => params.registers_per_thread = parse_u32(key, value)?,
            "static_shared" => params.static_shmem_bytes = parse_u32(key, value)?,
            "dynamic_shared" => params.dynamic_shmem_bytes = parse_u32(key, value)?,
            "grid" => params.grid_dim = parse_dim(key, value)?,
            "block" => params.block_dim = parse_dim(key, value)?,
            _ => {}
        }
    }
    Ok(params)
}

#[must_use]
pub fn is_kernel_using_tensor_core(kernel_name: &str) -> bool {
    let lower = kernel_name.to_ascii_lowercase();
    TENSOR_CORE_KERNEL_PATTERNS.iter().any(|p| lower.contains(p))
}

#[must_use]
pub fn is_op_tensor_core_eligible(op_name: &str) -> bool {
    let lower = op_name.to_ascii_lowercase();
    TENSOR_CORE_ELIGIBLE_OP_PATTERNS.iter().any(|p| lower.contains(p))
}

// ============================================================================
// Report map
// ============================================================================

/// Identity of a kernel report.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelReportKey {
    pub name: String,
    pub launch: KernelLaunchParams,
    pub op_name: String,
}

/// Accumulated timing of one kernel report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelReportValue {
    pub total_duration_ns: u64,
    pub min_duration_ns: u64,
    pub max_duration_ns: u64,
    pub occurrences: u64,
    pub is_kernel_using_tensor_core: bool,
    pub is_op_tensor_core_eligible: bool,
}

impl KernelReportValue {
    fn single(duration_ns: u64, is_kernel_using_tensor_core: bool, is_eligible: bool) -> Self {
        Self {
            total_duration_ns: duration_ns,
            min_duration_ns: duration_ns,
            max_duration_ns: duration_ns,
            occurrences: 1,
            is_kernel_using_tensor_core,
            is_op_tensor_core_eligible: is_eligible,
        }
    }

    fn merge(&mut self, other: &KernelReportValue) {
        self.total_duration_ns += other.total_duration_ns;
        self.min_duration_ns = self.min_duration_ns.min(other.min_duration_ns);
        self.max_duration_ns = self.max_duration_ns.max(other.max_duration_ns);
        self.occurrences += other.occurrences;
        self.is_kernel_using_tensor_core |= other.is_kernel_using_tensor_core;
        self.is_op_tensor_core_eligible |= other.is_op_tensor_core_eligible;
    }
}

pub type KernelReportMap = BTreeMap<KernelReportKey, KernelReportValue>;

/// Adds one report into `reports`, merging with an existing key.
pub fn insert_or_update_kernel_report(
    reports: &mut KernelReportMap,
    key: KernelReportKey,
    value: &KernelReportValue,
) {
    reports
        .entry(key)
        .and_modify(|existing| existing.merge(value))
        .or_insert(*value);
}

/// Op name for a kernel: the instruction's framework op when the module map
/// knows it, otherwise the event's framework-op stat.
fn kernel_op_name(event: &EventView<'_>, hlo_module_map: &HloModuleMap) -> String {
    let str_stat = |stat_type| event.stat(stat_type).and_then(|v| v.as_str());
    let program_id = event.stat(StatType::ProgramId).and_then(|v| v.as_u64());
    if let (Some(program_id), Some(hlo_op)) = (program_id, str_stat(StatType::HloOp)) {
        if let Some(instruction) = hlo_module_map.get_instruction(program_id, hlo_op) {
            return instruction.provenance.clone();
        }
    }
    str_stat(StatType::TfOp).unwrap_or_default().to_string()
}

/// Kernel reports of one GPU plane.
#[must_use]
pub fn convert_device_trace_xplane_to_kernel_reports(
    plane: &XPlane,
    hlo_module_map: &HloModuleMap,
) -> KernelReportMap {
    let mut reports = KernelReportMap::new();
    for line in plane.lines.iter().filter(|l| !DERIVED_LINE_NAMES.contains(&l.name.as_str())) {
        for event in plane.events(line) {
            let Some(details) = event.stat(StatType::KernelDetails).and_then(|v| v.as_str())
            else {
                continue;
            };
            let launch = parse_kernel_launch_params(details).unwrap_or_else(|e| {
                warn!("Kernel {} on {}: {e}", event.name(), plane.name);
                KernelLaunchParams::default()
            });
            let op_name = kernel_op_name(&event, hlo_module_map);
            let using_tensor_core = is_kernel_using_tensor_core(event.name());
            let eligible = is_op_tensor_core_eligible(&op_name);
            if using_tensor_core && !eligible && !op_name.is_empty() {
                debug!("Op {op_name} uses tensor cores");
            }
            let value = KernelReportValue::single(
                event.duration_ps() / 1000,
                using_tensor_core,
                eligible || using_tensor_core,
            );
            let key = KernelReportKey { name: event.name().to_string(), launch, op_name };
            insert_or_update_kernel_report(&mut reports, key, &value);
        }
    }
    reports
}

// ============================================================================
// Database
// ============================================================================

/// One row of the kernel stats database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KernelReport {
    pub name: String,
    pub registers_per_thread: u32,
    pub static_shmem_bytes: u32,
    pub dynamic_shmem_bytes: u32,
    pub grid_dim: [u32; 3],
    pub block_dim: [u32; 3],
    pub total_duration_ns: u64,
    pub min_duration_ns: u64,
    pub max_duration_ns: u64,
    pub is_kernel_using_tensor_core: bool,
    pub is_op_tensor_core_eligible: bool,
    pub op_name: String,
    pub occurrences: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KernelStatsDb {
    pub reports: Vec<KernelReport>,
}

/// The `MAX_KERNEL_REPORTS` longest kernels by total duration, longest first.
#[must_use]
pub fn copy_top_k_duration_kernel_reports_to_db(reports: &KernelReportMap) -> KernelStatsDb {
    let mut rows: Vec<KernelReport> = reports
        .iter()
        .map(|(key, value)| KernelReport {
            name: key.name.clone(),
            registers_per_thread: key.launch.registers_per_thread,
            static_shmem_bytes: key.launch.static_shmem_bytes,
            dynamic_shmem_bytes: key.launch.dynamic_shmem_bytes,
            grid_dim: key.launch.grid_dim,
            block_dim: key.launch.block_dim,
            total_duration_ns: value.total_duration_ns,
            min_duration_ns: value.min_duration_ns,
            max_duration_ns: value.max_duration_ns,
            is_kernel_using_tensor_core: value.is_kernel_using_tensor_core,
            is_op_tensor_core_eligible: value.is_op_tensor_core_eligible,
            op_name: key.op_name.clone(),
            occurrences: value.occurrences,
        })
        .collect();
    // Stable: equal totals keep key order.
    rows.sort_by(|a, b| b.total_duration_ns.cmp(&a.total_duration_ns));
    rows.truncate(MAX_KERNEL_REPORTS);
    KernelStatsDb { reports: rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opstats_common::{stat, Instruction, ProgramModule, XPlaneBuilder};

    #[test]
    fn test_parse_launch_params() {
        let details = "regs:32 static_shared:8 dynamic_shared:1024 grid:80,2 block:256,1,1";
        let params = parse_kernel_launch_params(details).unwrap();
        assert_eq!(params.registers_per_thread, 32);
        assert_eq!(params.static_shmem_bytes, 8);
        assert_eq!(params.dynamic_shmem_bytes, 1024);
        assert_eq!(params.grid_dim, [80, 2, 1]);
        assert_eq!(params.block_dim, [256, 1, 1]);

        assert!(matches!(
            parse_kernel_launch_params("regs:many"),
            Err(ParseError::KernelDetails(_))
        ));
        assert!(parse_kernel_launch_params("grid").is_err());
        assert_eq!(parse_kernel_launch_params("").unwrap(), KernelLaunchParams::default());
    }

    #[test]
    fn test_tensor_core_patterns() {
        assert!(is_kernel_using_tensor_core("volta_h884gemm_64x64_nn"));
        assert!(is_kernel_using_tensor_core("cutlass_tensorop_s1688gemm"));
        assert!(!is_kernel_using_tensor_core("volta_sgemm_128x64_nn"));
        assert!(is_op_tensor_core_eligible("model/dense/MatMul"));
        assert!(is_op_tensor_core_eligible("conv2d/Conv2D"));
        assert!(!is_op_tensor_core_eligible("relu/Relu"));
    }

    fn gpu_plane() -> XPlane {
        let mut b = XPlaneBuilder::new(1, "/device:GPU:0");
        b.add_line(1, "stream:7", 0);
        let sgemm_stats = |op: &str| {
            vec![
                stat(StatType::KernelDetails, "regs:64 grid:10,1,1 block:128,1,1"),
                stat(StatType::ProgramId, 3u64),
                stat(StatType::HloOp, op),
            ]
        };
        b.add_named_event(1, "volta_sgemm", 0, 4000, sgemm_stats("dot.1"));
        b.add_named_event(1, "volta_sgemm", 5000, 2000, sgemm_stats("dot.1"));
        b.add_named_event(
            1,
            "relu_kernel",
            8000,
            9000,
            vec![
                stat(StatType::KernelDetails, "regs:16 grid:1,1,1 block:32,1,1"),
                stat(StatType::TfOp, "relu/Relu:Relu"),
            ],
        );
        b.add_named_event(1, "memcpy", 20_000, 1000, Vec::new());
        b.build()
    }

    fn programs() -> Vec<ProgramModule> {
        vec![ProgramModule {
            program_id: 3,
            name: "cluster".to_string(),
            instructions: vec![Instruction {
                name: "dot.1".to_string(),
                opcode: "dot".to_string(),
                tf_op_name: "dense/MatMul".to_string(),
                ..Instruction::default()
            }],
        }]
    }

    #[test]
    fn test_kernel_reports_merge_by_key() {
        let map = HloModuleMap::build(&programs(), None);
        let mut reports = convert_device_trace_xplane_to_kernel_reports(&gpu_plane(), &map);
        assert_eq!(reports.len(), 2);
        for (key, value) in convert_device_trace_xplane_to_kernel_reports(&gpu_plane(), &map) {
            insert_or_update_kernel_report(&mut reports, key, &value);
        }

        let db = copy_top_k_duration_kernel_reports_to_db(&reports);
        assert_eq!(db.reports.len(), 2);
        let relu = &db.reports[0];
        assert_eq!(relu.name, "relu_kernel");
        assert_eq!(relu.op_name, "relu/Relu:Relu");
        assert_eq!(relu.total_duration_ns, 18);
        let sgemm = &db.reports[1];
        assert_eq!(sgemm.op_name, "dense/MatMul");
        assert!(sgemm.is_op_tensor_core_eligible);
        assert!(!sgemm.is_kernel_using_tensor_core);
        assert_eq!(sgemm.occurrences, 4);
        assert_eq!(sgemm.total_duration_ns, 12);
        assert_eq!((sgemm.min_duration_ns, sgemm.max_duration_ns), (2, 4));
        assert_eq!(sgemm.registers_per_thread, 64);
        assert_eq!(sgemm.grid_dim, [10, 1, 1]);
    }

    #[test]
    fn test_top_k_truncates() {
        let mut reports = KernelReportMap::new();
        for i in 0..(MAX_KERNEL_REPORTS as u64 + 5) {
            let key = KernelReportKey {
                name: format!("kernel_{i}"),
                launch: KernelLaunchParams::default(),
                op_name: String::new(),
            };
            insert_or_update_kernel_report(
                &mut reports,
                key,
                &KernelReportValue::single(i, false, false),
            );
        }
        let db = copy_top_k_duration_kernel_reports_to_db(&reports);
        assert_eq!(db.reports.len(), MAX_KERNEL_REPORTS);
        assert_eq!(db.reports[0].total_duration_ns, MAX_KERNEL_REPORTS as u64 + 4);
    }
}

//! Run environment, performance envelope and per-core details.
//!
//! # Perf envelope
//!
//! | Hardware | Peak compute                          | Bandwidths                          |
//! |----------|---------------------------------------|-------------------------------------|
//! | TPU      | `dev_cap_peak_teraflops_per_second`   | `dev_cap_peak_*` plane stats        |
//! | GPU      | SMs × cores/SM × 2 × clock            | memory bandwidth, shmem from clock  |
//!
//! The ridge point is peak GFLOPs per HBM GB/s; 0 when HBM bandwidth is
//! unknown.

#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeSet;

use log::warn;
use opstats_common::{StatType, XPlane, XSpace};
use serde::{Deserialize, Serialize};

use crate::domain::ParseError;

const LOCALHOST: &str = "localhost";

/// Shared-memory banks per SM, each 4 bytes wide per clock.
const SHARED_MEMORY_BANKS_PER_SM: f64 = 32.0;
const SHARED_MEMORY_BANK_WIDTH_BYTES: f64 = 4.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareType {
    #[default]
    CpuOnly,
    Gpu,
    Tpu,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunEnvironment {
    pub host_count: u32,
    pub task_count: u32,
    pub hostnames: BTreeSet<String>,
    pub device_type: String,
    pub device_core_count: u32,
    pub hardware_type: HardwareType,
    pub is_training: bool,
}

/// The trace's host, or `localhost` when none was recorded.
#[must_use]
pub fn hostname(space: &XSpace) -> String {
    space.hostnames.first().cloned().unwrap_or_else(|| LOCALHOST.to_string())
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Device planes of the space and whether they are TPU planes. TPU planes
/// (tensor and sparse cores) win over GPU planes; empty means host only.
#[must_use]
pub fn classify_device_planes(space: &XSpace) -> (Vec<&XPlane>, bool) {
    let tpu_planes = space.tpu_planes();
    if tpu_planes.is_empty() {
        (space.gpu_planes(), false)
    } else {
        (tpu_planes, true)
    }
}

/// Single-host environment for the classified device planes. The training
/// flag is left for the caller.
#[must_use]
pub fn run_environment(
    space: &XSpace,
    device_planes: &[&XPlane],
    is_tpu: bool,
) -> RunEnvironment {
    let mut env = RunEnvironment {
        host_count: 1,
        task_count: 1,
        hostnames: BTreeSet::from([hostname(space)]),
        ..RunEnvironment::default()
    };
    let Some(first) = device_planes.first() else {
        env.device_type = "CPU".to_string();
        env.hardware_type = HardwareType::CpuOnly;
        return env;
    };
    if is_tpu {
        // Sparse cores ride along with their chip's tensor cores.
        env.device_type = device_planes
            .iter()
            .find_map(|plane| device_type_string(plane))
            .unwrap_or_else(|| "TPU".to_string());
        env.device_core_count =
            count(device_planes.iter().filter(|plane| plane.is_tensor_core()).count());
        env.hardware_type = HardwareType::Tpu;
    } else {
        env.device_type = device_type_string(first).unwrap_or_else(|| "GPU".to_string());
        env.device_core_count = count(device_planes.len());
        env.hardware_type = HardwareType::Gpu;
    }
    env
}

fn device_type_string(plane: &XPlane) -> Option<String> {
    plane.stat(StatType::DeviceTypeString).and_then(|v| v.as_str()).map(str::to_string)
}

// ============================================================================
// Perf envelope
// ============================================================================

/// Peak bandwidth per memory tier, in GB/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PeakBandwidths {
    pub hbm_rw: f64,
    pub sram_rd: f64,
    pub sram_wr: f64,
    pub cmem_rd: f64,
    pub cmem_wr: f64,
    pub vmem_rd: f64,
    pub vmem_wr: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerfEnv {
    pub peak_tera_flops_per_second: f64,
    pub peak_bws_giga_bytes_per_second: PeakBandwidths,
    /// Operational intensity (FLOPs/byte) where compute and HBM bound meet.
    pub ridge_point: f64,
    pub has_cmem: bool,
    pub has_megacore: bool,
    pub has_merged_vmem: bool,
}

impl PerfEnv {
    #[must_use]
    pub fn new(peak_tera_flops_per_second: f64, bws: PeakBandwidths) -> Self {
        let ridge_point = if bws.hbm_rw > 0.0 {
            peak_tera_flops_per_second * 1000.0 / bws.hbm_rw
        } else {
            0.0
        };
        Self {
            peak_tera_flops_per_second,
            peak_bws_giga_bytes_per_second: bws,
            ridge_point,
            has_cmem: bws.cmem_rd > 0.0 || bws.cmem_wr > 0.0,
            has_megacore: false,
            has_merged_vmem: false,
        }
    }
}

/// Capabilities a GPU plane records about its device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Streaming multiprocessors.
    pub num_cores: u64,
    pub clock_rate_khz: u64,
    /// Bytes per second.
    pub memory_bandwidth: u64,
    pub compute_capability: (u32, u32),
}

#[must_use]
pub fn device_capabilities(plane: &XPlane) -> DeviceCapabilities {
    let uint = |stat_type| plane.stat(stat_type).and_then(|v| v.as_u64()).unwrap_or(0);
    let small = |stat_type| u32::try_from(uint(stat_type)).unwrap_or(0);
    DeviceCapabilities {
        num_cores: uint(StatType::DevCapCoreCount),
        clock_rate_khz: uint(StatType::DevCapClockRateKhz),
        memory_bandwidth: uint(StatType::DevCapMemoryBandwidth),
        compute_capability: (
            small(StatType::DevCapComputeCapMajor),
            small(StatType::DevCapComputeCapMinor),
        ),
    }
}

/// FP32 cores per SM by compute capability.
#[must_use]
pub fn cores_per_sm((major, minor): (u32, u32)) -> u64 {
    match (major, minor) {
        (2, 1) => 48,
        (2, _) => 32,
        (3, _) => 192,
        (6 | 8, 0) | (7, _) => 64,
        _ => 128,
    }
}

fn gpu_perf_env(cap: &DeviceCapabilities) -> PerfEnv {
    let clock_hz = cap.clock_rate_khz as f64 * 1e3;
    // Fused multiply-add counts as two FLOPs.
    let flops_per_sm = cores_per_sm(cap.compute_capability) as f64 * 2.0 * clock_hz;
    let shared_memory_gbps = cap.num_cores as f64
        * SHARED_MEMORY_BANKS_PER_SM
        * SHARED_MEMORY_BANK_WIDTH_BYTES
        * clock_hz
        / 1e9;
    PerfEnv::new(
        cap.num_cores as f64 * flops_per_sm / 1e12,
        PeakBandwidths {
            hbm_rw: cap.memory_bandwidth as f64 / 1e9,
            sram_rd: shared_memory_gbps,
            sram_wr: shared_memory_gbps,
            ..PeakBandwidths::default()
        },
    )
}

fn tpu_perf_env(plane: &XPlane) -> PerfEnv {
    let double = |stat_type| plane.stat(stat_type).and_then(|v| v.as_f64()).unwrap_or(0.0);
    let flag = |stat_type| plane.stat(stat_type).and_then(|v| v.as_bool()).unwrap_or(false);
    let mut env = PerfEnv::new(
        double(StatType::DevCapPeakTeraflopsPerSecond),
        PeakBandwidths {
            hbm_rw: double(StatType::DevCapPeakHbmBwGigabytesPerSecond),
            sram_rd: double(StatType::DevCapPeakSramRdBwGigabytesPerSecond),
            sram_wr: double(StatType::DevCapPeakSramWrBwGigabytesPerSecond),
            cmem_rd: double(StatType::DevCapPeakCmemRdBwGigabytesPerSecond),
            cmem_wr: double(StatType::DevCapPeakCmemWrBwGigabytesPerSecond),
            vmem_rd: double(StatType::DevCapPeakVmemRdBwGigabytesPerSecond),
            vmem_wr: double(StatType::DevCapPeakVmemWrBwGigabytesPerSecond),
        },
    );
    env.has_megacore = flag(StatType::DevHasMegacore);
    env.has_merged_vmem = flag(StatType::DevHasMergedVmem);
    env
}

/// Perf envelope of the device behind `plane`.
#[must_use]
pub fn perf_env_from_xplane(plane: &XPlane) -> PerfEnv {
    if plane.name.starts_with(opstats_common::schema::TPU_PLANE_PREFIX) {
        tpu_perf_env(plane)
    } else {
        gpu_perf_env(&device_capabilities(plane))
    }
}

// ============================================================================
// Core details
// ============================================================================

/// Placement of one TPU core, recorded as a JSON plane stat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreDetails {
    pub hostname: String,
    pub device_ordinal: u32,
    pub core_on_chip_index: u32,
    pub local_chip_id: u32,
    pub is_sparse_core: bool,
}

/// Parses a `core_details` stat value.
///
/// # Errors
///
/// Returns [`ParseError::CoreDetails`] when the value is not a JSON object
/// of core details.
pub fn parse_core_details(value: &str) -> Result<CoreDetails, ParseError> {
    serde_json::from_str(value).map_err(|e| ParseError::CoreDetails(e.to_string()))
}

/// Core details of a device plane, stamped with the host and sparse-core
/// flag. `None` (with a warning on parse failure) when absent.
#[must_use]
pub fn core_details_from_xplane(plane: &XPlane, hostname: &str) -> Option<CoreDetails> {
    let value = plane.stat(StatType::CoreDetails).and_then(|v| v.as_str())?;
    match parse_core_details(value) {
        Ok(mut details) => {
            details.hostname = hostname.to_string();
            details.is_sparse_core = plane.is_sparse_core();
            Some(details)
        }
        Err(e) => {
            warn!("Ignoring core details of {}: {e}", plane.name);
            None
        }
    }
}

/// Hardware counters sampled on the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceCounterResult {
    pub matrix_unit_utilization_percent: f64,
}

#[must_use]
pub fn performance_counter_result(host_plane: &XPlane) -> Option<PerformanceCounterResult> {
    host_plane
        .stat(StatType::MatrixUnitUtilizationPercent)
        .and_then(|v| v.as_f64())
        .map(|matrix_unit_utilization_percent| PerformanceCounterResult {
            matrix_unit_utilization_percent,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opstats_common::schema::HOST_THREADS_PLANE_NAME;
    use opstats_common::XPlaneBuilder;

    fn space(names: &[&str]) -> XSpace {
        XSpace {
            planes: names
                .iter()
                .zip(0u32..)
                .map(|(name, id)| XPlaneBuilder::new(id, *name).build())
                .collect(),
            ..XSpace::default()
        }
    }

    fn classified(space: &XSpace) -> RunEnvironment {
        let (planes, is_tpu) = classify_device_planes(space);
        run_environment(space, &planes, is_tpu)
    }

    #[test]
    fn test_run_environment_classification() {
        let cpu = classified(&space(&[HOST_THREADS_PLANE_NAME]));
        assert_eq!(cpu.hardware_type, HardwareType::CpuOnly);
        assert_eq!(cpu.device_type, "CPU");
        assert_eq!(cpu.device_core_count, 0);
        assert!(cpu.hostnames.contains(LOCALHOST));

        let gpu = classified(&space(&["/device:GPU:0", "/device:GPU:1"]));
        assert_eq!(gpu.hardware_type, HardwareType::Gpu);
        assert_eq!(gpu.device_type, "GPU");
        assert_eq!(gpu.device_core_count, 2);

        let mut tpu_space =
            space(&["/device:TPU:0", "/device:TPU:1", "/device:TPU:0 SparseCore 0"]);
        tpu_space.hostnames = vec!["worker-0".to_string()];
        let tpu = classified(&tpu_space);
        assert_eq!(tpu.hardware_type, HardwareType::Tpu);
        assert_eq!(tpu.device_core_count, 2);
        assert_eq!(tpu.hostnames, BTreeSet::from(["worker-0".to_string()]));
        assert_eq!((tpu.host_count, tpu.task_count), (1, 1));
    }

    #[test]
    fn test_sparse_core_only_space_is_tpu() {
        let sparse_only = space(&[HOST_THREADS_PLANE_NAME, "/device:TPU:0 SparseCore 0"]);
        let (planes, is_tpu) = classify_device_planes(&sparse_only);
        assert!(is_tpu);
        assert_eq!(planes.len(), 1);

        let env = run_environment(&sparse_only, &planes, is_tpu);
        assert_eq!(env.hardware_type, HardwareType::Tpu);
        assert_eq!(env.device_type, "TPU");
        assert_eq!(env.device_core_count, 0);
    }

    #[test]
    fn test_gpu_perf_env() {
        let mut b = XPlaneBuilder::new(0, "/device:GPU:0");
        b.add_plane_stat(StatType::DevCapCoreCount, 80u64);
        b.add_plane_stat(StatType::DevCapClockRateKhz, 1_000_000u64);
        b.add_plane_stat(StatType::DevCapMemoryBandwidth, 900_000_000_000u64);
        b.add_plane_stat(StatType::DevCapComputeCapMajor, 7u64);
        b.add_plane_stat(StatType::DevCapComputeCapMinor, 0u64);
        let env = perf_env_from_xplane(&b.build());
        // 80 SMs × 64 cores × 2 × 1 GHz.
        assert!((env.peak_tera_flops_per_second - 10.24).abs() < 1e-9);
        assert!((env.peak_bws_giga_bytes_per_second.hbm_rw - 900.0).abs() < 1e-9);
        assert!((env.ridge_point - 10240.0 / 900.0).abs() < 1e-9);
        assert!(!env.has_cmem);
    }

    #[test]
    fn test_tpu_perf_env_and_zero_bandwidth() {
        let mut b = XPlaneBuilder::new(0, "/device:TPU:0");
        b.add_plane_stat(StatType::DevCapPeakTeraflopsPerSecond, 275.0);
        b.add_plane_stat(StatType::DevCapPeakHbmBwGigabytesPerSecond, 1200.0);
        b.add_plane_stat(StatType::DevCapPeakCmemRdBwGigabytesPerSecond, 50.0);
        b.add_plane_stat(StatType::DevHasMegacore, true);
        let env = perf_env_from_xplane(&b.build());
        assert!((env.ridge_point - 275_000.0 / 1200.0).abs() < 1e-9);
        assert!(env.has_cmem);
        assert!(env.has_megacore);
        assert!(!env.has_merged_vmem);

        let empty = perf_env_from_xplane(&XPlaneBuilder::new(1, "/device:TPU:1").build());
        assert!(empty.ridge_point.abs() < f64::EPSILON);
    }

    #[test]
    fn test_core_details() {
        let mut b = XPlaneBuilder::new(4, "/device:TPU:0 SparseCore 1");
        b.add_plane_stat(StatType::CoreDetails, r#"{"local_chip_id": 3}"#);
        let details = core_details_from_xplane(&b.build(), "worker-0").unwrap();
        assert_eq!(details.local_chip_id, 3);
        assert_eq!(details.hostname, "worker-0");
        assert!(details.is_sparse_core);

        let mut bad = XPlaneBuilder::new(5, "/device:TPU:1");
        bad.add_plane_stat(StatType::CoreDetails, "not json");
        assert!(core_details_from_xplane(&bad.build(), "worker-0").is_none());
        assert!(matches!(parse_core_details("[]"), Err(ParseError::CoreDetails(_))));
    }
}

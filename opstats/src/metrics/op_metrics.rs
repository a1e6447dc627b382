//! Per-operation statistics records.
//!
//! An [`OpMetricsDb`] is the table of every distinct operation observed in
//! one scope (a device plane, a host plane, one core inside one step). Each
//! [`OpMetrics`] is keyed by `(hlo_module_id, name)`; fused operations carry
//! their fusion tree in `children`.
//!
//! ```text
//!   OpMetricsDb
//!   ├── total_time_ps      wall-clock time of the scope
//!   ├── total_op_time_ps   Σ self_time_ps over non-idle records
//!   └── metrics_db
//!       ├── fusion.3       time 40  self 40  occurrences 2
//!       │   └── children   add.1, multiply.2
//!       ├── copy.7         time 10  self 10  occurrences 1
//!       └── IDLE           self = total_time_ps - total_op_time_ps
//! ```

#![allow(clippy::cast_precision_loss)]

use log::error;
use serde::{Deserialize, Serialize};

use crate::domain::ParseError;

/// Name and category of the synthetic idle record.
pub const IDLE_OP_NAME: &str = "IDLE";
pub const IDLE_OP_CATEGORY: &str = "IDLE";

/// Category given to device ops whose category is unknown.
pub const UNKNOWN_OP_CATEGORY: &str = "unknown";

/// Opcodes that only forward values and never become fused children.
pub const PASS_THROUGH_OPCODES: &[&str] = &["parameter", "tuple"];

/// Direction of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOperation {
    Read,
    Write,
}

/// Bytes moved in one direction through one memory space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAccessed {
    pub operation_type: MemoryOperation,
    pub memory_space: u64,
    pub bytes_accessed: u64,
}

/// Source location an operation was lowered from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub file_name: String,
    pub line_number: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stack_frame: String,
}

/// Statistics of one distinct operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpMetrics {
    /// Program (module) id; 0 on the host.
    pub hlo_module_id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub long_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deduplicated_name: String,
    pub category: String,
    /// Framework op that produced this operation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provenance: String,
    pub is_eager: bool,
    pub occurrences: u64,
    pub time_ps: u64,
    pub self_time_ps: u64,
    pub min_time_ps: u64,
    pub dma_stall_ps: u64,
    pub num_cores: u32,
    pub flops: u64,
    pub model_flops: u64,
    pub bytes_accessed: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memory_accessed_breakdown: Vec<MemoryAccessed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_info: Option<SourceInfo>,
    /// Fused sub-operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<OpMetrics>,
}

impl OpMetrics {
    #[must_use]
    pub fn new(hlo_module_id: u64, name: impl Into<String>) -> Self {
        Self { hlo_module_id, name: name.into(), ..Self::default() }
    }

    #[must_use]
    pub fn key(&self) -> (u64, &str) {
        (self.hlo_module_id, self.name.as_str())
    }

    /// Time spent in nested operations.
    #[must_use]
    pub fn children_time_ps(&self) -> u64 {
        self.time_ps - self.self_time_ps
    }
}

/// Share of device compute time spent at each precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecisionStats {
    pub compute_16bit_ps: u64,
    pub compute_32bit_ps: u64,
}

impl PrecisionStats {
    /// Fraction of compute time spent in 16-bit ops; 0 when nothing ran.
    #[must_use]
    pub fn compute_16bit_percent(&self) -> f64 {
        let total = self.compute_16bit_ps + self.compute_32bit_ps;
        if total == 0 {
            return 0.0;
        }
        100.0 * self.compute_16bit_ps as f64 / total as f64
    }
}

/// Table of operation statistics for one scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpMetricsDb {
    pub metrics_db: Vec<OpMetrics>,
    pub total_time_ps: u64,
    pub total_op_time_ps: u64,
    /// Set from duty-cycle totals on TPU; 0 elsewhere.
    pub idle_time_ps: u64,
    pub busy_time_ps: u64,
    pub total_host_infeed_enq_duration_ps: u64,
    pub total_host_infeed_enq_start_timestamp_ps_diff: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision_stats: Option<PrecisionStats>,
}

impl OpMetricsDb {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics_db.is_empty()
    }

    #[must_use]
    pub fn find(&self, hlo_module_id: u64, name: &str) -> Option<&OpMetrics> {
        self.metrics_db.iter().find(|m| m.key() == (hlo_module_id, name))
    }

    /// The synthetic idle record, if one was appended.
    #[must_use]
    pub fn idle_op(&self) -> Option<&OpMetrics> {
        self.metrics_db.iter().find(|m| is_idle_op(m))
    }

    /// Σ self time over non-idle records.
    #[must_use]
    pub fn busy_self_time_ps(&self) -> u64 {
        self.metrics_db.iter().filter(|m| !is_idle_op(m)).map(|m| m.self_time_ps).sum()
    }
}

// ============================================================================
// Idle synthesis
// ============================================================================

#[must_use]
pub fn is_idle_op(metrics: &OpMetrics) -> bool {
    metrics.category == IDLE_OP_CATEGORY
}

/// Time not attributed to any operation.
#[must_use]
pub fn idle_time_ps(db: &OpMetricsDb) -> u64 {
    db.total_time_ps.saturating_sub(db.total_op_time_ps)
}

/// Idle share of total time; an empty db counts as fully idle.
#[must_use]
pub fn idle_time_ratio(db: &OpMetricsDb) -> f64 {
    if db.total_time_ps == 0 {
        return 1.0;
    }
    idle_time_ps(db) as f64 / db.total_time_ps as f64
}

/// Appends the IDLE record covering `total_time_ps - total_op_time_ps`.
///
/// # Panics
///
/// Panics if the db already has an IDLE record or if its op time exceeds its
/// total time.
pub fn add_idle_op(db: &mut OpMetricsDb) {
    assert!(
        db.idle_op().is_none(),
        "op metrics db already has an {IDLE_OP_NAME} record"
    );
    assert!(
        db.total_time_ps >= db.total_op_time_ps,
        "total time {}ps is below total op time {}ps",
        db.total_time_ps,
        db.total_op_time_ps
    );
    let idle_ps = idle_time_ps(db);
    db.metrics_db.push(OpMetrics {
        name: IDLE_OP_NAME.to_string(),
        category: IDLE_OP_CATEGORY.to_string(),
        time_ps: idle_ps,
        self_time_ps: idle_ps,
        ..OpMetrics::default()
    });
}

/// Infeed enqueue duty: total enqueue time over the spread of enqueue starts.
#[must_use]
pub fn host_infeed_enqueue_ratio(db: &OpMetricsDb) -> Option<f64> {
    if db.total_host_infeed_enq_start_timestamp_ps_diff == 0 {
        return None;
    }
    Some(
        db.total_host_infeed_enq_duration_ps as f64
            / db.total_host_infeed_enq_start_timestamp_ps_diff as f64,
    )
}

// ============================================================================
// Attribute parsing
// ============================================================================

/// Parses a `file:line` source location.
///
/// # Errors
///
/// Returns [`ParseError::SourceInfo`] when there is no `:` separator, the
/// file part is empty, or the line is not a number.
pub fn parse_source_info(expression: &str, stack_frame: &str) -> Result<SourceInfo, ParseError> {
    let (file_name, line) = expression
        .rsplit_once(':')
        .ok_or_else(|| ParseError::SourceInfo(expression.to_string()))?;
    if file_name.is_empty() {
        return Err(ParseError::SourceInfo(expression.to_string()));
    }
    let line_number =
        line.trim().parse().map_err(|_| ParseError::SourceInfo(expression.to_string()))?;
    Ok(SourceInfo {
        file_name: file_name.to_string(),
        line_number,
        stack_frame: stack_frame.to_string(),
    })
}

/// Like [`parse_source_info`], logging and discarding malformed values.
#[must_use]
pub fn source_info_or_log(expression: &str, stack_frame: &str) -> Option<SourceInfo> {
    match parse_source_info(expression, stack_frame) {
        Ok(info) => Some(info),
        Err(e) => {
            error!("{e}");
            None
        }
    }
}

/// Parses `read|write:<memory space>:<bytes>` entries separated by commas.
///
/// # Errors
///
/// Returns [`ParseError::MemoryAccess`] naming the first malformed entry.
pub fn parse_memory_breakdown(value: &str) -> Result<Vec<MemoryAccessed>, ParseError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let bad = || ParseError::MemoryAccess(entry.to_string());
            let mut parts = entry.split(':');
            let operation_type = match parts.next() {
                Some("read") => MemoryOperation::Read,
                Some("write") => MemoryOperation::Write,
                _ => return Err(bad()),
            };
            let memory_space = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            let bytes_accessed = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            if parts.next().is_some() {
                return Err(bad());
            }
            Ok(MemoryAccessed { operation_type, memory_space, bytes_accessed })
        })
        .collect()
}

/// Adds `src` scaled by `factor` into `dst`, merging by (direction, memory space).
pub fn combine_memory_breakdown(
    dst: &mut Vec<MemoryAccessed>,
    src: &[MemoryAccessed],
    factor: u64,
) {
    for access in src {
        let bytes = access.bytes_accessed * factor;
        if let Some(existing) = dst.iter_mut().find(|d| {
            d.operation_type == access.operation_type && d.memory_space == access.memory_space
        }) {
            existing.bytes_accessed += bytes;
        } else {
            dst.push(MemoryAccessed { bytes_accessed: bytes, ..*access });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_op_time(total_time_ps: u64, op_self_times: &[u64]) -> OpMetricsDb {
        let mut db = OpMetricsDb { total_time_ps, ..OpMetricsDb::default() };
        for (i, &t) in op_self_times.iter().enumerate() {
            db.metrics_db.push(OpMetrics {
                time_ps: t,
                self_time_ps: t,
                occurrences: 1,
                ..OpMetrics::new(1, format!("op{i}"))
            });
            db.total_op_time_ps += t;
        }
        db
    }

    #[test]
    fn test_add_idle_op_balances_totals() {
        let mut db = db_with_op_time(100, &[30, 20]);
        add_idle_op(&mut db);
        let idle = db.idle_op().unwrap();
        assert_eq!(idle.self_time_ps, 50);
        assert_eq!(idle.occurrences, 0);
        assert_eq!(db.total_time_ps, db.total_op_time_ps + idle.self_time_ps);
        assert_eq!(db.busy_self_time_ps(), db.total_op_time_ps);
    }

    #[test]
    #[should_panic(expected = "already has an IDLE record")]
    fn test_add_idle_op_twice_panics() {
        let mut db = db_with_op_time(100, &[30]);
        add_idle_op(&mut db);
        add_idle_op(&mut db);
    }

    #[test]
    #[should_panic(expected = "below total op time")]
    fn test_add_idle_op_negative_idle_panics() {
        let mut db = db_with_op_time(10, &[30]);
        add_idle_op(&mut db);
    }

    #[test]
    fn test_idle_time_ratio() {
        assert!((idle_time_ratio(&OpMetricsDb::default()) - 1.0).abs() < f64::EPSILON);
        let db = db_with_op_time(100, &[25]);
        assert!((idle_time_ratio(&db) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_parse_source_info() {
        let info = parse_source_info("models/resnet.py:42", "").unwrap();
        assert_eq!(info.file_name, "models/resnet.py");
        assert_eq!(info.line_number, 42);
        assert!(parse_source_info("resnet.py", "").is_err());
        assert!(parse_source_info(":12", "").is_err());
        assert!(parse_source_info("resnet.py:abc", "").is_err());
        assert_eq!(source_info_or_log("bogus", ""), None);
    }

    #[test]
    fn test_parse_and_combine_memory_breakdown() {
        let parsed = parse_memory_breakdown("read:1:100, write:1:50,read:0:10").unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1].operation_type, MemoryOperation::Write);
        assert!(parse_memory_breakdown("copy:1:100").is_err());
        assert!(parse_memory_breakdown("read:1").is_err());

        let mut dst = Vec::new();
        combine_memory_breakdown(&mut dst, &parsed, 2);
        combine_memory_breakdown(&mut dst, &parsed[..1], 1);
        assert_eq!(dst.len(), 3);
        assert_eq!(dst[0].bytes_accessed, 300);
        assert_eq!(dst[1].bytes_accessed, 100);
    }

    #[test]
    fn test_host_infeed_enqueue_ratio() {
        assert_eq!(host_infeed_enqueue_ratio(&OpMetricsDb::default()), None);
        let db = OpMetricsDb {
            total_host_infeed_enq_duration_ps: 25,
            total_host_infeed_enq_start_timestamp_ps_diff: 100,
            ..OpMetricsDb::default()
        };
        assert_eq!(host_infeed_enqueue_ratio(&db), Some(0.25));
    }

    #[test]
    fn test_precision_percent() {
        let stats = PrecisionStats { compute_16bit_ps: 30, compute_32bit_ps: 10 };
        assert!((stats.compute_16bit_percent() - 75.0).abs() < 1e-9);
        assert!(PrecisionStats::default().compute_16bit_percent().abs() < f64::EPSILON);
    }
}

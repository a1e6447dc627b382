//! Trace-space containers.
//!
//! Immutable input for a whole conversion pass; owned by the caller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::schema::{sparse_core_id, tensor_core_id, StatType, GPU_PLANE_PREFIX, TPU_PLANE_PREFIX};
use crate::view::EventView;

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatValue {
    Int(i64),
    Uint(u64),
    Double(f64),
    Str(String),
    Bool(bool),
}

impl StatValue {
    /// Integer view; unsigned values above `i64::MAX` do not fit.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            StatValue::Int(v) => Some(v),
            StatValue::Uint(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Unsigned view; negative integers do not fit.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            StatValue::Int(v) => u64::try_from(v).ok(),
            StatValue::Uint(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            StatValue::Double(v) => Some(v),
            StatValue::Int(v) => Some(v as f64),
            StatValue::Uint(v) => Some(v as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            StatValue::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            StatValue::Bool(b) => Some(b),
            StatValue::Int(v) => Some(v != 0),
            StatValue::Uint(v) => Some(v != 0),
            _ => None,
        }
    }
}

impl From<i64> for StatValue {
    fn from(v: i64) -> Self {
        StatValue::Int(v)
    }
}

impl From<u64> for StatValue {
    fn from(v: u64) -> Self {
        StatValue::Uint(v)
    }
}

impl From<f64> for StatValue {
    fn from(v: f64) -> Self {
        StatValue::Double(v)
    }
}

impl From<bool> for StatValue {
    fn from(v: bool) -> Self {
        StatValue::Bool(v)
    }
}

impl From<&str> for StatValue {
    fn from(v: &str) -> Self {
        StatValue::Str(v.to_string())
    }
}

impl From<String> for StatValue {
    fn from(v: String) -> Self {
        StatValue::Str(v)
    }
}

/// One key-value attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XStat {
    pub stat_type: StatType,
    pub value: StatValue,
}

pub(crate) fn find_stat(stats: &[XStat], stat_type: StatType) -> Option<&StatValue> {
    stats.iter().find(|s| s.stat_type == stat_type).map(|s| &s.value)
}

/// Shared description of all events with the same name on a plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XEventMetadata {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats: Vec<XStat>,
    /// Metadata ids of fused child operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_ids: Vec<i64>,
}

impl XEventMetadata {
    #[must_use]
    pub fn stat(&self, stat_type: StatType) -> Option<&StatValue> {
        find_stat(&self.stats, stat_type)
    }
}

/// One timed occurrence on a line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XEvent {
    pub metadata_id: i64,
    /// Offset from the line's start timestamp, in picoseconds.
    pub offset_ps: u64,
    pub duration_ps: u64,
    /// Number of aggregated occurrences; 0 means a single occurrence.
    #[serde(default)]
    pub num_occurrences: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats: Vec<XStat>,
}

/// One parallel timeline within a plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XLine {
    pub id: i64,
    pub name: String,
    /// Line start, in nanoseconds; event offsets are relative to it.
    #[serde(default)]
    pub timestamp_ns: u64,
    #[serde(default)]
    pub events: Vec<XEvent>,
}

/// One host or device timeline container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XPlane {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub lines: Vec<XLine>,
    #[serde(default)]
    pub event_metadata: BTreeMap<i64, XEventMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats: Vec<XStat>,
}

impl XPlane {
    /// Plane-level attribute lookup.
    #[must_use]
    pub fn stat(&self, stat_type: StatType) -> Option<&StatValue> {
        find_stat(&self.stats, stat_type)
    }

    #[must_use]
    pub fn metadata(&self, id: i64) -> Option<&XEventMetadata> {
        self.event_metadata.get(&id)
    }

    #[must_use]
    pub fn line_by_name(&self, name: &str) -> Option<&XLine> {
        self.lines.iter().find(|l| l.name == name)
    }

    /// Iterate a line's events resolved against this plane's metadata.
    pub fn events<'a>(&'a self, line: &'a XLine) -> impl Iterator<Item = EventView<'a>> + 'a {
        line.events.iter().map(move |event| EventView::new(self, line, event))
    }

    #[must_use]
    pub fn is_tensor_core(&self) -> bool {
        tensor_core_id(&self.name).is_some()
    }

    #[must_use]
    pub fn is_sparse_core(&self) -> bool {
        sparse_core_id(&self.name).is_some()
    }
}

/// Instruction of a materialized hardware module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub name: String,
    pub opcode: String,
    #[serde(default)]
    pub category: String,
    /// Framework op that produced this instruction (`scope/name:Type`).
    #[serde(default)]
    pub tf_op_name: String,
    #[serde(default)]
    pub deduplicated_name: String,
    #[serde(default)]
    pub expression: String,
    /// `file:line` of the originating source.
    #[serde(default)]
    pub source_info: Option<String>,
    /// Declared cost, used when no cost analysis is registered.
    #[serde(default)]
    pub flops: u64,
    #[serde(default)]
    pub bytes_accessed: u64,
    #[serde(default)]
    pub operand_bytes: u64,
    #[serde(default)]
    pub output_bytes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fused_instructions: Vec<Instruction>,
}

/// Program (hardware module) captured alongside the trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramModule {
    pub program_id: u64,
    pub name: String,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
}

/// The whole trace: planes plus space-level diagnostics and programs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XSpace {
    #[serde(default)]
    pub planes: Vec<XPlane>,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub programs: Vec<ProgramModule>,
}

impl XSpace {
    #[must_use]
    pub fn find_planes_with_prefix(&self, prefix: &str) -> Vec<&XPlane> {
        self.planes.iter().filter(|p| p.name.starts_with(prefix)).collect()
    }

    #[must_use]
    pub fn find_plane_with_name(&self, name: &str) -> Option<&XPlane> {
        self.planes.iter().find(|p| p.name == name)
    }

    /// TPU planes (tensor cores and sparse cores).
    #[must_use]
    pub fn tpu_planes(&self) -> Vec<&XPlane> {
        self.find_planes_with_prefix(TPU_PLANE_PREFIX)
    }

    #[must_use]
    pub fn gpu_planes(&self) -> Vec<&XPlane> {
        self.find_planes_with_prefix(GPU_PLANE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_value_conversions() {
        assert_eq!(StatValue::Int(-1).as_u64(), None);
        assert_eq!(StatValue::Int(7).as_u64(), Some(7));
        assert_eq!(StatValue::Uint(u64::MAX).as_i64(), None);
        assert_eq!(StatValue::Uint(3).as_f64(), Some(3.0));
        assert_eq!(StatValue::Int(1).as_bool(), Some(true));
        assert_eq!(StatValue::from("x").as_str(), Some("x"));
        assert_eq!(StatValue::Double(1.0).as_i64(), None);
    }

    #[test]
    fn test_plane_classification() {
        let space = XSpace {
            planes: vec![
                XPlane { id: 1, name: "/device:TPU:0".to_string(), ..XPlane::default() },
                XPlane {
                    id: 2,
                    name: "/device:TPU:0 SparseCore 0".to_string(),
                    ..XPlane::default()
                },
                XPlane { id: 3, name: "/host:CPU".to_string(), ..XPlane::default() },
            ],
            ..XSpace::default()
        };
        assert_eq!(space.tpu_planes().len(), 2);
        assert_eq!(space.tpu_planes().iter().filter(|p| p.is_tensor_core()).count(), 1);
        assert!(space.gpu_planes().is_empty());
        assert!(space.find_plane_with_name("/host:CPU").is_some());
    }

    #[test]
    fn test_space_json_defaults() {
        let space: XSpace =
            serde_json::from_str(r#"{"planes":[{"id":1,"name":"/host:CPU"}]}"#).unwrap();
        assert_eq!(space.planes.len(), 1);
        assert!(space.planes[0].lines.is_empty());
        assert!(space.hostnames.is_empty());
    }
}

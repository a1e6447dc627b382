//! Typed execution spans inside a step.
//!
//! Every event that contributes to a step breakdown is reduced to an
//! [`EventTypeSpan`]: what kind of work it was and when it ran. Step
//! boundaries are [`StepMarker`]s.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::Timespan;

/// Kind of work an interval represents.
///
/// Declaration order is the priority order used when overlapping spans are
/// resolved by type: later variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Unknown = 0,
    HostCompute = 10,
    HostCompile = 20,
    HostToHost = 30,
    HostToDevice = 40,
    HostPrepare = 50,
    DeviceCollectives = 60,
    HostWaitInput = 70,
    DeviceToDevice = 80,
    DeviceToHost = 90,
    DeviceCompute32 = 100,
    DeviceCompute16 = 110,
    DeviceWaitDevice = 120,
    DeviceWaitHost = 130,
}

impl EventType {
    /// Work performed on (or waiting on) an accelerator.
    #[must_use]
    pub fn is_device(self) -> bool {
        matches!(
            self,
            EventType::DeviceCollectives
                | EventType::DeviceToDevice
                | EventType::DeviceToHost
                | EventType::DeviceCompute32
                | EventType::DeviceCompute16
                | EventType::DeviceWaitDevice
                | EventType::DeviceWaitHost
        )
    }

    #[must_use]
    pub fn is_host(self) -> bool {
        self != EventType::Unknown && !self.is_device()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Unknown => "unknown",
            EventType::HostCompute => "host compute",
            EventType::HostCompile => "host compile",
            EventType::HostToHost => "host to host",
            EventType::HostToDevice => "host to device",
            EventType::HostPrepare => "host prepare",
            EventType::DeviceCollectives => "device collectives",
            EventType::HostWaitInput => "host wait input",
            EventType::DeviceToDevice => "device to device",
            EventType::DeviceToHost => "device to host",
            EventType::DeviceCompute32 => "device compute 32-bit",
            EventType::DeviceCompute16 => "device compute 16-bit",
            EventType::DeviceWaitDevice => "device wait device",
            EventType::DeviceWaitHost => "device wait host",
        };
        f.write_str(name)
    }
}

/// An interval of one kind of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTypeSpan {
    pub event_type: EventType,
    pub span: Timespan,
}

impl EventTypeSpan {
    #[must_use]
    pub const fn new(event_type: EventType, span: Timespan) -> Self {
        Self { event_type, span }
    }
}

/// Where a step boundary came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMarkerType {
    /// A named step scope recorded by the host (e.g. a trace context).
    ExplicitHostStepMarker,
    /// A host scope that only carries a step name attribute.
    ImplicitHostStepMarker,
    /// A step-line event on a device.
    DeviceStepMarker,
}

/// One step-boundary annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMarker {
    pub marker_type: StepMarkerType,
    pub event_name: String,
    pub span: Timespan,
}

impl StepMarker {
    #[must_use]
    pub fn new(marker_type: StepMarkerType, event_name: impl Into<String>, span: Timespan) -> Self {
        Self { marker_type, event_name: event_name.into(), span }
    }

    #[must_use]
    pub fn is_device(&self) -> bool {
        self.marker_type == StepMarkerType::DeviceStepMarker
    }
}

// ============================================================================
// Classification
// ============================================================================

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Classifies a GPU stream event by name and operand shapes.
#[must_use]
pub fn classify_gpu_event(event_name: &str, tensor_shapes: &str) -> EventType {
    if starts_with_ignore_case(event_name, "MEMCPYHtoD") {
        EventType::HostToDevice
    } else if starts_with_ignore_case(event_name, "MEMCPYDtoH") {
        EventType::DeviceToHost
    } else if starts_with_ignore_case(event_name, "MEMCPYDtoD") {
        EventType::DeviceToDevice
    } else if starts_with_ignore_case(event_name, "nccl") {
        EventType::DeviceCollectives
    } else if tensor_shapes.contains("half") || tensor_shapes.contains("bfloat16") {
        EventType::DeviceCompute16
    } else {
        EventType::DeviceCompute32
    }
}

/// Classifies a host event.
///
/// With a device present, events correlated to device work (or executor
/// processing scopes) are host-side preparation for the device.
#[must_use]
pub fn classify_cpu_event(
    event_name: &str,
    has_device: bool,
    has_correlation_id: bool,
) -> EventType {
    if starts_with_ignore_case(event_name, "MEMCPYHtoD") || event_name.contains("Infeed") {
        EventType::HostToDevice
    } else if starts_with_ignore_case(event_name, "MEMCPYHtoH") {
        EventType::HostToHost
    } else if has_device
        && (has_correlation_id || starts_with_ignore_case(event_name, "ExecutorState::Process"))
    {
        EventType::HostPrepare
    } else if starts_with_ignore_case(event_name, "IteratorGetNext") {
        EventType::HostWaitInput
    } else {
        EventType::HostCompute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_gpu_event() {
        assert_eq!(classify_gpu_event("MemcpyHtoD", ""), EventType::HostToDevice);
        assert_eq!(classify_gpu_event("memcpyDtoH", ""), EventType::DeviceToHost);
        assert_eq!(classify_gpu_event("MEMCPYDtoD", ""), EventType::DeviceToDevice);
        assert_eq!(classify_gpu_event("ncclAllReduce", ""), EventType::DeviceCollectives);
        assert_eq!(classify_gpu_event("volta_hgemm", "(half[8,8])"), EventType::DeviceCompute16);
        assert_eq!(classify_gpu_event("gemm", "(bfloat16[2])"), EventType::DeviceCompute16);
        assert_eq!(classify_gpu_event("gemm", "(float[2])"), EventType::DeviceCompute32);
    }

    #[test]
    fn test_classify_cpu_event() {
        assert_eq!(classify_cpu_event("InfeedEnqueue", false, false), EventType::HostToDevice);
        assert_eq!(classify_cpu_event("MEMCPYHtoH", true, true), EventType::HostToHost);
        assert_eq!(classify_cpu_event("launch", true, true), EventType::HostPrepare);
        assert_eq!(
            classify_cpu_event("ExecutorState::Process", true, false),
            EventType::HostPrepare
        );
        assert_eq!(classify_cpu_event("launch", false, true), EventType::HostCompute);
        assert_eq!(classify_cpu_event("IteratorGetNext", false, false), EventType::HostWaitInput);
    }

    #[test]
    fn test_event_type_sides() {
        assert!(EventType::DeviceCompute16.is_device());
        assert!(EventType::HostPrepare.is_host());
        assert!(!EventType::Unknown.is_host());
        assert!(EventType::DeviceWaitHost > EventType::HostCompute);
    }
}

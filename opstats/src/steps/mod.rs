//! Step reconstruction and the step database.
//!
//! - [`event_span`]: typed spans, markers and event classification
//! - [`step_events`]: per-step details, union/intersection, non-overlap
//! - [`extraction`]: step events from device and host planes
//! - [`step_db`]: the ordered per-core step database

pub mod event_span;
pub mod extraction;
pub mod step_db;
pub mod step_events;

pub use event_span::{EventType, EventTypeSpan, StepMarker, StepMarkerType};
pub use extraction::{
    convert_device_trace_xplane_to_step_events, convert_host_threads_xplane_to_step_events,
};
pub use step_db::{convert_step_events_to_step_db, PerCoreStepInfo, StepDatabase, StepInfoResult};
pub use step_events::{OverlapPriority, StepDetails, StepEvents};

//! # Shared Trace-Space Model
//!
//! Defines the in-memory trace space consumed by the `opstats` engine and the
//! well-known names used to recognize planes, lines and events inside it.
//! Everything here is plain data with serde derives so the same types are
//! used by the CLI (JSON input), the conversion core and the test fixtures.
//!
//! ## Layout
//!
//! ```text
//! XSpace
//!  ├── planes: one per host or device
//!  │    ├── event_metadata: id → name / display name / stats / fused children
//!  │    ├── stats: plane-level attributes (device caps, core details, ...)
//!  │    └── lines: parallel timelines (threads, streams, hardware queues)
//!  │         └── events: metadata id + offset + duration + stats
//!  ├── hostnames, errors, warnings
//!  └── programs: materialized hardware modules (program id → instructions)
//! ```
//!
//! ## Key Types
//!
//! - [`XSpace`] / [`XPlane`] / [`XLine`] / [`XEvent`] - the trace containers
//! - [`StatType`] / [`StatValue`] - typed key-value attributes
//! - [`EventView`] - resolves an event against its plane's metadata
//! - [`ProgramModule`] / [`Instruction`] - program metadata used for op costs
//! - [`XPlaneBuilder`] - incremental plane construction (fixtures and tests)

pub mod builder;
pub mod schema;
pub mod space;
pub mod view;

pub use builder::{stat, XPlaneBuilder};
pub use schema::{sparse_core_id, tensor_core_id, StatType};
pub use space::{
    Instruction, ProgramModule, StatValue, XEvent, XEventMetadata, XLine, XPlane, XSpace, XStat,
};
pub use view::EventView;

//! Domain model for opstats
//!
//! This module contains core domain types and errors that provide:
//! - Exact integer interval arithmetic via [`Timespan`]
//! - Reserved core-id constants shared by every extraction pass
//! - Structured error handling for the collaborator-facing surface

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{
    Timespan, DEFAULT_GPU_LOCAL_CORE_ID, DEFAULT_HOST_CORE_ID, SPARSE_CORE_INDEX_START,
};

pub use errors::{ExportError, ParseError, TraceError};

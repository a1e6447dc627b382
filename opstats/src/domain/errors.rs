//! Structured error types for opstats
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Only collaborator-facing failures live here: invariant violations inside
//! the conversion core panic, and missing data degrades to empty results.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to read trace file {path}: {source}")]
    ReadFailed { path: PathBuf, source: std::io::Error },

    #[error("Failed to parse trace space: {0}")]
    InvalidTrace(#[from] serde_json::Error),

    #[error("Trace space has no planes")]
    EmptySpace,
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize op stats: {0}")]
    Json(#[from] serde_json::Error),
}

/// Malformed auxiliary attribute; logged, and the field is left unset.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid source info expression: '{0}'")]
    SourceInfo(String),

    #[error("Invalid source line: '{0}'")]
    SourceLine(String),

    #[error("Invalid core details: {0}")]
    CoreDetails(String),

    #[error("Invalid memory access breakdown entry: '{0}'")]
    MemoryAccess(String),

    #[error("Invalid kernel details: '{0}'")]
    KernelDetails(String),
}

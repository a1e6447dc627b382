//! Trace input and op-stats output.
//!
//! Traces are read as JSON trace spaces (see `opstats_common`); op stats are
//! written as one JSON document, compact or pretty-printed.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use log::info;
use opstats_common::XSpace;

use crate::convert::OpStats;
use crate::domain::{ExportError, TraceError};

/// Parses a trace space from JSON text.
///
/// # Errors
///
/// Returns [`TraceError::InvalidTrace`] for malformed JSON and
/// [`TraceError::EmptySpace`] when the space has no planes.
pub fn parse_xspace(json: &str) -> Result<XSpace, TraceError> {
    non_empty(serde_json::from_str(json)?)
}

/// Reads a trace space from a JSON file.
///
/// # Errors
///
/// Returns [`TraceError::ReadFailed`] when the file cannot be opened, and
/// the errors of [`parse_xspace`] otherwise.
pub fn load_xspace(path: &Path) -> Result<XSpace, TraceError> {
    let file = File::open(path)
        .map_err(|source| TraceError::ReadFailed { path: path.to_path_buf(), source })?;
    let space: XSpace = serde_json::from_reader(BufReader::new(file))?;
    info!("Loaded {} planes from {}", space.planes.len(), path.display());
    non_empty(space)
}

fn non_empty(space: XSpace) -> Result<XSpace, TraceError> {
    if space.planes.is_empty() {
        return Err(TraceError::EmptySpace);
    }
    Ok(space)
}

/// Serializes `op_stats` to `writer`, followed by a newline.
///
/// # Errors
///
/// Returns [`ExportError`] on serialization or write failure.
pub fn write_op_stats_json<W: Write>(
    mut writer: W,
    op_stats: &OpStats,
    pretty: bool,
) -> Result<(), ExportError> {
    if pretty {
        serde_json::to_writer_pretty(&mut writer, op_stats)?;
    } else {
        serde_json::to_writer(&mut writer, op_stats)?;
    }
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Writes `op_stats` to a new file at `path`.
///
/// # Errors
///
/// Returns [`ExportError`] when the file cannot be created or written.
pub fn write_op_stats_to_file(
    path: &Path,
    op_stats: &OpStats,
    pretty: bool,
) -> Result<(), ExportError> {
    let file = File::create(path)?;
    write_op_stats_json(BufWriter::new(file), op_stats, pretty)?;
    info!("Wrote op stats to {}", path.display());
    Ok(())
}

//! Incremental plane construction.
//!
//! Used by fixtures and tests to assemble planes without hand-writing
//! metadata tables.

use crate::schema::StatType;
use crate::space::{StatValue, XEvent, XEventMetadata, XLine, XPlane, XStat};

/// Shorthand for building one attribute.
pub fn stat(stat_type: StatType, value: impl Into<StatValue>) -> XStat {
    XStat { stat_type, value: value.into() }
}

/// Builds an [`XPlane`] line by line.
#[derive(Debug)]
pub struct XPlaneBuilder {
    plane: XPlane,
    next_metadata_id: i64,
}

impl XPlaneBuilder {
    #[must_use]
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self { plane: XPlane { id, name: name.into(), ..XPlane::default() }, next_metadata_id: 1 }
    }

    /// Metadata id for `name`, created on first use.
    pub fn event_metadata(&mut self, name: &str) -> i64 {
        if let Some(existing) = self.plane.event_metadata.values().find(|m| m.name == name) {
            return existing.id;
        }
        let id = self.create_event_metadata();
        if let Some(metadata) = self.plane.event_metadata.get_mut(&id) {
            metadata.name = name.to_string();
        }
        id
    }

    /// Fresh anonymous metadata entry.
    pub fn create_event_metadata(&mut self) -> i64 {
        let id = self.next_metadata_id;
        self.next_metadata_id += 1;
        self.plane.event_metadata.insert(id, XEventMetadata { id, ..XEventMetadata::default() });
        id
    }

    pub fn set_display_name(&mut self, metadata_id: i64, display_name: &str) {
        if let Some(metadata) = self.plane.event_metadata.get_mut(&metadata_id) {
            metadata.display_name = display_name.to_string();
        }
    }

    pub fn add_metadata_stat(
        &mut self,
        metadata_id: i64,
        stat_type: StatType,
        value: impl Into<StatValue>,
    ) {
        if let Some(metadata) = self.plane.event_metadata.get_mut(&metadata_id) {
            metadata.stats.push(stat(stat_type, value));
        }
    }

    pub fn add_metadata_child(&mut self, parent_id: i64, child_id: i64) {
        if let Some(metadata) = self.plane.event_metadata.get_mut(&parent_id) {
            metadata.child_ids.push(child_id);
        }
    }

    pub fn add_plane_stat(&mut self, stat_type: StatType, value: impl Into<StatValue>) {
        self.plane.stats.push(stat(stat_type, value));
    }

    /// Creates the line if no line with `id` exists yet.
    pub fn add_line(&mut self, id: i64, name: &str, timestamp_ns: u64) {
        if self.plane.lines.iter().any(|l| l.id == id) {
            return;
        }
        self.plane.lines.push(XLine {
            id,
            name: name.to_string(),
            timestamp_ns,
            events: Vec::new(),
        });
    }

    /// Appends an event to line `line_id`; ignored when the line is missing.
    pub fn add_event(
        &mut self,
        line_id: i64,
        metadata_id: i64,
        offset_ps: u64,
        duration_ps: u64,
        stats: Vec<XStat>,
    ) {
        if let Some(line) = self.plane.lines.iter_mut().find(|l| l.id == line_id) {
            line.events.push(XEvent {
                metadata_id,
                offset_ps,
                duration_ps,
                num_occurrences: 0,
                stats,
            });
        }
    }

    /// Convenience: resolve `name` to metadata and append the event.
    pub fn add_named_event(
        &mut self,
        line_id: i64,
        name: &str,
        offset_ps: u64,
        duration_ps: u64,
        stats: Vec<XStat>,
    ) {
        let metadata_id = self.event_metadata(name);
        self.add_event(line_id, metadata_id, offset_ps, duration_ps, stats);
    }

    #[must_use]
    pub fn build(self) -> XPlane {
        self.plane
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_reused_by_name() {
        let mut builder = XPlaneBuilder::new(0, "/host:CPU");
        let a = builder.event_metadata("matmul");
        let b = builder.event_metadata("matmul");
        let c = builder.create_event_metadata();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_events_land_on_their_line() {
        let mut builder = XPlaneBuilder::new(0, "/host:CPU");
        builder.add_line(0, "main", 0);
        builder.add_line(1, "worker", 0);
        builder.add_line(1, "duplicate", 0);
        builder.add_named_event(1, "matmul", 10, 5, Vec::new());
        builder.add_named_event(9, "missing line", 10, 5, Vec::new());
        let plane = builder.build();
        assert_eq!(plane.lines.len(), 2);
        assert_eq!(plane.lines[1].name, "worker");
        assert_eq!(plane.lines[1].events.len(), 1);
        assert!(plane.lines[0].events.is_empty());
    }
}

//! Read-only event views.

use crate::schema::StatType;
use crate::space::{find_stat, StatValue, XEvent, XEventMetadata, XLine, XPlane};

/// An event resolved against its plane's metadata table.
///
/// Stat lookups check the event's own stats first, then its metadata's.
#[derive(Debug, Clone, Copy)]
pub struct EventView<'a> {
    plane: &'a XPlane,
    line: &'a XLine,
    event: &'a XEvent,
    metadata: Option<&'a XEventMetadata>,
}

impl<'a> EventView<'a> {
    #[must_use]
    pub fn new(plane: &'a XPlane, line: &'a XLine, event: &'a XEvent) -> Self {
        Self { plane, line, event, metadata: plane.metadata(event.metadata_id) }
    }

    #[must_use]
    pub fn plane(&self) -> &'a XPlane {
        self.plane
    }

    #[must_use]
    pub fn line(&self) -> &'a XLine {
        self.line
    }

    #[must_use]
    pub fn metadata(&self) -> Option<&'a XEventMetadata> {
        self.metadata
    }

    /// Metadata name, or empty when the metadata id is dangling.
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.metadata.map_or("", |m| m.name.as_str())
    }

    #[must_use]
    pub fn display_name(&self) -> Option<&'a str> {
        self.metadata.map(|m| m.display_name.as_str()).filter(|n| !n.is_empty())
    }

    /// Absolute begin, in picoseconds.
    #[must_use]
    pub fn timestamp_ps(&self) -> u64 {
        self.line.timestamp_ns * 1000 + self.event.offset_ps
    }

    #[must_use]
    pub fn duration_ps(&self) -> u64 {
        self.event.duration_ps
    }

    #[must_use]
    pub fn end_ps(&self) -> u64 {
        self.timestamp_ps() + self.event.duration_ps
    }

    /// Number of occurrences folded into this event (at least 1).
    #[must_use]
    pub fn num_occurrences(&self) -> u64 {
        self.event.num_occurrences.max(1)
    }

    #[must_use]
    pub fn stat(&self, stat_type: StatType) -> Option<&'a StatValue> {
        self.event_stat(stat_type).or_else(|| self.metadata_stat(stat_type))
    }

    #[must_use]
    pub fn event_stat(&self, stat_type: StatType) -> Option<&'a StatValue> {
        find_stat(&self.event.stats, stat_type)
    }

    #[must_use]
    pub fn metadata_stat(&self, stat_type: StatType) -> Option<&'a StatValue> {
        self.metadata.and_then(|m| m.stat(stat_type))
    }
}

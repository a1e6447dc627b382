//! Domain types providing compile-time safety and self-documentation
//!
//! All times are integer picoseconds; no floating point is involved in
//! interval arithmetic.

use opstats_common::EventView;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Offset added to a sparse-core plane id to form its per-step core id, so
/// sparse cores never collide with tensor-core ids.
pub const SPARSE_CORE_INDEX_START: u32 = 1_000_000;

/// Core id used for GPU and host step information.
pub const DEFAULT_GPU_LOCAL_CORE_ID: u32 = 0;

/// Core id under which host (CPU) op metrics are attributed inside a step.
pub const DEFAULT_HOST_CORE_ID: u32 = 0;

/// Half-open time interval `[begin, begin + duration)` in picoseconds.
///
/// Ordered by begin ascending, then by duration descending, so an enclosing
/// interval sorts before the intervals it contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Timespan {
    begin_ps: u64,
    duration_ps: u64,
}

impl Timespan {
    #[must_use]
    pub const fn new(begin_ps: u64, duration_ps: u64) -> Self {
        Self { begin_ps, duration_ps }
    }

    /// Interval between two end points; an inverted pair collapses to an
    /// instant at `begin_ps`.
    #[must_use]
    pub fn from_end_points(begin_ps: u64, end_ps: u64) -> Self {
        Self { begin_ps, duration_ps: end_ps.saturating_sub(begin_ps) }
    }

    /// Span covered by one trace event.
    #[must_use]
    pub fn from_event(event: &EventView<'_>) -> Self {
        Self::new(event.timestamp_ps(), event.duration_ps())
    }

    #[must_use]
    pub const fn begin_ps(&self) -> u64 {
        self.begin_ps
    }

    #[must_use]
    pub const fn end_ps(&self) -> u64 {
        self.begin_ps + self.duration_ps
    }

    #[must_use]
    pub const fn duration_ps(&self) -> u64 {
        self.duration_ps
    }

    /// True for the default value (no begin, no duration).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.begin_ps == 0 && self.duration_ps == 0
    }

    #[must_use]
    pub const fn is_instant(&self) -> bool {
        self.duration_ps == 0
    }

    /// Whether `time_ps` falls inside the interval (an instant includes only
    /// its own timestamp).
    #[must_use]
    pub const fn includes_ps(&self, time_ps: u64) -> bool {
        if self.is_instant() {
            time_ps == self.begin_ps
        } else {
            self.begin_ps <= time_ps && time_ps < self.end_ps()
        }
    }

    #[must_use]
    pub const fn includes(&self, other: &Timespan) -> bool {
        self.begin_ps <= other.begin_ps && other.end_ps() <= self.end_ps()
    }

    #[must_use]
    pub fn overlaps(&self, other: &Timespan) -> bool {
        match (self.is_instant(), other.is_instant()) {
            (true, true) => self.begin_ps == other.begin_ps,
            (true, false) => other.includes_ps(self.begin_ps),
            (false, true) => self.includes_ps(other.begin_ps),
            (false, false) => self.begin_ps < other.end_ps() && other.begin_ps < self.end_ps(),
        }
    }

    /// Length of the intersection, 0 when disjoint.
    #[must_use]
    pub fn overlapped_duration_ps(&self, other: &Timespan) -> u64 {
        let begin = self.begin_ps.max(other.begin_ps);
        let end = self.end_ps().min(other.end_ps());
        end.saturating_sub(begin)
    }

    /// Grow to the smallest interval covering both.
    pub fn expand_to_include(&mut self, other: &Timespan) {
        if self.is_empty() {
            *self = *other;
            return;
        }
        *self = Self::from_end_points(
            self.begin_ps.min(other.begin_ps),
            self.end_ps().max(other.end_ps()),
        );
    }
}

impl Ord for Timespan {
    fn cmp(&self, other: &Self) -> Ordering {
        self.begin_ps
            .cmp(&other.begin_ps)
            .then_with(|| other.duration_ps.cmp(&self.duration_ps))
    }
}

impl PartialOrd for Timespan {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}ps, {}ps)", self.begin_ps, self.end_ps())
    }
}

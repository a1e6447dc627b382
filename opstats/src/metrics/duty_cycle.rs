//! Active/idle accounting per core and per chip.
//!
//! A [`DutyCycleTracker`] keeps disjoint labeled segments. Different lines of
//! the same core can report overlapping busy and off-duty windows, so
//! insertion resolves overlap with one rule: active wins.
//!
//! ```text
//!   existing:   [==idle==)      [==active==)
//!   insert:         [=====active=====)
//!   result:     [id)[=======active=======)
//!
//!   existing:   [==idle==)      [==active==)
//!   insert:         [======idle======)
//!   result:     [=====idle=====)[==active==)
//! ```
//!
//! Totals are sums over the segments, so `active + idle` is the length of
//! the union of everything inserted.

use std::collections::BTreeMap;

use log::warn;

use crate::domain::Timespan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    end_ps: u64,
    active: bool,
}

/// Disjoint active/idle segments of one core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DutyCycleTracker {
    /// begin → segment; segments never overlap.
    segments: BTreeMap<u64, Segment>,
}

impl DutyCycleTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a labeled interval; instants are ignored.
    pub fn add_interval(&mut self, span: Timespan, active: bool) {
        if span.is_instant() {
            return;
        }
        let (begin_ps, end_ps) = (span.begin_ps(), span.end_ps());
        if active {
            self.carve(begin_ps, end_ps);
            self.insert_segment(begin_ps, end_ps, true);
        } else {
            for (gap_begin, gap_end) in self.gaps(begin_ps, end_ps) {
                self.insert_segment(gap_begin, gap_end, false);
            }
        }
    }

    /// Merges every segment of `other` into this tracker.
    pub fn union(&mut self, other: &DutyCycleTracker) {
        for (&begin_ps, segment) in &other.segments {
            self.add_interval(Timespan::from_end_points(begin_ps, segment.end_ps), segment.active);
        }
    }

    #[must_use]
    pub fn total_active_time_ps(&self) -> u64 {
        self.total_where(true)
    }

    #[must_use]
    pub fn total_idle_time_ps(&self) -> u64 {
        self.total_where(false)
    }

    /// Length of the union of all inserted intervals.
    #[must_use]
    pub fn duration_ps(&self) -> u64 {
        self.total_active_time_ps() + self.total_idle_time_ps()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn total_where(&self, active: bool) -> u64 {
        self.segments
            .iter()
            .filter(|(_, s)| s.active == active)
            .map(|(&begin, s)| s.end_ps - begin)
            .sum()
    }

    /// Segments intersecting `[begin, end)`, ascending.
    fn overlapping(&self, begin_ps: u64, end_ps: u64) -> Vec<(u64, Segment)> {
        let mut found: Vec<(u64, Segment)> = self
            .segments
            .range(..end_ps)
            .rev()
            .take_while(|(_, s)| s.end_ps > begin_ps)
            .map(|(&b, &s)| (b, s))
            .collect();
        found.reverse();
        found
    }

    /// Removes `[begin, end)` from existing segments, keeping the remainders.
    fn carve(&mut self, begin_ps: u64, end_ps: u64) {
        for (seg_begin, segment) in self.overlapping(begin_ps, end_ps) {
            self.segments.remove(&seg_begin);
            if seg_begin < begin_ps {
                self.segments.insert(seg_begin, Segment { end_ps: begin_ps, ..segment });
            }
            if segment.end_ps > end_ps {
                self.segments.insert(end_ps, segment);
            }
        }
    }

    /// Uncovered pieces of `[begin, end)`.
    fn gaps(&self, begin_ps: u64, end_ps: u64) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        let mut cursor = begin_ps;
        for (seg_begin, segment) in self.overlapping(begin_ps, end_ps) {
            if seg_begin > cursor {
                gaps.push((cursor, seg_begin));
            }
            cursor = cursor.max(segment.end_ps);
        }
        if cursor < end_ps {
            gaps.push((cursor, end_ps));
        }
        gaps
    }

    /// Inserts a segment over free space, coalescing equal neighbours.
    fn insert_segment(&mut self, mut begin_ps: u64, mut end_ps: u64, active: bool) {
        if let Some((&prev_begin, prev)) = self.segments.range(..begin_ps).next_back() {
            if prev.end_ps == begin_ps && prev.active == active {
                begin_ps = prev_begin;
                self.segments.remove(&prev_begin);
            }
        }
        if let Some(next) = self.segments.get(&end_ps).copied() {
            if next.active == active {
                self.segments.remove(&end_ps);
                end_ps = next.end_ps;
            }
        }
        self.segments.insert(begin_ps, Segment { end_ps, active });
    }
}

/// Folds per-core trackers into per-chip and fleet-wide totals.
#[derive(Debug, Default)]
pub struct DutyCycleCombiner {
    chip_trackers: BTreeMap<u32, DutyCycleTracker>,
    unattributed_active_ps: u64,
    unattributed_idle_ps: u64,
}

impl DutyCycleCombiner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Unions a core's tracker into the tracker of its chip.
    pub fn combine_core(&mut self, tracker: &DutyCycleTracker, local_chip_id: u32) {
        self.chip_trackers.entry(local_chip_id).or_default().union(tracker);
    }

    /// Adds a tracker whose core identity could not be resolved.
    pub fn combine_chip(&mut self, tracker: &DutyCycleTracker) {
        warn!(
            "Duty cycle without core details: adding {}ps active, {}ps idle as unattributed",
            tracker.total_active_time_ps(),
            tracker.total_idle_time_ps()
        );
        self.unattributed_active_ps += tracker.total_active_time_ps();
        self.unattributed_idle_ps += tracker.total_idle_time_ps();
    }

    #[must_use]
    pub fn total_active_time_ps(&self) -> u64 {
        self.chip_trackers.values().map(DutyCycleTracker::total_active_time_ps).sum::<u64>()
            + self.unattributed_active_ps
    }

    #[must_use]
    pub fn total_idle_time_ps(&self) -> u64 {
        self.chip_trackers.values().map(DutyCycleTracker::total_idle_time_ps).sum::<u64>()
            + self.unattributed_idle_ps
    }

    #[must_use]
    pub fn num_chips(&self) -> usize {
        self.chip_trackers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn union_length(spans: &[Timespan]) -> u64 {
        let mut sorted: Vec<Timespan> = spans.iter().copied().filter(|s| !s.is_instant()).collect();
        sorted.sort();
        let mut total = 0;
        let mut current: Option<(u64, u64)> = None;
        for span in sorted {
            match current {
                Some((b, e)) if span.begin_ps() <= e => current = Some((b, e.max(span.end_ps()))),
                Some((b, e)) => {
                    total += e - b;
                    current = Some((span.begin_ps(), span.end_ps()));
                }
                None => current = Some((span.begin_ps(), span.end_ps())),
            }
        }
        total + current.map_or(0, |(b, e)| e - b)
    }

    #[test]
    fn test_active_and_idle_cover_union() {
        let inserts = [
            (Timespan::new(0, 100), false),
            (Timespan::new(50, 100), true),
            (Timespan::new(140, 30), false),
            (Timespan::new(300, 10), false),
            (Timespan::new(305, 0), true),
            (Timespan::new(20, 10), true),
        ];
        let mut tracker = DutyCycleTracker::new();
        for (span, active) in inserts {
            tracker.add_interval(span, active);
        }
        let spans: Vec<Timespan> = inserts.iter().map(|(s, _)| *s).collect();
        assert_eq!(tracker.duration_ps(), union_length(&spans));
        assert_eq!(tracker.total_active_time_ps(), 110);
        assert_eq!(tracker.total_idle_time_ps(), 40 + 20 + 10);
    }

    #[test]
    fn test_active_over_idle_moves_exact_overlap() {
        let mut tracker = DutyCycleTracker::new();
        tracker.add_interval(Timespan::new(0, 100), false);
        let (active_before, idle_before) =
            (tracker.total_active_time_ps(), tracker.total_idle_time_ps());
        tracker.add_interval(Timespan::new(80, 50), true);
        assert_eq!(tracker.total_active_time_ps(), active_before + 50);
        assert_eq!(tracker.total_idle_time_ps(), idle_before - 20);
    }

    #[test]
    fn test_idle_never_overrides_active() {
        let mut tracker = DutyCycleTracker::new();
        tracker.add_interval(Timespan::new(10, 10), true);
        tracker.add_interval(Timespan::new(0, 30), false);
        assert_eq!(tracker.total_active_time_ps(), 10);
        assert_eq!(tracker.total_idle_time_ps(), 20);
    }

    #[test]
    fn test_adjacent_segments_coalesce() {
        let mut tracker = DutyCycleTracker::new();
        tracker.add_interval(Timespan::new(0, 10), true);
        tracker.add_interval(Timespan::new(10, 10), true);
        tracker.add_interval(Timespan::new(20, 10), true);
        assert_eq!(tracker.segments.len(), 1);
        assert_eq!(tracker.total_active_time_ps(), 30);
    }

    #[test]
    fn test_union_is_order_independent() {
        let mut a = DutyCycleTracker::new();
        a.add_interval(Timespan::new(0, 50), false);
        a.add_interval(Timespan::new(60, 10), true);
        let mut b = DutyCycleTracker::new();
        b.add_interval(Timespan::new(20, 50), true);

        let mut ab = a.clone();
        ab.union(&b);
        let mut ba = b.clone();
        ba.union(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.total_active_time_ps(), 50);
        assert_eq!(ab.total_idle_time_ps(), 20);
    }

    #[test]
    fn test_combiner_per_chip_and_unattributed() {
        let mut core0 = DutyCycleTracker::new();
        core0.add_interval(Timespan::new(0, 100), false);
        core0.add_interval(Timespan::new(0, 40), true);
        let mut core1 = DutyCycleTracker::new();
        core1.add_interval(Timespan::new(30, 30), true);

        let mut combiner = DutyCycleCombiner::new();
        combiner.combine_core(&core0, 0);
        combiner.combine_core(&core1, 0);
        combiner.combine_chip(&core1);
        assert_eq!(combiner.num_chips(), 1);
        assert_eq!(combiner.total_active_time_ps(), 60 + 30);
        assert_eq!(combiner.total_idle_time_ps(), 40);
    }
}

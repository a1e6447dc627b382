//! Reconstructed steps and their combination.
//!
//! [`StepEvents`] maps a step (group) id to the [`StepDetails`] gathered by one
//! extraction pass. Passes over different planes are merged either by
//! **union** (GPU devices, host + device) or by **intersection** (TPU cores,
//! where a step missing on one core is incomplete everywhere).
//!
//! Before the step database is built, the events of each step are
//! normalized so no two overlap:
//!
//! ```text
//!   HostCompute   [=================)
//!   HostPrepare        [=====)
//!   result        [====)[=====)[====)
//!                  comp  prep   comp
//! ```
//!
//! Which event owns an overlapped piece is an [`OverlapPriority`].

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::Timespan;
use crate::metrics::op_metrics::{OpMetricsDb, PrecisionStats};
use crate::metrics::op_metrics_db_combiner::OpMetricsDbCombiner;
use crate::steps::event_span::{EventType, EventTypeSpan, StepMarker};

/// Rule choosing the owner of a sub-interval covered by several events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPriority {
    /// The most specific event wins: latest begin, then earliest end, then
    /// the higher event type.
    #[default]
    Innermost,
    /// The higher event type wins; ties go to the innermost event.
    HighestEventType,
}

/// Everything observed for one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepDetails {
    markers: Vec<StepMarker>,
    events: Vec<EventTypeSpan>,
    per_core_op_metrics_db: BTreeMap<u32, OpMetricsDb>,
    step_name: String,
}

impl StepDetails {
    pub fn add_marker(&mut self, marker: StepMarker) {
        self.markers.push(marker);
    }

    pub fn add_event(&mut self, event: EventTypeSpan) {
        self.events.push(event);
    }

    /// Adds `db` into this step's db for `core_id`.
    pub fn add_step_op_metrics(&mut self, core_id: u32, db: &OpMetricsDb) {
        let dst = self.per_core_op_metrics_db.entry(core_id).or_default();
        OpMetricsDbCombiner::new(dst).combine(db, false);
    }

    pub fn set_step_name(&mut self, name: &str) {
        self.step_name = name.to_string();
    }

    #[must_use]
    pub fn markers(&self) -> &[StepMarker] {
        &self.markers
    }

    #[must_use]
    pub fn events(&self) -> &[EventTypeSpan] {
        &self.events
    }

    #[must_use]
    pub fn per_core_op_metrics_db(&self) -> &BTreeMap<u32, OpMetricsDb> {
        &self.per_core_op_metrics_db
    }

    #[must_use]
    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Longest device marker, else longest host marker, else the envelope of
    /// the step's events.
    #[must_use]
    pub fn step_time(&self) -> Timespan {
        let longest = |device: bool| {
            self.markers
                .iter()
                .filter(|m| m.is_device() == device)
                .map(|m| m.span)
                .max_by_key(Timespan::duration_ps)
                .filter(|s| s.duration_ps() > 0)
        };
        if let Some(span) = longest(true).or_else(|| longest(false)) {
            return span;
        }
        let mut envelope = Timespan::default();
        for event in &self.events {
            envelope.expand_to_include(&event.span);
        }
        envelope
    }

    /// Merges `other` into this step: markers and events concatenated,
    /// per-core dbs added.
    pub fn combine(&mut self, other: &StepDetails) {
        self.markers.extend(other.markers.iter().cloned());
        self.events.extend(other.events.iter().copied());
        for (&core_id, db) in &other.per_core_op_metrics_db {
            self.add_step_op_metrics(core_id, db);
        }
        if self.step_name.is_empty() {
            self.step_name.clone_from(&other.step_name);
        }
    }

    /// Same step with its events rewritten into disjoint spans.
    #[must_use]
    pub fn to_non_overlapped(&self, priority: OverlapPriority) -> StepDetails {
        StepDetails {
            markers: self.markers.clone(),
            events: to_non_overlapped_events(&self.events, priority),
            per_core_op_metrics_db: self.per_core_op_metrics_db.clone(),
            step_name: self.step_name.clone(),
        }
    }
}

/// Step id → step details for one or more extraction passes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepEvents {
    steps: BTreeMap<u64, StepDetails>,
}

impl StepEvents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Details for `step_id`, created empty on first use.
    pub fn step_mut(&mut self, step_id: u64) -> &mut StepDetails {
        self.steps.entry(step_id).or_default()
    }

    #[must_use]
    pub fn get(&self, step_id: u64) -> Option<&StepDetails> {
        self.steps.get(&step_id)
    }

    #[must_use]
    pub fn contains(&self, step_id: u64) -> bool {
        self.steps.contains_key(&step_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step ids, ascending.
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.steps.keys().copied()
    }

    /// Steps in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &StepDetails)> + '_ {
        self.steps.iter().map(|(&id, details)| (id, details))
    }

    pub fn retain(&mut self, mut keep: impl FnMut(u64, &StepDetails) -> bool) {
        self.steps.retain(|&id, details| keep(id, details));
    }

    /// Adds every step of `other`; shared ids are combined.
    pub fn union(&mut self, other: &StepEvents) {
        for (&id, details) in &other.steps {
            self.step_mut(id).combine(details);
        }
    }

    /// Keeps only ids present in both; shared ids are combined.
    pub fn intersect(&mut self, other: &StepEvents) {
        self.steps.retain(|id, _| other.steps.contains_key(id));
        for (id, details) in &mut self.steps {
            if let Some(theirs) = other.steps.get(id) {
                details.combine(theirs);
            }
        }
    }

    /// Every step rewritten into disjoint event spans.
    #[must_use]
    pub fn to_non_overlapped(&self, priority: OverlapPriority) -> StepEvents {
        StepEvents {
            steps: self
                .steps
                .iter()
                .map(|(&id, details)| (id, details.to_non_overlapped(priority)))
                .collect(),
        }
    }

    /// Time in 16-bit and 32-bit device compute across all steps.
    #[must_use]
    pub fn precision_stats(&self) -> PrecisionStats {
        let mut stats = PrecisionStats::default();
        for event in self.steps.values().flat_map(|d| d.events.iter()) {
            match event.event_type {
                EventType::DeviceCompute16 => stats.compute_16bit_ps += event.span.duration_ps(),
                EventType::DeviceCompute32 => stats.compute_32bit_ps += event.span.duration_ps(),
                _ => {}
            }
        }
        stats
    }
}

impl FromIterator<(u64, StepDetails)> for StepEvents {
    fn from_iter<I: IntoIterator<Item = (u64, StepDetails)>>(iter: I) -> Self {
        Self { steps: iter.into_iter().collect() }
    }
}

// ============================================================================
// Non-overlap normalization
// ============================================================================

/// Ordering key of a candidate owner; the greatest key wins.
type PriorityKey = (Option<EventType>, u64, Reverse<u64>, Option<EventType>, usize);

fn priority_key(event: &EventTypeSpan, idx: usize, priority: OverlapPriority) -> PriorityKey {
    let (begin_ps, end_ps) = (event.span.begin_ps(), event.span.end_ps());
    match priority {
        OverlapPriority::Innermost => {
            (None, begin_ps, Reverse(end_ps), Some(event.event_type), idx)
        }
        OverlapPriority::HighestEventType => {
            (Some(event.event_type), begin_ps, Reverse(end_ps), None, idx)
        }
    }
}

/// Splits `events` at every boundary and gives each piece to one owner;
/// zero-length pieces are dropped and adjacent pieces of the same type are
/// coalesced.
#[must_use]
pub fn to_non_overlapped_events(
    events: &[EventTypeSpan],
    priority: OverlapPriority,
) -> Vec<EventTypeSpan> {
    let mut boundaries: Vec<u64> = events
        .iter()
        .filter(|e| !e.span.is_instant())
        .flat_map(|e| [e.span.begin_ps(), e.span.end_ps()])
        .collect();
    boundaries.sort_unstable();
    boundaries.dedup();

    let mut by_begin: Vec<usize> =
        (0..events.len()).filter(|&i| !events[i].span.is_instant()).collect();
    by_begin.sort_by_key(|&i| events[i].span.begin_ps());

    let mut active: BTreeSet<PriorityKey> = BTreeSet::new();
    let mut ends: BTreeMap<u64, Vec<PriorityKey>> = BTreeMap::new();
    let mut next = 0;
    let mut result: Vec<EventTypeSpan> = Vec::new();

    for window in boundaries.windows(2) {
        let (begin_ps, end_ps) = (window[0], window[1]);
        while next < by_begin.len() && events[by_begin[next]].span.begin_ps() <= begin_ps {
            let idx = by_begin[next];
            let key = priority_key(&events[idx], idx, priority);
            active.insert(key);
            ends.entry(events[idx].span.end_ps()).or_default().push(key);
            next += 1;
        }
        while let Some(entry) = ends.first_entry() {
            if *entry.key() > begin_ps {
                break;
            }
            for key in entry.remove() {
                active.remove(&key);
            }
        }
        let Some(&(.., owner)) = active.last() else {
            continue;
        };
        let event_type = events[owner].event_type;
        match result.last_mut() {
            Some(last) if last.event_type == event_type && last.span.end_ps() == begin_ps => {
                last.span = Timespan::from_end_points(last.span.begin_ps(), end_ps);
            }
            _ => result.push(EventTypeSpan::new(
                event_type,
                Timespan::from_end_points(begin_ps, end_ps),
            )),
        }
    }
    result
}

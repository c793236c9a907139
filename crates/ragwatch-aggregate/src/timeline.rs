//! Step-state fold: (event set) -> [`SessionTimeline`].
//!
//! Key invariants:
//! - Duplicate event ids collapse to the first occurrence in the input.
//! - Events are folded in (timestamp, event_id) order, never arrival order, so
//!   any permutation of the same set produces an identical timeline.
//! - Step phases are monotonic: `completed` and `failed` never regress.
//! - The input is only read; every call returns a fresh view.

use std::collections::HashSet;

use ragwatch_protocol::{EventId, ProcessEvent, StepStatus, StepType};
use serde::Serialize;

/// Derived status of one canonical step. `Pending` is the only phase absent
/// from the raw event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    #[default]
    Pending,
    Started,
    Completed,
    Failed,
    Skipped,
}

impl StepPhase {
    /// Whether an event with `next` status may move this phase.
    ///
    /// pending -> anything; started -> started/skipped/completed/failed;
    /// skipped -> completed/failed; completed and failed are final.
    pub fn admits(self, next: StepStatus) -> bool {
        match self {
            Self::Pending | Self::Started => true,
            Self::Skipped => next.is_terminal(),
            Self::Completed | Self::Failed => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl From<StepStatus> for StepPhase {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Started => Self::Started,
            StepStatus::Completed => Self::Completed,
            StepStatus::Failed => Self::Failed,
            StepStatus::Skipped => Self::Skipped,
        }
    }
}

/// Derived state of one canonical step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepState {
    pub step_type: StepType,
    pub phase: StepPhase,
    /// Every event seen for this step, in fold order.
    pub history: Vec<ProcessEvent>,
    /// The event that most recently set (or re-affirmed) `phase`.
    pub latest_event: Option<ProcessEvent>,
}

impl StepState {
    fn pending(step_type: StepType) -> Self {
        Self {
            step_type,
            phase: StepPhase::Pending,
            history: Vec::new(),
            latest_event: None,
        }
    }

    fn apply(&mut self, event: &ProcessEvent) {
        self.history.push(event.clone());
        if self.phase.admits(event.status) {
            self.phase = event.status.into();
            self.latest_event = Some(event.clone());
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.latest_event.as_ref().and_then(|event| event.duration_ms)
    }
}

/// Whole-session derived view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionTimeline {
    /// Deduplicated events sorted by (timestamp, event_id).
    pub events: Vec<ProcessEvent>,
    /// One entry per canonical step, in canonical order.
    pub steps: Vec<StepState>,
    /// Index of the started step, or of the next expected step. `None` only
    /// when no events exist.
    pub active_step: Option<usize>,
}

impl Default for SessionTimeline {
    fn default() -> Self {
        aggregate(std::iter::empty())
    }
}

impl SessionTimeline {
    pub fn step(&self, step_type: &StepType) -> Option<&StepState> {
        step_type
            .canonical_index()
            .and_then(|idx| self.steps.get(idx))
    }

    pub fn phases(&self) -> Vec<StepPhase> {
        self.steps.iter().map(|step| step.phase).collect()
    }

    /// `-1` when no events exist, matching the display convention.
    pub fn active_step_index(&self) -> i64 {
        self.active_step.map_or(-1, |idx| idx as i64)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn active_step_type(&self) -> Option<&StepType> {
        self.active_step.and_then(|idx| StepType::CANONICAL.get(idx))
    }
}

/// Fold an event set into a [`SessionTimeline`].
///
/// Events whose step is unrecognized stay in [`SessionTimeline::events`] but
/// are excluded from the per-step view.
pub fn aggregate<'a, I>(events: I) -> SessionTimeline
where
    I: IntoIterator<Item = &'a ProcessEvent>,
{
    let mut seen: HashSet<&EventId> = HashSet::new();
    let mut unique: Vec<&ProcessEvent> = events
        .into_iter()
        .filter(|&event| seen.insert(&event.event_id))
        .collect();
    unique.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });

    let mut steps: Vec<StepState> = StepType::CANONICAL
        .iter()
        .cloned()
        .map(StepState::pending)
        .collect();

    for event in &unique {
        if let Some(idx) = event.step_type.canonical_index() {
            steps[idx].apply(event);
        }
    }

    let active_step = if unique.is_empty() {
        None
    } else {
        Some(active_index(&steps))
    };

    SessionTimeline {
        events: unique.into_iter().cloned().collect(),
        steps,
        active_step,
    }
}

fn active_index(steps: &[StepState]) -> usize {
    if let Some(started) = steps
        .iter()
        .position(|step| step.phase == StepPhase::Started)
    {
        return started;
    }
    steps
        .iter()
        .rposition(|step| step.phase == StepPhase::Completed)
        .map_or(0, |last| last + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use ragwatch_protocol::SessionId;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn event(id: &str, step: StepType, status: StepStatus, offset_ms: i64) -> ProcessEvent {
        ProcessEvent::new(
            SessionId::from("s1"),
            id,
            step,
            status,
            t0() + Duration::milliseconds(offset_ms),
        )
    }

    /// A full vectorstore-routed run with a few interleavings.
    fn sample_run() -> Vec<ProcessEvent> {
        vec![
            event("e1", StepType::Routing, StepStatus::Started, 0),
            event("e2", StepType::Routing, StepStatus::Completed, 120).with_duration_ms(120),
            event("e3", StepType::Retrieve, StepStatus::Started, 130),
            event("e4", StepType::Retrieve, StepStatus::Completed, 400).with_duration_ms(270),
            event("e5", StepType::GradeDocuments, StepStatus::Started, 410),
            event("e6", StepType::Websearch, StepStatus::Skipped, 410),
        ]
    }

    fn permutations(items: &[ProcessEvent]) -> Vec<Vec<ProcessEvent>> {
        // Heap's algorithm.
        fn heap(k: usize, items: &mut Vec<ProcessEvent>, out: &mut Vec<Vec<ProcessEvent>>) {
            if k <= 1 {
                out.push(items.clone());
                return;
            }
            heap(k - 1, items, out);
            for i in 0..k - 1 {
                if k % 2 == 0 {
                    items.swap(i, k - 1);
                } else {
                    items.swap(0, k - 1);
                }
                heap(k - 1, items, out);
            }
        }
        let mut scratch = items.to_vec();
        let mut out = Vec::new();
        heap(scratch.len(), &mut scratch, &mut out);
        out
    }

    #[test]
    fn every_arrival_order_converges() {
        let run = sample_run();
        let expected = aggregate(&run);
        let orders = permutations(&run);
        assert_eq!(orders.len(), 720);
        for order in &orders {
            assert_eq!(aggregate(order), expected);
        }
    }

    /// Conflicting deliveries: a retransmitted id, a late `started` after a
    /// terminal event, a same-instant tie and a step outside the catalog.
    fn conflicting_run() -> Vec<ProcessEvent> {
        let retrieve_started = event("e3", StepType::Retrieve, StepStatus::Started, 130);
        vec![
            event("e1", StepType::Routing, StepStatus::Started, 0),
            event("e2", StepType::Routing, StepStatus::Completed, 120).with_duration_ms(120),
            event("e7", StepType::Routing, StepStatus::Started, 300),
            retrieve_started.clone(),
            retrieve_started,
            event("e4", StepType::Retrieve, StepStatus::Failed, 130).with_error("index offline"),
            event("e8", StepType::Unrecognized("rerank".into()), StepStatus::Started, 200),
        ]
    }

    #[test]
    fn conflicting_arrival_orders_converge() {
        let run = conflicting_run();
        let expected = aggregate(&run);
        let orders = permutations(&run);
        assert_eq!(orders.len(), 5040);
        for order in &orders {
            assert_eq!(aggregate(order), expected);
        }

        assert_eq!(expected.events.len(), 6);
        let routing = expected.step(&StepType::Routing).unwrap();
        assert_eq!(routing.phase, StepPhase::Completed);
        assert_eq!(routing.latest_event.as_ref().unwrap().event_id.as_str(), "e2");
        assert_eq!(routing.history.len(), 3);
        let retrieve = expected.step(&StepType::Retrieve).unwrap();
        assert_eq!(retrieve.phase, StepPhase::Failed);
        assert_eq!(retrieve.history.len(), 2);
        assert!(
            expected
                .events
                .iter()
                .any(|event| event.step_type.as_str() == "rerank")
        );
        assert!(expected.steps.iter().all(|step| {
            step.history
                .iter()
                .all(|event| event.step_type.canonical_index().is_some())
        }));
    }

    #[test]
    fn aggregation_is_repeatable() {
        let run = sample_run();
        assert_eq!(aggregate(&run), aggregate(&run));
        let again = aggregate(&aggregate(&run).events);
        assert_eq!(again, aggregate(&run));
    }

    #[test]
    fn duplicate_event_id_collapses() {
        let run = sample_run();
        let mut with_dup = run.clone();
        let mut dup = run[1].clone();
        dup.duration_ms = Some(9_999);
        dup.error_message = Some("retransmitted".into());
        with_dup.push(dup);

        let timeline = aggregate(&with_dup);
        assert_eq!(timeline, aggregate(&run));
        assert_eq!(timeline.events.len(), run.len());
        let routing = timeline.step(&StepType::Routing).unwrap();
        assert_eq!(routing.duration_ms(), Some(120));
    }

    #[test]
    fn late_started_does_not_reopen_completed_step() {
        let completed = event("b", StepType::Generate, StepStatus::Completed, 500);
        let earlier_started = event("a", StepType::Generate, StepStatus::Started, 100);
        let later_started = event("c", StepType::Generate, StepStatus::Started, 900);

        let timeline = aggregate([&completed, &earlier_started, &later_started]);
        let generate = timeline.step(&StepType::Generate).unwrap();
        assert_eq!(generate.phase, StepPhase::Completed);
        assert_eq!(generate.latest_event.as_ref().unwrap().event_id.as_str(), "b");
        assert_eq!(generate.history.len(), 3);
    }

    #[test]
    fn failed_is_final_too() {
        let failed = event("x1", StepType::HallucinationCheck, StepStatus::Failed, 200)
            .with_error("grader timeout");
        let retry = event("x2", StepType::HallucinationCheck, StepStatus::Completed, 300);
        let timeline = aggregate([&retry, &failed]);
        let step = timeline.step(&StepType::HallucinationCheck).unwrap();
        assert_eq!(step.phase, StepPhase::Failed);
        assert_eq!(
            step.latest_event.as_ref().unwrap().error_message.as_deref(),
            Some("grader timeout")
        );
    }

    #[test]
    fn equal_timestamps_break_ties_by_event_id() {
        let started = event("z", StepType::Retrieve, StepStatus::Started, 100);
        let completed = event("a", StepType::Retrieve, StepStatus::Completed, 100);
        let timeline = aggregate([&started, &completed]);
        assert_eq!(timeline.events[0].event_id.as_str(), "a");
        assert_eq!(
            timeline.step(&StepType::Retrieve).unwrap().phase,
            StepPhase::Completed
        );
    }

    #[test]
    fn skipped_overrides_started_but_not_terminal() {
        let started = event("w1", StepType::Websearch, StepStatus::Started, 10);
        let skipped = event("w2", StepType::Websearch, StepStatus::Skipped, 20);
        let timeline = aggregate([&started, &skipped]);
        assert_eq!(
            timeline.step(&StepType::Websearch).unwrap().phase,
            StepPhase::Skipped
        );

        let done = event("g1", StepType::Generate, StepStatus::Completed, 10);
        let skipped = event("g2", StepType::Generate, StepStatus::Skipped, 20);
        let timeline = aggregate([&done, &skipped]);
        assert_eq!(
            timeline.step(&StepType::Generate).unwrap().phase,
            StepPhase::Completed
        );
    }

    #[test]
    fn active_step_is_the_started_one() {
        let events = [
            event("1", StepType::Routing, StepStatus::Completed, 1),
            event("2", StepType::Retrieve, StepStatus::Completed, 2),
            event("3", StepType::GradeDocuments, StepStatus::Started, 3),
        ];
        let timeline = aggregate(&events);
        use StepPhase::*;
        assert_eq!(
            timeline.phases(),
            vec![Completed, Completed, Started, Pending, Pending, Pending, Pending]
        );
        assert_eq!(timeline.active_step, Some(2));
        assert_eq!(timeline.active_step_type(), Some(&StepType::GradeDocuments));
    }

    #[test]
    fn active_step_is_zero_when_all_pending() {
        let unknown = event("u1", StepType::parse("rerank"), StepStatus::Started, 1);
        let timeline = aggregate([&unknown]);
        assert!(timeline.phases().iter().all(|p| *p == StepPhase::Pending));
        assert_eq!(timeline.active_step, Some(0));
        assert_eq!(timeline.events.len(), 1);
    }

    #[test]
    fn active_step_is_past_the_end_when_all_completed() {
        let events: Vec<_> = StepType::CANONICAL
            .iter()
            .enumerate()
            .map(|(i, step)| {
                event(&format!("c{i}"), step.clone(), StepStatus::Completed, i as i64)
            })
            .collect();
        let timeline = aggregate(&events);
        assert_eq!(timeline.active_step, Some(StepType::COUNT));
        assert_eq!(timeline.active_step_index(), 7);
    }

    #[test]
    fn active_step_is_next_after_last_completed() {
        // routing done, websearch skipped: next expected is retrieve.
        let events = [
            event("1", StepType::Routing, StepStatus::Completed, 1),
            event("2", StepType::Websearch, StepStatus::Skipped, 2),
        ];
        assert_eq!(aggregate(&events).active_step, Some(1));
    }

    #[test]
    fn empty_set_has_no_active_step() {
        let timeline = SessionTimeline::default();
        assert_eq!(timeline.active_step, None);
        assert_eq!(timeline.active_step_index(), -1);
        assert_eq!(timeline.steps.len(), StepType::COUNT);
        assert!(timeline.is_empty());
    }

    #[test]
    fn input_is_not_mutated() {
        let run = sample_run();
        let before = run.clone();
        let _ = aggregate(&run);
        assert_eq!(run, before);
    }
}

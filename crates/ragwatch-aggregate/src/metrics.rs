//! Summary numbers derived from a timeline.

use chrono::{DateTime, Utc};
use ragwatch_protocol::StepType;
use serde::Serialize;

use crate::timeline::{SessionTimeline, StepPhase};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessMetrics {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    /// Sum of `duration_ms` over every known event.
    pub total_duration_ms: u64,
    /// Mean over events that report a duration, 0 when none do.
    pub average_step_duration_ms: f64,
    /// Generation attempts beyond the first.
    pub retry_count: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ProcessMetrics {
    pub fn from_timeline(timeline: &SessionTimeline) -> Self {
        let count = |phase: StepPhase| timeline.steps.iter().filter(|s| s.phase == phase).count();

        let durations: Vec<u64> = timeline
            .events
            .iter()
            .filter_map(|event| event.duration_ms)
            .collect();
        let total_duration_ms = durations.iter().sum::<u64>();
        let average_step_duration_ms = if durations.is_empty() {
            0.0
        } else {
            total_duration_ms as f64 / durations.len() as f64
        };

        let retry_count = timeline
            .events
            .iter()
            .filter(|event| event.step_type == StepType::Generate)
            .filter_map(|event| event.details.generation_attempt)
            .max()
            .map_or(0, |attempt| attempt.saturating_sub(1));

        Self {
            total_steps: StepType::COUNT,
            completed_steps: count(StepPhase::Completed),
            failed_steps: count(StepPhase::Failed),
            skipped_steps: count(StepPhase::Skipped),
            total_duration_ms,
            average_step_duration_ms,
            retry_count,
            last_activity: timeline.events.last().map(|event| event.timestamp),
        }
    }
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self::from_timeline(&SessionTimeline::default())
    }
}

use chrono::{DateTime, Utc};
use ragwatch_aggregate::{ProcessMetrics, SessionTimeline};
use ragwatch_protocol::SessionId;
use ragwatch_stream::ConnectionStatus;
use serde::Serialize;

/// Everything a renderer needs for one session, republished on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: Option<SessionId>,
    pub enabled: bool,
    pub timeline: SessionTimeline,
    pub metrics: ProcessMetrics,
    pub connection: ConnectionStatus,
    /// Local arrival time of the latest new incremental event.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Last operator-visible failure, e.g. a rejected clear.
    pub last_error: Option<String>,
}

impl SessionView {
    pub fn idle(connection: ConnectionStatus) -> Self {
        let timeline = SessionTimeline::default();
        Self {
            session_id: None,
            enabled: false,
            metrics: ProcessMetrics::from_timeline(&timeline),
            timeline,
            connection,
            last_event_at: None,
            last_error: None,
        }
    }

    /// One-line progress summary, e.g. `2/7 steps, at Grade Documents [Connected]`.
    pub fn summary(&self) -> String {
        let progress = format!(
            "{}/{} steps",
            self.metrics.completed_steps, self.metrics.total_steps
        );
        match self.timeline.active_step_type() {
            Some(step) if !self.timeline.is_empty() => {
                format!("{progress}, at {} [{}]", step.label(), self.connection.label())
            }
            _ => format!("{progress} [{}]", self.connection.label()),
        }
    }
}

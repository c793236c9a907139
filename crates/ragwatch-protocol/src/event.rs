//! Process events: immutable facts about one pipeline stage at one instant.
//!
//! An update to a stage is always a new event, never an edit. The wire shape
//! is flat JSON; stage-specific fields are grouped into [`StepDetails`] and
//! flattened back out on serialization.

use crate::catalog::StepType;
use crate::ids::{EventId, SessionId};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Raw status vocabulary emitted by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// `completed` or `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Relevance grade for one retrieved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentGrade {
    pub content_preview: String,
    /// "yes" or "no".
    pub relevance_score: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl DocumentGrade {
    pub fn is_relevant(&self) -> bool {
        verdict(&self.relevance_score).unwrap_or(false)
    }
}

/// Stage-specific payload. Every field is optional; which ones are set
/// depends on the step and status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,

    // routing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_reasoning: Option<String>,

    // retrieval and grading
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_count")]
    pub documents_found: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents_graded: Option<Vec<DocumentGrade>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_count")]
    pub relevant_documents: Option<u32>,

    // web search
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_search_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_count")]
    pub web_sources_found: Option<u32>,

    // generation
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_count")]
    pub generation_attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_preview: Option<String>,

    // verdicts, "yes" or "no"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hallucination_score: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_grade: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl StepDetails {
    /// `Some(true)` when the hallucination grader judged the answer grounded.
    pub fn is_grounded(&self) -> Option<bool> {
        self.hallucination_score.as_deref().and_then(verdict)
    }

    /// `Some(true)` when the answer grader judged the question addressed.
    pub fn answers_question(&self) -> Option<bool> {
        self.answer_grade.as_deref().and_then(verdict)
    }

    /// Prefers the explicit count, falls back to counting graded documents.
    pub fn relevant_count(&self) -> Option<u32> {
        self.relevant_documents.or_else(|| {
            self.documents_graded
                .as_ref()
                .map(|grades| grades.iter().filter(|g| g.is_relevant()).count() as u32)
        })
    }
}

fn verdict(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

/// A single process event in the RAG workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub session_id: SessionId,
    pub event_id: EventId,
    pub step_type: StepType,
    pub status: StepStatus,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_count"
    )]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub details: StepDetails,
}

impl ProcessEvent {
    /// Create an event with an empty payload.
    pub fn new(
        session_id: SessionId,
        event_id: impl Into<EventId>,
        step_type: StepType,
        status: StepStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            event_id: event_id.into(),
            step_type,
            status,
            timestamp,
            duration_ms: None,
            error_message: None,
            details: StepDetails::default(),
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: StepDetails) -> Self {
        self.details = details;
        self
    }
}

/// Accepts RFC 3339 and naive ISO-8601 (no offset). The producer emits naive
/// local timestamps; those are taken as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    // Bulk snapshots are rendered with `str(datetime)`: space separator.
    if let Ok(parsed) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|error| format!("invalid timestamp {raw:?}: {error}"))
}

/// Durations and counts are optional extras: a fractional value is rounded,
/// and anything negative or non-numeric is dropped instead of failing the
/// whole event.
fn lenient_count<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(non_negative_integer)
        .and_then(|n| T::try_from(n).ok()))
}

fn non_negative_integer(value: &Value) -> Option<u64> {
    let Value::Number(number) = value else {
        return None;
    };
    number.as_u64().or_else(|| {
        number
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f.round() as u64)
    })
}

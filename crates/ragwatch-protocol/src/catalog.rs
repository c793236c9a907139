//! Step catalog: the seven canonical pipeline stages in order, with display
//! metadata.
//!
//! Forward-compatible: an unknown `step_type` string deserializes into
//! [`StepType::Unrecognized`] instead of failing the whole event.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// One stage of the RAG pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepType {
    Routing,
    Retrieve,
    GradeDocuments,
    Websearch,
    Generate,
    HallucinationCheck,
    AnswerGrading,
    /// A stage id this build does not know about. Excluded from per-step views.
    Unrecognized(String),
}

/// Display metadata for a canonical step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepInfo {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
}

impl StepType {
    /// Canonical order a pipeline run conceptually passes through.
    pub const CANONICAL: [StepType; 7] = [
        StepType::Routing,
        StepType::Retrieve,
        StepType::GradeDocuments,
        StepType::Websearch,
        StepType::Generate,
        StepType::HallucinationCheck,
        StepType::AnswerGrading,
    ];

    /// Number of canonical steps.
    pub const COUNT: usize = Self::CANONICAL.len();

    pub fn parse(raw: &str) -> Self {
        match raw {
            "routing" => Self::Routing,
            "retrieve" => Self::Retrieve,
            "grade_documents" => Self::GradeDocuments,
            "websearch" => Self::Websearch,
            "generate" => Self::Generate,
            "hallucination_check" => Self::HallucinationCheck,
            "answer_grading" => Self::AnswerGrading,
            other => Self::Unrecognized(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Unrecognized(raw) => raw,
            known => known.info().map(|info| info.id).unwrap_or_default(),
        }
    }

    /// Position in [`StepType::CANONICAL`], `None` for unrecognized steps.
    pub fn canonical_index(&self) -> Option<usize> {
        match self {
            Self::Routing => Some(0),
            Self::Retrieve => Some(1),
            Self::GradeDocuments => Some(2),
            Self::Websearch => Some(3),
            Self::Generate => Some(4),
            Self::HallucinationCheck => Some(5),
            Self::AnswerGrading => Some(6),
            Self::Unrecognized(_) => None,
        }
    }

    pub fn info(&self) -> Option<StepInfo> {
        let info = match self {
            Self::Routing => StepInfo {
                id: "routing",
                label: "Route Question",
                description: "Decide between the vector store and web search",
            },
            Self::Retrieve => StepInfo {
                id: "retrieve",
                label: "Retrieve Documents",
                description: "Fetch candidate documents from the vector store",
            },
            Self::GradeDocuments => StepInfo {
                id: "grade_documents",
                label: "Grade Documents",
                description: "Score each retrieved document for relevance",
            },
            Self::Websearch => StepInfo {
                id: "websearch",
                label: "Web Search",
                description: "Supplement context with web results",
            },
            Self::Generate => StepInfo {
                id: "generate",
                label: "Generate Answer",
                description: "Draft an answer from the graded context",
            },
            Self::HallucinationCheck => StepInfo {
                id: "hallucination_check",
                label: "Hallucination Check",
                description: "Verify the answer is grounded in the documents",
            },
            Self::AnswerGrading => StepInfo {
                id: "answer_grading",
                label: "Answer Grading",
                description: "Check the answer addresses the question",
            },
            Self::Unrecognized(_) => return None,
        };
        Some(info)
    }

    pub fn label(&self) -> &str {
        self.info().map(|info| info.label).unwrap_or(self.as_str())
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StepType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StepType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

//! Step-state aggregation for RAG process visualization.
//!
//! [`aggregate`] is a pure function from a set of process events to a
//! [`SessionTimeline`]. It is idempotent and independent of arrival order:
//! correctness of the whole view reduces to that fold.
//!
//! [`EventSet`] is the mutable accumulation half that a session controller
//! owns; it never feeds the fold anything but a read-only view.

pub mod event_set;
pub mod metrics;
pub mod timeline;

pub use event_set::EventSet;
pub use metrics::ProcessMetrics;
pub use timeline::{SessionTimeline, StepPhase, StepState, aggregate};

//! # ragwatch-protocol — RAG process visualization contract
//!
//! Shared types for observing a multi-stage RAG pipeline over a live channel.
//! Dependency-light (no tokio, no HTTP) so the aggregator can stay a pure
//! crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed ID wrappers (SessionId, EventId)
//! - [`catalog`] — The seven canonical steps, in order, with display metadata
//! - [`event`] — ProcessEvent, StepStatus, stage payloads
//! - [`frame`] — Inbound/outbound channel frames
//! - [`ports`] — Transport and history boundaries
//! - [`error`] — WatchError, WatchResult

pub mod catalog;
pub mod error;
pub mod event;
pub mod frame;
pub mod ids;
pub mod ports;

pub use catalog::{StepInfo, StepType};
pub use error::{WatchError, WatchResult};
pub use event::{DocumentGrade, ProcessEvent, StepDetails, StepStatus, parse_timestamp};
pub use frame::{FrameError, InboundFrame, OutboundFrame, Snapshot};
pub use ids::{EventId, SessionId};
pub use ports::{Channel, Connector, HistoryPort};

//! Control and data frames exchanged over the visualization channel.
//!
//! Outbound frames are tiny control messages. Inbound frames are
//! distinguished by a top-level `"type"` discriminator; anything without a
//! recognised discriminator is read as a bare [`ProcessEvent`].

use crate::event::ProcessEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Client to server control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Resync request: ask for the full current event set.
    GetEvents,
    /// Heartbeat.
    Ping,
}

impl OutboundFrame {
    pub fn to_json(&self) -> String {
        match self {
            Self::GetEvents => r#"{"type":"get_events"}"#.to_owned(),
            Self::Ping => r#"{"type":"ping"}"#.to_owned(),
        }
    }
}

/// Server to client frames.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Heartbeat acknowledgment.
    Pong,
    /// Resync response. Replaces the receiver's working set.
    SessionEvents(Snapshot),
    /// One incremental update.
    Event(Box<ProcessEvent>),
}

/// Bulk snapshot of a session's events.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub events: Vec<ProcessEvent>,
    /// Entries that failed to parse and were left out.
    pub rejected: usize,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("session_events frame has no events array")]
    MissingEvents,
    #[error("invalid process event: {0}")]
    InvalidEvent(String),
}

impl InboundFrame {
    /// Parse one text frame.
    ///
    /// A `session_events` frame is parsed entry by entry: malformed entries
    /// are counted in [`Snapshot::rejected`] rather than failing the frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: Value = serde_json::from_str(text)?;
        let Some(obj) = raw.as_object() else {
            return Err(FrameError::NotAnObject);
        };

        let kind = obj.get("type").and_then(Value::as_str).map(str::to_owned);
        match kind.as_deref() {
            Some("pong") => Ok(Self::Pong),
            Some("session_events") => {
                let entries = obj
                    .get("events")
                    .and_then(Value::as_array)
                    .ok_or(FrameError::MissingEvents)?;
                let mut snapshot = Snapshot::default();
                for entry in entries {
                    match serde_json::from_value::<ProcessEvent>(entry.clone()) {
                        Ok(event) => snapshot.events.push(event),
                        Err(_) => snapshot.rejected += 1,
                    }
                }
                Ok(Self::SessionEvents(snapshot))
            }
            _ => serde_json::from_value::<ProcessEvent>(raw)
                .map(|event| Self::Event(Box::new(event)))
                .map_err(|error| FrameError::InvalidEvent(error.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pong => "pong",
            Self::SessionEvents(_) => "session_events",
            Self::Event(_) => "event",
        }
    }
}

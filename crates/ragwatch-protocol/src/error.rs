//! Error types for the visualization client.

use thiserror::Error;

/// Errors surfaced by transports, collaborators, and the session controller.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("history request failed: {message}")]
    History {
        status: Option<u16>,
        message: String,
    },
    #[error("no session is enabled")]
    NoSession,
}

impl WatchError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// Convenience result type for visualization operations.
pub type WatchResult<T> = Result<T, WatchError>;

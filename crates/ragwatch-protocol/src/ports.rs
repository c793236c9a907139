//! Runtime ports: the only boundary between the visualization client and the
//! outside world.
//!
//! - [`Connector`] / [`Channel`]: the per-session duplex channel. A channel is a
//!   capability object; the stream client owns it and every timer around it.
//! - [`HistoryPort`]: the backend's stored-event REST surface.
//!
//! Traits use `async-trait` for async dyn-dispatch.

use crate::error::WatchResult;
use crate::event::ProcessEvent;
use crate::frame::OutboundFrame;
use crate::ids::SessionId;
use async_trait::async_trait;

/// Opens channels keyed by session id.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel. Resolving `Ok` means the handshake completed.
    async fn connect(&self, session_id: &SessionId) -> WatchResult<Box<dyn Channel>>;
}

/// One live duplex channel.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, frame: OutboundFrame) -> WatchResult<()>;

    /// Next inbound text frame. `None` once the peer has closed.
    ///
    /// Must be cancel-safe: the caller races it against timers and commands.
    async fn recv(&mut self) -> Option<WatchResult<String>>;

    /// Close from our side. Must be safe to call on an already closed channel.
    async fn close(&mut self);
}

/// Stored-event collaborator.
#[async_trait]
pub trait HistoryPort: Send + Sync {
    /// Delete every stored event for the session.
    async fn clear_events(&self, session_id: &SessionId) -> WatchResult<()>;

    /// Fetch every stored event for the session.
    async fn fetch_events(&self, session_id: &SessionId) -> WatchResult<Vec<ProcessEvent>>;
}

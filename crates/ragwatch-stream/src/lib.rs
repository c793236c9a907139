//! Resilient per-session stream client.
//!
//! [`StreamClient`] keeps one channel per watched session open, retries with
//! linear backoff up to a fixed budget, pings on a heartbeat and requests a
//! full snapshot each time the channel opens. Parsed frames fan out to any
//! number of subscribers.
//!
//! The lifecycle itself lives in [`machine`] and performs no IO, so every
//! transition is testable without a runtime.

pub mod client;
pub mod config;
pub mod machine;
pub mod ws;

pub use client::StreamClient;
pub use config::{RetryPolicy, SESSION_PLACEHOLDER, StreamConfig};
pub use machine::{AttemptId, ConnectionMachine, ConnectionState, ConnectionStatus, Effect};
pub use ws::{WsChannel, WsConnector};

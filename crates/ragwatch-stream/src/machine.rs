//! Connection lifecycle as a sans-IO state machine.
//!
//! ```text
//! Idle ──enable──▶ Connecting ──handshake──▶ Open
//!                    │    ▲                   │
//!             close  │    │ backoff elapsed   │ close
//!                    ▼    │                   ▼
//!                  Retrying ◀─────────────────┘
//!                    │ retries exhausted
//!                    ▼
//!                  Failed ──refresh──▶ Connecting
//! ```
//!
//! Every input returns the [`Effect`]s the driver must perform. The machine
//! never touches a socket or a timer itself, and it tags each connect attempt
//! so a result or close from a superseded attempt is ignored.

use std::time::Duration;

use ragwatch_protocol::{OutboundFrame, SessionId};
use serde::Serialize;
use tracing::debug;

use crate::config::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Retrying,
    Failed,
}

/// Snapshot of the connection for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn idle(max_retries: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            retry_count: 0,
            max_retries,
            last_error: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn label(&self) -> String {
        match self.state {
            ConnectionState::Idle => "Disabled".to_owned(),
            ConnectionState::Connecting => "Connecting...".to_owned(),
            ConnectionState::Open => "Connected".to_owned(),
            ConnectionState::Retrying => format!(
                "Reconnecting ({}/{})",
                self.retry_count, self.max_retries
            ),
            ConnectionState::Failed => "Connection lost. Refresh to reconnect.".to_owned(),
        }
    }
}

/// Identifies one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Connect {
        attempt: AttemptId,
        session_id: SessionId,
    },
    Send(OutboundFrame),
    /// Close the live channel, or abandon the in-flight connect.
    CloseChannel,
    ScheduleReconnect(Duration),
    CancelReconnect,
    StartHeartbeat(Duration),
    StopHeartbeat,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: RetryPolicy,
    state: ConnectionState,
    session_id: Option<SessionId>,
    retry_count: u32,
    attempt: u64,
    last_error: Option<String>,
}

impl ConnectionMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Idle,
            session_id: None,
            retry_count: 0,
            attempt: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            retry_count: self.retry_count,
            max_retries: self.policy.max_retries,
            last_error: self.last_error.clone(),
        }
    }

    /// Start watching `session_id`, tearing down whatever was running.
    /// A blank session id only resets.
    pub fn enable(&mut self, session_id: SessionId) -> Vec<Effect> {
        let mut effects = self.disable();
        if session_id.is_empty() {
            debug!("enable ignored: blank session id");
            return effects;
        }
        self.session_id = Some(session_id);
        effects.extend(self.begin_attempt());
        effects
    }

    /// Tear everything down and return to `Idle`. Safe from any state.
    pub fn disable(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Idle {
            debug!(from = ?self.state, "connection disabled");
        }
        self.state = ConnectionState::Idle;
        self.retry_count = 0;
        self.last_error = None;
        // Invalidate anything still in flight.
        self.attempt += 1;
        vec![
            Effect::CancelReconnect,
            Effect::StopHeartbeat,
            Effect::CloseChannel,
        ]
    }

    /// Operator-triggered clean reconnect. Recovers from `Failed`.
    pub fn refresh(&mut self) -> Vec<Effect> {
        match self.session_id.clone() {
            Some(session_id) => self.enable(session_id),
            None => self.disable(),
        }
    }

    /// The handshake for `attempt` completed. `None` means the attempt was
    /// superseded and the channel should be closed unused.
    pub fn on_connected(&mut self, attempt: AttemptId) -> Option<Vec<Effect>> {
        if !self.is_current(attempt) || self.state != ConnectionState::Connecting {
            debug!(?attempt, state = ?self.state, "ignoring stale handshake");
            return None;
        }
        self.state = ConnectionState::Open;
        self.retry_count = 0;
        self.last_error = None;
        debug!(?attempt, "connection open");
        Some(vec![
            Effect::Send(OutboundFrame::GetEvents),
            Effect::StartHeartbeat(self.policy.heartbeat_interval),
        ])
    }

    /// The channel for `attempt` failed to open or closed unexpectedly.
    pub fn on_closed(&mut self, attempt: AttemptId, error: Option<String>) -> Vec<Effect> {
        let live = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        );
        if !self.is_current(attempt) || !live {
            debug!(?attempt, state = ?self.state, "ignoring stale close");
            return Vec::new();
        }

        let mut effects = vec![Effect::StopHeartbeat, Effect::CloseChannel];
        if self.retry_count < self.policy.max_retries {
            self.retry_count += 1;
            self.state = ConnectionState::Retrying;
            self.last_error = Some(error.unwrap_or_else(|| "disconnected".to_owned()));
            let delay = self.policy.delay_for(self.retry_count);
            debug!(
                retry = self.retry_count,
                max = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            effects.push(Effect::ScheduleReconnect(delay));
        } else {
            self.state = ConnectionState::Failed;
            self.last_error = Some(match error {
                Some(error) => format!("connection lost: {error}"),
                None => "connection lost".to_owned(),
            });
            debug!(retries = self.retry_count, "retries exhausted");
        }
        effects
    }

    /// The backoff timer fired.
    pub fn on_reconnect_due(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Retrying {
            return Vec::new();
        }
        self.begin_attempt()
    }

    /// The heartbeat timer fired. Pings only while open.
    pub fn on_heartbeat_due(&self) -> Vec<Effect> {
        if self.state == ConnectionState::Open {
            vec![Effect::Send(OutboundFrame::Ping)]
        } else {
            Vec::new()
        }
    }

    /// Resync on demand, only meaningful while open.
    pub fn request_resync(&self) -> Vec<Effect> {
        if self.state == ConnectionState::Open {
            vec![Effect::Send(OutboundFrame::GetEvents)]
        } else {
            Vec::new()
        }
    }

    fn begin_attempt(&mut self) -> Vec<Effect> {
        let Some(session_id) = self.session_id.clone() else {
            return Vec::new();
        };
        self.attempt += 1;
        self.state = ConnectionState::Connecting;
        vec![Effect::Connect {
            attempt: AttemptId(self.attempt),
            session_id,
        }]
    }

    fn is_current(&self, attempt: AttemptId) -> bool {
        attempt.0 == self.attempt
    }
}

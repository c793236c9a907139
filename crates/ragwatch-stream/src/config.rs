use std::time::Duration;

use ragwatch_protocol::SessionId;

/// Placeholder replaced by the session id in [`StreamConfig::endpoint_path`].
pub const SESSION_PLACEHOLDER: &str = "{session_id}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Reconnects scheduled before giving up and landing in `Failed`.
    pub max_retries: u32,
    /// Reconnect delay is `base_delay * retry_count`.
    pub base_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Linear backoff.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.base_delay.saturating_mul(retry_count)
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// e.g. `ws://localhost:8000`
    pub base_url: String,
    pub endpoint_path: String,
    pub retry: RetryPolicy,
    /// Fan-out buffer per subscriber before it starts lagging.
    pub frame_buffer: usize,
}

impl StreamConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            endpoint_path: format!("/api/v1/visualization/ws/{SESSION_PLACEHOLDER}"),
            retry: RetryPolicy::default(),
            frame_buffer: 1024,
        }
    }

    pub fn endpoint_path(mut self, path: impl Into<String>) -> Self {
        self.endpoint_path = path.into();
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn frame_buffer(mut self, frame_buffer: usize) -> Self {
        self.frame_buffer = frame_buffer.max(1);
        self
    }

    pub fn endpoint(&self, session_id: &SessionId) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.endpoint_path
                .replace(SESSION_PLACEHOLDER, &session_id.url_segment())
        )
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new("ws://localhost:8000")
    }
}

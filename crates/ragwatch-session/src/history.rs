//! REST client for the backend's stored process events.

use std::time::Duration;

use async_trait::async_trait;
use ragwatch_protocol::{HistoryPort, ProcessEvent, SessionId, WatchError, WatchResult};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// e.g. `http://localhost:8000`
    pub base_url: String,
    pub timeout: Duration,
}

impl HistoryConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn events_url(&self, session_id: &SessionId) -> String {
        format!(
            "{}/api/v1/visualization/events/{}",
            self.base_url.trim_end_matches('/'),
            session_id.url_segment()
        )
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self::new("http://localhost:8000")
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server error: HTTP {status} - {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response body: {0}")]
    Body(String),
}

impl From<HistoryError> for WatchError {
    fn from(error: HistoryError) -> Self {
        let status = match &error {
            HistoryError::Status { status, .. } => Some(*status),
            HistoryError::Http(error) => error.status().map(|status| status.as_u16()),
            HistoryError::Body(_) => None,
        };
        WatchError::History {
            status,
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpHistoryClient {
    client: Client,
    config: HistoryConfig,
}

impl HttpHistoryClient {
    pub fn new(config: HistoryConfig) -> Result<Self, HistoryError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), HistoryError> {
        let url = self.config.events_url(session_id);
        let response = self.client.delete(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HistoryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn fetch(&self, session_id: &SessionId) -> Result<Vec<ProcessEvent>, HistoryError> {
        let url = self.config.events_url(session_id);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HistoryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let entries = match response.json::<Value>().await? {
            Value::Array(entries) => entries,
            other => {
                return Err(HistoryError::Body(format!(
                    "expected an array of events, got {}",
                    kind_of(&other)
                )));
            }
        };

        let total = entries.len();
        let events: Vec<ProcessEvent> = entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect();
        if events.len() < total {
            warn!(
                rejected = total - events.len(),
                kept = events.len(),
                "stored history contained malformed events"
            );
        }
        Ok(events)
    }
}

#[async_trait]
impl HistoryPort for HttpHistoryClient {
    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn clear_events(&self, session_id: &SessionId) -> WatchResult<()> {
        self.delete(session_id).await?;
        debug!("stored events cleared");
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn fetch_events(&self, session_id: &SessionId) -> WatchResult<Vec<ProcessEvent>> {
        let events = self.fetch(session_id).await?;
        debug!(count = events.len(), "stored events fetched");
        Ok(events)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

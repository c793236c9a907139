//! WebSocket transport.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use ragwatch_protocol::{Channel, Connector, OutboundFrame, SessionId, WatchError, WatchResult};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, instrument};

use crate::config::StreamConfig;

/// Opens `{base_url}{endpoint_path}` per session.
#[derive(Debug, Clone)]
pub struct WsConnector {
    config: StreamConfig,
}

impl WsConnector {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WsConnector {
    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn connect(&self, session_id: &SessionId) -> WatchResult<Box<dyn Channel>> {
        let url = self.config.endpoint(session_id);
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|error| WatchError::transport(format!("connect {url}: {error}")))?;
        debug!(%url, status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WsChannel { stream }))
    }
}

pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, frame: OutboundFrame) -> WatchResult<()> {
        self.stream
            .send(Message::text(frame.to_json()))
            .await
            .map_err(|error| WatchError::transport(error.to_string()))
    }

    async fn recv(&mut self) -> Option<WatchResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!(len = bytes.len(), "skipping non-utf8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "websocket closed by peer");
                    return None;
                }
                // tungstenite answers protocol pings on its own
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(error) => return Some(Err(WatchError::transport(error.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(error) = self.stream.close(None).await {
            debug!(%error, "websocket close");
        }
    }
}

//! Async driver around [`ConnectionMachine`].
//!
//! One task per client owns the channel, the backoff timer and the heartbeat.
//! Callers talk to it through commands and observe it through a broadcast of
//! inbound frames plus a watch of [`ConnectionStatus`].

use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use ragwatch_protocol::{Channel, Connector, InboundFrame, SessionId, WatchResult};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::machine::{AttemptId, ConnectionMachine, ConnectionStatus, Effect};

const PREVIEW_CHARS: usize = 120;

enum Command {
    Enable(SessionId, oneshot::Sender<()>),
    Disable(oneshot::Sender<()>),
    Refresh(oneshot::Sender<()>),
    Resync,
}

/// Handle to a running stream driver. Dropping every handle stops the driver
/// and closes its channel.
#[derive(Clone)]
pub struct StreamClient {
    commands: mpsc::UnboundedSender<Command>,
    frames: broadcast::Sender<InboundFrame>,
    status: watch::Receiver<ConnectionStatus>,
}

impl StreamClient {
    /// Spawn the driver on the current tokio runtime. Starts `Idle`.
    pub fn new(connector: Arc<dyn Connector>, config: StreamConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (frames, _) = broadcast::channel(config.frame_buffer.max(1));
        let machine = ConnectionMachine::new(config.retry.clone());
        let (status_tx, status) = watch::channel(machine.status());

        let driver = Driver {
            connector,
            machine,
            commands: command_rx,
            frames: frames.clone(),
            status: status_tx,
            connecting: None,
            channel: None,
            reconnect: None,
            heartbeat: None,
        };
        tokio::spawn(driver.run());

        Self {
            commands,
            frames,
            status,
        }
    }

    /// Watch `session_id`, replacing whatever was watched before. Resolves
    /// once the first connect attempt has been issued.
    pub async fn enable(&self, session_id: impl Into<SessionId>) {
        let session_id = session_id.into();
        self.request(|ack| Command::Enable(session_id, ack)).await;
    }

    /// Stop watching. Idempotent.
    pub async fn disable(&self) {
        self.request(Command::Disable).await;
    }

    /// Clean reconnect to the current session, resetting the retry budget.
    pub async fn refresh(&self) {
        self.request(Command::Refresh).await;
    }

    /// Ask the server for a full snapshot. Ignored unless connected.
    pub fn request_resync(&self) {
        if self.commands.send(Command::Resync).is_err() {
            debug!("resync requested after driver stopped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundFrame> {
        self.frames.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<InboundFrame> {
        BroadcastStream::new(self.frames.subscribe())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    async fn request(&self, command: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(command(ack)).is_err() {
            debug!("stream driver already stopped");
            return;
        }
        let _ = done.await;
    }
}

type ConnectFuture = BoxFuture<'static, (AttemptId, WatchResult<Box<dyn Channel>>)>;

struct Driver {
    connector: Arc<dyn Connector>,
    machine: ConnectionMachine,
    commands: mpsc::UnboundedReceiver<Command>,
    frames: broadcast::Sender<InboundFrame>,
    status: watch::Sender<ConnectionStatus>,
    connecting: Option<ConnectFuture>,
    channel: Option<(AttemptId, Box<dyn Channel>)>,
    reconnect: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                (attempt, result) = Self::poll_connect(&mut self.connecting) => {
                    self.on_connect_result(attempt, result).await;
                }
                (attempt, inbound) = Self::recv_inbound(&mut self.channel) => {
                    self.on_inbound(attempt, inbound).await;
                }
                () = Self::wait_reconnect(&mut self.reconnect) => {
                    let effects = self.machine.on_reconnect_due();
                    self.apply(effects).await;
                }
                () = Self::wait_heartbeat(&mut self.heartbeat) => {
                    let effects = self.machine.on_heartbeat_due();
                    self.apply(effects).await;
                }
            }
        }

        let effects = self.machine.disable();
        self.apply(effects).await;
        debug!("stream driver stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enable(session_id, ack) => {
                info!(%session_id, "stream enabled");
                let effects = self.machine.enable(session_id);
                self.apply(effects).await;
                let _ = ack.send(());
            }
            Command::Disable(ack) => {
                let effects = self.machine.disable();
                self.apply(effects).await;
                let _ = ack.send(());
            }
            Command::Refresh(ack) => {
                info!("stream refresh");
                let effects = self.machine.refresh();
                self.apply(effects).await;
                let _ = ack.send(());
            }
            Command::Resync => {
                let effects = self.machine.request_resync();
                self.apply(effects).await;
            }
        }
    }

    async fn on_connect_result(
        &mut self,
        attempt: AttemptId,
        result: WatchResult<Box<dyn Channel>>,
    ) {
        match result {
            Ok(mut channel) => match self.machine.on_connected(attempt) {
                Some(effects) => {
                    info!("stream connected");
                    self.channel = Some((attempt, channel));
                    self.apply(effects).await;
                }
                None => channel.close().await,
            },
            Err(error) => {
                warn!(%error, "stream connect failed");
                let effects = self.machine.on_closed(attempt, Some(error.to_string()));
                self.apply(effects).await;
            }
        }
    }

    async fn on_inbound(&mut self, attempt: AttemptId, inbound: Option<WatchResult<String>>) {
        let error = match inbound {
            Some(Ok(text)) => {
                self.dispatch(&text);
                return;
            }
            Some(Err(error)) => {
                warn!(%error, "stream channel error");
                Some(error.to_string())
            }
            None => {
                info!("stream closed by peer");
                None
            }
        };

        let effects = self.machine.on_closed(attempt, error);
        if effects.is_empty() {
            self.channel = None;
        }
        self.apply(effects).await;
    }

    fn dispatch(&self, text: &str) {
        match InboundFrame::parse(text) {
            Ok(InboundFrame::Pong) => debug!("pong"),
            Ok(frame) => {
                if let InboundFrame::SessionEvents(snapshot) = &frame {
                    if snapshot.rejected > 0 {
                        warn!(
                            rejected = snapshot.rejected,
                            kept = snapshot.events.len(),
                            "snapshot contained malformed events"
                        );
                    }
                }
                debug!(kind = frame.kind(), "frame received");
                // No subscribers is fine.
                let _ = self.frames.send(frame);
            }
            Err(error) => warn!(%error, preview = %preview(text), "dropping malformed frame"),
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Connect {
                    attempt,
                    session_id,
                } => {
                    debug!(?attempt, %session_id, "connecting");
                    let connector = Arc::clone(&self.connector);
                    self.connecting = Some(Box::pin(async move {
                        let result = connector.connect(&session_id).await;
                        (attempt, result)
                    }));
                }
                Effect::Send(frame) => {
                    let Some((attempt, channel)) = self.channel.as_mut() else {
                        continue;
                    };
                    let attempt = *attempt;
                    if let Err(error) = channel.send(frame).await {
                        warn!(%error, ?frame, "stream send failed");
                        queue.extend(self.machine.on_closed(attempt, Some(error.to_string())));
                    }
                }
                Effect::CloseChannel => {
                    self.connecting = None;
                    if let Some((_, mut channel)) = self.channel.take() {
                        channel.close().await;
                    }
                }
                Effect::ScheduleReconnect(delay) => {
                    self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
                }
                Effect::CancelReconnect => self.reconnect = None,
                Effect::StartHeartbeat(period) => {
                    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.heartbeat = Some(interval);
                }
                Effect::StopHeartbeat => self.heartbeat = None,
            }
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = self.machine.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!(state = ?status.state, retry = status.retry_count, "connection status");
            *current = status;
            true
        });
    }

    async fn poll_connect(
        connecting: &mut Option<ConnectFuture>,
    ) -> (AttemptId, WatchResult<Box<dyn Channel>>) {
        match connecting {
            Some(future) => {
                let output = future.await;
                *connecting = None;
                output
            }
            None => pending().await,
        }
    }

    async fn recv_inbound(
        channel: &mut Option<(AttemptId, Box<dyn Channel>)>,
    ) -> (AttemptId, Option<WatchResult<String>>) {
        match channel {
            Some((attempt, channel)) => {
                let attempt = *attempt;
                (attempt, channel.recv().await)
            }
            None => pending().await,
        }
    }

    async fn wait_reconnect(reconnect: &mut Option<Pin<Box<Sleep>>>) {
        match reconnect {
            Some(sleep) => {
                sleep.as_mut().await;
                *reconnect = None;
            }
            None => pending().await,
        }
    }

    async fn wait_heartbeat(heartbeat: &mut Option<Interval>) {
        match heartbeat {
            Some(interval) => {
                interval.tick().await;
            }
            None => pending().await,
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_owned();
    }
    let mut short: String = text.chars().take(PREVIEW_CHARS).collect();
    short.push_str("...");
    short
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::machine::ConnectionState;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use ragwatch_protocol::{OutboundFrame, WatchError};
    use std::time::Duration;

    #[derive(Default)]
    struct Link {
        sent: Vec<OutboundFrame>,
        closed: bool,
    }

    #[derive(Default)]
    struct MemoryState {
        accept: bool,
        connects: Vec<Instant>,
        links: Vec<Arc<Mutex<Link>>>,
        peers: Vec<mpsc::UnboundedSender<Option<String>>>,
    }

    /// In-process connector. `None` pushed by a peer closes the channel.
    #[derive(Clone, Default)]
    struct MemoryConnector {
        state: Arc<Mutex<MemoryState>>,
    }

    impl MemoryConnector {
        fn accepting() -> Self {
            let connector = Self::default();
            connector.state.lock().accept = true;
            connector
        }

        fn set_accept(&self, accept: bool) {
            self.state.lock().accept = accept;
        }

        fn connects(&self) -> Vec<Instant> {
            self.state.lock().connects.clone()
        }

        fn sent(&self, link: usize) -> Vec<OutboundFrame> {
            self.state.lock().links[link].lock().sent.clone()
        }

        fn closed(&self, link: usize) -> bool {
            self.state.lock().links[link].lock().closed
        }

        fn push(&self, link: usize, text: Option<&str>) {
            let peer = self.state.lock().peers[link].clone();
            peer.send(text.map(str::to_owned)).unwrap();
        }
    }

    struct MemoryChannel {
        link: Arc<Mutex<Link>>,
        inbound: mpsc::UnboundedReceiver<Option<String>>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, _session_id: &SessionId) -> WatchResult<Box<dyn Channel>> {
            let mut state = self.state.lock();
            state.connects.push(Instant::now());
            if !state.accept {
                return Err(WatchError::transport("connection refused"));
            }
            let link = Arc::new(Mutex::new(Link::default()));
            let (peer, inbound) = mpsc::unbounded_channel();
            state.links.push(Arc::clone(&link));
            state.peers.push(peer);
            Ok(Box::new(MemoryChannel { link, inbound }))
        }
    }

    #[async_trait]
    impl Channel for MemoryChannel {
        async fn send(&mut self, frame: OutboundFrame) -> WatchResult<()> {
            let mut link = self.link.lock();
            if link.closed {
                return Err(WatchError::transport("channel closed"));
            }
            link.sent.push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<WatchResult<String>> {
            match self.inbound.recv().await {
                Some(Some(text)) => Some(Ok(text)),
                _ => None,
            }
        }

        async fn close(&mut self) {
            self.link.lock().closed = true;
        }
    }

    fn client(connector: &MemoryConnector, retry: RetryPolicy) -> StreamClient {
        StreamClient::new(
            Arc::new(connector.clone()),
            StreamConfig::default().retry(retry),
        )
    }

    async fn wait_for_state(client: &StreamClient, state: ConnectionState) -> ConnectionStatus {
        let mut status = client.watch_status();
        let current = tokio::time::timeout(
            Duration::from_secs(3600),
            status.wait_for(|s| s.state == state),
        )
        .await
        .expect("timed out waiting for state")
        .expect("driver stopped")
        .clone();
        current
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    const EVENT: &str = r#"{"session_id":"s1","event_id":"e1","step_type":"routing","status":"completed","timestamp":"2024-05-01T10:00:00Z"}"#;

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_reconnects_with_linear_backoff() {
        let connector = MemoryConnector::default();
        let client = client(&connector, RetryPolicy::default());

        client.enable("s1").await;
        let status = wait_for_state(&client, ConnectionState::Failed).await;

        let connects = connector.connects();
        assert_eq!(connects.len(), 6);
        let gaps: Vec<u64> = connects
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs_f64().round() as u64)
            .collect();
        assert_eq!(gaps, vec![2, 4, 6, 8, 10]);
        assert_eq!(status.retry_count, 5);
        assert!(status.last_error.is_some());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.connects().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn open_requests_events_and_pings_on_interval() {
        let connector = MemoryConnector::accepting();
        let client = client(&connector, RetryPolicy::default());

        client.enable("s1").await;
        wait_for_state(&client, ConnectionState::Open).await;
        assert_eq!(connector.sent(0), vec![OutboundFrame::GetEvents]);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(
            connector.sent(0),
            vec![
                OutboundFrame::GetEvents,
                OutboundFrame::Ping,
                OutboundFrame::Ping
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pong_and_garbage_are_not_forwarded() {
        let connector = MemoryConnector::accepting();
        let client = client(&connector, RetryPolicy::default());
        let mut frames = client.subscribe();

        client.enable("s1").await;
        wait_for_state(&client, ConnectionState::Open).await;
        connector.push(0, Some(r#"{"type":"pong"}"#));
        connector.push(0, Some("{definitely not json"));
        connector.push(0, Some(EVENT));

        let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap();
        let InboundFrame::Event(event) = frame else {
            panic!("expected event, got {}", frame.kind());
        };
        assert_eq!(event.event_id.as_str(), "e1");
        assert_eq!(client.status().state, ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn disable_stops_everything() {
        let connector = MemoryConnector::accepting();
        let client = client(&connector, RetryPolicy::default());

        client.enable("s1").await;
        wait_for_state(&client, ConnectionState::Open).await;
        client.disable().await;
        client.disable().await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(connector.closed(0));
        assert_eq!(connector.sent(0), vec![OutboundFrame::GetEvents]);
        assert_eq!(connector.connects().len(), 1);
        assert_eq!(client.status(), ConnectionStatus::idle(5));
    }

    #[tokio::test(start_paused = true)]
    async fn disable_before_any_connection_is_harmless() {
        let connector = MemoryConnector::accepting();
        let client = client(&connector, RetryPolicy::default());
        client.disable().await;
        assert_eq!(client.status().state, ConnectionState::Idle);
        assert!(connector.connects().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_drop_resets_retry_count() {
        let connector = MemoryConnector::accepting();
        let client = client(&connector, RetryPolicy::default());

        client.enable("s1").await;
        wait_for_state(&client, ConnectionState::Open).await;
        connector.push(0, None);

        let retrying = wait_for_state(&client, ConnectionState::Retrying).await;
        assert_eq!(retrying.retry_count, 1);
        assert_eq!(retrying.label(), "Reconnecting (1/5)");

        let open = wait_for_state(&client, ConnectionState::Open).await;
        assert_eq!(open.retry_count, 0);
        assert_eq!(connector.connects().len(), 2);
        assert_eq!(connector.sent(1), vec![OutboundFrame::GetEvents]);
    }

    #[tokio::test(start_paused = true)]
    async fn disable_during_backoff_cancels_reconnect() {
        let connector = MemoryConnector::default();
        let client = client(&connector, RetryPolicy::default());

        client.enable("s1").await;
        wait_for_state(&client, ConnectionState::Retrying).await;
        client.disable().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.connects().len(), 1);
        assert_eq!(client.status().state, ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_recovers_from_failed() {
        let connector = MemoryConnector::default();
        let client = client(&connector, RetryPolicy::default().max_retries(1));

        client.enable("s1").await;
        wait_for_state(&client, ConnectionState::Failed).await;
        assert_eq!(connector.connects().len(), 2);

        connector.set_accept(true);
        client.refresh().await;
        let status = wait_for_state(&client, ConnectionState::Open).await;
        assert_eq!(status.retry_count, 0);
        assert_eq!(connector.connects().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_session_does_not_connect() {
        let connector = MemoryConnector::accepting();
        let client = client(&connector, RetryPolicy::default());

        client.enable("  ").await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(connector.connects().is_empty());
        assert_eq!(client.status().state, ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn resync_request_sends_get_events() {
        let connector = MemoryConnector::accepting();
        let client = client(&connector, RetryPolicy::default());

        client.request_resync();
        client.enable("s1").await;
        wait_for_state(&client, ConnectionState::Open).await;
        client.request_resync();
        settle().await;

        assert_eq!(
            connector.sent(0),
            vec![OutboundFrame::GetEvents, OutboundFrame::GetEvents]
        );
    }

    #[test]
    fn preview_truncates_long_frames() {
        let long = "x".repeat(500);
        let short = preview(&long);
        assert_eq!(short.chars().count(), PREVIEW_CHARS + 3);
        assert_eq!(preview("ok"), "ok");
    }
}

//! Session controller: owns the working event set for the watched session and
//! republishes the derived [`SessionView`] whenever anything changes.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use ragwatch_aggregate::{EventSet, ProcessMetrics};
use ragwatch_protocol::{
    HistoryPort, InboundFrame, ProcessEvent, SessionId, WatchError, WatchResult,
};
use ragwatch_stream::{ConnectionStatus, StreamClient, StreamConfig, WsConnector};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, instrument, warn};

use crate::history::{HistoryConfig, HttpHistoryClient};
use crate::view::SessionView;

#[derive(Debug)]
struct ControllerState {
    session_id: Option<SessionId>,
    enabled: bool,
    events: EventSet,
    connection: ConnectionStatus,
    last_event_at: Option<chrono::DateTime<Utc>>,
    last_error: Option<String>,
}

impl ControllerState {
    fn view(&self) -> SessionView {
        let timeline = self.events.timeline();
        SessionView {
            session_id: self.session_id.clone(),
            enabled: self.enabled,
            metrics: ProcessMetrics::from_timeline(&timeline),
            timeline,
            connection: self.connection.clone(),
            last_event_at: self.last_event_at,
            last_error: self.last_error.clone(),
        }
    }

    fn belongs(&self, event: &ProcessEvent) -> bool {
        self.session_id.as_ref() == Some(&event.session_id)
    }
}

struct Shared {
    state: Mutex<ControllerState>,
    view: watch::Sender<SessionView>,
}

impl Shared {
    /// Mutate under the lock and republish. Returns whatever `f` returns.
    fn update<T>(&self, f: impl FnOnce(&mut ControllerState) -> T) -> T {
        let mut state = self.state.lock();
        let out = f(&mut state);
        let view = state.view();
        self.view.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
        out
    }

    fn session_id(&self) -> Option<SessionId> {
        self.state.lock().session_id.clone()
    }

    fn apply_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Event(event) => self.update(|state| {
                if !state.belongs(&event) {
                    debug!(session_id = %event.session_id, "ignoring event for another session");
                    return;
                }
                let event_id = event.event_id.clone();
                if state.events.insert(*event) {
                    state.last_event_at = Some(Utc::now());
                } else {
                    debug!(%event_id, "duplicate event");
                }
            }),
            InboundFrame::SessionEvents(snapshot) => self.update(|state| {
                let received = snapshot.events.len();
                let events: Vec<ProcessEvent> = snapshot
                    .events
                    .into_iter()
                    .filter(|event| state.belongs(event))
                    .collect();
                debug!(received, kept = events.len(), "applying snapshot");
                state.events.replace(events);
            }),
            InboundFrame::Pong => {}
        }
    }
}

/// Glue between the stream client, the history collaborator and whatever
/// renders the view.
pub struct SessionController {
    stream: StreamClient,
    history: Arc<dyn HistoryPort>,
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

impl SessionController {
    /// Must be called inside a tokio runtime.
    pub fn new(stream: StreamClient, history: Arc<dyn HistoryPort>) -> Self {
        let connection = stream.status();
        let (view, _) = watch::channel(SessionView::idle(connection.clone()));
        let shared = Arc::new(Shared {
            state: Mutex::new(ControllerState {
                session_id: None,
                enabled: false,
                events: EventSet::new(),
                connection,
                last_event_at: None,
                last_error: None,
            }),
            view,
        });

        let pump = tokio::spawn(pump(
            Arc::clone(&shared),
            stream.clone(),
            stream.subscribe_stream(),
            stream.watch_status(),
        ));

        Self {
            stream,
            history,
            shared,
            pump,
        }
    }

    /// WebSocket stream plus REST history against a live backend.
    pub fn connect(stream: StreamConfig, history: HistoryConfig) -> WatchResult<Self> {
        let history = HttpHistoryClient::new(history)?;
        let client = StreamClient::new(Arc::new(WsConnector::new(stream.clone())), stream);
        Ok(Self::new(client, Arc::new(history)))
    }

    pub fn view(&self) -> SessionView {
        self.shared.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.shared.view.subscribe()
    }

    /// Start watching `session_id`. Switching to a different session discards
    /// the working set; re-enabling the same one keeps it.
    pub async fn enable(&self, session_id: impl Into<SessionId>) {
        let session_id = session_id.into();
        if session_id.is_empty() {
            debug!("enable without a session id");
            self.disable().await;
            return;
        }

        self.shared.update(|state| {
            if state.session_id.as_ref() != Some(&session_id) {
                state.events.clear();
                state.last_event_at = None;
            }
            state.session_id = Some(session_id.clone());
            state.enabled = true;
            state.last_error = None;
        });
        info!(%session_id, "visualization enabled");
        self.stream.enable(session_id).await;
    }

    /// Stop the stream. Accumulated events stay visible.
    pub async fn disable(&self) {
        self.stream.disable().await;
        self.shared.update(|state| state.enabled = false);
    }

    /// Clean reconnect with a fresh retry budget.
    pub async fn refresh(&self) {
        let enabled = self.shared.update(|state| {
            state.last_error = None;
            state.enabled
        });
        if enabled {
            self.stream.refresh().await;
        }
    }

    /// Purge the backend's stored events, then the local working set. On
    /// failure the local view is left untouched and the error is recorded.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> WatchResult<()> {
        let session_id = self.shared.session_id().ok_or(WatchError::NoSession)?;
        match self.history.clear_events(&session_id).await {
            Ok(()) => {
                info!(%session_id, "history cleared");
                self.shared.update(|state| {
                    if state.session_id.as_ref() == Some(&session_id) {
                        state.events.clear();
                        state.last_event_at = None;
                    }
                    state.last_error = None;
                });
                Ok(())
            }
            Err(error) => {
                warn!(%session_id, %error, "clear history failed");
                self.shared
                    .update(|state| state.last_error = Some(error.to_string()));
                Err(error)
            }
        }
    }

    /// Replace the working set from the stored history. Returns the number of
    /// events now known.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> WatchResult<usize> {
        let session_id = self.shared.session_id().ok_or(WatchError::NoSession)?;
        match self.history.fetch_events(&session_id).await {
            Ok(events) => Ok(self.shared.update(|state| {
                if state.session_id.as_ref() != Some(&session_id) {
                    return state.events.len();
                }
                state
                    .events
                    .replace(events.into_iter().filter(|event| event.session_id == session_id));
                state.last_error = None;
                debug!(count = state.events.len(), "reloaded from history");
                state.events.len()
            })),
            Err(error) => {
                warn!(%session_id, %error, "reload from history failed");
                self.shared
                    .update(|state| state.last_error = Some(error.to_string()));
                Err(error)
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(
    shared: Arc<Shared>,
    stream: StreamClient,
    mut frames: BroadcastStream<InboundFrame>,
    mut status: watch::Receiver<ConnectionStatus>,
) {
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(frame)) => shared.apply_frame(frame),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(skipped, "fell behind the stream, requesting resync");
                    stream.request_resync();
                }
                None => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let connection = status.borrow_and_update().clone();
                shared.update(|state| state.connection = connection);
            }
        }
    }
    debug!("session pump stopped");
}

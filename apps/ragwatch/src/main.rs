use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use ragwatch_aggregate::StepPhase;
use ragwatch_protocol::StepType;
use ragwatch_session::{HistoryConfig, SessionController, SessionView};
use ragwatch_stream::{ConnectionState, RetryPolicy, StreamConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ragwatch")]
#[command(about = "Follow a RAG pipeline session step by step")]
struct Cli {
    /// Session to watch.
    #[arg(long)]
    session: String,
    #[arg(long, default_value = "ws://localhost:8000")]
    ws_url: String,
    #[arg(long, default_value = "http://localhost:8000")]
    http_url: String,
    #[arg(long, default_value_t = 5)]
    max_retries: u32,
    #[arg(long, default_value_t = 2000)]
    base_delay_ms: u64,
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
    /// Purge stored history for the session before watching.
    #[arg(long)]
    clear_first: bool,
    /// JSON log lines.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn stream_config(&self) -> StreamConfig {
        StreamConfig::new(&self.ws_url).retry(
            RetryPolicy::default()
                .max_retries(self.max_retries)
                .base_delay(Duration::from_millis(self.base_delay_ms))
                .heartbeat_interval(Duration::from_secs(self.heartbeat_secs.max(1))),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }

    let controller =
        SessionController::connect(cli.stream_config(), HistoryConfig::new(&cli.http_url))?;
    let mut views = controller.watch();

    controller.enable(cli.session.as_str()).await;
    if cli.clear_first {
        if let Err(error) = controller.clear().await {
            warn!(%error, "could not clear stored history, continuing");
        }
    }

    let mut previous = controller.view();
    info!(status = %previous.connection.label(), "watching session {}", cli.session);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                report(&previous, &view);
                previous = view;
            }
        }
    }

    controller.disable().await;
    let view = controller.view();
    info!(
        completed = view.metrics.completed_steps,
        failed = view.metrics.failed_steps,
        events = view.timeline.events.len(),
        "stopped: {}",
        view.summary()
    );
    Ok(())
}

fn report(previous: &SessionView, view: &SessionView) {
    if previous.connection.state != view.connection.state
        || previous.connection.retry_count != view.connection.retry_count
    {
        match view.connection.state {
            ConnectionState::Failed => warn!(
                error = view.connection.last_error.as_deref().unwrap_or("unknown"),
                "{}",
                view.connection.label()
            ),
            _ => info!("{}", view.connection.label()),
        }
    }

    for (step, from, to) in transitions(previous, view) {
        info!(step = step.as_str(), from = from.as_str(), to = to.as_str(), "{}", step.label());
    }

    if previous.last_error != view.last_error {
        if let Some(error) = &view.last_error {
            warn!(%error, "session error");
        }
    }
}

/// Canonical steps whose phase differs between two views.
fn transitions(previous: &SessionView, view: &SessionView) -> Vec<(StepType, StepPhase, StepPhase)> {
    previous
        .timeline
        .steps
        .iter()
        .zip(&view.timeline.steps)
        .filter(|(before, after)| before.phase != after.phase)
        .map(|(before, after)| (after.step_type.clone(), before.phase, after.phase))
        .collect()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}

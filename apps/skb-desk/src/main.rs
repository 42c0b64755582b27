use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use skb_core::{load_effective_config, KeyedDispatcher};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

mod bootstrap;
mod console;
mod http_client;
mod openrouter;
mod postgrest;
mod webhook;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = load_effective_config().context("load configuration")?;
    skb_otel::init(config.log_dir.as_deref());

    let transport = Arc::new(console::ConsoleTransport::stdout());
    let bootstrap::BootstrapOutput {
        router,
        aggregator,
        background_tasks,
    } = bootstrap::build(&config, transport).await?;

    let dispatcher = KeyedDispatcher::new(router);
    tokio::select! {
        res = read_events(&dispatcher) => {
            if let Err(err) = res {
                error!(target: "skb::desk", error = %format!("{err:#}"), "event stream failed");
            }
            info!(target: "skb::desk", "event stream closed");
        }
        _ = shutdown_signal() => {}
    }

    // Stop accepting events, let in-flight handlers finish, then complete
    // every open dialog before exit.
    let grace = config.shutdown_grace();
    dispatcher.close();
    if tokio::time::timeout(grace, dispatcher.wait()).await.is_err() {
        warn!(
            target: "skb::desk",
            inflight = dispatcher.inflight(),
            conversations = dispatcher.active_keys(),
            "event handlers still running after grace period"
        );
    }
    let report = aggregator.flush_all_with_grace(grace).await;
    info!(
        target: "skb::desk",
        flushed = report.flushed,
        timed_out = report.timed_out,
        "open dialogs flushed"
    );

    info!(target: "skb::desk", "shutting down background tasks");
    // An interrupted sync run leaves its records unsynced for the next start.
    let summary = background_tasks.shutdown_with_grace(Duration::ZERO).await;
    info!(
        target: "skb::desk",
        completed = summary.completed,
        aborted = summary.aborted,
        "background tasks stopped"
    );
    Ok(())
}

/// Queue every stdin event on its conversation's mailbox: one conversation's
/// events keep their order while a slow handler does not hold up the others.
async fn read_events(dispatcher: &KeyedDispatcher) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let event = match console::parse_line(&line) {
            Ok(event) => event,
            Err(err) => {
                warn!(target: "skb::desk", error = %format!("{err:#}"), "skipping malformed event");
                continue;
            }
        };
        dispatcher.submit(event);
    }
    Ok(())
}

async fn shutdown_signal() {
    info!(target: "skb::desk", "shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(target: "skb::desk", %err, "SIGTERM handler unavailable; waiting for ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!(target: "skb::desk", "shutdown signal received");
}

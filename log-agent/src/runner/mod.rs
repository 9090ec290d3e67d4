//! Process wiring for the log-agent binary.
//!
//! Builds the sink from configuration, starts the tail manager and the
//! optional file watcher, then waits for Ctrl-C or a permanent sink failure.

use crate::config::{Config, SinkConfig};
use crate::manager::{ManagerOptions, TailManager};
use crate::sink::{AppendLogPublisher, SinkAdapter, SinkOptions};
use crate::watcher::watch_log_dir;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "LOG_AGENT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

const WATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the append log and starts the delivery worker in front of it.
pub async fn build_sink(config: &SinkConfig) -> Result<Arc<SinkAdapter>> {
    let output_path = config.output_path();
    let publisher = AppendLogPublisher::open(&output_path)
        .await
        .context("failed to open sink output")?;

    info!(
        output = %output_path.display(),
        topic = %config.topic,
        address = %config.address,
        queue_capacity = config.queue_capacity,
        "configured append-log sink"
    );

    Ok(Arc::new(SinkAdapter::spawn(
        publisher,
        SinkOptions::from_config(config),
    )))
}

/// Runs the agent until Ctrl-C or until the sink gives up for good.
///
/// With `config_path` set the manager re-reads the file on every tick so
/// `is_logging` can be flipped without a restart.
pub async fn run(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    info!("log-agent starting");

    let sink = build_sink(&config.sink).await?;
    let fatal = sink.fatal_token();
    let settings = config.tail_settings();
    let options = ManagerOptions::from_config(&config, config_path);

    let manager = TailManager::start(settings.clone(), sink, options)
        .await
        .context("failed to start tail manager")?;

    let cancel_token = CancellationToken::new();
    let watcher_handle = config.manager.watch_events.then(|| {
        let log_dir = settings.log_dir.clone();
        let manager = manager.clone();
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            if let Err(err) = watch_log_dir(log_dir, manager, cancel_token).await {
                warn!(error = %err, "file watcher exited; relying on periodic reconciliation");
            }
        })
    });

    info!(
        log_dir = %settings.log_dir.display(),
        enabled = settings.enabled,
        "log-agent started"
    );

    let shutdown_reason = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
            "signal"
        }
        _ = fatal.cancelled() => "sink_failure",
    };

    info!(reason = shutdown_reason, "initiating shutdown");
    cancel_token.cancel();

    if let Some(mut handle) = watcher_handle {
        let timeout = sleep(WATCHER_STOP_TIMEOUT);
        tokio::pin!(timeout);
        let result = tokio::select! {
            res = &mut handle => Some(res),
            _ = &mut timeout => None,
        };
        match result {
            Some(Ok(())) => info!("file watcher stopped"),
            Some(Err(err)) => warn!(error = %err, "file watcher exited with error during shutdown"),
            None => {
                warn!("file watcher did not stop within timeout; aborting");
                handle.abort();
            }
        }
    }

    if let Err(err) = manager.shutdown().await {
        warn!(error = %format!("{err:#}"), "shutdown did not complete cleanly");
    }

    if fatal.is_cancelled() {
        bail!("sink delivery failed permanently; restart resumes from the last recorded offsets");
    }

    info!("log-agent stopped");
    Ok(())
}

use crate::identity::is_finished;
use crate::manager::ManagerHandle;
use anyhow::{Context, Result};
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Minimum spacing between two reconciliation nudges.
pub const NUDGE_DEBOUNCE: Duration = Duration::from_millis(250);

/// Watches the log directory and asks the manager for an early pass when
/// files appear or change. Periodic reconciliation still runs regardless.
///
/// Events are folded into a one-slot channel, so a burst of writes turns
/// into a single nudge per [`NUDGE_DEBOUNCE`].
pub async fn watch_log_dir(
    log_dir: PathBuf,
    manager: ManagerHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel(1);

    let mut watcher = RecommendedWatcher::new(
        move |res| match res {
            Ok(event) => handle_event(&event_tx, event),
            Err(err) => error!(error = %err, "file watcher error"),
        },
        NotifyConfig::default(),
    )
    .context("failed to create notify watcher")?;

    watcher
        .watch(&log_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch path {}", log_dir.display()))?;

    info!(path = %log_dir.display(), "file watcher started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => {
                let Some(path) = event else {
                    warn!("watcher channel closed; stopping file watcher");
                    break;
                };
                debug!(path = %path.display(), "nudging reconciliation");
                manager.nudge();

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(NUDGE_DEBOUNCE) => {}
                }
            }
        }
    }

    drop(watcher);
    info!("file watcher stopped");
    Ok(())
}

fn handle_event(event_tx: &mpsc::Sender<PathBuf>, event: Event) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }

    for path in event.paths {
        if path.is_dir() || is_finished(&path) {
            continue;
        }
        match event_tx.try_send(path) {
            Ok(()) => {}
            // a nudge is already pending
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => {
                debug!("watcher channel closed; dropping file event");
                return;
            }
        }
    }
}

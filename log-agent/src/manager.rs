//! Tail task lifecycle and directory reconciliation.
//!
//! The manager runs as one tokio task that exclusively owns the map from
//! [`FileId`] to live tail task. Everything that changes the map arrives as a
//! message: task exits on an unbounded channel, handle requests on a bounded
//! command channel, and the periodic reconciliation tick. No lock guards the
//! map because nothing else ever touches it.
//!
//! A reconciliation pass lists the log directory and, per regular file:
//! - skips files carrying the finished suffix and files that already have a task
//! - starts a task at offset 0 when no side-car exists
//! - retires the file (source and side-car renamed with the finished suffix)
//!   when the recorded offset equals the file size
//! - resumes at the recorded offset when it is below the file size
//!
//! Passes are idempotent; running one twice without filesystem changes is a no-op.
//!
//! An identity whose task ended while the sink may still hold its records stays
//! in a draining set until a sink barrier resolves. Draining identities count
//! as tracked, so a side-car never has two writers.

use crate::config::{Config, TailSettings};
use crate::identity::{finished_path, is_finished, FileId};
use crate::metrics;
use crate::offset_store;
use crate::sink::RecordSink;
use crate::tail_task::{TailTask, TaskExit, TaskSpec};
use anyhow::{anyhow, Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub reconcile_interval: Duration,
    pub max_tasks: usize,
    pub shutdown_timeout: Duration,
    pub sink_close_timeout: Duration,
    /// Re-read on every tick so `is_logging` and directory changes take effect at runtime.
    pub config_path: Option<PathBuf>,
}

impl ManagerOptions {
    pub fn from_config(config: &Config, config_path: Option<PathBuf>) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval(),
            max_tasks: config.manager.max_tasks,
            shutdown_timeout: config.shutdown_timeout(),
            sink_close_timeout: config.sink.close_timeout(),
            config_path,
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            max_tasks: 256,
            shutdown_timeout: Duration::from_secs(5),
            sink_close_timeout: Duration::from_secs(5),
            config_path: None,
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub spawned: Vec<FileId>,
    pub finished: Vec<FileId>,
    pub skipped_tracked: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.spawned.is_empty() && self.finished.is_empty() && self.failed == 0
    }
}

enum Command {
    Reconcile(oneshot::Sender<Result<ReconcileReport>>),
    Apply(TailSettings, oneshot::Sender<Result<ReconcileReport>>),
    Tracked(oneshot::Sender<Vec<FileId>>),
    Nudge,
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front door to a running [`TailManager`].
#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
    sink: Arc<dyn RecordSink>,
    sink_close_timeout: Duration,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ManagerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| anyhow!("tail manager has stopped"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("tail manager dropped the request"))
    }

    /// Run a reconciliation pass now instead of waiting for the next tick.
    pub async fn reconcile_now(&self) -> Result<ReconcileReport> {
        self.request(Command::Reconcile).await?
    }

    /// Swap in new settings; disabling stops every task, enabling reconciles immediately.
    pub async fn apply_settings(&self, settings: TailSettings) -> Result<ReconcileReport> {
        self.request(|reply| Command::Apply(settings, reply)).await?
    }

    /// Identities that currently have a live tail task.
    pub async fn tracked(&self) -> Result<Vec<FileId>> {
        self.request(Command::Tracked).await
    }

    /// Ask for an early reconciliation without waiting. Dropped when the manager is busy.
    pub fn nudge(&self) {
        if let Err(err) = self.commands.try_send(Command::Nudge) {
            debug!(error = %err, "dropping reconciliation nudge");
        }
    }

    /// Cancel every task, stop the manager loop, then drain and close the sink.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }

        if let Some(join) = self.join.lock().await.take() {
            if let Err(err) = join.await {
                warn!(error = %err, "tail manager loop exited abnormally");
            }
        }

        self.sink
            .close(self.sink_close_timeout)
            .await
            .context("failed to close sink during shutdown")
    }
}

struct TaskEntry {
    generation: u64,
    source: PathBuf,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum Outcome {
    Ignored,
    Tracked,
    Deferred,
    Spawned(FileId),
    Finished(FileId),
}

pub struct TailManager {
    settings: TailSettings,
    options: ManagerOptions,
    sink: Arc<dyn RecordSink>,
    tasks: HashMap<FileId, TaskEntry>,
    exits_tx: mpsc::UnboundedSender<TaskExit>,
    exits_rx: mpsc::UnboundedReceiver<TaskExit>,
    draining: HashSet<FileId>,
    drained_tx: mpsc::UnboundedSender<Vec<FileId>>,
    drained_rx: mpsc::UnboundedReceiver<Vec<FileId>>,
    next_generation: u64,
}

impl TailManager {
    /// Creates the directories, runs the first pass and starts the reconciliation loop.
    ///
    /// Directory creation and listing failures are returned; later periodic
    /// passes only log theirs.
    pub async fn start(
        settings: TailSettings,
        sink: Arc<dyn RecordSink>,
        options: ManagerOptions,
    ) -> Result<ManagerHandle> {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let (drained_tx, drained_rx) = mpsc::unbounded_channel();
        let sink_close_timeout = options.sink_close_timeout;
        let mut manager = TailManager {
            settings,
            options,
            sink: sink.clone(),
            tasks: HashMap::new(),
            exits_tx,
            exits_rx,
            draining: HashSet::new(),
            drained_tx,
            drained_rx,
            next_generation: 1,
        };

        ensure_dirs(&manager.settings).await?;
        if manager.settings.enabled {
            let report = manager.reconcile().await?;
            info!(
                log_dir = %manager.settings.log_dir.display(),
                offset_dir = %manager.settings.offset_dir.display(),
                spawned = report.spawned.len(),
                finished = report.finished.len(),
                failed = report.failed,
                "initial reconciliation complete"
            );
        } else {
            info!("is_logging disabled; tail manager idle until re-enabled");
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let join = tokio::spawn(manager.run(commands_rx));

        Ok(ManagerHandle {
            commands: commands_tx,
            sink,
            sink_close_timeout,
            join: Arc::new(Mutex::new(Some(join))),
        })
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let interval = self.options.reconcile_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = interval.as_secs_f64(),
            "tail manager reconciliation loop started"
        );

        loop {
            tokio::select! {
                biased;
                Some(exit) = self.exits_rx.recv() => self.handle_exit(exit),
                Some(ids) = self.drained_rx.recv() => self.finish_draining(ids),
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("all manager handles dropped");
                        self.stop_all_tasks().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                _ = ticker.tick() => self.periodic_pass().await,
            }
        }

        info!("tail manager stopped");
    }

    /// Returns false once the loop should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Reconcile(reply) => {
                let result = if self.settings.enabled {
                    self.reconcile().await
                } else {
                    Ok(ReconcileReport::default())
                };
                let _ = reply.send(result);
            }
            Command::Apply(settings, reply) => {
                let result = self.apply_settings(settings).await;
                let _ = reply.send(result);
            }
            Command::Tracked(reply) => {
                self.collect_exits();
                let mut ids: Vec<FileId> = self.tasks.keys().copied().collect();
                ids.sort();
                let _ = reply.send(ids);
            }
            Command::Nudge => {
                if self.settings.enabled {
                    if let Err(err) = self.reconcile().await {
                        metrics::RECONCILE_ERRORS_TOTAL.inc();
                        warn!(error = %err, "event-triggered reconciliation failed");
                    }
                }
            }
            Command::Shutdown(reply) => {
                self.stop_all_tasks().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn periodic_pass(&mut self) {
        let settings = match &self.options.config_path {
            Some(path) => match Config::load(path) {
                Ok(config) => config.tail_settings(),
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %path.display(),
                        "config reload failed; keeping previous settings"
                    );
                    self.settings.clone()
                }
            },
            None => self.settings.clone(),
        };

        debug!("periodic reconciliation");
        if let Err(err) = self.apply_settings(settings).await {
            metrics::RECONCILE_ERRORS_TOTAL.inc();
            warn!(
                error = %err,
                log_dir = %self.settings.log_dir.display(),
                "periodic reconciliation failed; will retry on next tick"
            );
        }
    }

    async fn apply_settings(&mut self, settings: TailSettings) -> Result<ReconcileReport> {
        if settings != self.settings {
            info!(
                log_dir = %settings.log_dir.display(),
                offset_dir = %settings.offset_dir.display(),
                topic = %settings.topic,
                enabled = settings.enabled,
                "tail settings changed"
            );
        }
        self.settings = settings;

        if !self.settings.enabled {
            if !self.tasks.is_empty() {
                info!("is_logging disabled; stopping all tail tasks");
            }
            self.stop_all_tasks().await;
            return Ok(ReconcileReport::default());
        }

        ensure_dirs(&self.settings).await?;
        self.reconcile().await
    }

    /// One reconciliation pass over the log directory.
    async fn reconcile(&mut self) -> Result<ReconcileReport> {
        let started = Instant::now();
        self.collect_exits();
        self.prune_silent_exits();
        while let Ok(ids) = self.drained_rx.try_recv() {
            self.finish_draining(ids);
        }

        let log_dir = self.settings.log_dir.clone();
        let mut entries = fs::read_dir(&log_dir)
            .await
            .with_context(|| format!("failed to list log directory {}", log_dir.display()))?;

        let mut report = ReconcileReport::default();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to list log directory {}", log_dir.display()))?
        {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    // vanished between listing and stat
                    debug!(error = %err, path = %path.display(), "skipping unreadable entry");
                    continue;
                }
            };

            match self.examine(&path, &metadata).await {
                Ok(Outcome::Spawned(id)) => report.spawned.push(id),
                Ok(Outcome::Finished(id)) => report.finished.push(id),
                Ok(Outcome::Tracked) => report.skipped_tracked += 1,
                Ok(Outcome::Ignored) | Ok(Outcome::Deferred) => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        error = %format!("{err:#}"),
                        path = %path.display(),
                        "skipping file this pass"
                    );
                }
            }
        }

        self.publish_gauge();
        metrics::RECONCILE_DURATION.observe(started.elapsed().as_secs_f64());
        if !report.is_noop() {
            info!(
                spawned = report.spawned.len(),
                finished = report.finished.len(),
                tracked = report.skipped_tracked,
                failed = report.failed,
                "reconciliation pass applied changes"
            );
        }
        Ok(report)
    }

    /// Applies the eligibility rules to one directory entry.
    async fn examine(&mut self, path: &Path, metadata: &Metadata) -> Result<Outcome> {
        if metadata.is_dir() {
            debug!(path = %path.display(), "skipping directory");
            return Ok(Outcome::Ignored);
        }
        if !metadata.is_file() || is_finished(path) {
            return Ok(Outcome::Ignored);
        }

        let id = FileId::from_metadata(metadata)
            .with_context(|| format!("failed to identify {}", path.display()))?;
        if self.tasks.contains_key(&id) || self.draining.contains(&id) {
            return Ok(Outcome::Tracked);
        }

        let side_car = id.side_car_path(&self.settings.offset_dir);
        let size = metadata.len();
        let has_side_car = fs::try_exists(&side_car)
            .await
            .with_context(|| format!("failed to check side-car {}", side_car.display()))?;
        let recorded = offset_store::read_last_offset(&side_car).await?;

        if size == 0 && recorded.is_none() {
            // nothing written yet; a later pass picks it up once data arrives
            return Ok(Outcome::Deferred);
        }

        let start_at = match recorded {
            _ if !has_side_car => 0,
            Some(offset) if offset == size => {
                self.retire(path, &side_car, id).await?;
                return Ok(Outcome::Finished(id));
            }
            Some(offset) if offset > size => {
                warn!(
                    path = %path.display(),
                    recorded = offset,
                    size,
                    "file shrank below recorded offset; restarting from the beginning"
                );
                0
            }
            Some(offset) => offset,
            None => 0,
        };

        if self.tasks.len() >= self.options.max_tasks {
            debug!(
                path = %path.display(),
                max_tasks = self.options.max_tasks,
                "task limit reached; deferring file to a later pass"
            );
            return Ok(Outcome::Deferred);
        }

        self.spawn_task(path, side_car, id, start_at).await?;
        Ok(Outcome::Spawned(id))
    }

    async fn spawn_task(
        &mut self,
        path: &Path,
        side_car: PathBuf,
        id: FileId,
        offset: u64,
    ) -> Result<()> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let spec = TaskSpec {
            id,
            generation,
            source: path.to_path_buf(),
            side_car,
            topic: self.settings.topic.clone(),
            offset,
            settle_timeout: self.options.shutdown_timeout,
        };
        let running = TailTask::spawn(
            spec,
            self.sink.clone(),
            self.exits_tx.clone(),
            CancellationToken::new(),
        )
        .await
        .with_context(|| format!("failed to start tail task for {}", path.display()))?;

        debug!(%id, generation, path = %path.display(), offset, "registered tail task");
        self.tasks.insert(
            id,
            TaskEntry {
                generation,
                source: path.to_path_buf(),
                cancel: running.cancel,
                handle: running.handle,
            },
        );
        Ok(())
    }

    /// Renames a drained file and then its side-car with the finished suffix.
    ///
    /// The source goes first: if only the source is renamed the pair is still
    /// excluded from future scans, whereas a lone renamed side-car would make
    /// the source look new and get re-read from offset 0.
    async fn retire(&self, path: &Path, side_car: &Path, id: FileId) -> Result<()> {
        let done_source = finished_path(path);
        offset_store::rename(path, &done_source).await?;

        let done_side_car = finished_path(side_car);
        if let Err(err) = offset_store::rename(side_car, &done_side_car).await {
            error!(
                error = %err,
                %id,
                side_car = %side_car.display(),
                "source retired but side-car rename failed"
            );
            return Err(err);
        }

        metrics::FILES_FINISHED_TOTAL.inc();
        info!(
            %id,
            path = %done_source.display(),
            side_car = %done_side_car.display(),
            "file fully drained; marked finished"
        );
        Ok(())
    }

    fn handle_exit(&mut self, exit: TaskExit) {
        let current = self.tasks.get(&exit.id).map(|entry| entry.generation);
        if current != Some(exit.generation) {
            debug!(
                id = %exit.id,
                generation = exit.generation,
                "ignoring exit from a task that is no longer registered"
            );
            return;
        }

        if let Some(entry) = self.tasks.remove(&exit.id) {
            debug!(
                id = %exit.id,
                path = %entry.source.display(),
                reason = exit.reason.label(),
                offset = exit.offset,
                settled = exit.settled,
                "tail task deregistered"
            );
        }
        if !exit.settled {
            self.drain_in_background(vec![exit.id]);
        }
        self.publish_gauge();
    }

    fn collect_exits(&mut self) {
        while let Ok(exit) = self.exits_rx.try_recv() {
            self.handle_exit(exit);
        }
    }

    /// Drops registrations whose task ended without reporting back (a panic).
    fn prune_silent_exits(&mut self) {
        let mut silent = Vec::new();
        self.tasks.retain(|id, entry| {
            if entry.handle.is_finished() {
                warn!(%id, path = %entry.source.display(), "tail task ended without deregistering");
                silent.push(*id);
                false
            } else {
                true
            }
        });
        self.drain_in_background(silent);
    }

    /// Keeps `ids` off-limits until every record queued so far has been recorded.
    fn drain_in_background(&mut self, ids: Vec<FileId>) {
        if ids.is_empty() {
            return;
        }
        debug!(count = ids.len(), "waiting for sink to record offsets of stopped tasks");
        self.draining.extend(ids.iter().copied());

        let sink = self.sink.clone();
        let drained_tx = self.drained_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.barrier().await {
                debug!(error = %err, "sink stopped while draining stopped tasks");
            }
            let _ = drained_tx.send(ids);
        });
    }

    fn finish_draining(&mut self, ids: Vec<FileId>) {
        for id in ids {
            if self.draining.remove(&id) {
                debug!(%id, "side-car released");
            }
        }
    }

    async fn stop_all_tasks(&mut self) {
        if self.tasks.is_empty() {
            return;
        }

        info!(count = self.tasks.len(), "stopping tail tasks");
        for entry in self.tasks.values() {
            entry.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.options.shutdown_timeout;
        let mut unsettled = Vec::new();
        for (id, mut entry) in self.tasks.drain() {
            match tokio::time::timeout_at(deadline, &mut entry.handle).await {
                Ok(Ok(())) => debug!(%id, path = %entry.source.display(), "tail task stopped"),
                Ok(Err(err)) => {
                    warn!(
                        %id,
                        path = %entry.source.display(),
                        error = %err,
                        "tail task exited with error during shutdown"
                    );
                    unsettled.push(id);
                }
                Err(_) => {
                    warn!(
                        %id,
                        path = %entry.source.display(),
                        "tail task did not stop within timeout; aborting"
                    );
                    entry.handle.abort();
                    unsettled.push(id);
                }
            }
        }

        // The registrations are gone; only the settle state still matters.
        while let Ok(exit) = self.exits_rx.try_recv() {
            if !exit.settled {
                unsettled.push(exit.id);
            }
        }
        self.publish_gauge();

        if unsettled.is_empty() {
            return;
        }
        match tokio::time::timeout(self.options.shutdown_timeout, self.sink.barrier()).await {
            Ok(Ok(())) => debug!(count = unsettled.len(), "stopped tasks settled"),
            Ok(Err(err)) => debug!(error = %err, "sink stopped while settling stopped tasks"),
            Err(_) => {
                warn!(
                    count = unsettled.len(),
                    "sink still recording offsets of stopped tasks; holding their files"
                );
                self.drain_in_background(unsettled);
            }
        }
    }

    fn publish_gauge(&self) {
        metrics::ACTIVE_TASKS.set(self.tasks.len() as i64);
    }
}

async fn ensure_dirs(settings: &TailSettings) -> Result<()> {
    for dir in [&settings.log_dir, &settings.offset_dir] {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    Ok(())
}

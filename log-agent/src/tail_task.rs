use crate::identity::FileId;
use crate::metrics;
use crate::offset_store::OffsetLog;
use crate::sink::{LogRecord, RecordSink};
use crate::tail_reader::TailReader;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything needed to start tailing one file.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: FileId,
    /// Distinguishes successive tasks for the same identity.
    pub generation: u64,
    pub source: PathBuf,
    pub side_car: PathBuf,
    pub topic: String,
    pub offset: u64,
    /// How long a finishing task waits for the sink to record its outstanding offsets.
    pub settle_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Every line up to the end of the file was handed to the sink.
    Drained,
    Cancelled,
    Failed(String),
}

impl ExitReason {
    pub fn label(&self) -> &'static str {
        match self {
            ExitReason::Drained => "drained",
            ExitReason::Cancelled => "cancelled",
            ExitReason::Failed(_) => "failed",
        }
    }
}

/// Deregistration notice a task sends to the manager as its last act.
#[derive(Debug, Clone)]
pub struct TaskExit {
    pub id: FileId,
    pub generation: u64,
    pub reason: ExitReason,
    /// Offset of the last line submitted to the sink.
    pub offset: u64,
    /// False when the sink may still append to the side-car on this task's behalf.
    pub settled: bool,
}

pub struct RunningTask {
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

pub struct TailTask {
    spec: TaskSpec,
    reader: TailReader,
    offset_log: Arc<OffsetLog>,
    sink: Arc<dyn RecordSink>,
    exits: mpsc::UnboundedSender<TaskExit>,
    cancel: CancellationToken,
    submitted: u64,
}

impl TailTask {
    /// Opens the source and its side-car, then starts the run loop.
    ///
    /// Nothing is spawned when either file cannot be opened.
    pub async fn spawn(
        spec: TaskSpec,
        sink: Arc<dyn RecordSink>,
        exits: mpsc::UnboundedSender<TaskExit>,
        cancel: CancellationToken,
    ) -> Result<RunningTask> {
        let reader = TailReader::open(&spec.source, spec.offset).await?;
        let offset_log = Arc::new(OffsetLog::open(&spec.side_car).await?);

        let submitted = spec.offset;
        let task = TailTask {
            spec,
            reader,
            offset_log,
            sink,
            exits,
            cancel: cancel.clone(),
            submitted,
        };
        let handle = tokio::spawn(task.run());
        Ok(RunningTask { cancel, handle })
    }

    async fn run(mut self) {
        info!(
            id = %self.spec.id,
            path = %self.spec.source.display(),
            offset = self.spec.offset,
            "tail task started"
        );

        let (reason, forwarded) = self.pump().await;
        let settled = self.settle().await;

        let offset = self.submitted;
        metrics::TASK_EXITS_TOTAL
            .with_label_values(&[reason.label()])
            .inc();
        match &reason {
            ExitReason::Drained => info!(
                id = %self.spec.id,
                path = %self.reader.path().display(),
                offset,
                forwarded,
                "tail task drained file"
            ),
            ExitReason::Cancelled => info!(
                id = %self.spec.id,
                path = %self.reader.path().display(),
                offset,
                forwarded,
                "tail task cancelled"
            ),
            ExitReason::Failed(err) => warn!(
                id = %self.spec.id,
                path = %self.reader.path().display(),
                offset,
                forwarded,
                error = %err,
                "tail task failed; file will be resumed by a later pass"
            ),
        }

        let exit = TaskExit {
            id: self.spec.id,
            generation: self.spec.generation,
            reason,
            offset,
            settled,
        };
        if self.exits.send(exit).is_err() {
            debug!(id = %self.spec.id, "manager gone before task exit was reported");
        }
    }

    /// Forwards lines until the file is exhausted, the task is cancelled, or
    /// reading or submitting fails. Returns the exit reason and line count.
    async fn pump(&mut self) -> (ExitReason, u64) {
        let mut forwarded = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return (ExitReason::Cancelled, forwarded),
                next = self.reader.next_line() => next,
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => return (ExitReason::Drained, forwarded),
                Err(err) => return (ExitReason::Failed(format!("{err:#}")), forwarded),
            };

            let record = LogRecord {
                topic: self.spec.topic.clone(),
                key: String::new(),
                value: line,
                offset: self.reader.offset(),
                offset_log: self.offset_log.clone(),
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return (ExitReason::Cancelled, forwarded),
                submitted = self.sink.submit(record) => {
                    if let Err(err) = submitted {
                        return (ExitReason::Failed(format!("{err:#}")), forwarded);
                    }
                }
            }
            self.submitted = self.reader.offset();
            forwarded += 1;
        }
    }

    /// Waits until the sink has recorded every offset this task submitted so
    /// the side-car has no writer left once the task deregisters.
    ///
    /// A sink that rejects the barrier is closed or stopped, and no later task
    /// resumes through it, so that also counts as settled.
    async fn settle(&self) -> bool {
        match tokio::time::timeout(self.spec.settle_timeout, self.sink.barrier()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                debug!(
                    id = %self.spec.id,
                    error = %err,
                    "sink unavailable while settling task"
                );
                true
            }
            Err(_) => {
                warn!(
                    id = %self.spec.id,
                    side_car = %self.offset_log.path().display(),
                    "timed out waiting for sink to record outstanding offsets"
                );
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Sink that records synchronously, optionally holding every submit until released.
    pub(crate) struct RecordingSink {
        pub values: std::sync::Mutex<Vec<(String, u64)>>,
        pub gate: Option<Arc<Notify>>,
    }

    impl RecordingSink {
        pub(crate) fn new() -> Self {
            Self {
                values: std::sync::Mutex::new(Vec::new()),
                gate: None,
            }
        }

        pub(crate) fn gated(gate: Arc<Notify>) -> Self {
            Self {
                values: std::sync::Mutex::new(Vec::new()),
                gate: Some(gate),
            }
        }

        pub(crate) fn values(&self) -> Vec<String> {
            self.values
                .lock()
                .unwrap()
                .iter()
                .map(|(value, _)| value.clone())
                .collect()
        }
    }

    #[async_trait]
    impl RecordSink for RecordingSink {
        async fn submit(&self, record: LogRecord) -> Result<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            record.offset_log.append(record.offset).await?;
            self.values
                .lock()
                .unwrap()
                .push((record.value, record.offset));
            Ok(())
        }

        async fn barrier(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    fn spec(dir: &TempDir, offset: u64) -> TaskSpec {
        TaskSpec {
            id: FileId::new(1),
            generation: 1,
            source: dir.path().join("app.log"),
            side_car: dir.path().join("1"),
            topic: "web_log".to_string(),
            offset,
            settle_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_drains_file_and_records_offsets() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("app.log"), "GET /\nPOST /login\n")
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::new());
        let (exits_tx, mut exits_rx) = mpsc::unbounded_channel();

        let running = TailTask::spawn(spec(&dir, 0), sink.clone(), exits_tx, CancellationToken::new())
            .await
            .unwrap();
        let exit = exits_rx.recv().await.unwrap();
        running.handle.await.unwrap();

        assert_eq!(exit.reason, ExitReason::Drained);
        assert_eq!(exit.offset, 18);
        assert!(exit.settled);
        assert_eq!(sink.values(), vec!["GET /", "POST /login"]);
        let side_car = tokio::fs::read_to_string(dir.path().join("1")).await.unwrap();
        assert_eq!(side_car, "6\n18\n");
    }

    #[tokio::test]
    async fn test_resume_forwards_only_the_tail() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("app.log"), "old line\nnew line\n")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("1"), "9\n").await.unwrap();
        let sink = Arc::new(RecordingSink::new());
        let (exits_tx, mut exits_rx) = mpsc::unbounded_channel();

        TailTask::spawn(spec(&dir, 9), sink.clone(), exits_tx, CancellationToken::new())
            .await
            .unwrap();
        let exit = exits_rx.recv().await.unwrap();

        assert_eq!(exit.reason, ExitReason::Drained);
        assert_eq!(sink.values(), vec!["new line"]);
        let side_car = tokio::fs::read_to_string(dir.path().join("1")).await.unwrap();
        assert_eq!(side_car, "9\n18\n");
    }

    #[tokio::test]
    async fn test_cancel_stops_without_forwarding_more() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("app.log"), "a\nb\nc\n")
            .await
            .unwrap();
        let gate = Arc::new(Notify::new());
        let sink = Arc::new(RecordingSink::gated(gate.clone()));
        let (exits_tx, mut exits_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        TailTask::spawn(spec(&dir, 0), sink.clone(), exits_tx, cancel.clone())
            .await
            .unwrap();
        cancel.cancel();
        let exit = exits_rx.recv().await.unwrap();

        assert_eq!(exit.reason, ExitReason::Cancelled);
        assert_eq!(exit.offset, 0);
        assert!(sink.values().is_empty());
    }

    struct StalledBarrierSink;

    #[async_trait]
    impl RecordSink for StalledBarrierSink {
        async fn submit(&self, record: LogRecord) -> Result<()> {
            record.offset_log.append(record.offset).await
        }

        async fn barrier(&self) -> Result<()> {
            std::future::pending().await
        }

        async fn close(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unsettled_exit_when_barrier_times_out() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("app.log"), "x\n").await.unwrap();
        let (exits_tx, mut exits_rx) = mpsc::unbounded_channel();
        let spec = TaskSpec {
            settle_timeout: Duration::from_millis(20),
            ..spec(&dir, 0)
        };

        TailTask::spawn(spec, Arc::new(StalledBarrierSink), exits_tx, CancellationToken::new())
            .await
            .unwrap();
        let exit = exits_rx.recv().await.unwrap();

        assert_eq!(exit.reason, ExitReason::Drained);
        assert!(!exit.settled);
    }

    #[tokio::test]
    async fn test_missing_source_fails_to_spawn() {
        let dir = TempDir::new().unwrap();
        let (exits_tx, _exits_rx) = mpsc::unbounded_channel();
        let result = TailTask::spawn(
            spec(&dir, 0),
            Arc::new(RecordingSink::new()),
            exits_tx,
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert!(!dir.path().join("1").exists());
    }
}

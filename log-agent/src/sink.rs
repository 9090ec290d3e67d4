//! Downstream delivery of tailed lines.
//!
//! Tail tasks hand every line to a [`RecordSink`]. The production sink is a
//! [`SinkAdapter`]: a bounded queue drained by one delivery worker that
//! publishes the line and only then appends the line's offset to the owning
//! task's side-car. A crash between the two steps re-delivers the line on
//! resume; an offset is never recorded ahead of its line.

use crate::config::SinkConfig;
use crate::metrics;
use crate::offset_store::OffsetLog;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);
const MIN_ENQUEUE_WAIT: Duration = Duration::from_millis(10);

/// One tailed line on its way downstream.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub topic: String,
    pub key: String,
    pub value: String,
    /// Byte position in the source file just past this line.
    pub offset: u64,
    pub offset_log: Arc<OffsetLog>,
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Queue a record. Blocks while the sink applies backpressure.
    async fn submit(&self, record: LogRecord) -> Result<()>;

    /// Resolves once everything submitted before the call has been delivered
    /// and its offset recorded.
    async fn barrier(&self) -> Result<()>;

    /// Stop accepting records, drain what is queued and flush, giving up after `timeout`.
    async fn close(&self, timeout: Duration) -> Result<()>;
}

/// Where delivered values end up.
#[async_trait]
pub trait Publisher: Send + 'static {
    async fn publish(&mut self, record: &LogRecord) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;
}

/// Local stand-in for a message-queue producer: every value becomes one line
/// of a shared append-only log.
#[derive(Debug)]
pub struct AppendLogPublisher {
    path: PathBuf,
    file: File,
}

impl AppendLogPublisher {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create sink directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open sink output {}", path.display()))?;
        Ok(Self { path, file })
    }
}

#[async_trait]
impl Publisher for AppendLogPublisher {
    async fn publish(&mut self, record: &LogRecord) -> Result<()> {
        let mut line = Vec::with_capacity(record.value.len() + 1);
        line.extend_from_slice(record.value.as_bytes());
        line.push(b'\n');
        self.file
            .write_all(&line)
            .await
            .with_context(|| format!("failed to write to {}", self.path.display()))?;
        self.file
            .flush()
            .await
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .await
            .with_context(|| format!("failed to sync {}", self.path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub queue_capacity: usize,
    pub retry_max_attempts: usize,
    pub retry_base_delay: Duration,
    pub enqueue_warn_after: Duration,
}

impl SinkOptions {
    pub fn from_config(config: &SinkConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            retry_max_attempts: config.retry_max_attempts,
            retry_base_delay: config.retry_base_delay(),
            enqueue_warn_after: config.enqueue_warn_after(),
        }
    }
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            retry_max_attempts: 5,
            retry_base_delay: Duration::from_millis(200),
            enqueue_warn_after: Duration::from_secs(1),
        }
    }
}

enum SinkItem {
    Record(LogRecord),
    Barrier(oneshot::Sender<()>),
}

pub struct SinkAdapter {
    tx: Mutex<Option<mpsc::Sender<SinkItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    fatal: CancellationToken,
    abort: CancellationToken,
    capacity: usize,
    enqueue_warn_after: Duration,
}

impl SinkAdapter {
    pub fn spawn<P: Publisher>(publisher: P, options: SinkOptions) -> Self {
        let capacity = options.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let fatal = CancellationToken::new();
        let abort = CancellationToken::new();

        let worker = tokio::spawn(delivery_loop(
            publisher,
            rx,
            RetryPolicy {
                max_attempts: options.retry_max_attempts.max(1),
                base_delay: options.retry_base_delay,
            },
            fatal.clone(),
            abort.clone(),
        ));

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            fatal,
            abort,
            capacity,
            enqueue_warn_after: options.enqueue_warn_after.max(MIN_ENQUEUE_WAIT),
        }
    }

    /// Cancelled when delivery has failed for good and the agent must stop.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    async fn enqueue(&self, item: SinkItem) -> Result<()> {
        let sender = {
            let guard = self.tx.lock().await;
            guard.clone().ok_or_else(|| anyhow!("sink is closed"))?
        };

        let mut item = item;
        loop {
            match sender.send_timeout(item, self.enqueue_warn_after).await {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    warn!(
                        capacity = self.capacity,
                        waited_ms = self.enqueue_warn_after.as_millis() as u64,
                        "sink queue full; waiting for delivery to catch up"
                    );
                    item = returned;
                }
                Err(SendTimeoutError::Closed(_)) => {
                    return Err(anyhow!("sink delivery loop has stopped"));
                }
            }
        }
    }
}

#[async_trait]
impl RecordSink for SinkAdapter {
    async fn submit(&self, record: LogRecord) -> Result<()> {
        self.enqueue(SinkItem::Record(record)).await
    }

    async fn barrier(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(SinkItem::Barrier(ack_tx)).await?;
        ack_rx
            .await
            .map_err(|_| anyhow!("sink stopped before pending records were recorded"))
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        // Dropping the last sender lets the worker finish once the queue is empty.
        drop(self.tx.lock().await.take());

        let Some(mut worker) = self.worker.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut worker).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(anyhow!("sink delivery loop panicked: {err}")),
            Err(_) => {
                self.abort.cancel();
                worker.abort();
                Err(anyhow!(
                    "sink did not drain within {} ms; remaining records will be redelivered on restart",
                    timeout.as_millis()
                ))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
}

async fn delivery_loop<P: Publisher>(
    mut publisher: P,
    mut rx: mpsc::Receiver<SinkItem>,
    policy: RetryPolicy,
    fatal: CancellationToken,
    abort: CancellationToken,
) {
    info!("sink delivery loop started");

    while let Some(item) = rx.recv().await {
        match item {
            SinkItem::Barrier(ack) => {
                let _ = ack.send(());
            }
            SinkItem::Record(record) => {
                if let Err(err) = deliver(&mut publisher, &record, policy, &abort).await {
                    metrics::SINK_FAILURES_TOTAL.inc();
                    error!(
                        error = %err,
                        side_car = %record.offset_log.path().display(),
                        offset = record.offset,
                        "sink delivery failed permanently; stopping agent"
                    );
                    fatal.cancel();
                    break;
                }
            }
        }
    }

    // Queued barriers observe the closed channel once rx drops.
    rx.close();

    if let Err(err) = publisher.flush().await {
        warn!(error = %err, "failed to flush sink publisher");
    }
    info!("sink delivery loop stopped");
}

async fn deliver<P: Publisher>(
    publisher: &mut P,
    record: &LogRecord,
    policy: RetryPolicy,
    abort: &CancellationToken,
) -> Result<()> {
    let mut attempt = 0usize;
    let mut backoff = policy.base_delay.max(Duration::from_millis(1));
    loop {
        match publisher.publish(record).await {
            Ok(()) => break,
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(err.context(format!("publish failed after {attempt} attempts")));
                }
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "publish failed; retrying with backoff"
                );
                if !backoff_or_abort(&mut backoff, abort).await {
                    return Err(anyhow!("sink aborted while retrying publish"));
                }
            }
        }
    }
    metrics::LINES_FORWARDED_TOTAL
        .with_label_values(&[record.topic.as_str()])
        .inc();

    let mut attempt = 0usize;
    let mut backoff = policy.base_delay.max(Duration::from_millis(1));
    loop {
        match record.offset_log.append(record.offset).await {
            Ok(()) => break,
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(err.context(format!("offset append failed after {attempt} attempts")));
                }
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    side_car = %record.offset_log.path().display(),
                    "offset append failed; retrying with backoff"
                );
                if !backoff_or_abort(&mut backoff, abort).await {
                    return Err(anyhow!("sink aborted while retrying offset append"));
                }
            }
        }
    }
    metrics::OFFSETS_RECORDED_TOTAL.inc();

    debug!(
        side_car = %record.offset_log.path().display(),
        offset = record.offset,
        "line delivered and offset recorded"
    );
    Ok(())
}

/// Sleeps for the current backoff and doubles it. Returns false if aborted first.
async fn backoff_or_abort(backoff: &mut Duration, abort: &CancellationToken) -> bool {
    let wait = *backoff;
    *backoff = std::cmp::min(backoff.saturating_mul(2), MAX_RETRY_BACKOFF);
    tokio::select! {
        biased;
        _ = abort.cancelled() => false,
        _ = sleep(wait) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FlakyPublisher {
        failures_left: Arc<AtomicUsize>,
        published: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Publisher for FlakyPublisher {
        async fn publish(&mut self, record: &LogRecord) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(anyhow!("broker unavailable"));
            }
            self.published.lock().unwrap().push(record.value.clone());
            Ok(())
        }

        async fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn fast_options() -> SinkOptions {
        SinkOptions {
            queue_capacity: 4,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            enqueue_warn_after: Duration::from_millis(50),
        }
    }

    fn record(value: &str, offset: u64, log: &Arc<OffsetLog>) -> LogRecord {
        LogRecord {
            topic: "web_log".to_string(),
            key: String::new(),
            value: value.to_string(),
            offset,
            offset_log: log.clone(),
        }
    }

    #[tokio::test]
    async fn test_values_published_and_offsets_recorded() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out").join("total.log");
        let side_car = dir.path().join("77");
        let log = Arc::new(OffsetLog::open(&side_car).await.unwrap());

        let sink = SinkAdapter::spawn(
            AppendLogPublisher::open(&output).await.unwrap(),
            fast_options(),
        );
        sink.submit(record("first", 6, &log)).await.unwrap();
        sink.submit(record("second", 13, &log)).await.unwrap();
        sink.barrier().await.unwrap();

        assert_eq!(
            fs::read_to_string(&side_car).await.unwrap(),
            "6\n13\n"
        );
        sink.close(Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            fs::read_to_string(&output).await.unwrap(),
            "first\nsecond\n"
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(OffsetLog::open(dir.path().join("5")).await.unwrap());
        let published = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = SinkAdapter::spawn(
            FlakyPublisher {
                failures_left: Arc::new(AtomicUsize::new(2)),
                published: published.clone(),
            },
            fast_options(),
        );

        sink.submit(record("line", 5, &log)).await.unwrap();
        sink.barrier().await.unwrap();

        assert_eq!(*published.lock().unwrap(), vec!["line".to_string()]);
        assert!(!sink.fatal_token().is_cancelled());
        assert_eq!(
            fs::read_to_string(dir.path().join("5")).await.unwrap(),
            "5\n"
        );
    }

    #[tokio::test]
    async fn test_persistent_failure_is_fatal_and_records_nothing() {
        let dir = TempDir::new().unwrap();
        let side_car = dir.path().join("8");
        let log = Arc::new(OffsetLog::open(&side_car).await.unwrap());
        let sink = SinkAdapter::spawn(
            FlakyPublisher {
                failures_left: Arc::new(AtomicUsize::new(usize::MAX)),
                published: Arc::new(std::sync::Mutex::new(Vec::new())),
            },
            fast_options(),
        );
        let fatal = sink.fatal_token();

        sink.submit(record("doomed", 7, &log)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), fatal.cancelled())
            .await
            .expect("fatal token tripped");

        assert!(sink.barrier().await.is_err());
        assert_eq!(fs::read_to_string(&side_car).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_records() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(OffsetLog::open(dir.path().join("3")).await.unwrap());
        let sink = SinkAdapter::spawn(
            AppendLogPublisher::open(dir.path().join("total.log")).await.unwrap(),
            fast_options(),
        );

        sink.close(Duration::from_secs(5)).await.unwrap();
        assert!(sink.submit(record("late", 1, &log)).await.is_err());
        // closing twice is harmless
        sink.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_queued_records() {
        let dir = TempDir::new().unwrap();
        let side_car = dir.path().join("11");
        let log = Arc::new(OffsetLog::open(&side_car).await.unwrap());
        let sink = SinkAdapter::spawn(
            AppendLogPublisher::open(dir.path().join("total.log")).await.unwrap(),
            fast_options(),
        );

        for (i, value) in ["a", "b", "c"].iter().enumerate() {
            sink.submit(record(value, (i as u64 + 1) * 2, &log))
                .await
                .unwrap();
        }
        sink.close(Duration::from_secs(5)).await.unwrap();

        assert_eq!(
            fs::read_to_string(&side_car).await.unwrap(),
            "2\n4\n6\n"
        );
    }
}

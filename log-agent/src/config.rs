use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub log: LogConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    pub log_dir: String,
    pub offset_dir: String,
    /// Kill-switch: when false every tail task is stopped but the agent keeps
    /// running and picks tailing back up once a reload flips it to true.
    #[serde(default = "default_is_logging")]
    pub is_logging: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default)]
    pub address: String,
    pub topic: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_output_path")]
    pub output_path: String,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_enqueue_warn_ms")]
    pub enqueue_warn_ms: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ManagerConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Nudge reconciliation on filesystem events instead of waiting for the next tick.
    #[serde(default)]
    pub watch_events: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_addr: Option<String>,
}

const DEFAULT_IS_LOGGING: bool = true;
const DEFAULT_QUEUE_CAPACITY: usize = 1_000;
const DEFAULT_OUTPUT_PATH: &str = "./logsFinal/total.log";
const DEFAULT_RETRY_MAX_ATTEMPTS: usize = 5;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;
const DEFAULT_ENQUEUE_WARN_MS: u64 = 1_000;
const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_TASKS: usize = 256;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

fn default_is_logging() -> bool {
    DEFAULT_IS_LOGGING
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_output_path() -> String {
    DEFAULT_OUTPUT_PATH.to_string()
}

fn default_retry_max_attempts() -> usize {
    DEFAULT_RETRY_MAX_ATTEMPTS
}

fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}

fn default_enqueue_warn_ms() -> u64 {
    DEFAULT_ENQUEUE_WARN_MS
}

fn default_close_timeout_ms() -> u64 {
    DEFAULT_CLOSE_TIMEOUT_MS
}

fn default_reconcile_interval_secs() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_SECS
}

fn default_max_tasks() -> usize {
    DEFAULT_MAX_TASKS
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            max_tasks: DEFAULT_MAX_TASKS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            watch_events: false,
        }
    }
}

/// The slice of configuration a reconciliation pass depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailSettings {
    pub log_dir: PathBuf,
    pub offset_dir: PathBuf,
    pub topic: String,
    pub enabled: bool,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        if config.log.log_dir.trim().is_empty() {
            anyhow::bail!("log.log_dir cannot be empty");
        }
        if config.log.offset_dir.trim().is_empty() {
            anyhow::bail!("log.offset_dir cannot be empty");
        }
        if config.sink.topic.trim().is_empty() {
            anyhow::bail!("sink.topic cannot be empty");
        }
        if config.sink.queue_capacity == 0 {
            anyhow::bail!("sink.queue_capacity must be greater than zero");
        }
        if config.manager.reconcile_interval_secs == 0 {
            anyhow::bail!("manager.reconcile_interval_secs must be greater than zero");
        }
        if config.manager.max_tasks == 0 {
            anyhow::bail!("manager.max_tasks must be greater than zero");
        }
        if let Some(addr) = config.metrics.listen_addr.as_deref() {
            addr.parse::<SocketAddr>()
                .with_context(|| format!("invalid metrics.listen_addr {addr}"))?;
        }
        Ok(config)
    }

    pub fn tail_settings(&self) -> TailSettings {
        TailSettings {
            log_dir: expand_path(&self.log.log_dir),
            offset_dir: expand_path(&self.log.offset_dir),
            topic: self.sink.topic.clone(),
            enabled: self.log.is_logging,
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.manager.reconcile_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.manager.shutdown_timeout_ms)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics
            .listen_addr
            .as_deref()
            .and_then(|addr| addr.parse().ok())
    }
}

impl SinkConfig {
    pub fn output_path(&self) -> PathBuf {
        expand_path(&self.output_path)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn enqueue_warn_after(&self) -> Duration {
        Duration::from_millis(self.enqueue_warn_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [log]
        log_dir = "./logs"
        offset_dir = "./offsets"

        [sink]
        address = "127.0.0.1:9092"
        topic = "web_log"
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::parse(MINIMAL).expect("parse minimal config");
        assert!(config.log.is_logging);
        assert_eq!(config.sink.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.reconcile_interval(), Duration::from_secs(30));
        assert_eq!(config.manager.max_tasks, DEFAULT_MAX_TASKS);
        assert!(!config.manager.watch_events);
        assert!(config.metrics_addr().is_none());
    }

    #[test]
    fn test_tail_settings() {
        let config = Config::parse(MINIMAL).unwrap();
        let settings = config.tail_settings();
        assert_eq!(settings.log_dir, PathBuf::from("./logs"));
        assert_eq!(settings.offset_dir, PathBuf::from("./offsets"));
        assert_eq!(settings.topic, "web_log");
        assert!(settings.enabled);
    }

    #[test]
    fn test_kill_switch_parsed() {
        let raw = MINIMAL.replace("offset_dir = \"./offsets\"", "offset_dir = \"./offsets\"\nis_logging = false");
        let config = Config::parse(&raw).unwrap();
        assert!(!config.tail_settings().enabled);
    }

    #[test]
    fn test_rejects_empty_topic() {
        let raw = MINIMAL.replace("topic = \"web_log\"", "topic = \"  \"");
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn test_rejects_zero_queue_capacity() {
        let raw = format!("{MINIMAL}\nqueue_capacity = 0\n");
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn test_rejects_bad_metrics_addr() {
        let raw = format!("{MINIMAL}\n[metrics]\nlisten_addr = \"not-an-addr\"\n");
        assert!(Config::parse(&raw).is_err());
    }
}

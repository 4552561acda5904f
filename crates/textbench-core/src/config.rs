use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default lookup terms issued by the secondary poller.
pub const DEFAULT_PROBES: [&str; 10] = [
    "balancer",
    "guojun",
    "response",
    "partition",
    "distributed",
    "system",
    "internet",
    "database",
    "scalable",
    "lock",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub target: TargetConfig,
    pub mock: MockConfig,
    pub queues: QueueConfig,
    pub recorder: RecorderConfig,
    pub poller: PollerConfig,
    pub coordination: CoordinationConfig,
    pub report: ReportConfig,
}

impl HarnessConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| HarnessError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Check every value once, before any task is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.target.mode == TargetMode::Http {
            let url = url::Url::parse(&self.target.base_url).map_err(|e| {
                HarnessError::Config(format!(
                    "invalid target.base_url {}: {}",
                    self.target.base_url, e
                ))
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(HarnessError::Config(format!(
                    "target.base_url must be http:// or https:// (got {})",
                    self.target.base_url
                )));
            }
            if url.query().is_some() || url.fragment().is_some() {
                return Err(HarnessError::Config(format!(
                    "target.base_url must not include query/fragment (got {})",
                    self.target.base_url
                )));
            }
        }
        if self.target.function.is_empty() || self.target.function.contains('/') {
            return Err(HarnessError::Config(format!(
                "target.function must be a single path segment (got {:?})",
                self.target.function
            )));
        }
        if self.target.timeout_ms == 0 {
            return Err(HarnessError::Config("target.timeout_ms must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.mock.failure_rate) {
            return Err(HarnessError::Config(format!(
                "mock.failure_rate must be within 0.0..=1.0 (got {})",
                self.mock.failure_rate
            )));
        }
        if self.queues.workers_per_queue == 0 {
            return Err(HarnessError::Config(
                "queues.workers_per_queue must be >= 1".into(),
            ));
        }
        if self.queues.capacity == Some(0) {
            return Err(HarnessError::Config("queues.capacity must be >= 1".into()));
        }
        if self.recorder.pool_size == 0 {
            return Err(HarnessError::Config("recorder.pool_size must be >= 1".into()));
        }
        if self.recorder.post_log == self.recorder.get_log {
            return Err(HarnessError::Config(
                "recorder.post_log and recorder.get_log must differ".into(),
            ));
        }
        if self.poller.enabled && self.poller.probes.is_empty() {
            return Err(HarnessError::Config(
                "poller.probes must not be empty when the poller is enabled".into(),
            ));
        }
        if self.coordination.wait_timeout_ms == Some(0) {
            return Err(HarnessError::Config(
                "coordination.wait_timeout_ms must be > 0 when set".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    Http,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Base URL of the text processing service, e.g. "http://localhost:8080/TextProcessor"
    pub base_url: String,
    /// Name of the processing function selected by the request path
    pub function: String,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
    pub mode: TargetMode,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/TextProcessor".to_string(),
            function: "wordcount".to_string(),
            timeout_ms: 5000,
            mode: TargetMode::Http,
        }
    }
}

/// In-process stand-in for the target service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Simulated service latency in milliseconds
    pub delay_ms: u64,
    /// Probability that a write-style call answers 500
    pub failure_rate: f64,
    /// Deterministic seed for failure injection
    pub seed: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            delay_ms: 5,
            failure_rate: 0.0,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of workers sharing one queue
    pub workers_per_queue: usize,
    /// Queue capacity; defaults to the number of workers in the shard
    pub capacity: Option<usize>,
    /// Fill the queues completely before any worker starts
    pub await_ready: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers_per_queue: 8,
            capacity: None,
            await_ready: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Number of concurrent appenders draining the sample queue
    pub pool_size: usize,
    /// Latency log for write-style requests
    pub post_log: PathBuf,
    /// Latency log for poller lookups
    pub get_log: PathBuf,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            post_log: PathBuf::from("statistics.csv"),
            get_log: PathBuf::from("getStatistics.csv"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub enabled: bool,
    /// Pause before each probe batch in milliseconds
    pub interval_ms: u64,
    pub probes: Vec<String>,
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            probes: DEFAULT_PROBES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Upper bound for every blocking wait; unset waits forever
    pub wait_timeout_ms: Option<u64>,
}

impl CoordinationConfig {
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Directory receiving the JSON run report
    pub output_dir: Option<PathBuf>,
}

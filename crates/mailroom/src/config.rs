//! Queue and worker configuration.

use crate::error::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a single on-disk queue.
///
/// A queue lives at `<root_dir>/<queue_name>/` and owns the `queued/` and
/// `pulled/` state directories underneath it. `dead_letters` may name another
/// queue (recursively) that receives terminally failed and expired messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Parent directory containing all queues.
    pub root_dir: PathBuf,

    /// Directory name of this queue; unique under `root_dir`.
    pub queue_name: String,

    /// Failed attempts allowed before a message is dead-lettered or
    /// discarded. `None` disables the cap.
    #[serde(default = "default_max_retries")]
    pub max_retries: Option<u32>,

    /// Push is rejected once `queued/` holds this many messages
    /// (0 = unlimited).
    #[serde(default)]
    pub max_queued_messages: usize,

    /// Push is rejected for payloads above this size (0 = unlimited).
    #[serde(default)]
    pub max_message_bytes: u64,

    /// Messages older than this are routed as dead on pull (0 = no expiry).
    #[serde(default)]
    pub message_ttl_secs: u64,

    /// Dead-letter sink, itself a full queue configuration.
    #[serde(default)]
    pub dead_letters: Option<Box<QueueSettings>>,
}

fn default_max_retries() -> Option<u32> {
    Some(5)
}

impl QueueSettings {
    /// Creates settings with defaults for the given root and name.
    pub fn new(root_dir: impl Into<PathBuf>, queue_name: impl Into<String>) -> Self {
        Self {
            root_dir: root_dir.into(),
            queue_name: queue_name.into(),
            max_retries: default_max_retries(),
            max_queued_messages: 0,
            max_message_bytes: 0,
            message_ttl_secs: 0,
            dead_letters: None,
        }
    }

    /// Sets the retry cap; `None` disables it.
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the queued-message capacity (0 = unlimited).
    pub fn with_max_queued_messages(mut self, max: usize) -> Self {
        self.max_queued_messages = max;
        self
    }

    /// Sets the payload size bound (0 = unlimited).
    pub fn with_max_message_bytes(mut self, max: u64) -> Self {
        self.max_message_bytes = max;
        self
    }

    /// Sets the message time-to-live (0 = no expiry).
    pub fn with_message_ttl_secs(mut self, secs: u64) -> Self {
        self.message_ttl_secs = secs;
        self
    }

    /// Attaches a dead-letter queue.
    pub fn with_dead_letters(mut self, dead_letters: QueueSettings) -> Self {
        self.dead_letters = Some(Box::new(dead_letters));
        self
    }

    /// Returns the message TTL as a Duration, or `None` when expiry is off.
    pub fn message_ttl(&self) -> Option<Duration> {
        (self.message_ttl_secs > 0).then(|| Duration::from_secs(self.message_ttl_secs))
    }

    /// Validates the settings tree, failing fast before any directory is
    /// touched.
    pub fn validate(&self) -> QueueResult<()> {
        if self.queue_name.is_empty() {
            return Err(QueueError::Configuration("queue name is empty".into()));
        }
        if self.queue_name.contains(['/', '\\']) || self.queue_name == "." || self.queue_name == ".." {
            return Err(QueueError::Configuration(format!(
                "queue name is not a plain directory name: {:?}",
                self.queue_name
            )));
        }
        if self.root_dir.as_os_str().is_empty() {
            return Err(QueueError::Configuration("root_dir is empty".into()));
        }
        if let Some(dead_letters) = &self.dead_letters {
            dead_letters.validate()?;
        }
        Ok(())
    }
}

/// Configuration for a single worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Dispatch group joined at startup.
    #[serde(default = "default_group")]
    pub group: String,

    /// Hard wall-clock ceiling for a single handler invocation, in
    /// milliseconds.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,

    /// Idle poll interval in milliseconds; the recovery mechanism against
    /// missed wake-ups.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_group() -> String {
    "workers".to_string()
}

fn default_job_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            job_timeout_ms: default_job_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl WorkerConfig {
    /// Returns the job timeout as a Duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// Returns the idle poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validates the worker configuration.
    pub fn validate(&self) -> QueueResult<()> {
        if self.job_timeout_ms == 0 {
            return Err(QueueError::Configuration(
                "worker job timeout must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(QueueError::Configuration(
                "worker poll interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

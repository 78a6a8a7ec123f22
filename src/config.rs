use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdError};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:9000";
pub const DEFAULT_HEALTH_PING_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Which queued task the runner picks next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueOrder {
    /// The most recently submitted task runs next.
    #[default]
    NewestFirst,
    /// Tasks run in submission order.
    OldestFirst,
}

impl QueueOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newest-first" | "newest_first" | "lifo" => Some(QueueOrder::NewestFirst),
            "oldest-first" | "oldest_first" | "fifo" => Some(QueueOrder::OldestFirst),
            _ => None,
        }
    }
}

/// Configuration for the task runner and its HTTP client.
///
/// Use [`RunnerConfig::builder()`] for ergonomic construction,
/// [`RunnerConfig::from_env()`] to read `SD_*` environment variables, or
/// [`RunnerConfig::default()`] for a local server with no request timeout.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base URL of the Stable Diffusion UI server.
    pub endpoint: String,

    /// Per-request timeout for generation calls. `None` = wait forever.
    pub request_timeout: Option<Duration>,

    pub queue_order: QueueOrder,

    /// Interval between `/ping` probes when the health monitor is running.
    pub health_ping_interval: Duration,

    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout: None,
            queue_order: QueueOrder::default(),
            health_ping_interval: DEFAULT_HEALTH_PING_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl RunnerConfig {
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder::default()
    }

    /// Read overrides from the process environment:
    /// `SD_API_URL`, `SD_REQUEST_TIMEOUT_SECS`, `SD_HEALTH_PING_SECS`, `SD_QUEUE_ORDER`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SD_API_URL").filter(|v| !v.trim().is_empty()) {
            config.endpoint = url.trim().to_string();
        }

        if let Some(raw) = lookup("SD_REQUEST_TIMEOUT_SECS") {
            let secs = parse_secs("SD_REQUEST_TIMEOUT_SECS", &raw)?;
            config.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(raw) = lookup("SD_HEALTH_PING_SECS") {
            let secs = parse_secs("SD_HEALTH_PING_SECS", &raw)?;
            if secs == 0 {
                return Err(SdError::InvalidConfig(
                    "SD_HEALTH_PING_SECS must be greater than zero".into(),
                ));
            }
            config.health_ping_interval = Duration::from_secs(secs);
        }

        if let Some(raw) = lookup("SD_QUEUE_ORDER") {
            config.queue_order = QueueOrder::parse(&raw).ok_or_else(|| {
                SdError::InvalidConfig(format!(
                    "SD_QUEUE_ORDER must be newest-first or oldest-first, got {:?}",
                    raw
                ))
            })?;
        }

        Ok(config)
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| SdError::InvalidConfig(format!("{} must be whole seconds, got {:?}", key, raw)))
}

/// Builder for [`RunnerConfig`].
#[derive(Default)]
pub struct RunnerConfigBuilder {
    config: RunnerConfig,
}

impl RunnerConfigBuilder {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// Abort generation requests after `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    pub fn with_queue_order(mut self, order: QueueOrder) -> Self {
        self.config.queue_order = order;
        self
    }

    /// A zero interval falls back to [`DEFAULT_HEALTH_PING_INTERVAL`].
    pub fn with_health_ping_interval(mut self, interval: Duration) -> Self {
        self.config.health_ping_interval = if interval.is_zero() {
            DEFAULT_HEALTH_PING_INTERVAL
        } else {
            interval
        };
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> RunnerConfig {
        self.config
    }
}

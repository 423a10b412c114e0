#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(3);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Default ping payload written on every heartbeat tick.
pub const DEFAULT_PING: u8 = 0x01;
/// Default pong payload expected back from the peer.
pub const DEFAULT_PONG: u8 = 0x02;

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager).
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    #[builder(default)]
    heartbeat: HeartbeatConfig,
    #[builder(default)]
    retry: RetryPolicy,
    /// Size of the buffer each inbound read is performed into. The default is 8 KiB.
    #[builder(default = DEFAULT_READ_BUFFER_SIZE)]
    read_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    #[must_use]
    pub fn heartbeat(&self) -> &HeartbeatConfig {
        &self.heartbeat
    }

    #[must_use]
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size.max(1)
    }
}

/// Heartbeat cadence, timeout and wire payloads.
///
/// The interval is the exact cadence of the heartbeat timer and the timeout is the maximum
/// silence tolerated between two pongs. Both are fixed once a
/// [`HeartbeatMonitor`](crate::heartbeat::HeartbeatMonitor) is built from this value.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct HeartbeatConfig {
    /// How often a ping is written. The default is three (3) seconds.
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    interval: Duration,
    /// How long without a pong before the connection is considered dead. The default is five
    /// (5) seconds.
    #[builder(default = DEFAULT_HEARTBEAT_TIMEOUT_DURATION)]
    timeout: Duration,
    #[builder(into, default = vec![DEFAULT_PING])]
    ping: Vec<u8>,
    #[builder(into, default = vec![DEFAULT_PONG])]
    pong: Vec<u8>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn ping(&self) -> &[u8] {
        &self.ping
    }

    #[must_use]
    pub fn pong(&self) -> &[u8] {
        &self.pong
    }
}

/// How the connect loop behaves between failed attempts.
///
/// The default retries forever with no delay between attempts. Both limits are opt-in.
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    /// Maximum number of consecutive failed attempts before `connect` gives up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay strategy between attempts. `None` retries immediately.
    pub backoff: Option<BackoffConfig>,
}

impl RetryPolicy {
    /// Retry forever, immediately. This is the default.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub(crate) fn new_backoff(&self) -> Option<ExponentialBackoff> {
        self.backoff.clone().map(Into::into)
    }
}

/// Exponential backoff between connect attempts.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff duration for the first retry
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<BackoffConfig> for ExponentialBackoff {
    fn from(config: BackoffConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_max_elapsed_time(None) // Attempts are capped by RetryPolicy::max_attempts
            .build()
    }
}

/// Parameters handed to the [`Connector`](crate::transport::Connector) on every attempt.
///
/// The last options passed to `connect` are retained and reused for every automatic
/// reconnection.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct ConnectOptions {
    #[builder(into)]
    pub host: String,
    pub port: u16,
    /// Enable `TCP_NODELAY` on the connected socket.
    #[builder(default)]
    pub no_delay: bool,
    /// Upper bound for a single connect attempt. `None` waits for the OS to give up.
    pub connect_timeout: Option<Duration>,
}

impl ConnectOptions {
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self::builder().host(host).port(port).build()
    }

    /// Get the address string (host:port).
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

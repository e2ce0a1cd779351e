#![cfg_attr(
    feature = "reconnect",
    expect(
        clippy::module_name_repetitions,
        reason = "Configuration types intentionally mirror the module name for clarity"
    )
)]

use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "reconnect")]
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::journal::Journal;

const DEFAULT_REQUEST_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_HANDSHAKE_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_GRACE_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_SYNC_PAGE_SIZE: u32 = 40;
const DEFAULT_MAX_PENDING_REQUESTS: usize = 4096;
const DEFAULT_ORIGIN: &str = "https://web.max.ru";
#[cfg(feature = "reconnect")]
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(2);
#[cfg(feature = "reconnect")]
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(60);
#[cfg(feature = "reconnect")]
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Configuration for the realtime connection.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Deadline applied by [`Connection::request`](super::Connection::request)
    pub request_timeout: Duration,
    /// Deadline for each of the session init and sync responses
    pub handshake_timeout: Duration,
    /// Deadline for opening the WebSocket transport
    pub connect_timeout: Duration,
    /// Interval between keepalive pings while synced
    pub keepalive_interval: Duration,
    /// How long shutdown waits for in-flight push handler tasks before aborting them
    pub shutdown_grace: Duration,
    /// Number of conversations requested by the initial sync
    pub sync_page_size: u32,
    /// Outstanding requests allowed at once; further calls are refused
    pub max_pending_requests: usize,
    /// `Origin` header sent with the upgrade request
    pub origin: Option<String>,
    /// Shared journal receiving connection-level events
    pub journal: Option<Arc<Journal>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT_DURATION,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT_DURATION,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_DURATION,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL_DURATION,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE_DURATION,
            sync_page_size: DEFAULT_SYNC_PAGE_SIZE,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            origin: Some(DEFAULT_ORIGIN.to_owned()),
            journal: None,
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub(crate) fn record<S: Into<String>>(&self, line: S) {
        if let Some(journal) = &self.journal {
            journal.record(line);
        }
    }
}

/// Backoff policy for the caller-side reconnect loop in [`crate::reconnect`].
#[cfg(feature = "reconnect")]
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed connects before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Initial backoff duration for first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

#[cfg(feature = "reconnect")]
impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

#[cfg(feature = "reconnect")]
impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

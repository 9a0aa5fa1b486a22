//! Engine configuration
//!
//! Defaults suit a production operator; tests shrink the timings.

use std::time::Duration;

use crate::retry::RetryConfig;

/// Default number of identities processed concurrently
pub const DEFAULT_WORKERS: usize = 8;

/// Default bound on a single store operation
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Resource watcher settings
#[derive(Clone, Debug, Default)]
pub struct WatcherConfig {
    /// Reconnect backoff; the watcher never stops retrying
    pub backoff: RetryConfig,
    /// Re-list and re-present every object at this interval (disabled if `None`)
    pub resync_interval: Option<Duration>,
}

/// Settings for one operator instance
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upper bound on identities processed in parallel
    pub workers: usize,
    /// Timeout applied to each store call made through the facade
    pub operation_timeout: Duration,
    /// Watcher settings
    pub watcher: WatcherConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            watcher: WatcherConfig {
                backoff: RetryConfig::infinite(),
                resync_interval: None,
            },
        }
    }
}

impl EngineConfig {
    /// Set the worker pool size (at least one)
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the per-operation store timeout
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Enable periodic resync
    pub fn resync_every(mut self, interval: Duration) -> Self {
        self.watcher.resync_interval = Some(interval);
        self
    }

    /// Set the watcher reconnect backoff bounds
    pub fn reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.watcher.backoff = RetryConfig::infinite().delays(initial, max);
        self
    }
}

//! Retry utilities with exponential backoff and jitter.
//!
//! [`Backoff`] is the stateful delay sequence used by the watcher's reconnect
//! loop; [`retry_with_backoff`] wraps a fallible async operation with the
//! same policy.
//!
//! # Example
//!
//! ```ignore
//! use tether::retry::{retry_with_backoff, RetryConfig};
//!
//! let client = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(5),
//!     "connect",
//!     || kube::Client::try_default(),
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Override the delay bounds
    pub fn delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }
}

/// Exponential delay sequence with jitter, capped at `max_delay`
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    delay: Duration,
    attempt: u32,
}

impl Backoff {
    /// Start a new sequence at the configured initial delay
    pub fn new(config: RetryConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            delay,
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True once `max_attempts` delays have been handed out (never for 0)
    pub fn exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.attempt >= self.config.max_attempts
    }

    /// Next delay to wait, then grow the base delay
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);

        // Add jitter: 0.5x to 1.5x of the delay, never above max_delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * jitter).min(self.config.max_delay.as_secs_f64()),
        );

        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );
        jittered
    }

    /// Return to the initial delay after a success
    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
        self.attempt = 0;
    }
}

/// Run `operation` until it succeeds, sleeping a [`Backoff`] delay between tries
///
/// Gives up with the last error once `max_attempts` tries have failed; with
/// `max_attempts == 0` it never gives up.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config.clone());

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let delay = backoff.next_delay();
                if backoff.exhausted() {
                    error!(
                        operation = %operation_name,
                        attempt = backoff.attempt(),
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = backoff.attempt(),
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

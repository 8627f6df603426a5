//! Resilience utilities: retry policy and exponential backoff.
//!
//! - [`RetryConfig`]: exponential backoff schedule with an attempt bound
//! - [`retry`]: drive a fallible async operation under a [`RetryConfig`],
//!   separating "gave up after N attempts" from "not worth retrying"
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use oplog_replication::resilience::{retry, RetryConfig, RetryError};
//! use oplog_replication::ApplyError;
//!
//! let result = retry(&RetryConfig::backend_conflicts(), "apply", |_attempt| async {
//!     Err::<(), _>(ApplyError::BackendRollback { message: "deadlock".into() })
//! })
//! .await;
//! assert!(matches!(result, Err(RetryError::GiveUp { .. })));
//! # }
//! ```

use crate::error::{ApplyError, ReplicationError};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that know whether trying again could help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ApplyError {
    fn is_retryable(&self) -> bool {
        ApplyError::is_retryable(self)
    }
}

impl Retryable for ReplicationError {
    fn is_retryable(&self) -> bool {
        ReplicationError::is_retryable(self)
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    /// Set to `usize::MAX` for infinite retries (daemon mode).
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Infinite retry for long-running loops (never give up).
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9        256s
    /// 10+      300s (cap)
    /// ```
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }

    /// Short bounded schedule for backend transaction conflicts.
    ///
    /// Conflicts usually clear within a few milliseconds; five attempts spread
    /// over roughly 150ms.
    pub fn backend_conflicts() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }

    /// SQLite contention (SQLITE_BUSY/SQLITE_LOCKED) on the watermark store.
    ///
    /// Five attempts, 10ms doubling up to 500ms.
    pub fn sqlite_busy() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(64) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = (self.initial_delay.as_secs_f64() * multiplier).min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(delay_secs)
    }
}

/// Why [`retry`] stopped trying.
#[derive(Error, Debug, PartialEq)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    GiveUp { attempts: usize, last: E },

    /// An attempt failed with an error that retrying cannot fix.
    #[error("aborted: {0}")]
    Abort(E),
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// attempt budget runs out. `f` receives the 1-indexed attempt number.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, operation: &str, mut f: F) -> Result<T, RetryError<E>>
where
    E: Retryable + std::error::Error + 'static,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match f(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(RetryError::Abort(e)),
            Err(e) if attempt >= config.max_attempts => {
                return Err(RetryError::GiveUp { attempts: attempt, last: e });
            }
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

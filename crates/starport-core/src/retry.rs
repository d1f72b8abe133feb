//! Bounded retry with fail-fast classification.
//!
//! Script calls use [`RetryPolicy::attempts`], which retries immediately;
//! hosts can build a policy with backoff for their own use. Every attempt
//! first checks a [`CancelToken`] so a host-level timeout stops the loop
//! before the next request goes out.
//!
//! ```rust,ignore
//! use starport_core::retry::{RetryPolicy, CancelToken, with_retry};
//!
//! let outcome = with_retry(&RetryPolicy::attempts(3), &CancelToken::new(), || {
//!     client.chat(&request)
//! });
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier applied to delay after each retry
    pub backoff_factor: f64,
    /// Random jitter range as a fraction (0.1 = ±10%)
    pub jitter_percent: f64,
    /// Total number of attempts, including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::attempts(1)
    }
}

impl RetryPolicy {
    /// Up to `retry` attempts with no delay between them. Values below one
    /// still make a single attempt.
    #[must_use]
    pub fn attempts(retry: i64) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter_percent: 0.0,
            max_attempts: u32::try_from(retry.max(1)).unwrap_or(u32::MAX),
        }
    }

    /// Exponential backoff policy for host-side callers.
    #[must_use]
    pub fn with_backoff(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        if initial_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 {
            let jitter_range = base_ms * self.jitter_percent;
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }
}

/// Shared cancellation flag checked before each attempt.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous cancellation so the token can be reused.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcome of a retry loop.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The result (success or final error)
    pub result: Result<T>,
    /// Number of attempts made
    pub attempts: u32,
}

/// Only transport failures other than a provider bad request are worth
/// another attempt.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Transport { status, .. } => *status != Some(400),
        _ => false,
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error,
/// exhausts the policy or is cancelled.
pub fn with_retry<T, F>(policy: &RetryPolicy, cancel: &CancelToken, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            debug!(attempt, "Cancelled before next attempt");
            return RetryOutcome {
                result: Err(Error::Cancelled),
                attempts: attempt,
            };
        }

        match operation() {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                };
            }
            Err(e) => {
                attempt += 1;

                if !is_retryable(&e) {
                    debug!(attempt, error = %e, "Non-retryable error, giving up");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    };
                }

                if attempt >= max_attempts {
                    if max_attempts > 1 {
                        warn!(
                            attempt,
                            max_attempts,
                            error = %e,
                            "Operation failed after all retry attempts"
                        );
                    }
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    };
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after retryable failure"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

/// Per-call options shared by operations that reach a remote provider.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    pub retry: i64,
    pub full_response: bool,
    pub allow_error: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            retry: 1,
            full_response: false,
            allow_error: false,
        }
    }
}

impl CallOptions {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::attempts(self.retry)
    }

    /// Apply the allow-error rule: with `allow_error` set, a transport
    /// failure becomes `Ok(None)`. Every other error still propagates.
    pub fn settle<T>(&self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if self.allow_error && e.is_transport() => {
                debug!(error = %e, "Suppressing transport error");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

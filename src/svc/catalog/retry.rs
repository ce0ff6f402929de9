//! # Retry module
//!
//! This module provides the failure classification and backoff policy applied
//! to every catalog request. Transient failures are retried with exponential
//! backoff and jitter, rate limits honor the server-provided delay, permanent
//! failures are returned as-is.

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::debug;

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_ATTEMPTS: u32 = 5;
pub const DEFAULT_JITTER: f64 = 0.25;

// -----------------------------------------------------------------------------
// ErrorClass enumeration

/// how a failed request should be handled
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum ErrorClass {
    /// 5xx, timeouts and transport failures, worth retrying
    Transient,
    /// 4xx and malformed responses, retrying cannot help
    Permanent,
    /// 429, retry after the server-provided delay when present
    RateLimited(Option<Duration>),
}

// -----------------------------------------------------------------------------
// Classify trait

pub trait Classify {
    fn class(&self) -> ErrorClass;
}

// -----------------------------------------------------------------------------
// Backoff structure

#[derive(PartialEq, Clone, Copy, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub attempts: u32,
    /// fraction of the computed delay randomly shaved off, within [0, 1]
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            cap: DEFAULT_MAX_DELAY,
            attempts: DEFAULT_ATTEMPTS,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl Backoff {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    /// returns the delay before the given retry, exponential in the attempt
    /// number, capped, with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);

        if self.jitter <= 0.0 {
            return exponential;
        }

        let factor = 1.0 - rand::thread_rng().gen_range(0.0..self.jitter.min(1.0));

        exponential.mul_f64(factor)
    }
}

// -----------------------------------------------------------------------------
// helpers

/// runs `operation` until it succeeds, fails permanently, or exhausts the
/// attempt budget. The last error is returned on exhaustion
pub async fn with_backoff<T, E, F, Fut>(policy: &Backoff, mut operation: F) -> Result<T, E>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        attempt += 1;
        if attempt >= policy.attempts {
            return Err(err);
        }

        let delay = match err.class() {
            ErrorClass::Permanent => return Err(err),
            ErrorClass::Transient => policy.delay(attempt - 1),
            ErrorClass::RateLimited(retry_after) => {
                retry_after.unwrap_or_else(|| policy.delay(attempt - 1))
            }
        };

        debug!(
            attempt = attempt,
            delay = format!("{}ms", delay.as_millis()),
            error = err.to_string(),
            "Retry catalog request after transient failure"
        );

        tokio::time::sleep(delay).await;
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use super::{with_backoff, Backoff, Classify, ErrorClass};

    #[derive(thiserror::Error, Debug)]
    #[error("{message}")]
    struct FakeError {
        message: &'static str,
        class: ErrorClass,
    }

    impl Classify for FakeError {
        fn class(&self) -> ErrorClass {
            self.class
        }
    }

    fn transient() -> FakeError {
        FakeError {
            message: "upstream hiccup",
            class: ErrorClass::Transient,
        }
    }

    fn permanent() -> FakeError {
        FakeError {
            message: "bad request",
            class: ErrorClass::Permanent,
        }
    }

    fn fast_policy() -> Backoff {
        Backoff {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            attempts: 5,
            jitter: 0.0,
        }
    }

    #[test]
    fn delay_should_grow_exponentially_up_to_the_cap() {
        let policy = Backoff {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(350),
            attempts: 5,
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(10), Duration::from_millis(350));
    }

    #[test]
    fn jitter_should_stay_within_bounds() {
        let policy = Backoff {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(100),
            attempts: 5,
            jitter: 0.5,
        };

        for _ in 0..100 {
            let delay = policy.delay(0);
            assert!(delay <= Duration::from_millis(100));
            assert!(delay >= Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn transient_failures_should_be_retried_until_success() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, FakeError> = with_backoff(&fast_policy(), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.expect("operation to eventually succeed"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_should_not_be_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), FakeError> = with_backoff(&fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(permanent()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_should_return_the_last_error() {
        let calls = AtomicU32::new(0);

        let result: Result<(), FakeError> = with_backoff(&fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn rate_limits_should_honor_the_server_delay() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<(), FakeError> = with_backoff(&fast_policy(), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(FakeError {
                        message: "slow down",
                        class: ErrorClass::RateLimited(Some(Duration::from_millis(20))),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}

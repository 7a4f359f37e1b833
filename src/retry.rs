//! Retry policy with capped exponential backoff.
//!
//! The forge surfaces most failures as error text, so classification is
//! substring-based — that is the contract with the underlying CLI tooling —
//! but it is wrapped in a typed [`ErrorClass`] so callers and tests never
//! match strings themselves. Only rate limits and transient network failures
//! are retried; 404s and auth failures surface immediately.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cancel::{CancelToken, Cancelled};

/// Semantic classification of a failure, driving retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Forge rate limit; retried and counted separately.
    RateLimited,
    /// Network or 5xx hiccup; retried.
    Transient,
    /// Missing file/ref; never retried, usually converted to a skip.
    NotFound,
    /// Caller cancellation; propagated unchanged.
    Cancelled,
    /// Everything else (auth, validation, bad input); never retried.
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::RateLimited | ErrorClass::Transient)
    }
}

/// Classify an error message by its text.
///
/// Rate-limit and transient markers are checked before anything else so a
/// "403 rate limit exceeded" classifies as rate-limited, not fatal.
pub fn classify_text(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    if lower.contains("rate limit")
        || lower.contains("ratelimit")
        || lower.contains("api rate limit exceeded")
        || (lower.contains("403") && lower.contains("x-ratelimit-remaining: 0"))
    {
        return ErrorClass::RateLimited;
    }

    const TRANSIENT: &[&str] = &[
        "connection refused",
        "connection reset",
        "network unreachable",
        "timeout",
        "timed out",
        "temporary failure",
        "502",
        "503",
        "504",
        "bad gateway",
        "service unavailable",
        "gateway timeout",
    ];
    if TRANSIENT.iter().any(|marker| lower.contains(marker)) {
        return ErrorClass::Transient;
    }

    if lower.contains("404") || lower.contains("not found") {
        return ErrorClass::NotFound;
    }

    if lower.contains("cancelled") || lower.contains("canceled") {
        return ErrorClass::Cancelled;
    }

    ErrorClass::Fatal
}

/// Errors that know their own class can be driven through [`RetryPolicy::run`].
pub trait Retryable {
    fn class(&self) -> ErrorClass;

    /// Server-provided backoff hint, honored when present.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Counters shared with the caller so retries are observable.
#[derive(Debug, Default)]
pub struct RetryCounters {
    pub retries: AtomicU64,
    pub rate_limits: AtomicU64,
}

impl RetryCounters {
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn rate_limits(&self) -> u64 {
        self.rate_limits.load(Ordering::Relaxed)
    }
}

/// Capped exponential backoff with deterministic jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff for the given attempt (0-based), with jitter derived from
    /// `seed` so concurrent pipelines retrying the same window don't stampede
    /// in lockstep. Deterministic per (seed, attempt), which keeps tests
    /// stable.
    pub fn delay_for(&self, attempt: u32, seed: &str) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);

        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        attempt.hash(&mut hasher);
        let jitter_range = (exp.as_millis() as u64 / 2).max(1);
        let jitter = hasher.finish() % jitter_range;

        exp / 2 + Duration::from_millis(jitter)
    }

    /// Run `op`, retrying retryable failures up to `max_retries` times.
    ///
    /// Sleeps honor the error's `retry_after` hint when one is present and
    /// wake early on cancellation, in which case the last error is returned
    /// as-is for the caller to surface.
    pub fn run<T, E, F>(
        &self,
        token: &CancelToken,
        seed: &str,
        counters: &RetryCounters,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let class = err.class();
                    if class == ErrorClass::RateLimited {
                        counters.rate_limits.fetch_add(1, Ordering::Relaxed);
                    }
                    if !class.is_retryable() || attempt >= self.max_retries {
                        return Err(err);
                    }

                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| self.delay_for(attempt, seed));
                    log::debug!(
                        "retry {}/{} for {} in {:?}: {}",
                        attempt + 1,
                        self.max_retries,
                        seed,
                        delay,
                        err
                    );
                    counters.retries.fetch_add(1, Ordering::Relaxed);
                    if let Err(Cancelled) = token.sleep(delay) {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exponential-backoff retry executor
//!
//! `delay(n)` is `base_delay * multiplier^n` capped at `max_delay`. With
//! jitter enabled each delay is scaled by a uniform factor in [0.5, 1.5] and
//! capped again, so a fleet of callers that failed together does not retry
//! together.

use crate::config::RetryConfig;
use crate::error::Retryable;
use rand::Rng;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct RetryCounters {
    attempts: AtomicU64,
    retries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Aggregate counters across every execution of a policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Individual invocations of the wrapped operation
    pub attempts: u64,
    /// Backoff sleeps taken
    pub retries: u64,
    pub successes: u64,
    /// Executions that gave up and returned the error
    pub failures: u64,
}

/// Retry policy; cheap to clone, clones share counters
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    counters: Arc<RetryCounters>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            counters: Arc::new(RetryCounters::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Same policy with a different retry budget, sharing these counters
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self {
            config: self.config.clone().with_max_retries(max_retries),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Backoff before retry `attempt` (0-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let max = self.config.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.config.base_delay.as_secs_f64() * self.config.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(raw.min(max))
    }

    /// Delay actually slept before retry `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if !self.config.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..=1.5);
        delay.mul_f64(factor).min(self.config.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.execute_with(op, |e: &E| e.is_retryable()).await
    }

    /// Like [`execute`](Self::execute) with a caller-chosen retryable set
    pub async fn execute_with<T, E, F, Fut, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let max_retries = self.config.max_retries;
        let mut attempt = 0;
        loop {
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            let error = match op().await {
                Ok(value) => {
                    self.counters.successes.fetch_add(1, Ordering::Relaxed);
                    if attempt > 0 {
                        tracing::debug!(attempts = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !retryable(&error) {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %error, "operation failed, not retryable");
                return Err(error);
            }
            if attempt >= max_retries {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    attempts = attempt + 1,
                    error = %error,
                    "operation failed, retries exhausted"
                );
                return Err(error);
            }

            let delay = self.delay(attempt);
            tracing::warn!(
                attempt = attempt + 1,
                max_retries,
                delay = %humantime::format_duration(delay),
                error = %error,
                "operation failed, retrying"
            );
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

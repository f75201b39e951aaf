// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control plane configuration
//!
//! Loaded once at process start, usually from TOML. Every duration is a
//! humantime string (`"30s"`, `"250ms"`) and every missing key takes its
//! default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration for the whole control plane
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Total admission slots across every category
    pub global_max_concurrency: usize,
    /// Per-category slot limits; unlisted categories get the global max
    pub category_limits: BTreeMap<String, usize>,
    /// Default wait bound for lock acquisition
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// How long a granted lock lives before maintenance evicts it
    #[serde(with = "humantime_serde")]
    pub lock_lease: Duration,
    /// How long an admission slot lives before maintenance force-releases it
    #[serde(with = "humantime_serde")]
    pub slot_lease: Duration,
    /// Period of the background maintenance tick
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub failover: FailoverConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            global_max_concurrency: 10,
            category_limits: BTreeMap::new(),
            lock_timeout: Duration::from_secs(30),
            lock_lease: Duration::from_secs(300),
            slot_lease: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(10),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

impl ControlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: ControlConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "global_max_concurrency must be positive".to_string(),
            ));
        }
        if let Some((name, _)) = self.category_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(ConfigError::Invalid(format!(
                "category limit for {} must be positive",
                name
            )));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "cleanup_interval must be positive".to_string(),
            ));
        }
        self.breaker.validate()?;
        self.retry.validate()?;
        self.failover.validate()
    }

    /// Slot capacity for a category
    pub fn category_limit(&self, category: &str) -> usize {
        self.category_limits
            .get(category)
            .copied()
            .unwrap_or(self.global_max_concurrency)
    }

    pub fn with_global_max_concurrency(mut self, max: usize) -> Self {
        self.global_max_concurrency = max;
        self
    }

    pub fn with_category_limit(mut self, category: impl Into<String>, limit: usize) -> Self {
        self.category_limits.insert(category.into(), limit);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_slot_lease(mut self, lease: Duration) -> Self {
        self.slot_lease = lease;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_failover(mut self, failover: FailoverConfig) -> Self {
        self.failover = failover;
        self
    }
}

/// Circuit breaker thresholds, shared by every dependency's breaker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures inside the window that trip the breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Cool-down spent open before probing
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Concurrent probes admitted while half-open
    pub half_open_max_calls: u32,
    /// Sliding window for counting failures
    #[serde(with = "humantime_serde")]
    pub window_size: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            window_size: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0
            || self.success_threshold == 0
            || self.half_open_max_calls == 0
        {
            return Err(ConfigError::Invalid(
                "breaker thresholds and half_open_max_calls must be positive".to_string(),
            ));
        }
        if self.window_size.is_zero() {
            return Err(ConfigError::Invalid(
                "breaker window_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn with_window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }
}

/// Exponential backoff parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Randomize each delay to spread out retry storms
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::Invalid(
                "retry base_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Primary/secondary failover behavior
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Secondaries probed per failover before giving up
    pub max_failover_attempts: u32,
    /// How often the primary is health-checked
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Minimum time a failed device sits out before it is re-probed
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_failover_attempts: 3,
            health_check_interval: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(300),
        }
    }
}

impl FailoverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_failover_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_failover_attempts must be positive".to_string(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "health_check_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_max_failover_attempts(mut self, attempts: u32) -> Self {
        self.max_failover_attempts = attempts;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

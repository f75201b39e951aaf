// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic maintenance for coordination primitives
//!
//! Sweeps expired lock grants, expired admission slots and abandoned queue
//! requests, and decides when the next health-check pass is due. The sweep is
//! a backstop: timed-out waiters remove themselves without it.

use super::{ConcurrencyLimiter, LockManager, ResourceQueue};
use crate::clock::Clock;
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Configuration for the maintenance loop
#[derive(Clone, Debug)]
pub struct MaintenanceConfig {
    /// How often to sweep
    pub interval: Duration,
    /// How often a tick also runs health checks
    pub health_check_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl MaintenanceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }
}

/// What one sweep removed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub expired_locks: usize,
    pub expired_slots: usize,
    pub abandoned_requests: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.expired_locks + self.expired_slots + self.abandoned_requests
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Background maintenance task for coordination primitives
pub struct MaintenanceTask<C: Clock> {
    config: MaintenanceConfig,
    clock: C,
    last_health_check: Mutex<Option<Instant>>,
}

impl<C: Clock> MaintenanceTask<C> {
    pub fn new(config: MaintenanceConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            last_health_check: Mutex::new(None),
        }
    }

    /// Run a single sweep over the coordination managers
    pub fn sweep(
        &self,
        locks: &LockManager<C>,
        limiter: &ConcurrencyLimiter<C>,
        queue: &ResourceQueue<C>,
    ) -> SweepStats {
        let stats = SweepStats {
            expired_locks: locks.cleanup_expired(),
            expired_slots: limiter.cleanup_expired(),
            abandoned_requests: queue.cleanup_abandoned(),
        };
        if !stats.is_empty() {
            tracing::info!(
                expired_locks = stats.expired_locks,
                expired_slots = stats.expired_slots,
                abandoned_requests = stats.abandoned_requests,
                "maintenance sweep reclaimed resources"
            );
        }
        stats
    }

    /// True when a health-check pass is due; marks it as started.
    ///
    /// The first call is always due.
    pub fn take_health_check(&self) -> bool {
        let now = self.clock.now();
        let mut last = self
            .last_health_check
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let due = match *last {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.config.health_check_interval,
        };
        if due {
            *last = Some(now);
        }
        due
    }

    /// Get the maintenance interval
    pub fn interval(&self) -> Duration {
        self.config.interval
    }
}

#[cfg(test)]
#[path = "maintenance_tests.rs"]
mod tests;

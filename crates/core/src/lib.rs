// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! bulwark-core: in-process concurrency and resilience control plane
//!
//! This crate provides:
//! - Exclusive/shared locking with wait-for-graph deadlock prevention
//! - Two-tier admission control and a priority resource queue
//! - Retry with backoff, circuit breaking and health-checked failover
//! - A [`ControlPlane`] facade composing them with guaranteed release

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod clock;
pub mod config;
pub mod error;

pub mod coordination;
pub mod resilience;

pub mod control;

// Re-exports
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{BreakerConfig, ConfigError, ControlConfig, FailoverConfig, RetryConfig};
pub use control::{ControlPlane, ControlStatus, TickReport};
pub use error::{ControlError, Retryable};

pub use coordination::{
    ConcurrencyLimiter, HolderId, LockGuard, LockManager, LockMode, LockOutcome, ResourceGuard,
    ResourceQueue, SlotGuard,
};
pub use resilience::{
    BreakerRegistry, CallTicket, CircuitBreaker, CircuitState, DeviceId, FailoverError,
    FailoverManager, HealthCheck, HealthError, RetryPolicy,
};

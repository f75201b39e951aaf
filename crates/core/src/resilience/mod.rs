// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Protection against failing downstream dependencies
//!
//! - **RetryPolicy** - Exponential backoff with jitter
//! - **CircuitBreaker** - Per-dependency failure gate
//! - **FailoverManager** - Health-checked primary/secondary promotion

pub mod breaker;
pub mod failover;
pub mod retry;

pub use breaker::{
    BreakerCounters, BreakerRegistry, BreakerStatus, CallTicket, CircuitBreaker, CircuitState,
};
pub use failover::{
    DeviceId, FailoverError, FailoverManager, FailoverStatus, HealthCheck, HealthError,
    MonitorReport, ServiceStatus,
};
pub use retry::{RetryPolicy, RetryStats};

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for behavioral specs

pub use bulwark_core::{
    BreakerConfig, ControlConfig, ControlError, ControlPlane, DeviceId, FakeClock, HealthError,
    HolderId, LockMode, RetryConfig, Retryable,
};
pub use std::sync::atomic::{AtomicUsize, Ordering};
pub use std::sync::Arc;
pub use std::time::Duration;

/// Install a test-friendly subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A plane with small limits and fast, deterministic backoff
pub fn plane(config: ControlConfig) -> Arc<ControlPlane> {
    init_tracing();
    Arc::new(ControlPlane::new(config).unwrap())
}

pub fn small_config() -> ControlConfig {
    ControlConfig::new()
        .with_global_max_concurrency(2)
        .with_category_limit("x", 1)
        .with_retry(
            RetryConfig::new()
                .with_max_retries(3)
                .with_base_delay(Duration::from_millis(100))
                .with_jitter(false),
        )
}

/// Failure used by specs; `Transient` is worth retrying
#[derive(Debug, PartialEq)]
pub enum Failure {
    Transient,
    Permanent,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Transient => write!(f, "transient failure"),
            Failure::Permanent => write!(f, "permanent failure"),
        }
    }
}

impl Retryable for Failure {
    fn is_retryable(&self) -> bool {
        matches!(self, Failure::Transient)
    }
}

/// Tracks how many tasks are inside a section and the peak seen
#[derive(Default)]
pub struct Occupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

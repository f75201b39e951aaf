// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The control plane facade
//!
//! One [`ControlPlane`] is built at process start and handed to every
//! consumer. It owns all managers and the background maintenance task, and
//! offers helpers that compose them with guaranteed release: guards are
//! dropped on success, on error, on panic and when the caller's future is
//! cancelled.

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ControlConfig};
use crate::coordination::{
    ConcurrencyLimiter, HolderId, LimiterStatus, LockGuard, LockManager, LockMode, LockOutcome,
    LockStatus, MaintenanceConfig, MaintenanceTask, QueueStatus, ResourceQueue, SlotGuard,
    SweepStats,
};
use crate::error::{ControlError, Retryable};
use crate::resilience::{
    BreakerRegistry, BreakerStatus, FailoverManager, FailoverStatus, MonitorReport, RetryPolicy,
    RetryStats,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Inner<C: Clock> {
    config: ControlConfig,
    locks: LockManager<C>,
    limiter: ConcurrencyLimiter<C>,
    queue: ResourceQueue<C>,
    retry: RetryPolicy,
    breakers: BreakerRegistry<C>,
    failover: FailoverManager<C>,
    maintenance: MaintenanceTask<C>,
}

/// What one maintenance tick did
#[derive(Clone, Debug, Default, Serialize)]
pub struct TickReport {
    pub sweep: SweepStats,
    /// Present when the tick also ran health checks
    pub monitor: Option<MonitorReport>,
}

impl<C: Clock> Inner<C> {
    async fn tick(&self) -> TickReport {
        let sweep = self
            .maintenance
            .sweep(&self.locks, &self.limiter, &self.queue);
        let monitor = if self.maintenance.take_health_check() {
            Some(self.failover.monitor_once().await)
        } else {
            None
        };
        TickReport { sweep, monitor }
    }
}

struct Runner {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Concurrency and resilience control plane
pub struct ControlPlane<C: Clock = SystemClock> {
    inner: Arc<Inner<C>>,
    runner: Mutex<Option<Runner>>,
}

impl ControlPlane<SystemClock> {
    pub fn new(config: ControlConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> ControlPlane<C> {
    /// Validate `config` and build every manager on the given clock
    pub fn with_clock(config: ControlConfig, clock: C) -> Result<Self, ConfigError> {
        config.validate()?;
        let maintenance = MaintenanceConfig::new()
            .with_interval(config.cleanup_interval)
            .with_health_check_interval(config.failover.health_check_interval);
        let inner = Inner {
            locks: LockManager::new(config.lock_lease, clock.clone()),
            limiter: ConcurrencyLimiter::new(
                config.global_max_concurrency,
                config.category_limits.clone(),
                config.slot_lease,
                clock.clone(),
            ),
            queue: ResourceQueue::new(clock.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            breakers: BreakerRegistry::new(config.breaker.clone(), clock.clone()),
            failover: FailoverManager::new(config.failover.clone(), clock.clone()),
            maintenance: MaintenanceTask::new(maintenance, clock),
            config,
        };
        tracing::info!(
            global_max = inner.config.global_max_concurrency,
            categories = inner.config.category_limits.len(),
            "control plane ready"
        );
        Ok(Self {
            inner: Arc::new(inner),
            runner: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.inner.config
    }

    pub fn locks(&self) -> &LockManager<C> {
        &self.inner.locks
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter<C> {
        &self.inner.limiter
    }

    pub fn queue(&self) -> &ResourceQueue<C> {
        &self.inner.queue
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub fn breakers(&self) -> &BreakerRegistry<C> {
        &self.inner.breakers
    }

    pub fn failover(&self) -> &FailoverManager<C> {
        &self.inner.failover
    }

    /// Hold `resource` while `op` runs.
    ///
    /// `timeout` defaults to the configured lock timeout. A lock the holder
    /// already had before the call is left held afterwards.
    pub async fn run_with_lock<T, E, F, Fut>(
        &self,
        resource: &str,
        holder: &HolderId,
        mode: LockMode,
        timeout: Option<Duration>,
        op: F,
    ) -> Result<T, ControlError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _lock = self.lock(resource, holder, mode, timeout).await?;
        op().await.map_err(ControlError::Upstream)
    }

    async fn lock<E>(
        &self,
        resource: &str,
        holder: &HolderId,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<Option<LockGuard<'_, C>>, ControlError<E>> {
        let timeout = timeout.unwrap_or(self.inner.config.lock_timeout);
        let reentrant = self.inner.locks.is_held_by(resource, holder);
        match self
            .inner
            .locks
            .acquire_outcome(resource, holder, mode, timeout)
            .await
        {
            LockOutcome::Granted if reentrant => Ok(None),
            LockOutcome::Granted => Ok(Some(LockGuard::new(
                &self.inner.locks,
                resource,
                holder.clone(),
            ))),
            LockOutcome::TimedOut => Err(ControlError::Timeout {
                resource: resource.to_string(),
                timeout,
            }),
            LockOutcome::DeadlockRejected => Err(ControlError::DeadlockRejected {
                resource: resource.to_string(),
                holder: holder.to_string(),
            }),
        }
    }

    async fn slot<E>(
        &self,
        task_id: &str,
        category: &str,
        timeout: Duration,
    ) -> Result<SlotGuard<'_, C>, ControlError<E>> {
        if self
            .inner
            .limiter
            .acquire_slot(task_id, category, timeout)
            .await
        {
            Ok(SlotGuard::new(&self.inner.limiter, task_id))
        } else {
            Err(ControlError::Timeout {
                resource: format!("{} slot", category),
                timeout,
            })
        }
    }

    /// Hold an admission slot in `category` while `op` runs, retrying `op`
    /// up to `retries` times without giving the slot back in between
    pub async fn run_with_concurrency<T, E, F, Fut>(
        &self,
        task_id: &str,
        category: &str,
        timeout: Duration,
        retries: u32,
        op: F,
    ) -> Result<T, ControlError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let _slot = self.slot(task_id, category, timeout).await?;
        self.inner
            .retry
            .with_max_retries(retries)
            .execute(op)
            .await
            .map_err(ControlError::Upstream)
    }

    /// Take a slot, then a lock held by `task_id`; release lock, then slot
    pub async fn run_with_slot_and_lock<T, E, F, Fut>(
        &self,
        task_id: &str,
        category: &str,
        resource: &str,
        mode: LockMode,
        timeout: Duration,
        op: F,
    ) -> Result<T, ControlError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _slot = self.slot(task_id, category, timeout).await?;
        let _lock = self
            .lock(resource, &HolderId::new(task_id), mode, Some(timeout))
            .await?;
        op().await.map_err(ControlError::Upstream)
    }

    /// Call a dependency through its breaker, retrying around the breaker.
    ///
    /// A breaker rejection is not retried.
    pub async fn execute_with_resilience<T, E, F, Fut>(
        &self,
        dependency: &str,
        mut op: F,
    ) -> Result<T, ControlError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let breaker = self.inner.breakers.get_or_create(dependency);
        let breaker = breaker.as_ref();
        self.inner
            .retry
            .execute(|| {
                // Build the operation only once the breaker has admitted it
                let admitted = breaker.admit(&mut op);
                async move {
                    let (ticket, call) = admitted?;
                    breaker.run(ticket, call).await
                }
            })
            .await
    }

    pub async fn acquire_lock(
        &self,
        resource: &str,
        holder: &HolderId,
        mode: LockMode,
        timeout: Duration,
    ) -> bool {
        self.inner.locks.acquire(resource, holder, mode, timeout).await
    }

    pub fn release_lock(&self, resource: &str, holder: &HolderId) -> bool {
        self.inner.locks.release(resource, holder)
    }

    /// Drop every lock of a finished or crashed holder
    pub fn release_all(&self, holder: &HolderId) -> usize {
        self.inner.locks.release_all(holder)
    }

    pub async fn acquire_slot(&self, task_id: &str, category: &str, timeout: Duration) -> bool {
        self.inner.limiter.acquire_slot(task_id, category, timeout).await
    }

    pub fn release_slot(&self, task_id: &str) -> bool {
        self.inner.limiter.release_slot(task_id)
    }

    pub async fn request_resource(
        &self,
        resource: &str,
        requester: &str,
        priority: i32,
        timeout: Duration,
    ) -> bool {
        self.inner
            .queue
            .request(resource, requester, priority, timeout)
            .await
    }

    /// Hand `resource` to its next waiter; returns the new owner
    pub fn release_resource(&self, resource: &str) -> Option<String> {
        self.inner.queue.release(resource)
    }

    /// Run one maintenance tick now
    pub async fn maintenance_tick(&self) -> TickReport {
        self.inner.tick().await
    }

    /// Launch the background maintenance loop.
    ///
    /// Returns false if it is already running or there is no tokio runtime.
    pub fn start(&self) -> bool {
        let mut runner = self.runner.lock().unwrap_or_else(|e| e.into_inner());
        if runner.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            tracing::debug!("maintenance loop already running");
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("cannot start maintenance loop outside a tokio runtime");
            return false;
        };
        let (stop, stopped) = watch::channel(false);
        let handle = runtime.spawn(run_maintenance(Arc::clone(&self.inner), stopped));
        *runner = Some(Runner { stop, handle });
        tracing::info!(
            interval = %humantime::format_duration(self.inner.maintenance.interval()),
            "maintenance loop started"
        );
        true
    }

    /// Stop the maintenance loop and wait for it to exit; a no-op if it was
    /// never started
    pub async fn stop(&self) {
        let runner = self
            .runner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(Runner { stop, handle }) = runner else {
            return;
        };
        let _ = stop.send(true);
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "maintenance loop ended abnormally");
        }
        tracing::info!("maintenance loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.runner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub fn status(&self) -> ControlStatus {
        ControlStatus {
            running: self.is_running(),
            locks: self.inner.locks.status(),
            limiter: self.inner.limiter.status(),
            queue: self.inner.queue.status(),
            breakers: self.inner.breakers.status(),
            failover: self.inner.failover.status(),
            retry: self.inner.retry.stats(),
        }
    }
}

async fn run_maintenance<C: Clock>(inner: Arc<Inner<C>>, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.maintenance.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        // Own task per tick so a panicking health probe is contained
        let tick = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move { inner.tick().await }
        });
        match tick.await {
            Ok(report) => {
                if let Some(monitor) = report.monitor.filter(|m| !m.stranded.is_empty()) {
                    tracing::error!(stranded = ?monitor.stranded, "services without a healthy primary");
                }
            }
            Err(e) => tracing::error!(error = %e, "maintenance tick failed"),
        }
    }
}

/// Serializable snapshot of the whole control plane
#[derive(Clone, Debug, Serialize)]
pub struct ControlStatus {
    pub running: bool,
    pub locks: LockStatus,
    pub limiter: LimiterStatus,
    pub queue: QueueStatus,
    pub breakers: BTreeMap<String, BreakerStatus>,
    pub failover: FailoverStatus,
    pub retry: RetryStats,
}

impl ControlStatus {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;

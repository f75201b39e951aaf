// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Async lock manager
//!
//! Owns a [`LockTable`] behind one mutex. A request that cannot be granted
//! is parked with a oneshot wake signal; the caller drops the mutex before
//! awaiting the signal and retakes it only to settle a timeout.

use super::lock::{Admission, Grant, HolderId, LockMode, LockTable};
use crate::clock::Clock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

type Wake = oneshot::Sender<()>;

/// How a lock request resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    /// Waited the full timeout without a grant
    TimedOut,
    /// Refused without waiting; the wait would have deadlocked
    DeadlockRejected,
}

impl LockOutcome {
    pub fn is_granted(self) -> bool {
        self == LockOutcome::Granted
    }
}

/// Exclusive/shared lock manager with deadlock prevention
pub struct LockManager<C: Clock> {
    table: Mutex<LockTable<Wake>>,
    clock: C,
}

impl<C: Clock> LockManager<C> {
    /// Create a manager whose grants expire after `lease`
    pub fn new(lease: Duration, clock: C) -> Self {
        Self {
            table: Mutex::new(LockTable::new(lease)),
            clock,
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, LockTable<Wake>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire `resource` for `holder`, waiting at most `timeout`
    pub async fn acquire(
        &self,
        resource: &str,
        holder: &HolderId,
        mode: LockMode,
        timeout: Duration,
    ) -> bool {
        self.acquire_outcome(resource, holder, mode, timeout)
            .await
            .is_granted()
    }

    /// Acquire and report why a request was not granted
    pub async fn acquire_outcome(
        &self,
        resource: &str,
        holder: &HolderId,
        mode: LockMode,
        timeout: Duration,
    ) -> LockOutcome {
        let mut pending = {
            let mut table = self.lock_table();
            match table.try_acquire(resource, holder, mode, self.clock.now()) {
                Admission::Granted => {
                    tracing::debug!(resource, %holder, %mode, "lock granted");
                    return LockOutcome::Granted;
                }
                Admission::Deadlock => {
                    tracing::warn!(
                        resource,
                        %holder,
                        %mode,
                        holders = ?table.holders(resource),
                        "lock request rejected: would deadlock"
                    );
                    return LockOutcome::DeadlockRejected;
                }
                Admission::Wait => {
                    let (tx, rx) = oneshot::channel();
                    let id = table.enqueue(resource, holder, mode, timeout, self.clock.now(), tx);
                    tracing::debug!(
                        resource,
                        %holder,
                        %mode,
                        queued = table.waiting_count(resource),
                        "lock busy, waiting"
                    );
                    PendingWait {
                        manager: self,
                        resource: resource.to_string(),
                        id,
                        rx,
                        settled: false,
                    }
                }
            }
        };

        let outcome = match tokio::time::timeout(timeout, &mut pending.rx).await {
            Ok(Ok(())) => LockOutcome::Granted,
            // Swept by cleanup before a grant arrived
            Ok(Err(_)) => LockOutcome::TimedOut,
            Err(_) => {
                if self.settle_timeout(&pending.resource, pending.id, &mut pending.rx) {
                    LockOutcome::Granted
                } else {
                    LockOutcome::TimedOut
                }
            }
        };
        pending.settled = true;

        match outcome {
            LockOutcome::Granted => tracing::debug!(resource, %holder, %mode, "lock granted after wait"),
            _ => tracing::debug!(
                resource,
                %holder,
                timeout = %humantime::format_duration(timeout),
                "lock wait timed out"
            ),
        }
        outcome
    }

    /// Remove our own wait entry. Returns true if a grant beat the timeout.
    fn settle_timeout(&self, resource: &str, id: u64, rx: &mut oneshot::Receiver<()>) -> bool {
        let mut table = self.lock_table();
        if table.cancel_wait(resource, id) {
            return false;
        }
        rx.try_recv().is_ok()
    }

    /// Release every record `holder` has on `resource`
    pub fn release(&self, resource: &str, holder: &HolderId) -> bool {
        let mut table = self.lock_table();
        let (released, grants) = table.release(resource, holder, self.clock.now());
        if released > 0 {
            tracing::debug!(resource, %holder, records = released, "lock released");
        }
        self.deliver(&mut table, grants);
        released > 0
    }

    /// Release every lock held by `holder`, e.g. when its task finished or crashed
    pub fn release_all(&self, holder: &HolderId) -> usize {
        let mut table = self.lock_table();
        let (released, grants) = table.release_all(holder, self.clock.now());
        if released > 0 {
            tracing::info!(%holder, records = released, "released all locks");
        }
        self.deliver(&mut table, grants);
        released
    }

    /// Evict grants past their lease and waiters past their wait bound
    pub fn cleanup_expired(&self) -> usize {
        let mut table = self.lock_table();
        let expired = table.expire(self.clock.now());
        for record in &expired.records {
            tracing::warn!(
                resource = %record.resource,
                holder = %record.holder,
                mode = %record.mode,
                lease = %humantime::format_duration(record.timeout),
                "evicting expired lock"
            );
        }
        let evicted = expired.records.len();
        self.deliver(&mut table, expired.grants);
        evicted
    }

    /// Signal each grant's waiter; a waiter that is gone forfeits its grant
    fn deliver(&self, table: &mut LockTable<Wake>, grants: Vec<Grant<Wake>>) {
        let mut pending = grants;
        while let Some(grant) = pending.pop() {
            let Grant {
                id,
                resource,
                holder,
                wake,
                ..
            } = grant;
            if wake.send(()).is_err() {
                tracing::debug!(%resource, %holder, "waiter gone, revoking grant");
                pending.extend(table.revoke(&resource, id, self.clock.now()));
            }
        }
    }

    /// Current holders of a resource with their modes
    pub fn holders(&self, resource: &str) -> Vec<(HolderId, LockMode)> {
        self.lock_table()
            .records(resource)
            .iter()
            .map(|r| (r.holder.clone(), r.mode))
            .collect()
    }

    pub fn is_held_by(&self, resource: &str, holder: &HolderId) -> bool {
        self.lock_table().is_held_by(resource, holder)
    }

    pub fn waiting_count(&self, resource: &str) -> usize {
        self.lock_table().waiting_count(resource)
    }

    pub fn status(&self) -> LockStatus {
        let table = self.lock_table();
        let mut resources = BTreeMap::new();
        let mut names: Vec<&str> = table.locked_resources();
        names.extend(table.contended_resources());
        names.sort_unstable();
        names.dedup();
        for name in names {
            let records = table.records(name);
            let mode = if records.is_empty() {
                None
            } else if records.iter().any(|r| r.mode == LockMode::Exclusive) {
                Some(LockMode::Exclusive)
            } else {
                Some(LockMode::Shared)
            };
            resources.insert(
                name.to_string(),
                ResourceLockStatus {
                    mode,
                    holders: table.holders(name).iter().map(|h| h.0.clone()).collect(),
                    waiting: table.waiting_count(name),
                },
            );
        }
        LockStatus {
            active_locks: table.total_records(),
            waiting: table.total_waiting(),
            holders: table.holder_count(),
            resources,
        }
    }
}

/// A parked request; withdraws itself if the acquiring future is dropped
struct PendingWait<'a, C: Clock> {
    manager: &'a LockManager<C>,
    resource: String,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl<C: Clock> Drop for PendingWait<'_, C> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut table = self.manager.lock_table();
        if table.cancel_wait(&self.resource, self.id) {
            return;
        }
        if self.rx.try_recv().is_ok() {
            let grants = table.revoke(&self.resource, self.id, self.manager.clock.now());
            self.manager.deliver(&mut table, grants);
        }
    }
}

/// Releases a held lock when dropped
pub struct LockGuard<'a, C: Clock> {
    manager: &'a LockManager<C>,
    resource: String,
    holder: HolderId,
}

impl<'a, C: Clock> LockGuard<'a, C> {
    /// Wrap a lock the caller already holds
    pub fn new(manager: &'a LockManager<C>, resource: impl Into<String>, holder: HolderId) -> Self {
        Self {
            manager,
            resource: resource.into(),
            holder,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl<C: Clock> Drop for LockGuard<'_, C> {
    fn drop(&mut self) {
        self.manager.release(&self.resource, &self.holder);
    }
}

/// Snapshot of the lock table
#[derive(Clone, Debug, Default, Serialize)]
pub struct LockStatus {
    pub active_locks: usize,
    pub waiting: usize,
    pub holders: usize,
    pub resources: BTreeMap<String, ResourceLockStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResourceLockStatus {
    pub mode: Option<LockMode>,
    pub holders: Vec<String>,
    pub waiting: usize,
}

#[cfg(test)]
#[path = "lock_manager_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Two-tier admission control
//!
//! A global permit pool bounds all in-flight work; a per-category pool bounds
//! each class of work. A task is admitted only while it holds one permit from
//! each, and those two permits live inside its [`AdmissionSlot`], so the
//! number of permits out always equals the number of live slots.
//!
//! Permits are taken global first, then category, and given back category
//! first, then global. Both waits share one timeout; when it fires the
//! global permit already taken is dropped with the wait, so a starved
//! category never strands global capacity.

use crate::clock::Clock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// A task currently admitted
#[derive(Debug)]
pub struct AdmissionSlot {
    pub task_id: String,
    pub category: String,
    pub started_at: Instant,
    /// Lease; maintenance force-releases the slot after this long
    pub timeout: Duration,
    category_permit: OwnedSemaphorePermit,
    global_permit: OwnedSemaphorePermit,
}

impl AdmissionSlot {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) >= self.timeout
    }

    /// Give the permits back, category first
    fn release(self) {
        let AdmissionSlot {
            category_permit,
            global_permit,
            ..
        } = self;
        drop(category_permit);
        drop(global_permit);
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    categories: HashMap<String, Arc<Semaphore>>,
    slots: HashMap<String, AdmissionSlot>,
}

/// Global plus per-category concurrency limiter
pub struct ConcurrencyLimiter<C: Clock> {
    global: Arc<Semaphore>,
    global_max: usize,
    category_limits: BTreeMap<String, usize>,
    slot_lease: Duration,
    state: Mutex<LimiterState>,
    clock: C,
}

impl<C: Clock> ConcurrencyLimiter<C> {
    pub fn new(
        global_max: usize,
        category_limits: BTreeMap<String, usize>,
        slot_lease: Duration,
        clock: C,
    ) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_max)),
            global_max,
            category_limits,
            slot_lease,
            state: Mutex::new(LimiterState::default()),
            clock,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Capacity of a category's pool
    pub fn category_limit(&self, category: &str) -> usize {
        self.category_limits
            .get(category)
            .copied()
            .unwrap_or(self.global_max)
    }

    fn category_semaphore(&self, state: &mut LimiterState, category: &str) -> Arc<Semaphore> {
        let limit = self.category_limit(category);
        Arc::clone(
            state
                .categories
                .entry(category.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(limit))),
        )
    }

    /// Admit `task_id` into `category`, waiting at most `timeout` overall.
    ///
    /// Returns false on timeout, or if the task already holds a slot.
    pub async fn acquire_slot(&self, task_id: &str, category: &str, timeout: Duration) -> bool {
        let category_pool = {
            let mut state = self.lock_state();
            if state.slots.contains_key(task_id) {
                tracing::warn!(task_id, category, "task already holds an admission slot");
                return false;
            }
            self.category_semaphore(&mut state, category)
        };

        // Cancelling the wait drops a global permit already taken, so a
        // starved category hands global capacity straight back
        let permits = async {
            let global_permit = Arc::clone(&self.global).acquire_owned().await?;
            let category_permit = category_pool.acquire_owned().await?;
            Ok::<_, AcquireError>((global_permit, category_permit))
        };
        let (global_permit, category_permit) = match tokio::time::timeout(timeout, permits).await {
            Ok(Ok(permits)) => permits,
            _ => {
                tracing::debug!(task_id, category, "timed out waiting for admission slot");
                return false;
            }
        };

        let mut state = self.lock_state();
        if state.slots.contains_key(task_id) {
            // Lost a race with a concurrent acquire for the same task id
            drop(category_permit);
            drop(global_permit);
            return false;
        }
        state.slots.insert(
            task_id.to_string(),
            AdmissionSlot {
                task_id: task_id.to_string(),
                category: category.to_string(),
                started_at: self.clock.now(),
                timeout: self.slot_lease,
                category_permit,
                global_permit,
            },
        );
        tracing::debug!(
            task_id,
            category,
            active = state.slots.len(),
            "admission slot acquired"
        );
        true
    }

    /// Release a task's slot. Returns false if it held none.
    pub fn release_slot(&self, task_id: &str) -> bool {
        let slot = self.lock_state().slots.remove(task_id);
        match slot {
            Some(slot) => {
                tracing::debug!(task_id, category = %slot.category, "admission slot released");
                slot.release();
                true
            }
            None => false,
        }
    }

    /// Force-release slots held longer than their lease
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<AdmissionSlot> = {
            let mut state = self.lock_state();
            let ids: Vec<String> = state
                .slots
                .values()
                .filter(|slot| slot.is_expired(now))
                .map(|slot| slot.task_id.clone())
                .collect();
            ids.iter().filter_map(|id| state.slots.remove(id)).collect()
        };
        let count = expired.len();
        for slot in expired {
            tracing::warn!(
                task_id = %slot.task_id,
                category = %slot.category,
                held_for = %humantime::format_duration(now.saturating_duration_since(slot.started_at)),
                "force-releasing expired admission slot"
            );
            slot.release();
        }
        count
    }

    pub fn holds_slot(&self, task_id: &str) -> bool {
        self.lock_state().slots.contains_key(task_id)
    }

    pub fn active_count(&self) -> usize {
        self.lock_state().slots.len()
    }

    pub fn active_in_category(&self, category: &str) -> usize {
        self.lock_state()
            .slots
            .values()
            .filter(|slot| slot.category == category)
            .count()
    }

    pub fn global_available(&self) -> usize {
        self.global.available_permits()
    }

    /// Free permits in a category's pool (its full limit if never used)
    pub fn category_available(&self, category: &str) -> usize {
        self.lock_state()
            .categories
            .get(category)
            .map_or_else(|| self.category_limit(category), |pool| pool.available_permits())
    }

    pub fn status(&self) -> LimiterStatus {
        let state = self.lock_state();
        let mut categories: BTreeMap<String, CategoryStatus> = BTreeMap::new();
        for name in self.category_limits.keys().chain(state.categories.keys()) {
            if categories.contains_key(name) {
                continue;
            }
            let limit = self.category_limit(name);
            let active = state.slots.values().filter(|s| &s.category == name).count();
            let available = state
                .categories
                .get(name)
                .map_or(limit, |pool| pool.available_permits());
            categories.insert(
                name.clone(),
                CategoryStatus {
                    limit,
                    active,
                    available,
                    utilization: ratio(active, limit),
                },
            );
        }
        let active = state.slots.len();
        LimiterStatus {
            global_limit: self.global_max,
            global_active: active,
            global_available: self.global.available_permits(),
            global_utilization: ratio(active, self.global_max),
            categories,
        }
    }
}

fn ratio(used: usize, limit: usize) -> f64 {
    if limit == 0 {
        0.0
    } else {
        used as f64 / limit as f64
    }
}

/// Releases an admission slot when dropped
pub struct SlotGuard<'a, C: Clock> {
    limiter: &'a ConcurrencyLimiter<C>,
    task_id: String,
}

impl<'a, C: Clock> SlotGuard<'a, C> {
    /// Wrap a slot the caller already holds
    pub fn new(limiter: &'a ConcurrencyLimiter<C>, task_id: impl Into<String>) -> Self {
        Self {
            limiter,
            task_id: task_id.into(),
        }
    }
}

impl<C: Clock> Drop for SlotGuard<'_, C> {
    fn drop(&mut self) {
        self.limiter.release_slot(&self.task_id);
    }
}

/// Snapshot of admission control
#[derive(Clone, Debug, Default, Serialize)]
pub struct LimiterStatus {
    pub global_limit: usize,
    pub global_active: usize,
    pub global_available: usize,
    pub global_utilization: f64,
    pub categories: BTreeMap<String, CategoryStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CategoryStatus {
    pub limit: usize,
    pub active: usize,
    pub available: usize,
    pub utilization: f64,
}

#[cfg(test)]
#[path = "limiter_tests.rs"]
mod tests;

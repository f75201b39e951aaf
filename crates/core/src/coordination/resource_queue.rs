// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-owner arbitration for short-lived physical resources
//!
//! One holder per resource, no shared mode, no reentrancy and no deadlock
//! check: a requester here never holds one resource while waiting on another.
//! Waiters are served lowest priority value first, then by arrival.

use crate::clock::Clock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Queue position: lower priority value first, then arrival order
type QueueKey = (i32, u64);

#[derive(Debug)]
struct QueueEntry {
    requester: String,
    enqueued_at: Instant,
    wake: oneshot::Sender<()>,
}

#[derive(Debug)]
struct Owner {
    requester: String,
    since: Instant,
}

#[derive(Debug, Default)]
struct ResourceState {
    owner: Option<Owner>,
    queue: BTreeMap<QueueKey, QueueEntry>,
}

#[derive(Debug, Default)]
struct QueueState {
    resources: HashMap<String, ResourceState>,
    next_seq: u64,
}

/// Priority/FIFO queue handing out exclusive ownership
pub struct ResourceQueue<C: Clock> {
    state: Mutex<QueueState>,
    clock: C,
}

impl<C: Clock> ResourceQueue<C> {
    pub fn new(clock: C) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take ownership of `resource`, queueing up to `timeout` if it is busy
    pub async fn request(
        &self,
        resource: &str,
        requester: &str,
        priority: i32,
        timeout: Duration,
    ) -> bool {
        let mut pending = {
            let mut state = self.lock_state();
            let seq = state.next_seq;
            state.next_seq += 1;
            let now = self.clock.now();
            let entry = state.resources.entry(resource.to_string()).or_default();
            if entry.owner.is_none() {
                entry.owner = Some(Owner {
                    requester: requester.to_string(),
                    since: now,
                });
                tracing::debug!(resource, requester, "resource assigned");
                return true;
            }
            let (tx, rx) = oneshot::channel();
            entry.queue.insert(
                (priority, seq),
                QueueEntry {
                    requester: requester.to_string(),
                    enqueued_at: now,
                    wake: tx,
                },
            );
            tracing::debug!(
                resource,
                requester,
                priority,
                queued = entry.queue.len(),
                "resource busy, queued"
            );
            PendingRequest {
                queue: self,
                resource: resource.to_string(),
                key: (priority, seq),
                rx,
                settled: false,
            }
        };

        let assigned = match tokio::time::timeout(timeout, &mut pending.rx).await {
            Ok(result) => result.is_ok(),
            Err(_) => {
                let mut state = self.lock_state();
                let removed = state
                    .resources
                    .get_mut(resource)
                    .and_then(|r| r.queue.remove(&pending.key))
                    .is_some();
                !removed && pending.rx.try_recv().is_ok()
            }
        };
        pending.settled = true;
        if !assigned {
            tracing::debug!(resource, requester, "resource request timed out");
        }
        assigned
    }

    /// Clear the current owner and hand the resource to the next waiter.
    ///
    /// Returns the new owner, if any.
    pub fn release(&self, resource: &str) -> Option<String> {
        let mut state = self.lock_state();
        let now = self.clock.now();
        let Some(entry) = state.resources.get_mut(resource) else {
            return None;
        };
        if let Some(previous) = entry.owner.take() {
            tracing::debug!(resource, requester = %previous.requester, "resource released");
        }
        let next = promote(entry, now);
        if entry.owner.is_none() && entry.queue.is_empty() {
            state.resources.remove(resource);
        }
        next
    }

    /// Drop queue entries whose requester has gone away
    pub fn cleanup_abandoned(&self) -> usize {
        let mut state = self.lock_state();
        let mut removed = 0;
        for (resource, entry) in state.resources.iter_mut() {
            let before = entry.queue.len();
            entry.queue.retain(|_, waiter| !waiter.wake.is_closed());
            let dropped = before - entry.queue.len();
            if dropped > 0 {
                tracing::warn!(resource = %resource, dropped, "dropping abandoned resource requests");
            }
            removed += dropped;
        }
        state
            .resources
            .retain(|_, entry| entry.owner.is_some() || !entry.queue.is_empty());
        removed
    }

    /// Current owner of a resource
    pub fn holder(&self, resource: &str) -> Option<String> {
        self.lock_state()
            .resources
            .get(resource)
            .and_then(|r| r.owner.as_ref())
            .map(|owner| owner.requester.clone())
    }

    pub fn queue_len(&self, resource: &str) -> usize {
        self.lock_state()
            .resources
            .get(resource)
            .map_or(0, |r| r.queue.len())
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock_state();
        let now = self.clock.now();
        let resources = state
            .resources
            .iter()
            .map(|(name, r)| {
                (
                    name.clone(),
                    ResourceQueueStatus {
                        holder: r.owner.as_ref().map(|o| o.requester.clone()),
                        held_for_ms: r
                            .owner
                            .as_ref()
                            .map(|o| now.saturating_duration_since(o.since).as_millis() as u64),
                        waiting: r.queue.values().map(|e| e.requester.clone()).collect(),
                        oldest_wait_ms: r
                            .queue
                            .values()
                            .map(|e| now.saturating_duration_since(e.enqueued_at).as_millis() as u64)
                            .max(),
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        QueueStatus {
            busy: resources.values().filter(|r| r.holder.is_some()).count(),
            waiting: resources.values().map(|r| r.waiting.len()).sum(),
            resources,
        }
    }
}

/// Move the front waiter into ownership, skipping waiters that went away
fn promote(entry: &mut ResourceState, now: Instant) -> Option<String> {
    while let Some((_, waiter)) = entry.queue.pop_first() {
        let requester = waiter.requester.clone();
        if waiter.wake.send(()).is_ok() {
            tracing::debug!(requester = %requester, "resource handed to next waiter");
            entry.owner = Some(Owner {
                requester: requester.clone(),
                since: now,
            });
            return Some(requester);
        }
    }
    None
}

/// A queued request; leaves the queue if the requesting future is dropped
struct PendingRequest<'a, C: Clock> {
    queue: &'a ResourceQueue<C>,
    resource: String,
    key: QueueKey,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl<C: Clock> Drop for PendingRequest<'_, C> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let now = self.queue.clock.now();
        let mut state = self.queue.lock_state();
        let Some(entry) = state.resources.get_mut(&self.resource) else {
            return;
        };
        if entry.queue.remove(&self.key).is_none() && self.rx.try_recv().is_ok() {
            // Assigned to us after all; pass it on
            entry.owner = None;
            promote(entry, now);
        }
        if entry.owner.is_none() && entry.queue.is_empty() {
            state.resources.remove(&self.resource);
        }
    }
}

/// Releases a resource when dropped
pub struct ResourceGuard<'a, C: Clock> {
    queue: &'a ResourceQueue<C>,
    resource: String,
}

impl<'a, C: Clock> ResourceGuard<'a, C> {
    pub fn new(queue: &'a ResourceQueue<C>, resource: impl Into<String>) -> Self {
        Self {
            queue,
            resource: resource.into(),
        }
    }
}

impl<C: Clock> Drop for ResourceGuard<'_, C> {
    fn drop(&mut self) {
        self.queue.release(&self.resource);
    }
}

/// Snapshot of resource ownership
#[derive(Clone, Debug, Default, Serialize)]
pub struct QueueStatus {
    pub busy: usize,
    pub waiting: usize,
    pub resources: BTreeMap<String, ResourceQueueStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResourceQueueStatus {
    pub holder: Option<String>,
    pub held_for_ms: Option<u64>,
    /// Waiters in service order
    pub waiting: Vec<String>,
    pub oldest_wait_ms: Option<u64>,
}

#[cfg(test)]
#[path = "resource_queue_tests.rs"]
mod tests;

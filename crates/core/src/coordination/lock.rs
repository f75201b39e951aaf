// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lock table for exclusive/shared resource access
//!
//! Pure bookkeeping: grant records, per-resource FIFO wait queues, a
//! holder → resources index, and the wait-for graph used to refuse requests
//! that would close a cycle. The async [`LockManager`](super::LockManager)
//! wraps this table in a mutex and turns wait entries into suspended callers.
//!
//! The table is generic over the wake signal `W` carried by each wait entry so
//! it can be driven without a runtime.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Unique identifier for a lock holder
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HolderId(pub String);

impl HolderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HolderId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Lock mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Exclusive,
    Shared,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Exclusive => write!(f, "exclusive"),
            LockMode::Shared => write!(f, "shared"),
        }
    }
}

/// A granted lock
#[derive(Clone, Debug)]
pub struct LockRecord {
    pub resource: String,
    pub mode: LockMode,
    pub holder: HolderId,
    pub acquired_at: Instant,
    /// Lease; the record is evictable once this much time has passed
    pub timeout: Duration,
    /// Matches the wait entry id when granted from the queue
    pub grant_id: u64,
}

impl LockRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.acquired_at) >= self.timeout
    }
}

/// A request parked behind incompatible holders
#[derive(Debug)]
pub struct WaitEntry<W> {
    pub id: u64,
    pub waiter: HolderId,
    pub resource: String,
    pub mode: LockMode,
    pub enqueued_at: Instant,
    pub timeout: Duration,
    pub wake: W,
}

impl<W> WaitEntry<W> {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.enqueued_at) >= self.timeout
    }
}

/// A wait entry that the wake pass turned into a lock record
#[derive(Debug)]
pub struct Grant<W> {
    pub id: u64,
    pub resource: String,
    pub holder: HolderId,
    pub mode: LockMode,
    pub wake: W,
}

/// Immediate answer to a lock request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Record inserted, caller holds the lock
    Granted,
    /// Waiting would close a cycle in the wait-for graph
    Deadlock,
    /// Caller must enqueue and wait
    Wait,
}

/// Everything removed by one expiry sweep
#[derive(Debug)]
pub struct Expired<W> {
    pub records: Vec<LockRecord>,
    pub waiters: Vec<WaitEntry<W>>,
    pub grants: Vec<Grant<W>>,
}

/// Lock table with wait queues and deadlock prevention
#[derive(Debug)]
pub struct LockTable<W> {
    lease: Duration,
    records: HashMap<String, Vec<LockRecord>>,
    waiters: HashMap<String, VecDeque<WaitEntry<W>>>,
    held_by: HashMap<HolderId, HashSet<String>>,
    next_id: u64,
}

impl<W> LockTable<W> {
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            records: HashMap::new(),
            waiters: HashMap::new(),
            held_by: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Records currently granted on a resource
    pub fn records(&self, resource: &str) -> &[LockRecord] {
        self.records.get(resource).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct holders of a resource
    pub fn holders(&self, resource: &str) -> Vec<&HolderId> {
        let mut holders: Vec<&HolderId> = Vec::new();
        for record in self.records(resource) {
            if !holders.contains(&&record.holder) {
                holders.push(&record.holder);
            }
        }
        holders
    }

    pub fn is_held_by(&self, resource: &str, holder: &HolderId) -> bool {
        self.records(resource).iter().any(|r| &r.holder == holder)
    }

    /// Resources a holder currently has records on
    pub fn resources_of(&self, holder: &HolderId) -> Vec<String> {
        let mut resources: Vec<String> = self
            .held_by
            .get(holder)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        resources.sort();
        resources
    }

    pub fn waiting_count(&self, resource: &str) -> usize {
        self.waiters.get(resource).map_or(0, VecDeque::len)
    }

    pub fn total_waiting(&self) -> usize {
        self.waiters.values().map(VecDeque::len).sum()
    }

    pub fn total_records(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn holder_count(&self) -> usize {
        self.held_by.len()
    }

    /// Resources with at least one record, sorted
    pub fn locked_resources(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.records.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resources with at least one waiter, sorted
    pub fn contended_resources(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.waiters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether `holder` could take `resource` in `mode` right now.
    ///
    /// Free resources, resources held only by `holder` itself, and shared
    /// requests against purely shared holders are compatible.
    pub fn is_compatible(&self, resource: &str, holder: &HolderId, mode: LockMode) -> bool {
        let records = self.records(resource);
        if records.iter().all(|r| &r.holder == holder) {
            return true;
        }
        mode == LockMode::Shared && records.iter().all(|r| r.mode == LockMode::Shared)
    }

    /// Grant immediately, refuse as a deadlock, or tell the caller to wait
    pub fn try_acquire(
        &mut self,
        resource: &str,
        holder: &HolderId,
        mode: LockMode,
        now: Instant,
    ) -> Admission {
        if self.is_compatible(resource, holder, mode) {
            let id = self.take_id();
            self.insert_record(resource, holder.clone(), mode, id, now);
            return Admission::Granted;
        }
        if self.would_deadlock(resource, holder) {
            return Admission::Deadlock;
        }
        Admission::Wait
    }

    /// Park a request at the back of the resource's queue
    pub fn enqueue(
        &mut self,
        resource: &str,
        waiter: &HolderId,
        mode: LockMode,
        timeout: Duration,
        now: Instant,
        wake: W,
    ) -> u64 {
        let id = self.take_id();
        self.waiters
            .entry(resource.to_string())
            .or_default()
            .push_back(WaitEntry {
                id,
                waiter: waiter.clone(),
                resource: resource.to_string(),
                mode,
                enqueued_at: now,
                timeout,
                wake,
            });
        id
    }

    /// Remove a wait entry. Returns false if it is no longer queued (granted
    /// or swept).
    pub fn cancel_wait(&mut self, resource: &str, id: u64) -> bool {
        let Some(queue) = self.waiters.get_mut(resource) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|entry| entry.id != id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.waiters.remove(resource);
        }
        removed
    }

    /// Drop every record `holder` has on `resource`, then run the wake pass
    pub fn release(
        &mut self,
        resource: &str,
        holder: &HolderId,
        now: Instant,
    ) -> (usize, Vec<Grant<W>>) {
        let released = self.remove_records(resource, |r| &r.holder == holder);
        if released == 0 {
            return (0, Vec::new());
        }
        (released, self.wake(resource, now))
    }

    /// Release every resource the holder index lists for `holder`
    pub fn release_all(&mut self, holder: &HolderId, now: Instant) -> (usize, Vec<Grant<W>>) {
        let mut released = 0;
        let mut grants = Vec::new();
        for resource in self.resources_of(holder) {
            let (count, woken) = self.release(&resource, holder, now);
            released += count;
            grants.extend(woken);
        }
        (released, grants)
    }

    /// Take back a single grant whose waiter went away before claiming it
    pub fn revoke(&mut self, resource: &str, grant_id: u64, now: Instant) -> Vec<Grant<W>> {
        if self.remove_records(resource, |r| r.grant_id == grant_id) == 0 {
            return Vec::new();
        }
        self.wake(resource, now)
    }

    /// Evict records past their lease and waiters past their wait bound
    pub fn expire(&mut self, now: Instant) -> Expired<W> {
        let mut expired = Expired {
            records: Vec::new(),
            waiters: Vec::new(),
            grants: Vec::new(),
        };

        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|(_, records)| records.iter().any(|r| r.is_expired(now)))
            .map(|(resource, _)| resource.clone())
            .collect();
        for resource in &stale {
            let mut evicted = Vec::new();
            if let Some(records) = self.records.get_mut(resource) {
                let (gone, kept): (Vec<_>, Vec<_>) =
                    records.drain(..).partition(|r| r.is_expired(now));
                *records = kept;
                evicted = gone;
            }
            for record in &evicted {
                self.unindex(resource, &record.holder);
            }
            if self.records.get(resource).is_some_and(Vec::is_empty) {
                self.records.remove(resource);
            }
            expired.records.extend(evicted);
        }

        let mut emptied = Vec::new();
        for (resource, queue) in self.waiters.iter_mut() {
            let (gone, kept): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|entry| entry.is_expired(now));
            *queue = kept;
            expired.waiters.extend(gone);
            if queue.is_empty() {
                emptied.push(resource.clone());
            }
        }
        for resource in emptied {
            self.waiters.remove(&resource);
        }

        for resource in &stale {
            expired.grants.extend(self.wake(resource, now));
        }
        expired
    }

    /// Whether making `holder` wait on `resource` would close a cycle.
    ///
    /// Builds the wait-for graph from every queued waiter plus the
    /// hypothetical edges `holder → current holders of resource`, then looks
    /// for a path from `holder` back to itself.
    pub fn would_deadlock(&self, resource: &str, holder: &HolderId) -> bool {
        let mut graph = self.wait_for_graph();
        let targets = graph.entry(holder).or_default();
        for current in self.holders(resource) {
            if current != holder {
                targets.insert(current);
            }
        }
        let mut on_path = HashSet::new();
        let mut finished = HashSet::new();
        reaches(&graph, holder, holder, &mut on_path, &mut finished)
    }

    /// Edges `waiter → holder` for every queued waiter
    pub fn wait_for_graph(&self) -> HashMap<&HolderId, HashSet<&HolderId>> {
        let mut graph: HashMap<&HolderId, HashSet<&HolderId>> = HashMap::new();
        for (resource, queue) in &self.waiters {
            let holders = self.holders(resource);
            for entry in queue {
                let edges = graph.entry(&entry.waiter).or_default();
                for holder in &holders {
                    if *holder != &entry.waiter {
                        edges.insert(*holder);
                    }
                }
            }
        }
        graph
    }

    /// Grant queued entries front to back while they stay compatible.
    ///
    /// Consecutive shared waiters are granted together; an exclusive waiter
    /// is granted only when it is alone. Stops at the first entry that must
    /// keep waiting so arrival order is preserved.
    fn wake(&mut self, resource: &str, now: Instant) -> Vec<Grant<W>> {
        let mut grants = Vec::new();
        loop {
            let Some((waiter, mode)) = self
                .waiters
                .get(resource)
                .and_then(VecDeque::front)
                .map(|entry| (entry.waiter.clone(), entry.mode))
            else {
                break;
            };
            if !self.is_compatible(resource, &waiter, mode) {
                break;
            }
            let Some(entry) = self.waiters.get_mut(resource).and_then(VecDeque::pop_front) else {
                break;
            };
            self.insert_record(resource, entry.waiter.clone(), entry.mode, entry.id, now);
            grants.push(Grant {
                id: entry.id,
                resource: entry.resource,
                holder: entry.waiter,
                mode: entry.mode,
                wake: entry.wake,
            });
        }
        if self.waiters.get(resource).is_some_and(VecDeque::is_empty) {
            self.waiters.remove(resource);
        }
        grants
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert_record(
        &mut self,
        resource: &str,
        holder: HolderId,
        mode: LockMode,
        grant_id: u64,
        now: Instant,
    ) {
        self.held_by
            .entry(holder.clone())
            .or_default()
            .insert(resource.to_string());
        self.records
            .entry(resource.to_string())
            .or_default()
            .push(LockRecord {
                resource: resource.to_string(),
                mode,
                holder,
                acquired_at: now,
                timeout: self.lease,
                grant_id,
            });
    }

    fn remove_records(&mut self, resource: &str, matches: impl Fn(&LockRecord) -> bool) -> usize {
        let Some(records) = self.records.get_mut(resource) else {
            return 0;
        };
        let mut removed = Vec::new();
        records.retain(|r| {
            if matches(r) {
                removed.push(r.holder.clone());
                false
            } else {
                true
            }
        });
        if records.is_empty() {
            self.records.remove(resource);
        }
        for holder in &removed {
            self.unindex(resource, holder);
        }
        removed.len()
    }

    /// Drop `resource` from the holder index once no record links them
    fn unindex(&mut self, resource: &str, holder: &HolderId) {
        if self.is_held_by(resource, holder) {
            return;
        }
        if let Some(resources) = self.held_by.get_mut(holder) {
            resources.remove(resource);
            if resources.is_empty() {
                self.held_by.remove(holder);
            }
        }
    }
}

/// Depth-first search for a path from `node` to `target`
fn reaches<'a>(
    graph: &HashMap<&'a HolderId, HashSet<&'a HolderId>>,
    node: &'a HolderId,
    target: &HolderId,
    on_path: &mut HashSet<&'a HolderId>,
    finished: &mut HashSet<&'a HolderId>,
) -> bool {
    if !on_path.insert(node) {
        return false;
    }
    if let Some(next) = graph.get(node) {
        for &successor in next {
            if successor == target {
                return true;
            }
            if !finished.contains(successor)
                && reaches(graph, successor, target, on_path, finished)
            {
                return true;
            }
        }
    }
    on_path.remove(node);
    finished.insert(node);
    false
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;

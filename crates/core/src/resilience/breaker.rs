// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Circuit breaker with a sliding failure window
//!
//! - Closed: calls pass; `failure_threshold` failures inside `window_size`
//!   trips the breaker
//! - Open: calls are rejected without running; after `timeout` the next
//!   state read moves to half-open (no timer task)
//! - HalfOpen: at most `half_open_max_calls` probes in flight; one failure
//!   reopens, `success_threshold` successes close
//!
//! Every decision is made under the breaker's mutex after the counters for
//! the triggering call are updated.

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::error::ControlError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Circuit breaker states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Lifetime counters; never reset
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BreakerCounters {
    /// Calls admitted
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    /// Calls refused while open or with half-open probes exhausted
    pub rejections: u64,
    pub times_opened: u64,
}

/// Admission handed out by [`CircuitBreaker::can_execute`].
///
/// Consumed by [`CircuitBreaker::record_success`] or
/// [`CircuitBreaker::record_failure`]. Only a half-open probe from the
/// current open cycle counts toward closing the breaker.
#[derive(Debug, PartialEq, Eq)]
pub struct CallTicket {
    generation: u64,
    probe: bool,
}

impl CallTicket {
    /// Whether this call was admitted as a half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    success_count: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
    /// Bumped on every open and close; stale probes no longer match
    generation: u64,
    counters: BreakerCounters,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            success_count: 0,
            half_open_calls: 0,
            opened_at: None,
            generation: 0,
            counters: BreakerCounters::default(),
        }
    }

    fn is_current_probe(&self, ticket: &CallTicket) -> bool {
        self.state == CircuitState::HalfOpen && ticket.probe && ticket.generation == self.generation
    }
}

/// Three-state failure gate for one dependency
pub struct CircuitBreaker<C: Clock> {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    clock: C,
}

impl<C: Clock> CircuitBreaker<C> {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: C) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::closed()),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Lock the state, applying the lazy open → half-open transition
    fn lock_state(&self) -> MutexGuard<'_, BreakerState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.state == CircuitState::Open {
            let cooled = match state.opened_at {
                Some(at) => self.clock.elapsed_since(at) >= self.config.timeout,
                None => true,
            };
            if cooled {
                state.state = CircuitState::HalfOpen;
                state.success_count = 0;
                state.half_open_calls = 0;
                tracing::info!(breaker = %self.name, "circuit half-open, admitting probes");
            }
        }
        state
    }

    pub fn state(&self) -> CircuitState {
        self.lock_state().state
    }

    /// Admit a call, or count a rejection and return `None`.
    ///
    /// An admitted half-open call holds a probe slot until its ticket is
    /// recorded or dropped through [`CircuitBreaker::execute`].
    pub fn can_execute(&self) -> Option<CallTicket> {
        let mut state = self.lock_state();
        let probe = match state.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => None,
            CircuitState::HalfOpen if state.half_open_calls < self.config.half_open_max_calls => {
                state.half_open_calls += 1;
                Some(true)
            }
            CircuitState::HalfOpen => None,
        };
        match probe {
            Some(probe) => {
                state.counters.calls += 1;
                Some(CallTicket {
                    generation: state.generation,
                    probe,
                })
            }
            None => {
                state.counters.rejections += 1;
                tracing::debug!(breaker = %self.name, state = %state.state, "call rejected");
                None
            }
        }
    }

    pub fn record_success(&self, ticket: CallTicket) {
        let mut state = self.lock_state();
        state.counters.successes += 1;
        if state.is_current_probe(&ticket) {
            state.half_open_calls = state.half_open_calls.saturating_sub(1);
            state.success_count += 1;
            if state.success_count >= self.config.success_threshold {
                self.close(&mut state);
            }
        }
    }

    pub fn record_failure(&self, ticket: CallTicket) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        state.counters.failures += 1;
        match state.state {
            CircuitState::Closed => {
                state.failures.push_back(now);
                let window = self.config.window_size;
                while state
                    .failures
                    .front()
                    .is_some_and(|at| now.saturating_duration_since(*at) > window)
                {
                    state.failures.pop_front();
                }
                if state.failures.len() >= self.config.failure_threshold as usize {
                    self.open(&mut state, now);
                }
            }
            CircuitState::HalfOpen if state.is_current_probe(&ticket) => {
                self.open(&mut state, now);
            }
            // Late result from a call admitted before this open cycle
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    /// Give back a half-open probe slot without recording a result
    fn abandon(&self, ticket: CallTicket) {
        let mut state = self.lock_state();
        if state.is_current_probe(&ticket) {
            state.half_open_calls = state.half_open_calls.saturating_sub(1);
        }
    }

    fn open(&self, state: &mut BreakerState, now: Instant) {
        state.state = CircuitState::Open;
        state.opened_at = Some(now);
        state.generation += 1;
        state.success_count = 0;
        state.half_open_calls = 0;
        state.failures.clear();
        state.counters.times_opened += 1;
        tracing::warn!(
            breaker = %self.name,
            cool_down = %humantime::format_duration(self.config.timeout),
            "circuit opened"
        );
    }

    fn close(&self, state: &mut BreakerState) {
        state.state = CircuitState::Closed;
        state.opened_at = None;
        state.generation += 1;
        state.success_count = 0;
        state.half_open_calls = 0;
        state.failures.clear();
        tracing::info!(breaker = %self.name, "circuit closed");
    }

    /// Run `call` through the breaker.
    ///
    /// `call` is only invoked once the breaker admits it; a rejection is
    /// reported as [`ControlError::BreakerOpen`].
    pub async fn execute<T, E, F, Fut>(&self, call: F) -> Result<T, ControlError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (ticket, call) = self.admit(call)?;
        self.run(ticket, call).await
    }

    /// Gate and start `call` without awaiting it.
    ///
    /// Lets a caller that cannot lend `call` to a future (such as a retry
    /// closure) build the operation only after admission.
    pub fn admit<T, E, F, Fut>(&self, call: F) -> Result<(CallTicket, Fut), ControlError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.can_execute() {
            Some(ticket) => Ok((ticket, call())),
            None => Err(ControlError::BreakerOpen {
                dependency: self.name.clone(),
            }),
        }
    }

    /// Await an admitted call and record its result
    pub async fn run<T, E, Fut>(&self, ticket: CallTicket, call: Fut) -> Result<T, ControlError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let mut in_flight = InFlight {
            breaker: self,
            ticket: Some(ticket),
        };
        let result = call.await;
        if let Some(ticket) = in_flight.ticket.take() {
            match &result {
                Ok(_) => self.record_success(ticket),
                Err(_) => self.record_failure(ticket),
            }
        }
        result.map_err(ControlError::Upstream)
    }

    /// Force the breaker closed; lifetime counters are kept
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.close(&mut state);
    }

    pub fn counters(&self) -> BreakerCounters {
        self.lock_state().counters
    }

    pub fn status(&self) -> BreakerStatus {
        let state = self.lock_state();
        let now = self.clock.now();
        BreakerStatus {
            name: self.name.clone(),
            state: state.state,
            failures_in_window: state
                .failures
                .iter()
                .filter(|at| now.saturating_duration_since(**at) <= self.config.window_size)
                .count(),
            success_count: state.success_count,
            half_open_calls: state.half_open_calls,
            retry_in_ms: match (state.state, state.opened_at) {
                (CircuitState::Open, Some(at)) => Some(
                    self.config
                        .timeout
                        .saturating_sub(now.saturating_duration_since(at))
                        .as_millis() as u64,
                ),
                _ => None,
            },
            counters: state.counters,
        }
    }
}

/// Returns a half-open probe slot if the call is dropped mid-flight
struct InFlight<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    ticket: Option<CallTicket>,
}

impl<C: Clock> Drop for InFlight<'_, C> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.breaker.abandon(ticket);
        }
    }
}

/// Snapshot of one breaker
#[derive(Clone, Debug, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub success_count: u32,
    pub half_open_calls: u32,
    /// Time left before half-open, while open
    pub retry_in_ms: Option<u64>,
    pub counters: BreakerCounters,
}

/// Breakers keyed by dependency name, created on first use
pub struct BreakerRegistry<C: Clock> {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker<C>>>>,
    clock: C,
}

impl<C: Clock> BreakerRegistry<C> {
    pub fn new(config: BreakerConfig, clock: C) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock_breakers(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker<C>>>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_or_create(&self, dependency: &str) -> Arc<CircuitBreaker<C>> {
        let mut breakers = self.lock_breakers();
        Arc::clone(breakers.entry(dependency.to_string()).or_insert_with(|| {
            tracing::debug!(breaker = dependency, "creating circuit breaker");
            Arc::new(CircuitBreaker::new(
                dependency,
                self.config.clone(),
                self.clock.clone(),
            ))
        }))
    }

    pub fn get(&self, dependency: &str) -> Option<Arc<CircuitBreaker<C>>> {
        self.lock_breakers().get(dependency).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_breakers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> BTreeMap<String, BreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker<C>>> = self.lock_breakers().values().cloned().collect();
        breakers
            .iter()
            .map(|b| (b.name().to_string(), b.status()))
            .collect()
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;

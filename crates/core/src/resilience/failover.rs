// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Primary/secondary failover driven by health checks
//!
//! Each logical service has one primary and an ordered list of secondaries.
//! A failed primary is replaced by the first secondary that passes its own
//! health check; devices that fail go to a failed set with their failure
//! time and are re-admitted to the tail of the secondary list once they have
//! been down for `recovery_timeout` and pass a check again.
//!
//! Topology lives under a std mutex and is never held across a probe.
//! Failover and recovery passes are serialized by an async gate so two
//! callers cannot promote different candidates for the same outage.

use crate::clock::Clock;
use crate::config::FailoverConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Identifier of a physical device or endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Why a device failed its health check
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("health probe failed: {0}")]
    Failed(String),
    #[error("health probe timed out after {}", humantime::format_duration(*.0))]
    TimedOut(Duration),
}

/// Errors from failover operations
#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("invalid topology for {service}: {reason}")]
    InvalidTopology { service: String, reason: String },
    #[error("no healthy candidate for {service} after {attempts} attempts")]
    NoHealthyCandidate { service: String, attempts: u32 },
}

/// Health probe for a device
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, device: &DeviceId) -> Result<(), HealthError>;
}

#[async_trait]
impl<F> HealthCheck for F
where
    F: Fn(&DeviceId) -> Result<(), HealthError> + Send + Sync,
{
    async fn check(&self, device: &DeviceId) -> Result<(), HealthError> {
        self(device)
    }
}

#[derive(Debug)]
struct Topology {
    primary: DeviceId,
    secondaries: VecDeque<DeviceId>,
    failed: HashMap<DeviceId, Instant>,
    failovers: u64,
    recoveries: u64,
}

#[derive(Default)]
struct FailoverState {
    services: BTreeMap<String, Topology>,
    checks: HashMap<DeviceId, Arc<dyn HealthCheck>>,
}

/// Result of one monitoring pass over every service
#[derive(Clone, Debug, Default, Serialize)]
pub struct MonitorReport {
    pub checked: usize,
    /// Service → newly promoted primary
    pub promoted: BTreeMap<String, DeviceId>,
    /// Service → devices returned to the secondary list
    pub recovered: BTreeMap<String, Vec<DeviceId>>,
    /// Services left with an unhealthy primary and no candidate
    pub stranded: Vec<String>,
}

/// Failover manager for any number of logical services
pub struct FailoverManager<C: Clock> {
    config: FailoverConfig,
    state: Mutex<FailoverState>,
    gate: tokio::sync::Mutex<()>,
    clock: C,
}

impl<C: Clock> FailoverManager<C> {
    pub fn new(config: FailoverConfig, clock: C) -> Self {
        Self {
            config,
            state: Mutex::new(FailoverState::default()),
            gate: tokio::sync::Mutex::new(()),
            clock,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, FailoverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Register (or replace) a service's topology
    pub fn register_service(
        &self,
        service: &str,
        primary: DeviceId,
        secondaries: Vec<DeviceId>,
    ) -> Result<(), FailoverError> {
        let mut seen = HashSet::from([&primary]);
        for device in &secondaries {
            if !seen.insert(device) {
                return Err(FailoverError::InvalidTopology {
                    service: service.to_string(),
                    reason: format!("device {} listed twice", device),
                });
            }
        }
        tracing::info!(
            service,
            %primary,
            secondaries = secondaries.len(),
            "registered failover topology"
        );
        self.lock_state().services.insert(
            service.to_string(),
            Topology {
                primary,
                secondaries: secondaries.into(),
                failed: HashMap::new(),
                failovers: 0,
                recoveries: 0,
            },
        );
        Ok(())
    }

    /// Attach a probe to a device; devices without one count as healthy
    pub fn register_health_check(&self, device: DeviceId, check: impl HealthCheck + 'static) {
        self.lock_state().checks.insert(device, Arc::new(check));
    }

    pub fn services(&self) -> Vec<String> {
        self.lock_state().services.keys().cloned().collect()
    }

    pub fn primary(&self, service: &str) -> Option<DeviceId> {
        self.lock_state()
            .services
            .get(service)
            .map(|t| t.primary.clone())
    }

    pub fn secondaries(&self, service: &str) -> Vec<DeviceId> {
        self.lock_state()
            .services
            .get(service)
            .map(|t| t.secondaries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Devices currently in the failed set, oldest failure first
    pub fn failed(&self, service: &str) -> Vec<DeviceId> {
        let state = self.lock_state();
        let Some(topology) = state.services.get(service) else {
            return Vec::new();
        };
        by_failure_age(&topology.failed)
    }

    /// Probe one device, bounded by the health-check interval
    pub async fn probe(&self, device: &DeviceId) -> bool {
        let check = self.lock_state().checks.get(device).cloned();
        let Some(check) = check else {
            return true;
        };
        let bound = self.config.health_check_interval;
        let result = match tokio::time::timeout(bound, check.check(device)).await {
            Ok(result) => result,
            Err(_) => Err(HealthError::TimedOut(bound)),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%device, error = %e, "health check failed");
                false
            }
        }
    }

    /// Health-check a service's current primary
    pub async fn check_primary(&self, service: &str) -> Result<bool, FailoverError> {
        let primary = self
            .primary(service)
            .ok_or_else(|| FailoverError::UnknownService(service.to_string()))?;
        Ok(self.probe(&primary).await)
    }

    /// Replace the primary with the first healthy secondary.
    ///
    /// Candidates are taken in order; each one that fails its check moves to
    /// the failed set. At most `max_failover_attempts` candidates are tried.
    /// With no healthy candidate the primary is left in place.
    pub async fn failover(&self, service: &str) -> Result<DeviceId, FailoverError> {
        let _gate = self.gate.lock().await;
        let max_attempts = self.config.max_failover_attempts;
        let mut attempts = 0;

        while attempts < max_attempts {
            let candidate = {
                let mut state = self.lock_state();
                let topology = state
                    .services
                    .get_mut(service)
                    .ok_or_else(|| FailoverError::UnknownService(service.to_string()))?;
                match topology.secondaries.pop_front() {
                    Some(candidate) => candidate,
                    None => break,
                }
            };
            attempts += 1;

            let healthy = self.probe(&candidate).await;

            let now = self.clock.now();
            let mut state = self.lock_state();
            let topology = state
                .services
                .get_mut(service)
                .ok_or_else(|| FailoverError::UnknownService(service.to_string()))?;
            if healthy {
                let previous = std::mem::replace(&mut topology.primary, candidate.clone());
                topology.failed.insert(previous.clone(), now);
                topology.failovers += 1;
                tracing::warn!(
                    service,
                    from = %previous,
                    to = %candidate,
                    attempts,
                    "failed over to secondary"
                );
                return Ok(candidate);
            }
            tracing::debug!(service, %candidate, "failover candidate unhealthy");
            topology.failed.insert(candidate, now);
        }

        tracing::error!(service, attempts, "failover found no healthy candidate");
        Err(FailoverError::NoHealthyCandidate {
            service: service.to_string(),
            attempts,
        })
    }

    /// Re-check failed devices old enough to retry; healthy ones rejoin the
    /// tail of the secondary list
    pub async fn recover(&self, service: &str) -> Result<Vec<DeviceId>, FailoverError> {
        let _gate = self.gate.lock().await;
        let due: Vec<DeviceId> = {
            let state = self.lock_state();
            let topology = state
                .services
                .get(service)
                .ok_or_else(|| FailoverError::UnknownService(service.to_string()))?;
            let now = self.clock.now();
            by_failure_age(&topology.failed)
                .into_iter()
                .filter(|device| {
                    topology
                        .failed
                        .get(device)
                        .is_some_and(|at| now.saturating_duration_since(*at) >= self.config.recovery_timeout)
                })
                .collect()
        };

        let mut recovered = Vec::new();
        for device in due {
            if !self.probe(&device).await {
                continue;
            }
            let mut state = self.lock_state();
            let Some(topology) = state.services.get_mut(service) else {
                break;
            };
            if topology.failed.remove(&device).is_none() {
                continue;
            }
            if topology.primary != device && !topology.secondaries.contains(&device) {
                topology.secondaries.push_back(device.clone());
            }
            topology.recoveries += 1;
            tracing::info!(service, %device, "device recovered, rejoined as secondary");
            recovered.push(device);
        }
        Ok(recovered)
    }

    /// One monitoring pass: check every primary, fail over the unhealthy
    /// ones, then run recovery
    pub async fn monitor_once(&self) -> MonitorReport {
        let mut report = MonitorReport::default();
        for service in self.services() {
            report.checked += 1;
            match self.check_primary(&service).await {
                Ok(true) => {}
                Ok(false) => match self.failover(&service).await {
                    Ok(primary) => {
                        report.promoted.insert(service.clone(), primary);
                    }
                    Err(e) => {
                        tracing::error!(service = %service, error = %e, "failover failed");
                        report.stranded.push(service.clone());
                    }
                },
                // Unregistered while iterating
                Err(_) => continue,
            }
            match self.recover(&service).await {
                Ok(devices) if !devices.is_empty() => {
                    report.recovered.insert(service.clone(), devices);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(service = %service, error = %e, "recovery skipped"),
            }
        }
        report
    }

    pub fn status(&self) -> FailoverStatus {
        let state = self.lock_state();
        let now = self.clock.now();
        let services = state
            .services
            .iter()
            .map(|(name, t)| {
                let failed = t
                    .failed
                    .iter()
                    .map(|(device, at)| {
                        (
                            device.0.clone(),
                            now.saturating_duration_since(*at).as_millis() as u64,
                        )
                    })
                    .collect();
                (
                    name.clone(),
                    ServiceStatus {
                        primary: t.primary.0.clone(),
                        secondaries: t.secondaries.iter().map(|d| d.0.clone()).collect(),
                        failed_for_ms: failed,
                        failovers: t.failovers,
                        recoveries: t.recoveries,
                    },
                )
            })
            .collect();
        FailoverStatus { services }
    }
}

fn by_failure_age(failed: &HashMap<DeviceId, Instant>) -> Vec<DeviceId> {
    let mut devices: Vec<(&DeviceId, &Instant)> = failed.iter().collect();
    devices.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
    devices.into_iter().map(|(device, _)| device.clone()).collect()
}

/// Snapshot of every service's topology
#[derive(Clone, Debug, Default, Serialize)]
pub struct FailoverStatus {
    pub services: BTreeMap<String, ServiceStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ServiceStatus {
    pub primary: String,
    pub secondaries: Vec<String>,
    /// Failed device → time since failure
    pub failed_for_ms: BTreeMap<String, u64>,
    pub failovers: u64,
    pub recoveries: u64,
}

#[cfg(test)]
#[path = "failover_tests.rs"]
mod tests;
